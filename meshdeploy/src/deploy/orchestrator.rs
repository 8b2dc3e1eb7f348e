//! Sidecar-ordered service orchestration
//!
//! A deploy cleans out stale containers, starts the sidecar, waits for it to
//! report ready and only then starts the application. A failure after the
//! sidecar is up removes the sidecar again before the error is returned.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::{error, info, warn};

use crate::deploy::fsm::{OrchestrationEvent, OrchestrationFsm, OrchestrationState};
use crate::errors::DeployError;
use crate::mesh::envoy::ProxyConfigGenerator;
use crate::mesh::identity::ServiceIdentity;
use crate::probe::ReadinessProbe;
use crate::runtime::{ContainerOptions, ContainerRuntime, ContainerSpec, SidecarHandle};

/// Progress notifications emitted while a deploy runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorEvent {
    /// The state machine entered a new state
    Transition(OrchestrationState),

    /// The sidecar config was rendered and the sidecar is about to start
    SidecarConfigRendered,
}

pub type Observer<'a> = &'a (dyn Fn(OrchestratorEvent) + Send + Sync);

#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    /// Network both containers join
    pub network: String,

    /// How long the sidecar gets to report ready
    pub ready_timeout: Duration,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            network: "meshnet".to_string(),
            ready_timeout: Duration::from_secs(30),
        }
    }
}

/// A service whose sidecar and application are both running
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployedService {
    pub app_container_id: String,
    pub sidecar: SidecarHandle,
}

type ServiceLock = Arc<tokio::sync::Mutex<()>>;

/// Per-service deploy locks. An entry lives only while someone holds or
/// waits on it.
#[derive(Default)]
struct ServiceLocks {
    locks: Mutex<HashMap<String, ServiceLock>>,
}

impl ServiceLocks {
    fn map(&self) -> MutexGuard<'_, HashMap<String, ServiceLock>> {
        match self.locks.lock() {
            Ok(locks) => locks,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn acquire(&self, name: &str) -> ServiceLock {
        self.map().entry(name.to_string()).or_default().clone()
    }

    /// Give back a lock from `acquire`, dropping the entry if no other
    /// deploy of `name` holds a clone.
    fn release(&self, name: &str, lock: ServiceLock) {
        let mut locks = self.map();
        // One reference in the map plus ours
        if Arc::strong_count(&lock) == 2 {
            locks.remove(name);
        }
    }

    fn len(&self) -> usize {
        self.map().len()
    }
}

pub struct ServiceOrchestrator {
    runtime: Arc<dyn ContainerRuntime>,
    prober: Arc<dyn ReadinessProbe>,
    proxy_config: ProxyConfigGenerator,
    options: OrchestratorOptions,
    service_locks: ServiceLocks,
}

impl ServiceOrchestrator {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        prober: Arc<dyn ReadinessProbe>,
        proxy_config: ProxyConfigGenerator,
        options: OrchestratorOptions,
    ) -> Self {
        Self {
            runtime,
            prober,
            proxy_config,
            options,
            service_locks: ServiceLocks::default(),
        }
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    pub fn options(&self) -> &OrchestratorOptions {
        &self.options
    }

    /// Number of services with a deploy in flight
    pub fn active_deploys(&self) -> usize {
        self.service_locks.len()
    }

    /// Deploy `image` as `identity` behind a freshly started sidecar.
    ///
    /// Deploys of the same service are serialized; different services never
    /// wait on each other.
    pub async fn deploy(
        &self,
        identity: &ServiceIdentity,
        image: &str,
        options: ContainerOptions,
        observer: Option<Observer<'_>>,
    ) -> Result<DeployedService, DeployError> {
        let lock = self.service_locks.acquire(identity.name());
        let result = {
            let _guard = lock.lock().await;
            self.deploy_locked(identity, image, options, observer).await
        };
        self.service_locks.release(identity.name(), lock);
        result
    }

    async fn deploy_locked(
        &self,
        identity: &ServiceIdentity,
        image: &str,
        options: ContainerOptions,
        observer: Option<Observer<'_>>,
    ) -> Result<DeployedService, DeployError> {
        let notify = |event: OrchestratorEvent| {
            if let Some(observer) = observer {
                observer(event);
            }
        };
        let mut fsm = OrchestrationFsm::new();
        let advance = |fsm: &mut OrchestrationFsm, event: OrchestrationEvent| -> Result<(), DeployError> {
            let state = fsm.process(event).map_err(DeployError::Internal)?;
            notify(OrchestratorEvent::Transition(state));
            Ok(())
        };

        info!("Deploying {} from {}", identity, image);

        // Cleaning
        advance(&mut fsm, OrchestrationEvent::Begin)?;
        self.clean(identity).await;
        advance(&mut fsm, OrchestrationEvent::Cleaned)?;

        // Starting sidecar
        let sidecar = match self.start_sidecar(identity, &notify).await {
            Ok(handle) => handle,
            Err(e) => {
                error!("Sidecar for {} failed to start: {}", identity, e);
                advance(&mut fsm, OrchestrationEvent::SidecarStartFailed(e.to_string()))?;
                return Err(DeployError::SidecarStart {
                    service: identity.name().to_string(),
                    source: Box::new(e),
                });
            }
        };
        advance(&mut fsm, OrchestrationEvent::SidecarStarted)?;

        // Waiting for readiness
        if !self.prober.wait_ready(identity, self.options.ready_timeout).await {
            let err = DeployError::SidecarNotReady(identity.name().to_string());
            error!("{}", err);
            advance(&mut fsm, OrchestrationEvent::SidecarNotReady(err.to_string()))?;
            self.remove_container(&identity.sidecar_name()).await;
            advance(&mut fsm, OrchestrationEvent::RolledBack)?;
            return Err(err);
        }
        advance(&mut fsm, OrchestrationEvent::SidecarReady)?;

        // Starting app
        let spec = ContainerSpec::app(identity, image, self.options.network.clone(), options);
        let app_container_id = match self.runtime.start(&spec).await {
            Ok(id) => id,
            Err(e) => {
                error!("Application container for {} failed to start: {}", identity, e);
                advance(&mut fsm, OrchestrationEvent::AppStartFailed(e.to_string()))?;
                self.remove_container(&identity.sidecar_name()).await;
                advance(&mut fsm, OrchestrationEvent::RolledBack)?;
                return Err(DeployError::AppStart {
                    service: identity.name().to_string(),
                    source: Box::new(e),
                });
            }
        };
        advance(&mut fsm, OrchestrationEvent::AppStarted)?;

        info!("Deployed {} (app {}, sidecar {})", identity, app_container_id, sidecar.container_id);
        Ok(DeployedService {
            app_container_id,
            sidecar,
        })
    }

    async fn start_sidecar(
        &self,
        identity: &ServiceIdentity,
        notify: &(dyn Fn(OrchestratorEvent) + Send + Sync),
    ) -> Result<SidecarHandle, DeployError> {
        let config = self.proxy_config.generate(identity).await?;
        notify(OrchestratorEvent::SidecarConfigRendered);
        self.runtime.start_sidecar(identity, &config).await
    }

    /// Remove both containers of a service if either exists
    async fn clean(&self, identity: &ServiceIdentity) {
        let app = identity.name().to_string();
        let sidecar = identity.sidecar_name();
        if self.runtime.exists(&app).await || self.runtime.exists(&sidecar).await {
            info!("Removing stale containers of {}", identity);
            self.remove_container(&app).await;
            self.remove_container(&sidecar).await;
        }
    }

    /// Best-effort stop and remove. Failures are logged, never returned.
    async fn remove_container(&self, name: &str) -> bool {
        if let Err(e) = self.runtime.stop(name).await {
            warn!("Failed to stop {}: {}", name, e);
        }
        match self.runtime.remove(name).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to remove {}: {}", name, e);
                false
            }
        }
    }

    /// Stop and remove every container this tool manages. Returns the names
    /// that were removed.
    pub async fn destroy_all(&self) -> Result<Vec<String>, DeployError> {
        let mut destroyed = Vec::new();
        for name in self.runtime.list_managed().await? {
            if self.remove_container(&name).await {
                info!("Destroyed {}", name);
                destroyed.push(name);
            }
        }
        Ok(destroyed)
    }
}

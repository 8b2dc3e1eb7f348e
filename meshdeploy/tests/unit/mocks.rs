//! In-process fakes for the deploy collaborators

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::{extract::State, http::StatusCode, routing::get, Router};
use futures::StreamExt;
use meshdeploy::deploy::git::RepoFetcher;
use meshdeploy::deploy::image::{image_name, ImageBuilder};
use meshdeploy::deploy::orchestrator::{OrchestratorOptions, ServiceOrchestrator};
use meshdeploy::deploy::pipeline::{DeployPipeline, PipelineOptions};
use meshdeploy::deploy::slug::RepoSlug;
use meshdeploy::errors::DeployError;
use meshdeploy::health::HealthCheck;
use meshdeploy::mesh::ca::CertificateAuthority;
use meshdeploy::mesh::envoy::{ProxyConfigGenerator, DEFAULT_ENVOY_TEMPLATE};
use meshdeploy::mesh::identity::ServiceIdentity;
use meshdeploy::probe::ReadinessProbe;
use meshdeploy::runtime::{ContainerRuntime, ContainerSpec, LogStream, SidecarHandle};
use meshdeploy::storage::layout::StorageLayout;
use meshdeploy::storage::settings::PortSettings;
use meshdeploy_api::{HealthStatus, ServiceSummary, ServingStatus};
use tokio::net::TcpListener;

/// Records every call and keeps container state in memory
#[derive(Default)]
pub struct MockRuntime {
    pub calls: Mutex<Vec<String>>,
    /// Container name to whether it is an application container
    pub containers: Mutex<BTreeMap<String, bool>>,
    /// Error returned when starting an application container
    pub app_start_error: Option<String>,
    /// Error returned when starting a sidecar
    pub sidecar_start_error: Option<String>,
    /// Error returned by every stop and remove. The container is kept.
    pub teardown_error: Option<String>,
    /// Address reported for every existing container
    pub ip: Option<String>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self {
            ip: Some("172.20.0.2".to_string()),
            ..Default::default()
        }
    }

    pub fn with_container(self, name: &str, is_app: bool) -> Self {
        self.containers.lock().unwrap().insert(name.to_string(), is_app);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn container_names(&self) -> Vec<String> {
        self.containers.lock().unwrap().keys().cloned().collect()
    }

    pub fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn exists(&self, name: &str) -> bool {
        self.containers.lock().unwrap().contains_key(name)
    }

    async fn running(&self, name: &str) -> bool {
        self.exists(name).await
    }

    async fn start(&self, spec: &ContainerSpec) -> Result<String, DeployError> {
        self.record(format!("start:{}", spec.name));
        if let Some(err) = &self.app_start_error {
            return Err(DeployError::Runtime(err.clone()));
        }
        self.containers.lock().unwrap().insert(spec.name.clone(), true);
        Ok(format!("{}-id", spec.name))
    }

    async fn start_sidecar(
        &self,
        identity: &ServiceIdentity,
        config: &str,
    ) -> Result<SidecarHandle, DeployError> {
        let name = identity.sidecar_name();
        self.record(format!("start_sidecar:{}", name));
        assert!(config.contains(identity.name()), "sidecar config must name its service");
        if let Some(err) = &self.sidecar_start_error {
            return Err(DeployError::Runtime(err.clone()));
        }
        self.containers.lock().unwrap().insert(name.clone(), false);
        Ok(SidecarHandle {
            container_id: format!("{}-id", name),
            config_path: PathBuf::from(format!("/tmp/{}.yaml", name)),
        })
    }

    async fn stop(&self, name: &str) -> Result<(), DeployError> {
        self.record(format!("stop:{}", name));
        match &self.teardown_error {
            Some(err) => Err(DeployError::Runtime(err.clone())),
            None => Ok(()),
        }
    }

    async fn remove(&self, name: &str) -> Result<(), DeployError> {
        self.record(format!("remove:{}", name));
        if let Some(err) = &self.teardown_error {
            return Err(DeployError::Runtime(err.clone()));
        }
        self.containers.lock().unwrap().remove(name);
        Ok(())
    }

    async fn logs(&self, name: &str, tail: usize) -> String {
        format!("{} last {} lines", name, tail)
    }

    async fn follow_logs(&self, name: &str, tail: usize) -> Result<LogStream, DeployError> {
        self.record(format!("follow_logs:{}", name));
        let lines: Vec<String> = (1..=tail.min(3)).map(|n| format!("{} line {}", name, n)).collect();
        Ok(futures::stream::iter(lines).boxed())
    }

    async fn ip(&self, name: &str) -> Option<String> {
        if self.exists(name).await {
            self.ip.clone()
        } else {
            None
        }
    }

    async fn list_services(&self) -> Result<Vec<ServiceSummary>, DeployError> {
        Ok(self
            .containers
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, is_app)| **is_app)
            .map(|(name, _)| ServiceSummary {
                name: name.clone(),
                status: "running".to_string(),
            })
            .collect())
    }

    async fn list_managed(&self) -> Result<Vec<String>, DeployError> {
        Ok(self.container_names())
    }

    async fn ensure_network(&self, _name: &str, _subnet: &str) -> Result<(), DeployError> {
        Ok(())
    }
}

/// Reports a fixed readiness result and logs it next to the runtime calls
pub struct MockProber {
    pub ready: bool,
    pub runtime: Arc<MockRuntime>,
}

#[async_trait]
impl ReadinessProbe for MockProber {
    async fn wait_ready(&self, identity: &ServiceIdentity, _timeout: Duration) -> bool {
        let outcome = if self.ready { "probe_ready" } else { "probe_not_ready" };
        self.runtime.record(format!("{}:{}", outcome, identity.sidecar_name()));
        self.ready
    }
}

/// Local stand-in for a sidecar admin endpoint
pub struct AdminEndpoint {
    pub port: u16,
    pub hits: Arc<AtomicUsize>,
}

impl AdminEndpoint {
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

/// Serves `/ready`, answering 503 until `ready_after` requests have been seen
pub async fn admin_endpoint(ready_after: usize) -> AdminEndpoint {
    async fn ready(State((hits, ready_after)): State<(Arc<AtomicUsize>, usize)>) -> StatusCode {
        let seen = hits.fetch_add(1, Ordering::SeqCst) + 1;
        if seen >= ready_after {
            StatusCode::OK
        } else {
            StatusCode::SERVICE_UNAVAILABLE
        }
    }

    let hits = Arc::new(AtomicUsize::new(0));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let app = Router::new()
        .route("/ready", get(ready))
        .with_state((hits.clone(), ready_after));
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    AdminEndpoint { port, hits }
}

/// Serves every repository from one local directory. Owners named `missing`
/// fail to fetch and owners named `bare` have no entrypoint.
pub struct MockFetcher {
    pub root: PathBuf,
}

#[async_trait]
impl RepoFetcher for MockFetcher {
    async fn fetch(&self, slug: &RepoSlug) -> Result<PathBuf, DeployError> {
        if slug.owner == "missing" {
            return Err(DeployError::Fetch(format!("{}: not found", slug)));
        }
        Ok(self.root.join(slug.service_name()))
    }

    async fn detect_entrypoint(&self, repo_path: &Path) -> Option<String> {
        let name = repo_path.file_name()?.to_str()?;
        if name.starts_with("bare-") {
            None
        } else {
            Some("app:create_app".to_string())
        }
    }
}

pub struct MockBuilder;

#[async_trait]
impl ImageBuilder for MockBuilder {
    async fn build(&self, _repo_path: &Path, slug: &RepoSlug, _entrypoint: &str) -> Result<String, DeployError> {
        Ok(image_name(&slug.service_name()))
    }
}

pub struct MockHealth;

#[async_trait]
impl HealthCheck for MockHealth {
    async fn check(&self, identity: &ServiceIdentity) -> HealthStatus {
        HealthStatus::new(ServingStatus::Serving, format!("{} is up", identity))
    }
}

/// Proxy config generator backed by a real CA under `root`
pub async fn proxy_config(root: &Path) -> ProxyConfigGenerator {
    let layout = StorageLayout::new(root);
    layout
        .envoy_template_file()
        .write_string(DEFAULT_ENVOY_TEMPLATE)
        .await
        .unwrap();
    let ca = Arc::new(CertificateAuthority::new(layout.clone(), "meshdeploy", "meshnet"));
    ProxyConfigGenerator::new(ca, layout.envoy_template_file(), PortSettings::default())
}

pub async fn orchestrator(root: &Path, runtime: Arc<MockRuntime>, ready: bool) -> ServiceOrchestrator {
    ServiceOrchestrator::new(
        runtime.clone(),
        Arc::new(MockProber { ready, runtime }),
        proxy_config(root).await,
        OrchestratorOptions::default(),
    )
}

pub async fn pipeline(root: &Path, runtime: Arc<MockRuntime>) -> DeployPipeline {
    DeployPipeline::new(
        Arc::new(MockFetcher {
            root: root.join("repos"),
        }),
        Arc::new(MockBuilder),
        Arc::new(orchestrator(root, runtime, true).await),
        Arc::new(MockHealth),
        PipelineOptions::default(),
    )
}

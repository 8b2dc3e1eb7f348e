//! Sidecar readiness probing

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::mesh::identity::ServiceIdentity;
use crate::runtime::ContainerRuntime;

/// Waits for a service's sidecar to report ready
#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    /// `true` as soon as the sidecar is ready, `false` once `timeout` elapses
    async fn wait_ready(&self, identity: &ServiceIdentity, timeout: Duration) -> bool;
}

#[derive(Debug, Clone)]
pub struct ProbeOptions {
    pub admin_port: u16,
    pub poll_interval: Duration,
    pub request_timeout: Duration,
}

impl Default for ProbeOptions {
    fn default() -> Self {
        Self {
            admin_port: 9901,
            poll_interval: Duration::from_secs(1),
            request_timeout: Duration::from_secs(2),
        }
    }
}

/// Polls the sidecar admin endpoint `GET /ready` over the container network
pub struct HttpReadinessProber {
    runtime: Arc<dyn ContainerRuntime>,
    client: reqwest::Client,
    options: ProbeOptions,
}

impl HttpReadinessProber {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, options: ProbeOptions) -> Self {
        Self {
            runtime,
            client: reqwest::Client::new(),
            options,
        }
    }

    async fn check(&self, ip: &str) -> Result<bool, reqwest::Error> {
        let url = format!("http://{}:{}/ready", ip, self.options.admin_port);
        let response = self
            .client
            .get(&url)
            .timeout(self.options.request_timeout)
            .send()
            .await?;
        Ok(response.status() == reqwest::StatusCode::OK)
    }
}

#[async_trait]
impl ReadinessProbe for HttpReadinessProber {
    async fn wait_ready(&self, identity: &ServiceIdentity, timeout: Duration) -> bool {
        let sidecar = identity.sidecar_name();
        let started = Instant::now();

        loop {
            if self.runtime.running(&sidecar).await {
                match self.runtime.ip(&sidecar).await {
                    Some(ip) => match self.check(&ip).await {
                        Ok(true) => {
                            info!("Sidecar {} is ready after {:?}", sidecar, started.elapsed());
                            return true;
                        }
                        Ok(false) => debug!("Sidecar {} not ready yet", sidecar),
                        Err(e) => debug!("Readiness request to {} failed: {}", sidecar, e),
                    },
                    None => debug!("Sidecar {} has no address yet", sidecar),
                }
            } else {
                debug!("Sidecar {} is not running yet", sidecar);
            }

            let elapsed = started.elapsed();
            if elapsed >= timeout {
                warn!("Sidecar {} not ready within {:?}", sidecar, timeout);
                return false;
            }
            tokio::time::sleep(self.options.poll_interval.min(timeout - elapsed)).await;
        }
    }
}

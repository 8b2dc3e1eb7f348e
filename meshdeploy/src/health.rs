//! Service health checks through the sidecar's mTLS listener

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use meshdeploy_api::{HealthStatus, ServingStatus};
use reqwest::{Certificate, Identity};
use tracing::debug;

use crate::errors::DeployError;
use crate::mesh::identity::ServiceIdentity;
use crate::storage::layout::StorageLayout;

#[async_trait]
pub trait HealthCheck: Send + Sync {
    /// Never fails; problems are reported in the returned status
    async fn check(&self, identity: &ServiceIdentity) -> HealthStatus;
}

#[derive(Debug, Clone)]
pub struct HealthCheckOptions {
    /// Host the sidecar's inbound port is published on
    pub host: IpAddr,
    pub inbound_port: u16,
    pub request_timeout: Duration,
}

impl Default for HealthCheckOptions {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            inbound_port: 15000,
            request_timeout: Duration::from_secs(5),
        }
    }
}

/// Calls `GET /health` on a service through its sidecar, presenting the
/// service's own certificate and trusting only the mesh root.
pub struct MtlsHealthChecker {
    layout: StorageLayout,
    options: HealthCheckOptions,
}

impl MtlsHealthChecker {
    pub fn new(layout: StorageLayout, options: HealthCheckOptions) -> Self {
        Self { layout, options }
    }

    async fn client_for(&self, identity: &ServiceIdentity) -> Result<reqwest::Client, DeployError> {
        let ca_pem = self.layout.ca_cert_file().read_bytes().await?;
        let mut identity_pem = self.layout.service_cert_file(identity.name()).read_bytes().await?;
        identity_pem.extend(self.layout.service_key_file(identity.name()).read_bytes().await?);

        // The service name only resolves inside the container network; pin it to
        // the published port so the certificate SAN still matches.
        let addr = SocketAddr::new(self.options.host, self.options.inbound_port);
        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .tls_built_in_root_certs(false)
            .add_root_certificate(Certificate::from_pem(&ca_pem)?)
            .identity(Identity::from_pem(&identity_pem)?)
            .resolve(identity.name(), addr)
            .timeout(self.options.request_timeout)
            .build()?;
        Ok(client)
    }
}

#[async_trait]
impl HealthCheck for MtlsHealthChecker {
    async fn check(&self, identity: &ServiceIdentity) -> HealthStatus {
        let client = match self.client_for(identity).await {
            Ok(client) => client,
            Err(e) => {
                return HealthStatus::new(
                    ServingStatus::ServiceUnknown,
                    format!("Error checking health: {}", e),
                );
            }
        };

        let url = format!("https://{}:{}/health", identity.name(), self.options.inbound_port);
        debug!("Checking health of {} at {}", identity, url);
        match client.get(&url).send().await {
            Ok(response) if response.status().is_success() => {
                HealthStatus::new(ServingStatus::Serving, format!("HTTP {}", response.status()))
            }
            Ok(response) => {
                HealthStatus::new(ServingStatus::NotServing, format!("HTTP {}", response.status()))
            }
            Err(e) => HealthStatus::new(ServingStatus::NotServing, format!("Request failed: {}", e)),
        }
    }
}

//! Application state management

use std::sync::Arc;

use secrecy::SecretString;
use tracing::{info, warn};

use crate::authn::jwt::JwtVerifier;
use crate::deploy::git::{FetcherOptions, GitFetcher};
use crate::deploy::image::DockerImageBuilder;
use crate::deploy::orchestrator::{OrchestratorOptions, ServiceOrchestrator};
use crate::deploy::pipeline::{DeployPipeline, PipelineOptions};
use crate::errors::DeployError;
use crate::health::{HealthCheckOptions, MtlsHealthChecker};
use crate::mesh::ca::CertificateAuthority;
use crate::mesh::envoy::ProxyConfigGenerator;
use crate::probe::{HttpReadinessProber, ProbeOptions};
use crate::runtime::docker::{DockerCli, DockerOptions};
use crate::runtime::ContainerRuntime;
use crate::storage::layout::StorageLayout;
use crate::storage::settings::Settings;

/// Everything a command or the server needs, wired from settings
pub struct AppState {
    pub layout: StorageLayout,
    pub settings: Settings,
    pub docker: Arc<DockerCli>,
    pub ca: Arc<CertificateAuthority>,
    pub fetcher: Arc<GitFetcher>,
    pub pipeline: Arc<DeployPipeline>,
}

impl AppState {
    /// Wire components. Nothing here talks to docker or the network.
    pub fn init(layout: StorageLayout, settings: Settings) -> Self {
        let docker = Arc::new(DockerCli::new(DockerOptions::from_settings(&settings), layout.clone()));
        let runtime: Arc<dyn ContainerRuntime> = docker.clone();

        let ca = Arc::new(CertificateAuthority::new(
            layout.clone(),
            settings.ca.organization.clone(),
            settings.network.name.clone(),
        ));
        let proxy_config = ProxyConfigGenerator::new(ca.clone(), layout.envoy_template_file(), settings.ports);

        let prober = Arc::new(HttpReadinessProber::new(
            runtime.clone(),
            ProbeOptions {
                admin_port: settings.ports.admin,
                poll_interval: settings.sidecar.poll_interval(),
                request_timeout: settings.sidecar.probe_timeout(),
            },
        ));
        let orchestrator = Arc::new(ServiceOrchestrator::new(
            runtime,
            prober,
            proxy_config,
            OrchestratorOptions {
                network: settings.network.name.clone(),
                ready_timeout: settings.sidecar.ready_timeout(),
            },
        ));

        let fetcher = Arc::new(GitFetcher::new(
            layout.repo_cache_dir(),
            FetcherOptions {
                git_bin: settings.runtime.git_bin.clone(),
                clone_timeout: settings.runtime.command_timeout(),
            },
        ));
        let builder = Arc::new(DockerImageBuilder::new(
            docker.clone(),
            layout.dockerfile_template_file(),
            layout.builds_dir(),
            settings.ports.app,
        ));
        let health = Arc::new(MtlsHealthChecker::new(
            layout.clone(),
            HealthCheckOptions {
                inbound_port: settings.ports.inbound,
                ..Default::default()
            },
        ));

        let pipeline = Arc::new(DeployPipeline::new(
            fetcher.clone(),
            builder,
            orchestrator,
            health,
            PipelineOptions {
                app_port: settings.ports.app,
                otlp_endpoint: settings.telemetry.otlp_endpoint.clone(),
            },
        ));

        Self {
            layout,
            settings,
            docker,
            ca,
            fetcher,
            pipeline,
        }
    }

    /// Load settings from the layout and wire components
    pub fn load(layout: StorageLayout) -> Result<Self, DeployError> {
        let settings = Settings::load(&layout)?;
        Ok(Self::init(layout, settings))
    }

    /// Token verifier for the admin API, `None` when no secret is configured
    pub fn verifier(&self) -> Option<Arc<JwtVerifier>> {
        let auth = &self.settings.auth;
        match &auth.jwt_secret {
            Some(secret) if !secret.is_empty() => {
                let secret = SecretString::from(secret.clone());
                Some(Arc::new(JwtVerifier::new(&secret, &auth.audience, auth.issuer.as_deref())))
            }
            _ => {
                warn!("auth.jwt_secret is not set, the admin API is unauthenticated");
                None
            }
        }
    }

    /// Create the storage layout, the root CA and the container network
    pub async fn prepare(&self) -> Result<(), DeployError> {
        self.layout.setup().await?;
        self.ca.ensure_root().await?;
        self.docker
            .ensure_network(&self.settings.network.name, &self.settings.network.subnet)
            .await?;
        info!("Network {} is ready", self.settings.network.name);
        Ok(())
    }
}

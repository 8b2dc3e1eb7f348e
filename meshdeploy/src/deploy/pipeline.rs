//! Batch deploys: slug to running, health-checked service

use std::collections::BTreeMap;
use std::sync::Arc;

use meshdeploy_api::{DeployStage, DeploymentOutcome, ProgressEvent};
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::deploy::fsm::OrchestrationState;
use crate::deploy::git::RepoFetcher;
use crate::deploy::image::ImageBuilder;
use crate::deploy::orchestrator::{Observer, OrchestratorEvent, ServiceOrchestrator};
use crate::deploy::slug::RepoSlug;
use crate::errors::DeployError;
use crate::health::HealthCheck;
use crate::runtime::ContainerOptions;

pub type ProgressSender = mpsc::UnboundedSender<ProgressEvent>;

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Port the application listens on inside its container
    pub app_port: u16,
    /// Collector endpoint handed to applications
    pub otlp_endpoint: String,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            app_port: 50051,
            otlp_endpoint: "http://localhost:4317".to_string(),
        }
    }
}

/// Emits progress frames for one slug of a batch
struct Reporter<'a> {
    step: usize,
    total: usize,
    slug: &'a str,
    sender: Option<&'a ProgressSender>,
}

impl Reporter<'_> {
    fn emit(&self, status: DeployStage, message: Option<String>) {
        let Some(sender) = self.sender else {
            return;
        };
        // A closed receiver means the client went away; the deploy still runs
        // to completion.
        let _ = sender.send(ProgressEvent {
            step: self.step,
            total: self.total,
            slug: self.slug.to_string(),
            status,
            message,
        });
    }
}

pub struct DeployPipeline {
    fetcher: Arc<dyn RepoFetcher>,
    builder: Arc<dyn ImageBuilder>,
    orchestrator: Arc<ServiceOrchestrator>,
    health: Arc<dyn HealthCheck>,
    options: PipelineOptions,
}

impl DeployPipeline {
    pub fn new(
        fetcher: Arc<dyn RepoFetcher>,
        builder: Arc<dyn ImageBuilder>,
        orchestrator: Arc<ServiceOrchestrator>,
        health: Arc<dyn HealthCheck>,
        options: PipelineOptions,
    ) -> Self {
        Self {
            fetcher,
            builder,
            orchestrator,
            health,
            options,
        }
    }

    pub fn orchestrator(&self) -> &Arc<ServiceOrchestrator> {
        &self.orchestrator
    }

    pub fn health(&self) -> &Arc<dyn HealthCheck> {
        &self.health
    }

    /// Deploy every slug in request order. A failed slug is recorded in its
    /// outcome and the batch moves on.
    pub async fn deploy_batch(
        &self,
        slugs: &[String],
        wait_for_ready: bool,
        progress: Option<&ProgressSender>,
    ) -> Vec<DeploymentOutcome> {
        let total = slugs.len();
        let mut outcomes = Vec::with_capacity(total);

        for (index, slug) in slugs.iter().enumerate() {
            let reporter = Reporter {
                step: index + 1,
                total,
                slug,
                sender: progress,
            };
            outcomes.push(self.deploy_one(&reporter, wait_for_ready).await);
        }

        let deployed = outcomes.iter().filter(|o| o.deployed).count();
        info!("Batch finished: {}/{} services deployed", deployed, total);
        outcomes
    }

    async fn deploy_one(&self, reporter: &Reporter<'_>, wait_for_ready: bool) -> DeploymentOutcome {
        let mut outcome = DeploymentOutcome {
            slug: reporter.slug.to_string(),
            ..Default::default()
        };

        match self.run_stages(reporter, wait_for_ready, &mut outcome).await {
            Ok(()) => {
                outcome.deployed = true;
                reporter.emit(DeployStage::Completed, None);
            }
            Err(e) => {
                error!("Deploy of {} failed: {}", reporter.slug, e);
                outcome.error = Some(e.to_string());
                reporter.emit(DeployStage::Error, Some(e.to_string()));
            }
        }
        outcome
    }

    async fn run_stages(
        &self,
        reporter: &Reporter<'_>,
        wait_for_ready: bool,
        outcome: &mut DeploymentOutcome,
    ) -> Result<(), DeployError> {
        reporter.emit(DeployStage::Parsing, None);
        let slug = RepoSlug::parse(reporter.slug)?;
        let identity = slug.identity()?;
        outcome.service_name = identity.name().to_string();

        reporter.emit(DeployStage::Fetching, None);
        let repo_path = self.fetcher.fetch(&slug).await?;

        reporter.emit(DeployStage::DetectingEntrypoint, None);
        let entrypoint = self
            .fetcher
            .detect_entrypoint(&repo_path)
            .await
            .ok_or_else(|| DeployError::EntrypointNotFound(slug.to_string()))?;
        info!("Entrypoint of {} is {}", slug, entrypoint);

        reporter.emit(DeployStage::Building, None);
        let image = self.builder.build(&repo_path, &slug, &entrypoint).await?;
        outcome.image_name = Some(image.clone());

        let observer = |event: OrchestratorEvent| match event {
            OrchestratorEvent::Transition(OrchestrationState::StartingSidecar) => {
                reporter.emit(DeployStage::ConfiguringEnvoy, None)
            }
            OrchestratorEvent::SidecarConfigRendered => reporter.emit(DeployStage::StartingContainers, None),
            OrchestratorEvent::Transition(_) => {}
        };
        let deployed = self
            .orchestrator
            .deploy(&identity, &image, self.app_options(), Some(&observer as Observer<'_>))
            .await?;
        outcome.app_container_id = Some(deployed.app_container_id);
        outcome.sidecar_container_id = Some(deployed.sidecar.container_id);
        reporter.emit(DeployStage::Started, None);

        let runtime = self.orchestrator.runtime();
        outcome.app_ip = runtime.ip(identity.name()).await;
        outcome.sidecar_ip = runtime.ip(&identity.sidecar_name()).await;

        if wait_for_ready {
            reporter.emit(DeployStage::HealthCheck, None);
            let status = self.health.check(&identity).await;
            info!("Health of {}: {} ({})", identity, status.status.as_str(), status.message);
            outcome.health_status = Some(status);
        }
        Ok(())
    }

    fn app_options(&self) -> ContainerOptions {
        ContainerOptions {
            environment: BTreeMap::from([
                ("OTEL_EXPORTER_OTLP_ENDPOINT".to_string(), self.options.otlp_endpoint.clone()),
                ("GRPC_PORT".to_string(), self.options.app_port.to_string()),
            ]),
            ..Default::default()
        }
    }
}

//! Server state

use std::sync::Arc;

use crate::authn::jwt::JwtVerifier;
use crate::deploy::pipeline::DeployPipeline;
use crate::health::HealthCheck;
use crate::runtime::ContainerRuntime;

/// Server state shared across handlers
pub struct ServerState {
    pub pipeline: Arc<DeployPipeline>,

    /// `None` disables authentication on every route
    pub verifier: Option<Arc<JwtVerifier>>,
}

impl ServerState {
    pub fn new(pipeline: Arc<DeployPipeline>, verifier: Option<Arc<JwtVerifier>>) -> Self {
        Self { pipeline, verifier }
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        self.pipeline.orchestrator().runtime()
    }

    pub fn health(&self) -> &Arc<dyn HealthCheck> {
        self.pipeline.health()
    }
}

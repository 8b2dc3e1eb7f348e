//! Admin API models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Health response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
    pub timestamp: DateTime<Utc>,
}

/// Version response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionResponse {
    pub version: String,
    pub git_hash: String,
    pub build_time: String,
}

/// Error body returned by every failing endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}

/// Deploy request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployRequest {
    #[serde(default)]
    pub slugs: Vec<String>,

    #[serde(default = "default_true")]
    pub wait_for_ready: bool,
}

fn default_true() -> bool {
    true
}

/// Stage a service has reached in a batch deploy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployStage {
    Parsing,
    Fetching,
    DetectingEntrypoint,
    Building,
    ConfiguringEnvoy,
    StartingContainers,
    Started,
    HealthCheck,
    Completed,
    Error,
}

impl DeployStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeployStage::Parsing => "parsing",
            DeployStage::Fetching => "fetching",
            DeployStage::DetectingEntrypoint => "detecting_entrypoint",
            DeployStage::Building => "building",
            DeployStage::ConfiguringEnvoy => "configuring_envoy",
            DeployStage::StartingContainers => "starting_containers",
            DeployStage::Started => "started",
            DeployStage::HealthCheck => "health_check",
            DeployStage::Completed => "completed",
            DeployStage::Error => "error",
        }
    }

    /// Whether this stage ends the pipeline for one service
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeployStage::Completed | DeployStage::Error)
    }
}

impl std::fmt::Display for DeployStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One progress frame of a batch deploy, attributable to a single slug
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// 1-based position of the slug in the request
    pub step: usize,
    pub total: usize,
    pub slug: String,
    pub status: DeployStage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Final frame of a batch deploy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploySummary {
    pub status: DeployStage,
    pub results: Vec<DeploymentOutcome>,
}

/// A frame of the streamed deploy response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DeployFrame {
    Progress(ProgressEvent),
    Summary(DeploySummary),
}

/// Serving status reported by a service health check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServingStatus {
    Unknown,
    Serving,
    NotServing,
    ServiceUnknown,
}

impl ServingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServingStatus::Unknown => "UNKNOWN",
            ServingStatus::Serving => "SERVING",
            ServingStatus::NotServing => "NOT_SERVING",
            ServingStatus::ServiceUnknown => "SERVICE_UNKNOWN",
        }
    }
}

/// Health of a deployed service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: ServingStatus,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl HealthStatus {
    pub fn new(status: ServingStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn is_serving(&self) -> bool {
        self.status == ServingStatus::Serving
    }
}

/// Result of deploying one slug
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeploymentOutcome {
    pub slug: String,
    pub service_name: String,
    pub deployed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_container_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sidecar_container_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_status: Option<HealthStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sidecar_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DeploymentOutcome {
    pub fn failed(slug: impl Into<String>, service_name: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            slug: slug.into(),
            service_name: service_name.into(),
            deployed: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// A deployed service as seen by the container runtime
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSummary {
    pub name: String,
    pub status: String,
}

/// Service list response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServicesResponse {
    pub services: Vec<ServiceSummary>,
}

/// Container logs response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogsResponse {
    pub logs: String,
}

/// One line of a followed log stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    pub log: String,
}

/// Service health response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceHealthResponse {
    pub service_name: String,
    pub health_status: HealthStatus,
}

/// Destroy response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestroyResponse {
    pub destroyed: Vec<String>,
}

//! Error types for meshdeploy

use thiserror::Error;

/// Main error type for meshdeploy
#[derive(Error, Debug)]
pub enum DeployError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Crypto error: {0}")]
    Crypto(#[from] openssl::error::ErrorStack),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Template error: {0}")]
    Template(String),

    #[error("Invalid slug: {0}")]
    InvalidSlug(String),

    #[error("Invalid service identity: {0}")]
    InvalidIdentity(String),

    #[error("Failed to fetch repository: {0}")]
    Fetch(String),

    #[error("No entrypoint detected in {0}")]
    EntrypointNotFound(String),

    #[error("Image build failed: {0}")]
    Build(String),

    #[error("Sidecar for {service} failed to start: {source}")]
    SidecarStart {
        service: String,
        #[source]
        source: Box<DeployError>,
    },

    #[error("Sidecar for {0} failed to become ready")]
    SidecarNotReady(String),

    #[error("Application container for {service} failed to start: {source}")]
    AppStart {
        service: String,
        #[source]
        source: Box<DeployError>,
    },

    #[error("Container runtime error: {0}")]
    Runtime(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Server error: {0}")]
    Server(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DeployError {
    /// The error that triggered a rollback, if this error wraps one
    pub fn root_cause(&self) -> &DeployError {
        match self {
            DeployError::SidecarStart { source, .. } | DeployError::AppStart { source, .. } => {
                source.root_cause()
            }
            other => other,
        }
    }
}

impl From<figment::Error> for DeployError {
    fn from(err: figment::Error) -> Self {
        DeployError::Config(err.to_string())
    }
}

impl From<anyhow::Error> for DeployError {
    fn from(err: anyhow::Error) -> Self {
        DeployError::Internal(err.to_string())
    }
}

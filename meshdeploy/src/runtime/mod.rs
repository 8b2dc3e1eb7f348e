//! Container runtime abstraction

pub mod docker;

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use futures::stream::BoxStream;
use meshdeploy_api::ServiceSummary;

use crate::errors::DeployError;
use crate::mesh::identity::ServiceIdentity;

/// Log lines of a followed container, ending when the container stops or
/// the stream is dropped
pub type LogStream = BoxStream<'static, String>;

/// Label carrying the owning service name on every container this tool starts
pub const SERVICE_LABEL: &str = "meshdeploy.service";

/// Label distinguishing application containers from sidecars
pub const ROLE_LABEL: &str = "meshdeploy.role";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerRole {
    App,
    Sidecar,
}

impl ContainerRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerRole::App => "app",
            ContainerRole::Sidecar => "sidecar",
        }
    }
}

/// A host path bound into a container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub source: PathBuf,
    pub target: String,
    pub read_only: bool,
}

impl Mount {
    pub fn read_only(source: impl Into<PathBuf>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            read_only: true,
        }
    }

    /// `-v` argument form
    pub fn to_arg(&self) -> String {
        let mut arg = format!("{}:{}", self.source.display(), self.target);
        if self.read_only {
            arg.push_str(":ro");
        }
        arg
    }
}

/// A published port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortMapping {
    pub host: u16,
    pub container: u16,
}

impl PortMapping {
    /// Publish a port on the same number on the host
    pub fn same(port: u16) -> Self {
        Self {
            host: port,
            container: port,
        }
    }

    pub fn to_arg(&self) -> String {
        format!("{}:{}", self.host, self.container)
    }
}

/// Environment, mounts and published ports of a container
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerOptions {
    pub environment: BTreeMap<String, String>,
    pub volumes: Vec<Mount>,
    pub ports: Vec<PortMapping>,
}

/// Everything needed to run one container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub network: String,
    pub options: ContainerOptions,
    pub labels: BTreeMap<String, String>,
    /// Overrides the image's default command when not empty
    pub command: Vec<String>,
}

impl ContainerSpec {
    /// Spec for a service's application container
    pub fn app(
        identity: &ServiceIdentity,
        image: impl Into<String>,
        network: impl Into<String>,
        options: ContainerOptions,
    ) -> Self {
        Self {
            name: identity.name().to_string(),
            image: image.into(),
            network: network.into(),
            options,
            labels: labels_for(identity, ContainerRole::App),
            command: Vec::new(),
        }
    }
}

pub fn labels_for(identity: &ServiceIdentity, role: ContainerRole) -> BTreeMap<String, String> {
    BTreeMap::from([
        (SERVICE_LABEL.to_string(), identity.name().to_string()),
        (ROLE_LABEL.to_string(), role.as_str().to_string()),
    ])
}

/// A started sidecar and the config file it mounts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SidecarHandle {
    pub container_id: String,
    pub config_path: PathBuf,
}

/// Process lifecycle primitives for application and sidecar containers.
///
/// The runtime is the source of truth for container state; implementations
/// cache nothing beyond the config files of sidecars they started.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Whether a container with exactly this name exists, running or not
    async fn exists(&self, name: &str) -> bool;

    /// Whether a container with exactly this name is running
    async fn running(&self, name: &str) -> bool;

    /// Create and start a detached container. Returns its id.
    async fn start(&self, spec: &ContainerSpec) -> Result<String, DeployError>;

    /// Materialize `config` and start the service's sidecar with it
    async fn start_sidecar(
        &self,
        identity: &ServiceIdentity,
        config: &str,
    ) -> Result<SidecarHandle, DeployError>;

    async fn stop(&self, name: &str) -> Result<(), DeployError>;

    /// Remove a container and any sidecar config tracked for it. The config
    /// is deleted even when the runtime call fails.
    async fn remove(&self, name: &str) -> Result<(), DeployError>;

    /// Last `tail` log lines, or an error description
    async fn logs(&self, name: &str, tail: usize) -> String;

    /// The last `tail` log lines followed by new ones as they are written
    async fn follow_logs(&self, name: &str, tail: usize) -> Result<LogStream, DeployError>;

    /// Container address on its network, `None` when it cannot be resolved
    async fn ip(&self, name: &str) -> Option<String>;

    /// Application containers started by this tool
    async fn list_services(&self) -> Result<Vec<ServiceSummary>, DeployError>;

    /// Every container started by this tool, sidecars included
    async fn list_managed(&self) -> Result<Vec<String>, DeployError>;

    /// Create the shared network unless it already exists
    async fn ensure_network(&self, name: &str, subnet: &str) -> Result<(), DeployError>;
}

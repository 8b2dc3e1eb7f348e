//! Settings file management
//!
//! Settings are layered: built-in defaults, then `settings.json` in the
//! storage layout, then `MESHDEPLOY_*` environment variables (`__` separates
//! nested keys, e.g. `MESHDEPLOY_PORTS__ADMIN=9902`).

use std::time::Duration;

use figment::providers::{Env, Format, Json, Serialized};
use figment::Figment;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::errors::DeployError;
use crate::logs::LogLevel;
use crate::storage::layout::StorageLayout;

/// Environment variable prefix for settings overrides
pub const ENV_PREFIX: &str = "MESHDEPLOY_";

/// meshdeploy settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Emit JSON log lines
    #[serde(default)]
    pub log_json: bool,

    /// Also write daily-rotated log files under the layout's logs directory
    #[serde(default)]
    pub log_to_file: bool,

    #[serde(default)]
    pub network: NetworkSettings,

    #[serde(default)]
    pub ports: PortSettings,

    #[serde(default)]
    pub sidecar: SidecarSettings,

    #[serde(default)]
    pub runtime: RuntimeSettings,

    #[serde(default)]
    pub ca: CaSettings,

    #[serde(default)]
    pub telemetry: TelemetrySettings,

    #[serde(default)]
    pub server: ServerSettings,

    #[serde(default)]
    pub auth: AuthSettings,

    #[serde(default)]
    pub cache: CacheSettings,
}

impl Settings {
    /// Load settings for a storage layout
    pub fn load(layout: &StorageLayout) -> Result<Self, DeployError> {
        let settings: Settings = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Json::file(layout.settings_file().path()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Reject settings that would produce a broken deployment
    pub fn validate(&self) -> Result<(), DeployError> {
        if self.network.name.trim().is_empty() {
            return Err(DeployError::Config("network.name must not be empty".to_string()));
        }
        self.network.subnet()?;

        let ports = [
            ("ports.app", self.ports.app),
            ("ports.inbound", self.ports.inbound),
            ("ports.outbound", self.ports.outbound),
            ("ports.admin", self.ports.admin),
        ];
        for (name, port) in ports {
            if port == 0 {
                return Err(DeployError::Config(format!("{} must not be 0", name)));
            }
        }
        if self.ports.inbound == self.ports.admin {
            return Err(DeployError::Config(
                "ports.inbound and ports.admin are both published and must differ".to_string(),
            ));
        }

        Url::parse(&self.telemetry.otlp_endpoint).map_err(|e| {
            DeployError::Config(format!(
                "invalid telemetry.otlp_endpoint '{}': {}",
                self.telemetry.otlp_endpoint, e
            ))
        })?;

        if self.sidecar.ready_timeout_secs == 0 {
            return Err(DeployError::Config(
                "sidecar.ready_timeout_secs must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

/// Container network settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSettings {
    /// User-defined network every container joins. Also the DNS domain
    /// placed in service certificates.
    #[serde(default = "default_network_name")]
    pub name: String,

    #[serde(default = "default_subnet")]
    pub subnet: String,
}

impl NetworkSettings {
    pub fn subnet(&self) -> Result<IpNet, DeployError> {
        self.subnet
            .parse()
            .map_err(|e| DeployError::Config(format!("invalid network.subnet '{}': {}", self.subnet, e)))
    }
}

fn default_network_name() -> String {
    "meshnet".to_string()
}

fn default_subnet() -> String {
    "172.20.0.0/16".to_string()
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            name: default_network_name(),
            subnet: default_subnet(),
        }
    }
}

/// Port assignments shared by the proxy config and the container runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortSettings {
    /// Port the application listens on inside its container
    #[serde(default = "default_app_port")]
    pub app: u16,

    /// Sidecar mTLS listener, published on the host
    #[serde(default = "default_inbound_port")]
    pub inbound: u16,

    /// Sidecar egress listener
    #[serde(default = "default_outbound_port")]
    pub outbound: u16,

    /// Sidecar admin/metrics listener, published on the host
    #[serde(default = "default_admin_port")]
    pub admin: u16,
}

fn default_app_port() -> u16 {
    50051
}

fn default_inbound_port() -> u16 {
    15000
}

fn default_outbound_port() -> u16 {
    15001
}

fn default_admin_port() -> u16 {
    9901
}

impl Default for PortSettings {
    fn default() -> Self {
        Self {
            app: default_app_port(),
            inbound: default_inbound_port(),
            outbound: default_outbound_port(),
            admin: default_admin_port(),
        }
    }
}

/// Sidecar container settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SidecarSettings {
    #[serde(default = "default_sidecar_image")]
    pub image: String,

    #[serde(default = "default_ready_timeout")]
    pub ready_timeout_secs: u64,

    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,
}

impl SidecarSettings {
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

fn default_sidecar_image() -> String {
    "envoyproxy/envoy:v1.28-latest".to_string()
}

fn default_ready_timeout() -> u64 {
    30
}

fn default_poll_interval() -> u64 {
    1000
}

fn default_probe_timeout() -> u64 {
    2000
}

impl Default for SidecarSettings {
    fn default() -> Self {
        Self {
            image: default_sidecar_image(),
            ready_timeout_secs: default_ready_timeout(),
            poll_interval_ms: default_poll_interval(),
            probe_timeout_ms: default_probe_timeout(),
        }
    }
}

/// Container runtime CLI settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeSettings {
    /// Path or name of the docker-compatible CLI
    #[serde(default = "default_docker_bin")]
    pub docker_bin: String,

    /// Used when a repository archive cannot be downloaded
    #[serde(default = "default_git_bin")]
    pub git_bin: String,

    /// Upper bound for every runtime call except image builds
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,

    #[serde(default = "default_build_timeout")]
    pub build_timeout_secs: u64,
}

impl RuntimeSettings {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.build_timeout_secs)
    }
}

fn default_docker_bin() -> String {
    "docker".to_string()
}

fn default_git_bin() -> String {
    "git".to_string()
}

fn default_command_timeout() -> u64 {
    120
}

fn default_build_timeout() -> u64 {
    1800
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            docker_bin: default_docker_bin(),
            git_bin: default_git_bin(),
            command_timeout_secs: default_command_timeout(),
            build_timeout_secs: default_build_timeout(),
        }
    }
}

/// Certificate authority settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaSettings {
    /// Organization placed in certificate subjects
    #[serde(default = "default_organization")]
    pub organization: String,
}

fn default_organization() -> String {
    "meshdeploy".to_string()
}

impl Default for CaSettings {
    fn default() -> Self {
        Self {
            organization: default_organization(),
        }
    }
}

/// Telemetry passed through to deployed applications
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetrySettings {
    #[serde(default = "default_otlp_endpoint")]
    pub otlp_endpoint: String,
}

fn default_otlp_endpoint() -> String {
    "http://localhost:4317".to_string()
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            otlp_endpoint: default_otlp_endpoint(),
        }
    }
}

/// Admin API server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_server_host")]
    pub host: String,

    #[serde(default = "default_server_port")]
    pub port: u16,
}

fn default_server_host() -> String {
    "127.0.0.1".to_string()
}

fn default_server_port() -> u16 {
    8080
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_server_host(),
            port: default_server_port(),
        }
    }
}

/// Admin API authentication settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthSettings {
    /// HS256 secret for bearer tokens. Authentication is disabled when unset.
    #[serde(default)]
    pub jwt_secret: Option<String>,

    #[serde(default = "default_audience")]
    pub audience: String,

    #[serde(default)]
    pub issuer: Option<String>,
}

fn default_audience() -> String {
    "authenticated".to_string()
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            jwt_secret: None,
            audience: default_audience(),
            issuer: None,
        }
    }
}

/// Fetched repository cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    #[serde(default = "default_max_age_days")]
    pub max_age_days: u64,
}

impl CacheSettings {
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_days * 24 * 60 * 60)
    }
}

fn default_max_age_days() -> u64 {
    7
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            max_age_days: default_max_age_days(),
        }
    }
}

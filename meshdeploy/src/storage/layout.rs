//! Storage layout configuration

use std::path::PathBuf;

use crate::errors::DeployError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;

/// Environment variable overriding the default base directory
pub const HOME_ENV_VAR: &str = "MESHDEPLOY_HOME";

/// Storage layout for meshdeploy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageLayout {
    /// Base directory for all storage
    pub base_dir: PathBuf,
}

impl StorageLayout {
    /// Create a new storage layout
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Get the settings file path
    pub fn settings_file(&self) -> File {
        File::new(self.base_dir.join("settings.json"))
    }

    /// Directory holding the root CA and every service certificate
    pub fn secrets_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("secrets"))
    }

    pub fn ca_cert_file(&self) -> File {
        self.secrets_dir().file("ca.pem")
    }

    pub fn ca_key_file(&self) -> File {
        self.secrets_dir().file("ca.key")
    }

    /// Leaf certificate of a service. Derived from the name alone.
    pub fn service_cert_file(&self, service_name: &str) -> File {
        self.secrets_dir().file(&format!("{}.crt", service_name))
    }

    /// Leaf private key of a service. Derived from the name alone.
    pub fn service_key_file(&self, service_name: &str) -> File {
        self.secrets_dir().file(&format!("{}.key", service_name))
    }

    /// Directory for rendered sidecar configs of live sidecars
    pub fn sidecars_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("sidecars"))
    }

    /// Get the templates directory
    pub fn templates_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("templates"))
    }

    pub fn envoy_template_file(&self) -> File {
        self.templates_dir().file("envoy.yaml.tmpl")
    }

    pub fn dockerfile_template_file(&self) -> File {
        self.templates_dir().file("app.Dockerfile.tmpl")
    }

    /// Get the fetched repositories cache directory
    pub fn repo_cache_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("cache").join("repos"))
    }

    /// Scratch space for rendered Dockerfiles
    pub fn builds_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("cache").join("builds"))
    }

    /// Get the logs directory
    pub fn logs_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("logs"))
    }

    /// Setup the storage layout (create directories)
    pub async fn setup(&self) -> Result<(), DeployError> {
        self.secrets_dir().create().await?;
        self.sidecars_dir().create().await?;
        self.templates_dir().create().await?;
        self.repo_cache_dir().create().await?;
        self.builds_dir().create().await?;
        self.logs_dir().create().await?;
        Ok(())
    }
}

impl Default for StorageLayout {
    fn default() -> Self {
        if let Some(home) = std::env::var_os(HOME_ENV_VAR) {
            return Self::new(home);
        }

        #[cfg(target_os = "linux")]
        let base_dir = PathBuf::from("/var/lib/meshdeploy");

        #[cfg(not(target_os = "linux"))]
        let base_dir = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".meshdeploy");

        Self::new(base_dir)
    }
}

#[cfg(not(target_os = "linux"))]
mod dirs {
    use std::path::PathBuf;

    pub fn home_dir() -> Option<PathBuf> {
        std::env::var_os("HOME")
            .or_else(|| std::env::var_os("USERPROFILE"))
            .map(PathBuf::from)
    }
}

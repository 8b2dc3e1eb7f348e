//! Sidecar proxy configuration

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::errors::DeployError;
use crate::filesys::file::File;
use crate::mesh::ca::CertificateAuthority;
use crate::mesh::identity::ServiceIdentity;
use crate::mesh::template::Template;
use crate::storage::settings::PortSettings;

/// Directory the certificates are mounted at inside the sidecar
pub const SIDECAR_CERT_DIR: &str = "/etc/envoy/certs";
pub const SIDECAR_CA_CERT_PATH: &str = "/etc/envoy/certs/ca.crt";
pub const SIDECAR_CERT_PATH: &str = "/etc/envoy/certs/tls.crt";
pub const SIDECAR_KEY_PATH: &str = "/etc/envoy/certs/tls.key";

/// Path the rendered config is mounted at inside the sidecar
pub const SIDECAR_CONFIG_PATH: &str = "/etc/envoy/envoy.yaml";

/// Renders a sidecar config for a service from the on-disk template
#[derive(Debug, Clone)]
pub struct ProxyConfigGenerator {
    ca: Arc<CertificateAuthority>,
    template_file: File,
    ports: PortSettings,
}

impl ProxyConfigGenerator {
    pub fn new(ca: Arc<CertificateAuthority>, template_file: File, ports: PortSettings) -> Self {
        Self {
            ca,
            template_file,
            ports,
        }
    }

    pub fn ports(&self) -> &PortSettings {
        &self.ports
    }

    /// Render the sidecar config, issuing the service's leaf certificate first
    /// if it does not exist yet.
    pub async fn generate(&self, identity: &ServiceIdentity) -> Result<String, DeployError> {
        if !self.ca.leaf_exists(identity).await {
            self.ca.issue_leaf(identity).await?;
        }

        if !self.template_file.exists().await {
            return Err(DeployError::Template(format!(
                "sidecar template not found at {:?}",
                self.template_file.path()
            )));
        }
        let source = self.template_file.read_string().await?;
        let template = Template::parse(&source)?;

        debug!("Rendering sidecar config for {}", identity);
        template.render(&self.values(identity))
    }

    fn values(&self, identity: &ServiceIdentity) -> HashMap<&'static str, String> {
        HashMap::from([
            ("service_name", identity.name().to_string()),
            ("app_port", self.ports.app.to_string()),
            ("inbound_port", self.ports.inbound.to_string()),
            ("outbound_port", self.ports.outbound.to_string()),
            ("admin_port", self.ports.admin.to_string()),
            ("ca_cert_path", SIDECAR_CA_CERT_PATH.to_string()),
            ("cert_path", SIDECAR_CERT_PATH.to_string()),
            ("key_path", SIDECAR_KEY_PATH.to_string()),
        ])
    }
}

/// Default sidecar template written by `meshdeploy init`
pub const DEFAULT_ENVOY_TEMPLATE: &str = include_str!("../../templates/envoy.yaml.tmpl");

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::layout::StorageLayout;

    async fn generator(root: &std::path::Path) -> (ProxyConfigGenerator, Arc<CertificateAuthority>) {
        let layout = StorageLayout::new(root);
        let ca = Arc::new(CertificateAuthority::new(layout.clone(), "meshdeploy", "meshnet"));
        layout
            .envoy_template_file()
            .write_string(DEFAULT_ENVOY_TEMPLATE)
            .await
            .unwrap();
        let generator = ProxyConfigGenerator::new(ca.clone(), layout.envoy_template_file(), PortSettings::default());
        (generator, ca)
    }

    #[tokio::test]
    async fn test_generate_renders_in_container_paths() {
        let dir = tempfile::tempdir().unwrap();
        let (generator, ca) = generator(dir.path()).await;
        let identity = ServiceIdentity::new("alice-todo").unwrap();

        let config = generator.generate(&identity).await.unwrap();

        assert!(ca.leaf_exists(&identity).await);
        assert!(config.contains("alice-todo"));
        assert!(config.contains("15000"));
        assert!(config.contains("9901"));
        assert!(config.contains("50051"));
        assert!(config.contains(SIDECAR_CERT_PATH));
        assert!(!config.contains(dir.path().to_str().unwrap()));
        assert!(!config.contains("{{"));
    }

    #[tokio::test]
    async fn test_generate_is_pure_given_disk_state() {
        let dir = tempfile::tempdir().unwrap();
        let (generator, ca) = generator(dir.path()).await;
        let identity = ServiceIdentity::new("alice-todo").unwrap();

        let first = generator.generate(&identity).await.unwrap();
        let cert = std::fs::read(&ca.leaf_paths(&identity).cert).unwrap();
        let second = generator.generate(&identity).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(cert, std::fs::read(&ca.leaf_paths(&identity).cert).unwrap());
    }

    #[tokio::test]
    async fn test_missing_template_is_template_error() {
        let dir = tempfile::tempdir().unwrap();
        let (generator, _) = generator(dir.path()).await;
        std::fs::remove_file(StorageLayout::new(dir.path()).envoy_template_file().path()).unwrap();

        let identity = ServiceIdentity::new("alice-todo").unwrap();
        assert!(matches!(
            generator.generate(&identity).await,
            Err(DeployError::Template(_))
        ));
    }

    #[tokio::test]
    async fn test_malformed_template_is_template_error() {
        let dir = tempfile::tempdir().unwrap();
        let (generator, _) = generator(dir.path()).await;
        StorageLayout::new(dir.path())
            .envoy_template_file()
            .write_string("cluster: {{ upstream_host }}\n")
            .await
            .unwrap();

        let identity = ServiceIdentity::new("alice-todo").unwrap();
        assert!(matches!(
            generator.generate(&identity).await,
            Err(DeployError::Template(_))
        ));
    }
}

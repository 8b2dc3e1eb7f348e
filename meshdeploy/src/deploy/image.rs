//! Application image builds

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::deploy::slug::RepoSlug;
use crate::errors::DeployError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;
use crate::mesh::template::Template;
use crate::runtime::docker::DockerCli;
use crate::utils::generate_uuid;

/// Default application Dockerfile written by `meshdeploy init`
pub const DEFAULT_DOCKERFILE_TEMPLATE: &str = include_str!("../../templates/app.Dockerfile.tmpl");

#[async_trait]
pub trait ImageBuilder: Send + Sync {
    /// Build the repository at `repo_path` and return the image reference
    async fn build(&self, repo_path: &Path, slug: &RepoSlug, entrypoint: &str) -> Result<String, DeployError>;
}

/// Tag every image built for a service gets
pub fn image_name(service_name: &str) -> String {
    format!("meshdeploy-{}:latest", service_name)
}

/// Renders the Dockerfile template and builds it with the docker CLI
pub struct DockerImageBuilder {
    docker: Arc<DockerCli>,
    template_file: File,
    scratch: Dir,
    app_port: u16,
}

impl DockerImageBuilder {
    pub fn new(docker: Arc<DockerCli>, template_file: File, scratch: Dir, app_port: u16) -> Self {
        Self {
            docker,
            template_file,
            scratch,
            app_port,
        }
    }

    pub async fn render_dockerfile(&self, entrypoint: &str) -> Result<String, DeployError> {
        if !self.template_file.exists().await {
            return Err(DeployError::Template(format!(
                "Dockerfile template not found at {:?}",
                self.template_file.path()
            )));
        }
        let template = Template::parse(&self.template_file.read_string().await?)?;
        template.render(&HashMap::from([
            ("grpc_port", self.app_port.to_string()),
            ("entrypoint", entrypoint.to_string()),
        ]))
    }
}

#[async_trait]
impl ImageBuilder for DockerImageBuilder {
    async fn build(&self, repo_path: &Path, slug: &RepoSlug, entrypoint: &str) -> Result<String, DeployError> {
        let dockerfile = self.render_dockerfile(entrypoint).await?;

        self.scratch.create().await?;
        let dockerfile_file = self.scratch.file(&format!("{}.Dockerfile", generate_uuid()));
        dockerfile_file.write_string(&dockerfile).await?;

        let tag = image_name(&slug.service_name());
        info!("Building {} for {} with entrypoint {}", tag, slug, entrypoint);
        let result = self.docker.build_image(dockerfile_file.path(), &tag, repo_path).await;

        if let Err(e) = dockerfile_file.delete().await {
            warn!("Failed to delete {:?}: {}", dockerfile_file.path(), e);
        }
        result.map(|_| tag)
    }
}

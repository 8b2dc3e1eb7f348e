//! Docker CLI container runtime

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use ipnet::IpNet;
use meshdeploy_api::ServiceSummary;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::errors::DeployError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;
use crate::mesh::envoy::{SIDECAR_CA_CERT_PATH, SIDECAR_CERT_PATH, SIDECAR_CONFIG_PATH, SIDECAR_KEY_PATH};
use crate::mesh::identity::ServiceIdentity;
use crate::runtime::{
    labels_for, ContainerOptions, ContainerRole, ContainerRuntime, ContainerSpec, LogStream, Mount,
    PortMapping, SidecarHandle, ROLE_LABEL, SERVICE_LABEL,
};
use crate::storage::layout::StorageLayout;
use crate::storage::settings::Settings;
use crate::utils::{generate_uuid, tail_lines};

const SIDECAR_CONFIG_MODE: u32 = 0o644;
const ENVOY_BIN: &str = "/usr/local/bin/envoy";
const ERROR_TAIL_LINES: usize = 20;

/// How sidecars are launched
#[derive(Debug, Clone)]
pub struct SidecarRunOptions {
    pub image: String,
    pub network: String,
    pub inbound_port: u16,
    pub admin_port: u16,
}

/// Options for the docker CLI adapter
#[derive(Debug, Clone)]
pub struct DockerOptions {
    pub docker_bin: String,
    pub command_timeout: Duration,
    pub build_timeout: Duration,
    pub sidecar: SidecarRunOptions,
}

impl DockerOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            docker_bin: settings.runtime.docker_bin.clone(),
            command_timeout: settings.runtime.command_timeout(),
            build_timeout: settings.runtime.build_timeout(),
            sidecar: SidecarRunOptions {
                image: settings.sidecar.image.clone(),
                network: settings.network.name.clone(),
                inbound_port: settings.ports.inbound,
                admin_port: settings.ports.admin,
            },
        }
    }
}

struct CommandOutput {
    success: bool,
    stdout: String,
    stderr: String,
}

/// Drives containers through the `docker` CLI. Every call is one process
/// invocation bounded by a timeout, with no retries.
pub struct DockerCli {
    options: DockerOptions,
    layout: StorageLayout,
    sidecar_configs: Mutex<HashMap<String, PathBuf>>,
}

impl DockerCli {
    pub fn new(options: DockerOptions, layout: StorageLayout) -> Self {
        Self {
            options,
            layout,
            sidecar_configs: Mutex::new(HashMap::new()),
        }
    }

    /// Config file tracked for a sidecar container, if any
    pub fn tracked_config(&self, name: &str) -> Option<PathBuf> {
        self.configs().get(name).cloned()
    }

    fn configs(&self) -> MutexGuard<'_, HashMap<String, PathBuf>> {
        match self.sidecar_configs.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    async fn run(&self, args: &[String], timeout: Duration) -> Result<CommandOutput, DeployError> {
        debug!("Running: {} {}", self.options.docker_bin, args.join(" "));

        let child = Command::new(&self.options.docker_bin)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| DeployError::Runtime(format!("Failed to run {}: {}", self.options.docker_bin, e)))?;

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(output) => output?,
            Err(_) => {
                return Err(DeployError::Runtime(format!(
                    "docker {} timed out after {:?}",
                    args.first().map(String::as_str).unwrap_or_default(),
                    timeout
                )));
            }
        };

        Ok(CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    async fn run_checked(&self, args: &[String]) -> Result<String, DeployError> {
        let output = self.run(args, self.options.command_timeout).await?;
        if !output.success {
            return Err(DeployError::Runtime(format!(
                "docker {} failed: {}",
                args.first().map(String::as_str).unwrap_or_default(),
                tail_lines(&output.stderr, ERROR_TAIL_LINES)
            )));
        }
        Ok(output.stdout)
    }

    async fn list_names(&self, all: bool, filter: &str) -> Result<Vec<String>, DeployError> {
        let mut args = vec!["ps".to_string()];
        if all {
            args.push("-a".to_string());
        }
        args.extend(["--filter".to_string(), filter.to_string()]);
        args.extend(["--format".to_string(), "{{.Names}}".to_string()]);

        let stdout = self.run_checked(&args).await?;
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    // The name filter is a substring match, so results are compared exactly.
    async fn has_container(&self, name: &str, all: bool) -> bool {
        match self.list_names(all, &format!("name={}", name)).await {
            Ok(names) => names.iter().any(|n| n == name),
            Err(e) => {
                debug!("Container lookup for {} failed: {}", name, e);
                false
            }
        }
    }

    /// Build an image from `context` using the Dockerfile at `dockerfile`
    pub async fn build_image(&self, dockerfile: &Path, tag: &str, context: &Path) -> Result<(), DeployError> {
        let args = vec![
            "build".to_string(),
            "-f".to_string(),
            dockerfile.display().to_string(),
            "-t".to_string(),
            tag.to_string(),
            context.display().to_string(),
        ];
        info!("Building image {}", tag);
        let output = self
            .run(&args, self.options.build_timeout)
            .await
            .map_err(|e| DeployError::Build(e.to_string()))?;
        if !output.success {
            return Err(DeployError::Build(tail_lines(&output.stderr, ERROR_TAIL_LINES)));
        }
        Ok(())
    }

    fn sidecar_spec(&self, identity: &ServiceIdentity, config_path: &Path) -> ContainerSpec {
        let sidecar = &self.options.sidecar;
        let volumes = vec![
            Mount::read_only(config_path, SIDECAR_CONFIG_PATH),
            Mount::read_only(self.layout.ca_cert_file().path(), SIDECAR_CA_CERT_PATH),
            Mount::read_only(self.layout.service_cert_file(identity.name()).path(), SIDECAR_CERT_PATH),
            Mount::read_only(self.layout.service_key_file(identity.name()).path(), SIDECAR_KEY_PATH),
        ];

        ContainerSpec {
            name: identity.sidecar_name(),
            image: sidecar.image.clone(),
            network: sidecar.network.clone(),
            options: ContainerOptions {
                environment: Default::default(),
                volumes,
                ports: vec![
                    PortMapping::same(sidecar.inbound_port),
                    PortMapping::same(sidecar.admin_port),
                ],
            },
            labels: labels_for(identity, ContainerRole::Sidecar),
            command: vec![
                ENVOY_BIN.to_string(),
                "-c".to_string(),
                SIDECAR_CONFIG_PATH.to_string(),
                "--service-cluster".to_string(),
                identity.name().to_string(),
                "--service-node".to_string(),
                format!("{}-node", identity.name()),
            ],
        }
    }

    async fn materialize_config(&self, config_file: &File, config: &str) -> Result<(), DeployError> {
        config_file.write_string(config).await?;
        config_file.set_mode(SIDECAR_CONFIG_MODE).await
    }

    fn sidecars_dir(&self) -> Dir {
        self.layout.sidecars_dir()
    }
}

fn line_stream<R>(reader: R) -> BoxStream<'static, String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let lines = BufReader::new(reader).lines();
    stream::unfold(lines, |mut lines| async move {
        match lines.next_line().await {
            Ok(Some(line)) => Some((line, lines)),
            Ok(None) => None,
            Err(e) => {
                debug!("Log stream read failed: {}", e);
                None
            }
        }
    })
    .boxed()
}

/// `docker run` arguments for a spec
pub fn run_args(spec: &ContainerSpec) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "-d".to_string(),
        "--name".to_string(),
        spec.name.clone(),
        "--network".to_string(),
        spec.network.clone(),
        "--restart".to_string(),
        "unless-stopped".to_string(),
    ];
    for (key, value) in &spec.labels {
        args.push("--label".to_string());
        args.push(format!("{}={}", key, value));
    }
    for (key, value) in &spec.options.environment {
        args.push("-e".to_string());
        args.push(format!("{}={}", key, value));
    }
    for mount in &spec.options.volumes {
        args.push("-v".to_string());
        args.push(mount.to_arg());
    }
    for port in &spec.options.ports {
        args.push("-p".to_string());
        args.push(port.to_arg());
    }
    args.push(spec.image.clone());
    args.extend(spec.command.iter().cloned());
    args
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn exists(&self, name: &str) -> bool {
        self.has_container(name, true).await
    }

    async fn running(&self, name: &str) -> bool {
        self.has_container(name, false).await
    }

    async fn start(&self, spec: &ContainerSpec) -> Result<String, DeployError> {
        info!("Starting container {} from {}", spec.name, spec.image);
        let stdout = self.run_checked(&run_args(spec)).await?;
        Ok(stdout.trim().to_string())
    }

    async fn start_sidecar(
        &self,
        identity: &ServiceIdentity,
        config: &str,
    ) -> Result<SidecarHandle, DeployError> {
        let config_file = self.sidecars_dir().file(&format!("{}.yaml", generate_uuid()));
        let spec = self.sidecar_spec(identity, config_file.path());
        let started = match self.materialize_config(&config_file, config).await {
            Ok(()) => self.start(&spec).await,
            Err(e) => Err(e),
        };

        match started {
            Ok(container_id) => {
                let config_path = config_file.path().to_path_buf();
                self.configs().insert(spec.name.clone(), config_path.clone());
                Ok(SidecarHandle {
                    container_id,
                    config_path,
                })
            }
            Err(e) => {
                if let Err(cleanup) = config_file.delete().await {
                    warn!("Failed to delete sidecar config {:?}: {}", config_file.path(), cleanup);
                }
                Err(e)
            }
        }
    }

    async fn stop(&self, name: &str) -> Result<(), DeployError> {
        debug!("Stopping container {}", name);
        self.run_checked(&["stop".to_string(), name.to_string()]).await?;
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<(), DeployError> {
        debug!("Removing container {}", name);
        let result = self.run_checked(&["rm".to_string(), name.to_string()]).await;

        let tracked = self.configs().remove(name);
        if let Some(path) = tracked {
            if let Err(e) = File::new(&path).delete().await {
                warn!("Failed to delete sidecar config {:?}: {}", path, e);
            }
        }

        result.map(|_| ())
    }

    async fn logs(&self, name: &str, tail: usize) -> String {
        let args = vec!["logs".to_string(), "--tail".to_string(), tail.to_string(), name.to_string()];
        match self.run(&args, self.options.command_timeout).await {
            Ok(output) if output.success => {
                // docker replays the container's stderr on its own stderr
                let mut logs = output.stdout;
                logs.push_str(&output.stderr);
                logs
            }
            Ok(output) => format!("Error getting logs: {}", output.stderr.trim()),
            Err(e) => format!("Error getting logs: {}", e),
        }
    }

    async fn follow_logs(&self, name: &str, tail: usize) -> Result<LogStream, DeployError> {
        let args = vec![
            "logs".to_string(),
            "-f".to_string(),
            "--tail".to_string(),
            tail.to_string(),
            name.to_string(),
        ];
        debug!("Running: {} {}", self.options.docker_bin, args.join(" "));

        let mut child = Command::new(&self.options.docker_bin)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| DeployError::Runtime(format!("Failed to run {}: {}", self.options.docker_bin, e)))?;

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(DeployError::Runtime("docker logs output was not captured".to_string()));
        };
        let lines = stream::select(line_stream(stdout), line_stream(stderr));

        // The child rides along so dropping the stream kills `docker logs -f`.
        Ok(stream::unfold((lines, child), |(mut lines, child)| async move {
            lines.next().await.map(|line| (line, (lines, child)))
        })
        .boxed())
    }

    async fn ip(&self, name: &str) -> Option<String> {
        let args = vec![
            "inspect".to_string(),
            "-f".to_string(),
            "{{range .NetworkSettings.Networks}}{{.IPAddress}} {{end}}".to_string(),
            name.to_string(),
        ];
        match self.run_checked(&args).await {
            Ok(stdout) => stdout.split_whitespace().next().map(str::to_string),
            Err(e) => {
                debug!("Could not resolve address of {}: {}", name, e);
                None
            }
        }
    }

    async fn list_services(&self) -> Result<Vec<ServiceSummary>, DeployError> {
        let args = vec![
            "ps".to_string(),
            "-a".to_string(),
            "--filter".to_string(),
            format!("label={}={}", ROLE_LABEL, ContainerRole::App.as_str()),
            "--format".to_string(),
            "{{.Names}}\t{{.State}}".to_string(),
        ];
        let stdout = self.run_checked(&args).await?;

        let mut services: Vec<ServiceSummary> = stdout
            .lines()
            .filter_map(|line| {
                let mut parts = line.trim().splitn(2, '\t');
                let name = parts.next().filter(|n| !n.is_empty())?;
                let state = parts.next().unwrap_or_default();
                Some(ServiceSummary {
                    name: name.to_string(),
                    status: if state == "running" { "running" } else { "stopped" }.to_string(),
                })
            })
            .collect();
        services.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(services)
    }

    async fn list_managed(&self) -> Result<Vec<String>, DeployError> {
        let mut names = self.list_names(true, &format!("label={}", SERVICE_LABEL)).await?;
        names.sort();
        Ok(names)
    }

    async fn ensure_network(&self, name: &str, subnet: &str) -> Result<(), DeployError> {
        let subnet: IpNet = subnet
            .parse()
            .map_err(|e| DeployError::Config(format!("invalid subnet '{}': {}", subnet, e)))?;

        let inspect = self
            .run(&["network".to_string(), "inspect".to_string(), name.to_string()], self.options.command_timeout)
            .await?;
        if inspect.success {
            debug!("Network {} already exists", name);
            return Ok(());
        }

        info!("Creating network {} ({})", name, subnet);
        self.run_checked(&[
            "network".to_string(),
            "create".to_string(),
            "--driver".to_string(),
            "bridge".to_string(),
            "--subnet".to_string(),
            subnet.to_string(),
            name.to_string(),
        ])
        .await?;
        Ok(())
    }
}

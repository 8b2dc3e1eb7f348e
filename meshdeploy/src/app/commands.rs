//! Command-line subcommands

use std::collections::HashMap;
use std::path::Path;

use colored::Colorize;
use futures::StreamExt;
use meshdeploy_api::{DeployStage, DeploymentOutcome, ProgressEvent};
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::app::state::AppState;
use crate::errors::DeployError;
use crate::filesys::file::File;
use crate::mesh::identity::ServiceIdentity;
use crate::runtime::LogStream;

const DEFAULT_LOG_TAIL: usize = 100;

/// `--key=value` and `--flag` arguments plus an optional positional command
#[derive(Debug, Clone, Default)]
pub struct CliArgs {
    pub command: Option<String>,
    pub flags: HashMap<String, String>,
}

impl CliArgs {
    pub fn parse(args: impl IntoIterator<Item = String>) -> Self {
        let mut parsed = CliArgs::default();
        for arg in args {
            if let Some((key, value)) = arg.split_once('=') {
                // Handle --key=value format
                let clean_key = key.trim_start_matches('-');
                parsed.flags.insert(clean_key.to_string(), value.to_string());
            } else if arg.starts_with("--") {
                // Handle standalone flags like --version
                let clean_key = arg.trim_start_matches('-');
                parsed.flags.insert(clean_key.to_string(), "true".to_string());
            } else if parsed.command.is_none() {
                parsed.command = Some(arg);
            }
        }
        parsed
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.flags.get(key).map(String::as_str)
    }

    pub fn has(&self, key: &str) -> bool {
        self.flags.contains_key(key)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SlugFile {
    List(Vec<String>),
    Object { slugs: Vec<String> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlugFileFormat {
    Json,
    Yaml,
}

impl SlugFileFormat {
    /// `.yaml` and `.yml` files are YAML, anything else is JSON
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => SlugFileFormat::Yaml,
            _ => SlugFileFormat::Json,
        }
    }
}

/// Parse a slug file: a list or an object with a `slugs` list
pub fn parse_slug_file(contents: &str, format: SlugFileFormat) -> Result<Vec<String>, DeployError> {
    let parsed = match format {
        SlugFileFormat::Json => serde_json::from_str::<SlugFile>(contents).map_err(|e| e.to_string()),
        SlugFileFormat::Yaml => serde_yaml::from_str::<SlugFile>(contents).map_err(|e| e.to_string()),
    };
    match parsed {
        Ok(SlugFile::List(slugs)) | Ok(SlugFile::Object { slugs }) => Ok(slugs),
        Err(e) => Err(DeployError::Config(format!(
            "slug file must be a list or an object with a \"slugs\" list: {}",
            e
        ))),
    }
}

/// Slugs from `--file=` followed by `--slug=a,b`
pub async fn collect_slugs(args: &CliArgs) -> Result<Vec<String>, DeployError> {
    let mut slugs = Vec::new();
    if let Some(path) = args.get("file") {
        let path = Path::new(path);
        let contents = File::new(path).read_string().await?;
        slugs.extend(parse_slug_file(&contents, SlugFileFormat::from_path(path))?);
    }
    if let Some(list) = args.get("slug") {
        slugs.extend(
            list.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
        );
    }
    Ok(slugs)
}

/// `meshdeploy deploy`. Returns whether every service deployed.
pub async fn deploy(state: &AppState, args: &CliArgs) -> Result<bool, DeployError> {
    let slugs = collect_slugs(args).await?;
    if slugs.is_empty() {
        return Err(DeployError::Config(
            "No slugs provided. Use --slug=a,b or --file=slugs.json".to_string(),
        ));
    }
    let wait_for_ready = !args.has("no-wait");

    state.prepare().await?;
    println!("Deploying {} service(s)...", slugs.len());

    let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
    let pipeline = state.pipeline.clone();
    let deploy = async move {
        let results = pipeline.deploy_batch(&slugs, wait_for_ready, Some(&progress_tx)).await;
        drop(progress_tx);
        results
    };
    let printer = async {
        while let Some(event) = progress_rx.recv().await {
            print_progress(&event);
        }
    };
    let (results, ()) = tokio::join!(deploy, printer);

    print_summary(&results, &state.settings.network.name, &state.settings.network.subnet);
    Ok(results.iter().all(|r| r.deployed))
}

fn print_progress(event: &ProgressEvent) {
    match event.status {
        DeployStage::Parsing => println!("[{}/{}] Processing {}...", event.step, event.total, event.slug),
        DeployStage::Error => {
            let message = event.message.as_deref().unwrap_or("unknown error");
            eprintln!("  {} {}", "Error:".red(), message);
        }
        DeployStage::Completed => println!("  {}", "Deployed successfully".green()),
        stage => println!("  {}...", stage.as_str().replace('_', " ")),
    }
}

fn print_summary(results: &[DeploymentOutcome], network: &str, subnet: &str) {
    let successful = results.iter().filter(|r| r.deployed).count();
    println!();
    println!("{}", "Deployment Summary:".bold());
    println!("  Successful: {}/{}", successful, results.len());
    println!("  Network: {} ({})", network, subnet);

    for result in results {
        if result.deployed {
            println!("  {} {}", "✓".green(), result.slug);
            if let Some(ip) = &result.app_ip {
                println!("    App IP: {}", ip);
            }
            if let Some(ip) = &result.sidecar_ip {
                println!("    Sidecar IP: {}", ip);
            }
            if let Some(health) = &result.health_status {
                println!("    Health: {} ({})", health.status.as_str(), health.message);
            }
        } else {
            println!("  {} {}", "✗".red(), result.slug);
            println!("    Error: {}", result.error.as_deref().unwrap_or("Unknown error"));
        }
    }
}

/// `meshdeploy destroy --yes`
pub async fn destroy(state: &AppState, args: &CliArgs) -> Result<(), DeployError> {
    if !args.has("yes") {
        return Err(DeployError::Config(
            "Refusing to destroy without --yes".to_string(),
        ));
    }
    println!("Destroying all managed containers...");
    let destroyed = state.pipeline.orchestrator().destroy_all().await?;
    for name in &destroyed {
        println!("  Removed container: {}", name);
    }
    println!("{} {} container(s) destroyed", "✓".green(), destroyed.len());
    Ok(())
}

/// `meshdeploy services`
pub async fn services(state: &AppState) -> Result<(), DeployError> {
    let services = state.pipeline.orchestrator().runtime().list_services().await?;
    if services.is_empty() {
        println!("No services deployed");
        return Ok(());
    }
    println!("{:<40} STATUS", "NAME");
    for service in services {
        let status = if service.status == "running" {
            service.status.green()
        } else {
            service.status.yellow()
        };
        println!("{:<40} {}", service.name, status);
    }
    Ok(())
}

/// Services named by `--service=`, or every deployed service
async fn target_services(state: &AppState, args: &CliArgs) -> Result<Vec<ServiceIdentity>, DeployError> {
    if let Some(name) = args.get("service") {
        return Ok(vec![ServiceIdentity::new(name)?]);
    }
    state
        .pipeline
        .orchestrator()
        .runtime()
        .list_services()
        .await?
        .into_iter()
        .map(|s| ServiceIdentity::new(s.name))
        .collect()
}

/// `meshdeploy logs [--service=x] [--tail=100] [--follow]`
pub async fn logs(state: &AppState, args: &CliArgs) -> Result<(), DeployError> {
    let tail = match args.get("tail") {
        Some(tail) => tail
            .parse()
            .map_err(|_| DeployError::Config(format!("invalid --tail value '{}'", tail)))?,
        None => DEFAULT_LOG_TAIL,
    };
    let runtime = state.pipeline.orchestrator().runtime();
    let services = target_services(state, args).await?;

    if args.has("follow") {
        let mut followed = Vec::with_capacity(services.len());
        for identity in services {
            let lines = runtime.follow_logs(identity.name(), tail).await?;
            followed.push((identity.name().to_string(), lines));
        }
        let mut merged = merge_followed(followed);
        while let Some(line) = merged.next().await {
            println!("{}", line);
        }
        return Ok(());
    }

    for identity in services {
        println!("{}", format!("==> {} <==", identity).bold());
        println!("{}", runtime.logs(identity.name(), tail).await);
    }
    Ok(())
}

/// Interleave followed logs, prefixing each line with its service once more
/// than one service is followed
fn merge_followed(followed: Vec<(String, LogStream)>) -> LogStream {
    let prefixed = followed.len() > 1;
    let streams = followed.into_iter().map(move |(name, lines)| {
        lines
            .map(move |line| {
                if prefixed {
                    format!("[{}] {}", name, line)
                } else {
                    line
                }
            })
            .boxed()
    });
    futures::stream::select_all(streams).boxed()
}

/// `meshdeploy health [--service=x]`. Returns whether every service is serving.
pub async fn health(state: &AppState, args: &CliArgs) -> Result<bool, DeployError> {
    let mut all_serving = true;
    for identity in target_services(state, args).await? {
        let status = state.pipeline.health().check(&identity).await;
        let label = if status.is_serving() {
            status.status.as_str().green()
        } else {
            all_serving = false;
            status.status.as_str().red()
        };
        println!("{:<40} {} {}", identity.name(), label, status.message);
    }
    Ok(all_serving)
}

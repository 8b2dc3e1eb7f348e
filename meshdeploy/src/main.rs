//! meshdeploy - Entry Point
//!
//! Deploys GitHub/GitLab repositories as containers on a shared network,
//! each behind an mTLS sidecar proxy.

use std::env;
use std::sync::Arc;

use meshdeploy::app::commands::{self, CliArgs};
use meshdeploy::app::options::AppOptions;
use meshdeploy::app::run::run;
use meshdeploy::app::state::AppState;
use meshdeploy::errors::DeployError;
use meshdeploy::installer::install::init;
use meshdeploy::logs::{init_logging, LogOptions};
use meshdeploy::storage::layout::StorageLayout;
use meshdeploy::storage::settings::Settings;
use meshdeploy::utils::version_info;

use tracing::{error, info, warn};

const USAGE: &str = "\
Usage: meshdeploy <command> [--base-dir=<path>] [options]

Commands:
  init      [--network]                          Create storage, templates, settings and the root CA
  deploy    --slug=gh:owner/repo[,..] | --file=  Deploy repositories [--no-wait]
  destroy   --yes                                Remove every managed container
  services                                       List deployed services
  logs      [--service=<name>] [--tail=100]      Show container logs [--follow]
  health    [--service=<name>]                   Check service health through the sidecar
  serve                                          Run the admin HTTP API";

#[tokio::main]
async fn main() {
    // Parse command line arguments
    let cli_args = CliArgs::parse(env::args().skip(1));

    // Print version and exit
    if cli_args.has("version") {
        match serde_json::to_string_pretty(&version_info()) {
            Ok(version) => println!("{}", version),
            Err(e) => eprintln!("Failed to render version: {}", e),
        }
        return;
    }

    let layout = match cli_args.get("base-dir") {
        Some(base_dir) => StorageLayout::new(base_dir),
        None => StorageLayout::default(),
    };

    let Some(command) = cli_args.command.clone() else {
        eprintln!("{}", USAGE);
        std::process::exit(2);
    };

    // Initialization runs before any settings file exists
    if command == "init" {
        let _guard = init_logging(LogOptions::default()).ok().flatten();
        if let Err(e) = init(layout, &cli_args).await {
            error!("Initialization failed: {:?}", e);
            eprintln!("\n[ERROR] Initialization failed: {}", e);
            std::process::exit(1);
        }
        return;
    }

    // Retrieve the settings
    let settings = match Settings::load(&layout) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Unable to load settings: {}", e);
            eprintln!("Run: meshdeploy init");
            std::process::exit(1);
        }
    };

    // Initialize logging
    let log_options = LogOptions {
        log_level: settings.log_level.clone(),
        json_format: settings.log_json,
        log_dir: settings
            .log_to_file
            .then(|| layout.logs_dir().path().to_path_buf()),
        ..Default::default()
    };
    let _guard = match init_logging(log_options) {
        Ok(guard) => guard,
        Err(e) => {
            println!("Failed to initialize logging: {e}");
            None
        }
    };

    let app_state = AppState::init(layout, settings);
    let result = dispatch(&command, &cli_args, app_state).await;
    match result {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            error!("{} failed: {}", command, e);
            eprintln!("[ERROR] {}", e);
            std::process::exit(1);
        }
    }
}

/// Run a command. `Ok(false)` means it ran but should exit non-zero.
async fn dispatch(command: &str, cli_args: &CliArgs, app_state: AppState) -> Result<bool, DeployError> {
    match command {
        "deploy" => commands::deploy(&app_state, cli_args).await,
        "destroy" => commands::destroy(&app_state, cli_args).await.map(|_| true),
        "services" => commands::services(&app_state).await.map(|_| true),
        "logs" => commands::logs(&app_state, cli_args).await.map(|_| true),
        "health" => commands::health(&app_state, cli_args).await,
        "serve" => {
            let options = AppOptions::from_settings(&app_state.settings);
            info!("Running meshdeploy server with options: {:?}", options);
            run(options, Arc::new(app_state), await_shutdown_signal())
                .await
                .map(|_| true)
        }
        other => Err(DeployError::Config(format!(
            "unknown command '{}'\n\n{}",
            other, USAGE
        ))),
    }
}

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let (mut sigterm, mut sigint) = match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
            _ => {
                warn!("Unable to install signal handlers, falling back to Ctrl+C");
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!("Failed to listen for Ctrl+C: {}", e);
                }
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down...");
            }
            _ = sigint.recv() => {
                info!("SIGINT received, shutting down...");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl+C received, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
        }
        info!("Ctrl+C received, shutting down...");
    }
}

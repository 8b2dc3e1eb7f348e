//! Storage initialization

use tracing::info;

use crate::app::commands::CliArgs;
use crate::app::state::AppState;
use crate::deploy::image::DEFAULT_DOCKERFILE_TEMPLATE;
use crate::errors::DeployError;
use crate::filesys::file::File;
use crate::mesh::envoy::DEFAULT_ENVOY_TEMPLATE;
use crate::storage::layout::StorageLayout;
use crate::storage::settings::Settings;
use crate::utils::version_info;

/// What `init` created, as opposed to what was already present
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct InitReport {
    pub wrote_settings: bool,
    pub wrote_envoy_template: bool,
    pub wrote_dockerfile_template: bool,
}

/// Create the storage layout, default templates, default settings and the root CA.
///
/// Existing files are never overwritten so local template edits survive a re-run.
pub async fn init_layout(layout: &StorageLayout) -> Result<InitReport, DeployError> {
    layout.setup().await?;

    let report = InitReport {
        wrote_envoy_template: write_if_absent(&layout.envoy_template_file(), DEFAULT_ENVOY_TEMPLATE).await?,
        wrote_dockerfile_template: write_if_absent(
            &layout.dockerfile_template_file(),
            DEFAULT_DOCKERFILE_TEMPLATE,
        )
        .await?,
        wrote_settings: {
            let settings_file = layout.settings_file();
            if settings_file.exists().await {
                false
            } else {
                settings_file.write_json(&Settings::default()).await?;
                true
            }
        },
    };

    Ok(report)
}

async fn write_if_absent(file: &File, contents: &str) -> Result<bool, DeployError> {
    if file.exists().await {
        return Ok(false);
    }
    file.write_string(contents).await?;
    info!("Wrote {}", file.path().display());
    Ok(true)
}

/// `meshdeploy init [--network]`
pub async fn init(layout: StorageLayout, args: &CliArgs) -> Result<(), DeployError> {
    println!("meshdeploy init");
    println!("===============");
    println!();
    println!("Setting up storage at: {}", layout.base_dir.display());

    let report = init_layout(&layout).await?;
    let settings_file = layout.settings_file();
    if report.wrote_settings {
        println!("Settings saved to: {}", settings_file.path().display());
    } else {
        println!("Keeping existing settings: {}", settings_file.path().display());
    }
    if report.wrote_envoy_template || report.wrote_dockerfile_template {
        println!("Default templates written to: {}", layout.templates_dir().path().display());
    }

    let state = AppState::load(layout)?;
    state.ca.ensure_root().await?;
    println!("Root CA: {}", state.ca.root_cert_file().path().display());

    if args.has("network") {
        state.prepare().await?;
        println!(
            "Network: {} ({})",
            state.settings.network.name, state.settings.network.subnet
        );
    }

    let version = version_info();
    println!();
    println!("meshdeploy version: {}", version.version);
    println!("Git hash: {}", version.git_hash);
    println!("Build time: {}", version.build_time);

    Ok(())
}

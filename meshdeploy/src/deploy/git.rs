//! Repository fetching and entrypoint detection

use std::fs;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use flate2::read::GzDecoder;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::deploy::slug::RepoSlug;
use crate::errors::DeployError;
use crate::filesys::dir::Dir;
use crate::utils::tail_lines;

#[async_trait]
pub trait RepoFetcher: Send + Sync {
    /// Local checkout of the slug's ref
    async fn fetch(&self, slug: &RepoSlug) -> Result<PathBuf, DeployError>;

    /// Module or `module:factory` the application image should run
    async fn detect_entrypoint(&self, repo_path: &Path) -> Option<String>;
}

#[derive(Debug, Clone)]
pub struct FetcherOptions {
    pub git_bin: String,
    pub clone_timeout: Duration,
}

impl Default for FetcherOptions {
    fn default() -> Self {
        Self {
            git_bin: "git".to_string(),
            clone_timeout: Duration::from_secs(120),
        }
    }
}

/// Fetches repositories into a local cache, downloading the source archive
/// first and falling back to a shallow clone
pub struct GitFetcher {
    cache: Dir,
    client: reqwest::Client,
    options: FetcherOptions,
}

impl GitFetcher {
    pub fn new(cache: Dir, options: FetcherOptions) -> Self {
        Self {
            cache,
            client: reqwest::Client::new(),
            options,
        }
    }

    async fn fetch_archive(&self, slug: &RepoSlug) -> Result<PathBuf, DeployError> {
        let target = self
            .cache
            .subdir(&format!("{}-{}", slug.service_name(), slug.ref_or_default()));
        if target.exists().await {
            debug!("Using cached archive of {} at {:?}", slug, target.path());
            return Ok(target.path().to_path_buf());
        }

        let url = slug.archive_url();
        info!("Downloading {}", url);
        let bytes = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;

        self.cache.create().await?;
        let partial = self
            .cache
            .subdir(&format!(".{}.partial", slug.service_name()));
        partial.delete().await?;

        let extract_to = partial.path().to_path_buf();
        let extracted = tokio::task::spawn_blocking(move || extract_archive(&bytes, &extract_to))
            .await
            .map_err(|e| DeployError::Internal(e.to_string()))?;
        if let Err(e) = extracted {
            partial.delete().await?;
            return Err(e);
        }

        tokio::fs::rename(partial.path(), target.path()).await?;
        Ok(target.path().to_path_buf())
    }

    async fn fetch_clone(&self, slug: &RepoSlug) -> Result<PathBuf, DeployError> {
        let target = self.cache.subdir(&slug.service_name());
        if target.exists().await {
            debug!("Using cached clone of {} at {:?}", slug, target.path());
            return Ok(target.path().to_path_buf());
        }
        self.cache.create().await?;

        let url = slug.clone_url();
        info!("Cloning {}", url);
        let child = Command::new(&self.options.git_bin)
            .args(["clone", "--depth", "1", "--single-branch", "--branch"])
            .arg(slug.ref_or_default())
            .arg(&url)
            .arg(target.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| DeployError::Fetch(format!("Failed to run {}: {}", self.options.git_bin, e)))?;

        let result = match tokio::time::timeout(self.options.clone_timeout, child.wait_with_output()).await {
            Ok(Ok(output)) if output.status.success() => Ok(()),
            Ok(Ok(output)) => Err(DeployError::Fetch(format!(
                "git clone failed: {}",
                tail_lines(&String::from_utf8_lossy(&output.stderr), 20)
            ))),
            Ok(Err(e)) => Err(DeployError::Io(e)),
            Err(_) => Err(DeployError::Fetch(format!(
                "git clone timed out after {:?}",
                self.options.clone_timeout
            ))),
        };

        if let Err(e) = result {
            target.delete().await?;
            return Err(e);
        }
        Ok(target.path().to_path_buf())
    }

    /// Remove cached repositories older than `max_age`
    pub async fn cleanup_cache(&self, max_age: Duration) -> Result<Vec<PathBuf>, DeployError> {
        if !self.cache.exists().await {
            return Ok(Vec::new());
        }
        let removed = self.cache.prune_older_than(max_age).await?;
        if !removed.is_empty() {
            info!("Removed {} cached repositories", removed.len());
        }
        Ok(removed)
    }
}

#[async_trait]
impl RepoFetcher for GitFetcher {
    async fn fetch(&self, slug: &RepoSlug) -> Result<PathBuf, DeployError> {
        let archive_err = match self.fetch_archive(slug).await {
            Ok(path) => return Ok(path),
            Err(e) => e,
        };
        warn!("Archive download of {} failed, falling back to clone: {}", slug, archive_err);

        self.fetch_clone(slug).await.map_err(|clone_err| {
            DeployError::Fetch(format!(
                "{}: archive failed: {}, clone failed: {}",
                slug, archive_err, clone_err
            ))
        })
    }

    async fn detect_entrypoint(&self, repo_path: &Path) -> Option<String> {
        let repo_path = repo_path.to_path_buf();
        tokio::task::spawn_blocking(move || detect_entrypoint(&repo_path))
            .await
            .ok()
            .flatten()
    }
}

/// Unpack a gzipped tarball into `target`, dropping the single top-level
/// directory code hosts wrap archives in
pub fn extract_archive(bytes: &[u8], target: &Path) -> Result<(), DeployError> {
    fs::create_dir_all(target)?;
    let mut archive = tar::Archive::new(GzDecoder::new(bytes));

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        let stripped: PathBuf = path.components().skip(1).collect();
        if stripped.as_os_str().is_empty() {
            continue;
        }
        if stripped
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(DeployError::Fetch(format!(
                "archive entry {:?} escapes the extraction directory",
                path
            )));
        }

        let dest = target.join(&stripped);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        entry.unpack(&dest)?;
    }
    Ok(())
}

/// Guess how to launch a Python project. Checks run in a fixed order and the
/// first match wins.
pub fn detect_entrypoint(repo: &Path) -> Option<String> {
    if repo.join("__main__.py").is_file() || repo.join("main.py").is_file() {
        return Some("main".to_string());
    }

    if let Some(script) = first_pyproject_script(&repo.join("pyproject.toml")) {
        return Some(script);
    }

    if read_to_string(&repo.join("setup.py")).is_some_and(|s| s.contains("entry_points")) {
        return Some("main".to_string());
    }

    if let Some(pkg) = sorted_subdirs(repo)
        .into_iter()
        .find(|dir| dir.join("__main__.py").is_file())
    {
        return Some(format!("{}.main", file_stem(&pkg)?));
    }

    if repo.join("wsgi.py").is_file() {
        return Some("wsgi".to_string());
    }
    if repo.join("app.py").is_file() {
        return Some("app".to_string());
    }

    let app_dir = repo.join("app");
    if app_dir.join("__main__.py").is_file() {
        return Some("app.main".to_string());
    }
    if app_dir.join("app.py").is_file() {
        return Some("app.app".to_string());
    }

    if let Some(pkg) = sorted_subdirs(&repo.join("src"))
        .into_iter()
        .find(|dir| dir.join("__main__.py").is_file())
    {
        return Some(format!("{}.main", file_stem(&pkg)?));
    }

    for file in sorted_python_files(repo) {
        let Some(stem) = file_stem(&file) else {
            continue;
        };
        let candidate = stem.starts_with("main")
            || stem.starts_with("app")
            || matches!(stem.as_str(), "run" | "server" | "wsgi");
        if candidate && read_to_string(&file).is_some_and(|s| has_launch_marker(&s)) {
            return Some(stem);
        }
    }

    if read_to_string(&app_dir.join("__init__.py"))
        .is_some_and(|s| s.contains("create_app") || s.contains("Flask"))
    {
        return Some("app:create_app".to_string());
    }

    None
}

fn has_launch_marker(source: &str) -> bool {
    source.contains("def main(")
        || source.contains("if __name__ == \"__main__\"")
        || source.contains("create_app")
        || source.contains("Flask(__name__)")
}

fn first_pyproject_script(path: &Path) -> Option<String> {
    let source = read_to_string(path)?;
    let doc: toml::Table = toml::from_str(&source).ok()?;
    doc.get("project")?
        .get("scripts")?
        .as_table()?
        .keys()
        .next()
        .cloned()
}

fn read_to_string(path: &Path) -> Option<String> {
    fs::read_to_string(path).ok()
}

fn file_stem(path: &Path) -> Option<String> {
    path.file_stem().map(|s| s.to_string_lossy().to_string())
}

fn sorted_subdirs(dir: &Path) -> Vec<PathBuf> {
    let mut dirs: Vec<PathBuf> = fs::read_dir(dir)
        .into_iter()
        .flatten()
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    dirs.sort();
    dirs
}

fn sorted_python_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)
        .into_iter()
        .flatten()
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "py"))
        .collect();
    files.sort();
    files
}

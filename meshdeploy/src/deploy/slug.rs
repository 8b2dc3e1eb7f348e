//! Repository slugs of the form `scheme:owner/repo[#ref]`

use std::fmt;
use std::str::FromStr;

use regex::Regex;

use crate::errors::DeployError;
use crate::mesh::identity::{ServiceIdentity, MAX_NAME_LEN};

const SLUG_PATTERN: &str = r"^([a-zA-Z]+):([^/]+/[^#]+)(?:#(.+))?$";

/// Code hosts a slug can point at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlugScheme {
    /// github.com
    GitHub,
    /// gitlab.com
    GitLab,
}

impl SlugScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            SlugScheme::GitHub => "gh",
            SlugScheme::GitLab => "gl",
        }
    }

    fn host(&self) -> &'static str {
        match self {
            SlugScheme::GitHub => "https://github.com",
            SlugScheme::GitLab => "https://gitlab.com",
        }
    }
}

impl FromStr for SlugScheme {
    type Err = DeployError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "gh" => Ok(SlugScheme::GitHub),
            "gl" => Ok(SlugScheme::GitLab),
            other => Err(DeployError::InvalidSlug(format!(
                "unsupported scheme '{}', expected 'gh' or 'gl'",
                other
            ))),
        }
    }
}

/// A parsed repository slug
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RepoSlug {
    pub scheme: SlugScheme,
    pub owner: String,
    pub repo: String,
    pub git_ref: Option<String>,
}

impl RepoSlug {
    pub fn parse(slug: &str) -> Result<Self, DeployError> {
        let pattern = Regex::new(SLUG_PATTERN).map_err(|e| DeployError::Internal(e.to_string()))?;
        let caps = pattern.captures(slug.trim()).ok_or_else(|| {
            DeployError::InvalidSlug(format!(
                "'{}' does not match scheme:owner/repo[#ref]",
                slug
            ))
        })?;

        let scheme: SlugScheme = caps[1].parse()?;
        let (owner, repo) = caps[2].split_once('/').ok_or_else(|| {
            DeployError::InvalidSlug(format!("'{}' is not owner/repo", &caps[2]))
        })?;
        if owner.is_empty() || repo.is_empty() {
            return Err(DeployError::InvalidSlug(format!(
                "'{}' has an empty owner or repository",
                &caps[2]
            )));
        }

        Ok(Self {
            scheme,
            owner: owner.to_string(),
            repo: repo.to_string(),
            git_ref: caps.get(3).map(|m| m.as_str().to_string()),
        })
    }

    /// `owner/repo`
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.repo)
    }

    /// Ref to fetch, `main` when the slug names none
    pub fn ref_or_default(&self) -> &str {
        self.git_ref.as_deref().unwrap_or("main")
    }

    /// `owner-repo` lowercased, with anything a container name cannot carry
    /// replaced by `-`
    pub fn service_name(&self) -> String {
        let raw = format!("{}-{}", self.owner, self.repo).to_lowercase();
        let mapped: String = raw
            .chars()
            .map(|c| {
                if c.is_ascii_lowercase() || c.is_ascii_digit() {
                    c
                } else {
                    '-'
                }
            })
            .collect();
        let trimmed = mapped.trim_matches('-');
        let truncated = &trimmed[..trimmed.len().min(MAX_NAME_LEN)];
        truncated.trim_end_matches('-').to_string()
    }

    pub fn identity(&self) -> Result<ServiceIdentity, DeployError> {
        ServiceIdentity::new(self.service_name())
    }

    pub fn archive_url(&self) -> String {
        let base = format!("{}/{}", self.scheme.host(), self.full_name());
        match (self.scheme, &self.git_ref) {
            (SlugScheme::GitHub, Some(git_ref)) => format!("{}/archive/{}.tar.gz", base, git_ref),
            (SlugScheme::GitHub, None) => format!("{}/archive/refs/heads/main.tar.gz", base),
            (SlugScheme::GitLab, _) => {
                let git_ref = self.ref_or_default();
                format!("{}/-/archive/{}/{}-{}.tar.gz", base, git_ref, self.repo, git_ref)
            }
        }
    }

    pub fn clone_url(&self) -> String {
        format!("{}/{}.git", self.scheme.host(), self.full_name())
    }
}

impl FromStr for RepoSlug {
    type Err = DeployError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for RepoSlug {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.scheme.as_str(), self.full_name())?;
        if let Some(git_ref) = &self.git_ref {
            write!(f, "#{}", git_ref)?;
        }
        Ok(())
    }
}

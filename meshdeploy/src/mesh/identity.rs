//! Service identity

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::DeployError;

/// Suffix appended to a service name to form its sidecar container name
pub const SIDECAR_SUFFIX: &str = "-sidecar";

/// Longest service name whose sidecar name still fits a 63 character DNS label
pub const MAX_NAME_LEN: usize = 63 - SIDECAR_SUFFIX.len();

/// Name of a deployed service.
///
/// Joins the certificate authority, the proxy config and the container
/// runtime: certificate paths, container names and SANs all derive from it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ServiceIdentity {
    name: String,
}

impl ServiceIdentity {
    pub fn new(name: impl Into<String>) -> Result<Self, DeployError> {
        let name = name.into();
        validate_name(&name)?;
        Ok(Self { name })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sidecar_name(&self) -> String {
        format!("{}{}", self.name, SIDECAR_SUFFIX)
    }

    /// DNS name of the service inside the container network
    pub fn network_fqdn(&self, network: &str) -> String {
        format!("{}.{}", self.name, network)
    }
}

fn validate_name(name: &str) -> Result<(), DeployError> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(DeployError::InvalidIdentity(format!(
            "'{}' must be 1 to {} characters long",
            name, MAX_NAME_LEN
        )));
    }
    if name.starts_with('-') || name.ends_with('-') {
        return Err(DeployError::InvalidIdentity(format!(
            "'{}' must not start or end with '-'",
            name
        )));
    }
    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-'))
    {
        return Err(DeployError::InvalidIdentity(format!(
            "'{}' contains invalid character '{}'",
            name, c
        )));
    }
    Ok(())
}

impl fmt::Display for ServiceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl TryFrom<String> for ServiceIdentity {
    type Error = DeployError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ServiceIdentity> for String {
    fn from(identity: ServiceIdentity) -> Self {
        identity.name
    }
}

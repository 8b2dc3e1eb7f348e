//! mTLS mesh identity: service names, certificates and sidecar configs

pub mod ca;
pub mod envoy;
pub mod identity;
pub mod template;

//! meshdeploy library
//!
//! Deploys source repositories as containers, each fronted by an Envoy
//! sidecar that terminates mutual TLS with certificates from a local CA.

pub mod app;
pub mod authn;
pub mod deploy;
pub mod errors;
pub mod filesys;
pub mod health;
pub mod installer;
pub mod logs;
pub mod mesh;
pub mod probe;
pub mod runtime;
pub mod server;
pub mod storage;
pub mod utils;

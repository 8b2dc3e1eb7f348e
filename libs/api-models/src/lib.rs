//! Wire models for the meshdeploy admin API.

pub mod models;

pub use models::*;

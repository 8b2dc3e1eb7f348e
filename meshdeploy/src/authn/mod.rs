//! Admin API authentication

pub mod jwt;

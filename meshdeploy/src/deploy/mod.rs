//! Deployment module

pub mod fsm;
pub mod git;
pub mod image;
pub mod orchestrator;
pub mod pipeline;
pub mod slug;

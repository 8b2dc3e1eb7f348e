//! Integration tests driving the orchestrator, pipeline, probe and admin API
//! against in-process fakes of docker, git and the sidecar.

mod mocks;
mod test_orchestrator;
mod test_pipeline;
mod test_probe;
mod test_server;

//! Readiness probing against a local stand-in for the sidecar admin endpoint

use std::sync::Arc;
use std::time::Duration;

use meshdeploy::mesh::identity::ServiceIdentity;
use meshdeploy::probe::{HttpReadinessProber, ProbeOptions, ReadinessProbe};

use crate::mocks::{admin_endpoint, MockRuntime};

fn prober(runtime: Arc<MockRuntime>, admin_port: u16) -> HttpReadinessProber {
    HttpReadinessProber::new(
        runtime,
        ProbeOptions {
            admin_port,
            poll_interval: Duration::from_millis(20),
            request_timeout: Duration::from_millis(500),
        },
    )
}

fn local_runtime() -> Arc<MockRuntime> {
    Arc::new(MockRuntime {
        ip: Some("127.0.0.1".to_string()),
        ..MockRuntime::new().with_container("alice-todo-sidecar", false)
    })
}

#[tokio::test]
async fn test_ready_once_admin_reports_ok() {
    let endpoint = admin_endpoint(3).await;
    let prober = prober(local_runtime(), endpoint.port);
    let identity = ServiceIdentity::new("alice-todo").unwrap();

    assert!(prober.wait_ready(&identity, Duration::from_secs(5)).await);
    assert_eq!(endpoint.hits(), 3);
}

#[tokio::test]
async fn test_not_ready_within_timeout() {
    let endpoint = admin_endpoint(usize::MAX).await;
    let prober = prober(local_runtime(), endpoint.port);
    let identity = ServiceIdentity::new("alice-todo").unwrap();

    let started = std::time::Instant::now();
    assert!(!prober.wait_ready(&identity, Duration::from_millis(200)).await);
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn test_missing_sidecar_is_never_ready() {
    let endpoint = admin_endpoint(0).await;
    let prober = prober(Arc::new(MockRuntime::new()), endpoint.port);
    let identity = ServiceIdentity::new("bob-api").unwrap();

    assert!(!prober.wait_ready(&identity, Duration::from_millis(100)).await);
    assert_eq!(endpoint.hits(), 0);
}

//! Batch deploys and progress reporting

use std::sync::Arc;

use meshdeploy_api::{DeployStage, ProgressEvent, ServingStatus};
use tokio::sync::mpsc;

use crate::mocks::{pipeline, MockRuntime};

fn drain(mut rx: mpsc::UnboundedReceiver<ProgressEvent>) -> Vec<ProgressEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn stages(events: &[ProgressEvent], slug: &str) -> Vec<DeployStage> {
    events
        .iter()
        .filter(|e| e.slug == slug)
        .map(|e| e.status)
        .collect()
}

#[tokio::test]
async fn test_batch_reports_every_stage_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = Arc::new(MockRuntime::new());
    let pipeline = pipeline(dir.path(), runtime).await;
    let (tx, rx) = mpsc::unbounded_channel();

    let outcomes = pipeline
        .deploy_batch(&["gh:alice/todo".to_string()], true, Some(&tx))
        .await;
    drop(tx);

    assert_eq!(outcomes.len(), 1);
    let outcome = &outcomes[0];
    assert!(outcome.deployed, "{:?}", outcome.error);
    assert_eq!(outcome.service_name, "alice-todo");
    assert_eq!(outcome.image_name.as_deref(), Some("meshdeploy-alice-todo:latest"));
    assert_eq!(outcome.app_container_id.as_deref(), Some("alice-todo-id"));
    assert_eq!(outcome.sidecar_container_id.as_deref(), Some("alice-todo-sidecar-id"));
    assert_eq!(outcome.app_ip.as_deref(), Some("172.20.0.2"));
    assert_eq!(
        outcome.health_status.as_ref().map(|h| h.status),
        Some(ServingStatus::Serving)
    );

    let events = drain(rx);
    assert_eq!(
        stages(&events, "gh:alice/todo"),
        vec![
            DeployStage::Parsing,
            DeployStage::Fetching,
            DeployStage::DetectingEntrypoint,
            DeployStage::Building,
            DeployStage::ConfiguringEnvoy,
            DeployStage::StartingContainers,
            DeployStage::Started,
            DeployStage::HealthCheck,
            DeployStage::Completed,
        ]
    );
    assert!(events.iter().all(|e| e.step == 1 && e.total == 1));
}

#[tokio::test]
async fn test_batch_keeps_going_after_a_failure() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = Arc::new(MockRuntime::new());
    let pipeline = pipeline(dir.path(), runtime.clone()).await;
    let (tx, rx) = mpsc::unbounded_channel();

    let slugs = vec!["gh:missing/x".to_string(), "gh:y/y".to_string()];
    let outcomes = pipeline.deploy_batch(&slugs, true, Some(&tx)).await;
    drop(tx);

    assert_eq!(outcomes.len(), 2);
    assert_eq!(outcomes[0].slug, "gh:missing/x");
    assert!(!outcomes[0].deployed);
    assert!(outcomes[0].error.as_deref().unwrap_or_default().contains("not found"));
    assert_eq!(outcomes[1].slug, "gh:y/y");
    assert!(outcomes[1].deployed);

    let events = drain(rx);
    assert_eq!(
        stages(&events, "gh:missing/x"),
        vec![DeployStage::Parsing, DeployStage::Fetching, DeployStage::Error]
    );
    // Every frame of the first slug precedes every frame of the second
    let last_first = events.iter().rposition(|e| e.step == 1).unwrap();
    let first_second = events.iter().position(|e| e.step == 2).unwrap();
    assert!(last_first < first_second);
    assert!(events.iter().all(|e| e.total == 2));

    assert_eq!(runtime.container_names(), vec!["y-y", "y-y-sidecar"]);
}

#[tokio::test]
async fn test_invalid_slug_and_missing_entrypoint_fail_early() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = Arc::new(MockRuntime::new());
    let pipeline = pipeline(dir.path(), runtime.clone()).await;

    let slugs = vec!["svn:alice/todo".to_string(), "gh:bare/repo".to_string()];
    let outcomes = pipeline.deploy_batch(&slugs, false, None).await;

    assert!(!outcomes[0].deployed);
    assert!(outcomes[0].error.as_deref().unwrap_or_default().contains("Invalid slug"));
    assert!(!outcomes[1].deployed);
    assert_eq!(outcomes[1].service_name, "bare-repo");
    assert!(outcomes[1]
        .error
        .as_deref()
        .unwrap_or_default()
        .contains("No entrypoint detected"));
    assert!(runtime.calls().is_empty());
}

#[tokio::test]
async fn test_no_wait_skips_health_check() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = Arc::new(MockRuntime::new());
    let pipeline = pipeline(dir.path(), runtime).await;
    let (tx, rx) = mpsc::unbounded_channel();

    let outcomes = pipeline
        .deploy_batch(&["gl:team/svc#v2".to_string()], false, Some(&tx))
        .await;
    drop(tx);

    assert!(outcomes[0].deployed);
    assert!(outcomes[0].health_status.is_none());
    let stages = stages(&drain(rx), "gl:team/svc#v2");
    assert!(!stages.contains(&DeployStage::HealthCheck));
    assert_eq!(stages.last(), Some(&DeployStage::Completed));
}

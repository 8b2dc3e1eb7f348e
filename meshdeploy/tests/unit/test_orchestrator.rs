//! Sidecar-first ordering, rollback and cleanup

use std::sync::{Arc, Mutex};
use std::time::Duration;

use meshdeploy::deploy::fsm::OrchestrationState;
use meshdeploy::deploy::orchestrator::{Observer, OrchestratorEvent, OrchestratorOptions, ServiceOrchestrator};
use meshdeploy::errors::DeployError;
use meshdeploy::mesh::identity::ServiceIdentity;
use meshdeploy::probe::{HttpReadinessProber, ProbeOptions};
use meshdeploy::runtime::ContainerOptions;

use crate::mocks::{admin_endpoint, orchestrator, proxy_config, MockRuntime};

fn alice() -> ServiceIdentity {
    ServiceIdentity::new("alice-todo").unwrap()
}

#[tokio::test]
async fn test_deploy_starts_sidecar_before_app() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = Arc::new(MockRuntime::new());
    let orchestrator = orchestrator(dir.path(), runtime.clone(), true).await;

    let deployed = orchestrator
        .deploy(&alice(), "meshdeploy-alice-todo:latest", ContainerOptions::default(), None)
        .await
        .unwrap();

    assert_eq!(deployed.app_container_id, "alice-todo-id");
    assert_eq!(deployed.sidecar.container_id, "alice-todo-sidecar-id");
    assert_eq!(
        runtime.calls(),
        vec![
            "start_sidecar:alice-todo-sidecar",
            "probe_ready:alice-todo-sidecar",
            "start:alice-todo",
        ]
    );
    assert_eq!(runtime.container_names(), vec!["alice-todo", "alice-todo-sidecar"]);
    assert_eq!(orchestrator.active_deploys(), 0);
}

#[tokio::test]
async fn test_deploy_issues_leaf_certificate() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = Arc::new(MockRuntime::new());
    let orchestrator = orchestrator(dir.path(), runtime, true).await;

    orchestrator
        .deploy(&alice(), "img", ContainerOptions::default(), None)
        .await
        .unwrap();

    assert!(dir.path().join("secrets").join("alice-todo.crt").exists());
    assert!(dir.path().join("secrets").join("alice-todo.key").exists());
}

#[tokio::test]
async fn test_sidecar_not_ready_rolls_back_and_never_starts_app() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = Arc::new(MockRuntime::new());
    let orchestrator = orchestrator(dir.path(), runtime.clone(), false).await;
    let identity = ServiceIdentity::new("bob-api").unwrap();

    let err = orchestrator
        .deploy(&identity, "img", ContainerOptions::default(), None)
        .await
        .unwrap_err();

    assert!(matches!(err, DeployError::SidecarNotReady(ref name) if name == "bob-api"));
    assert_eq!(
        runtime.calls(),
        vec![
            "start_sidecar:bob-api-sidecar",
            "probe_not_ready:bob-api-sidecar",
            "stop:bob-api-sidecar",
            "remove:bob-api-sidecar",
        ]
    );
    assert!(runtime.container_names().is_empty());
}

#[tokio::test]
async fn test_app_start_failure_removes_sidecar_and_keeps_cause() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = Arc::new(MockRuntime {
        app_start_error: Some("port is already allocated".to_string()),
        ..MockRuntime::new()
    });
    let orchestrator = orchestrator(dir.path(), runtime.clone(), true).await;

    let err = orchestrator
        .deploy(&alice(), "img", ContainerOptions::default(), None)
        .await
        .unwrap_err();

    assert!(matches!(err, DeployError::AppStart { .. }));
    assert!(err.to_string().contains("port is already allocated"));
    assert!(runtime.container_names().is_empty());

    let calls = runtime.calls();
    let app_start = calls.iter().position(|c| c == "start:alice-todo").unwrap();
    let sidecar_remove = calls.iter().position(|c| c == "remove:alice-todo-sidecar").unwrap();
    assert!(sidecar_remove > app_start);
    assert_eq!(orchestrator.active_deploys(), 0);
}

#[tokio::test]
async fn test_failed_teardown_does_not_mask_app_error() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = Arc::new(MockRuntime {
        app_start_error: Some("port is already allocated".to_string()),
        teardown_error: Some("daemon unreachable".to_string()),
        ..MockRuntime::new()
    });
    let orchestrator = orchestrator(dir.path(), runtime.clone(), true).await;

    let err = orchestrator
        .deploy(&alice(), "img", ContainerOptions::default(), None)
        .await
        .unwrap_err();

    assert!(matches!(err, DeployError::AppStart { .. }));
    assert!(
        matches!(err.root_cause(), DeployError::Runtime(msg) if msg == "port is already allocated"),
        "{}",
        err
    );
    assert!(!err.to_string().contains("daemon unreachable"));

    let calls = runtime.calls();
    assert_eq!(
        &calls[calls.len() - 2..],
        &["stop:alice-todo-sidecar", "remove:alice-todo-sidecar"]
    );
}

#[tokio::test]
async fn test_failed_teardown_does_not_mask_not_ready() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = Arc::new(MockRuntime {
        teardown_error: Some("daemon unreachable".to_string()),
        ..MockRuntime::new()
    });
    let orchestrator = orchestrator(dir.path(), runtime.clone(), false).await;

    let err = orchestrator
        .deploy(&alice(), "img", ContainerOptions::default(), None)
        .await
        .unwrap_err();

    assert!(matches!(err, DeployError::SidecarNotReady(ref name) if name == "alice-todo"));
    assert!(!runtime.calls().iter().any(|c| c == "start:alice-todo"));
}

#[tokio::test]
async fn test_sidecar_ready_after_polling_then_app_starts() {
    let dir = tempfile::tempdir().unwrap();
    let endpoint = admin_endpoint(5).await;
    let runtime = Arc::new(MockRuntime {
        ip: Some("127.0.0.1".to_string()),
        ..MockRuntime::new()
    });
    let poll_interval = Duration::from_millis(20);
    let orchestrator = ServiceOrchestrator::new(
        runtime.clone(),
        Arc::new(HttpReadinessProber::new(
            runtime.clone(),
            ProbeOptions {
                admin_port: endpoint.port,
                poll_interval,
                request_timeout: Duration::from_millis(500),
            },
        )),
        proxy_config(dir.path()).await,
        OrchestratorOptions {
            ready_timeout: poll_interval * 30,
            ..OrchestratorOptions::default()
        },
    );

    orchestrator
        .deploy(&alice(), "img", ContainerOptions::default(), None)
        .await
        .unwrap();

    assert_eq!(endpoint.hits(), 5);
    assert_eq!(
        runtime.calls(),
        vec!["start_sidecar:alice-todo-sidecar", "start:alice-todo"]
    );
}

#[tokio::test]
async fn test_sidecar_start_failure_has_nothing_to_roll_back() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = Arc::new(MockRuntime {
        sidecar_start_error: Some("image not found".to_string()),
        ..MockRuntime::new()
    });
    let orchestrator = orchestrator(dir.path(), runtime.clone(), true).await;

    let states = Mutex::new(Vec::new());
    let observer = |event: OrchestratorEvent| {
        if let OrchestratorEvent::Transition(state) = event {
            states.lock().unwrap().push(state);
        }
    };
    let err = orchestrator
        .deploy(&alice(), "img", ContainerOptions::default(), Some(&observer as Observer<'_>))
        .await
        .unwrap_err();

    assert!(matches!(err, DeployError::SidecarStart { .. }));
    assert_eq!(runtime.calls(), vec!["start_sidecar:alice-todo-sidecar"]);
    assert!(!runtime.calls().iter().any(|c| c.starts_with("probe_")));
    assert_eq!(
        states.into_inner().unwrap(),
        vec![
            OrchestrationState::Cleaning,
            OrchestrationState::StartingSidecar,
            OrchestrationState::Failed,
        ]
    );
}

#[tokio::test]
async fn test_redeploy_cleans_stale_containers_first() {
    let presets: [&[(&str, bool)]; 3] = [
        &[("alice-todo", true)],
        &[("alice-todo-sidecar", false)],
        &[("alice-todo", true), ("alice-todo-sidecar", false)],
    ];

    for preset in presets {
        let dir = tempfile::tempdir().unwrap();
        let runtime = preset
            .iter()
            .fold(MockRuntime::new(), |runtime, (name, is_app)| runtime.with_container(name, *is_app));
        let runtime = Arc::new(runtime);
        let orchestrator = orchestrator(dir.path(), runtime.clone(), true).await;

        orchestrator
            .deploy(&alice(), "img", ContainerOptions::default(), None)
            .await
            .unwrap();

        let calls = runtime.calls();
        assert_eq!(
            &calls[..4],
            &[
                "stop:alice-todo",
                "remove:alice-todo",
                "stop:alice-todo-sidecar",
                "remove:alice-todo-sidecar",
            ],
            "preset {:?}",
            preset
        );
        assert_eq!(
            &calls[4..],
            &[
                "start_sidecar:alice-todo-sidecar",
                "probe_ready:alice-todo-sidecar",
                "start:alice-todo",
            ]
        );
    }
}

#[tokio::test]
async fn test_clean_without_containers_touches_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = Arc::new(MockRuntime::new());
    let orchestrator = orchestrator(dir.path(), runtime.clone(), true).await;

    for _ in 0..2 {
        orchestrator
            .deploy(&alice(), "img", ContainerOptions::default(), None)
            .await
            .unwrap();
    }

    let stops = runtime.calls().iter().filter(|c| c.starts_with("stop:")).count();
    assert_eq!(stops, 2, "only the second deploy finds containers to clean");
}

#[tokio::test]
async fn test_destroy_all_removes_every_managed_container() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = Arc::new(
        MockRuntime::new()
            .with_container("alice-todo", true)
            .with_container("alice-todo-sidecar", false)
            .with_container("bob-api", true),
    );
    let orchestrator = orchestrator(dir.path(), runtime.clone(), true).await;

    let destroyed = orchestrator.destroy_all().await.unwrap();

    assert_eq!(destroyed, vec!["alice-todo", "alice-todo-sidecar", "bob-api"]);
    assert!(runtime.container_names().is_empty());
    assert!(orchestrator.destroy_all().await.unwrap().is_empty());
}

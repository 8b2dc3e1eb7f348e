//! Admin API over a real listener

use std::sync::Arc;

use chrono::Utc;
use jsonwebtoken::{encode, EncodingKey, Header};
use meshdeploy::app::options::ServerOptions;
use meshdeploy::authn::jwt::JwtVerifier;
use meshdeploy::server::serve::{bind, serve};
use meshdeploy::server::state::ServerState;
use meshdeploy_api::{DeployFrame, DeployStage, ErrorResponse, LogLine, LogsResponse, ServicesResponse};
use secrecy::SecretString;
use serde_json::json;

use crate::mocks::{pipeline, MockRuntime};

const SECRET: &str = "test-secret";

struct TestServer {
    base_url: String,
    _dir: tempfile::TempDir,
}

async fn start(runtime: Arc<MockRuntime>, with_auth: bool) -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = Arc::new(pipeline(dir.path(), runtime).await);
    let verifier = with_auth.then(|| {
        Arc::new(JwtVerifier::new(
            &SecretString::from(SECRET.to_string()),
            "authenticated",
            None,
        ))
    });

    let listener = bind(&ServerOptions {
        host: "127.0.0.1".to_string(),
        port: 0,
    })
    .await
    .unwrap();
    let base_url = format!("http://{}", listener.local_addr().unwrap());
    serve(
        listener,
        Arc::new(ServerState::new(pipeline, verifier)),
        std::future::pending(),
    )
    .await
    .unwrap();

    TestServer { base_url, _dir: dir }
}

fn token() -> String {
    let claims = json!({
        "sub": "operator",
        "aud": "authenticated",
        "exp": Utc::now().timestamp() + 600,
    });
    encode(&Header::default(), &claims, &EncodingKey::from_secret(SECRET.as_bytes())).unwrap()
}

fn parse_frames(body: &str) -> Vec<DeployFrame> {
    body.split("\n\n")
        .filter(|chunk| !chunk.is_empty())
        .map(|chunk| {
            let json = chunk.strip_prefix("data: ").expect("frame must start with data:");
            serde_json::from_str(json).unwrap()
        })
        .collect()
}

#[tokio::test]
async fn test_health_is_open_when_auth_is_configured() {
    let server = start(Arc::new(MockRuntime::new()), true).await;

    let response = reqwest::get(format!("{}/health", server.base_url)).await.unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn test_protected_routes_require_a_valid_token() {
    let runtime = Arc::new(MockRuntime::new().with_container("alice-todo", true));
    let server = start(runtime, true).await;
    let client = reqwest::Client::new();
    let url = format!("{}/services", server.base_url);

    let missing = client.get(&url).send().await.unwrap();
    assert_eq!(missing.status(), 401);

    let wrong = client.get(&url).bearer_auth("not-a-jwt").send().await.unwrap();
    assert_eq!(wrong.status(), 401);
    let error: ErrorResponse = wrong.json().await.unwrap();
    assert!(error.error.contains("Invalid token"));

    let ok = client.get(&url).bearer_auth(token()).send().await.unwrap();
    assert_eq!(ok.status(), 200);
    let services: ServicesResponse = ok.json().await.unwrap();
    assert_eq!(services.services.len(), 1);
    assert_eq!(services.services[0].name, "alice-todo");
}

#[tokio::test]
async fn test_deploy_without_slugs_is_rejected() {
    let server = start(Arc::new(MockRuntime::new()), false).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{}/deploy", server.base_url))
        .json(&json!({ "slugs": [] }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 400);
    let error: ErrorResponse = response.json().await.unwrap();
    assert_eq!(error.error, "No slugs provided");
}

#[tokio::test]
async fn test_deploy_streams_progress_then_summary() {
    let server = start(Arc::new(MockRuntime::new()), false).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{}/deploy", server.base_url))
        .json(&json!({ "slugs": ["gh:x/x", "gh:missing/y"], "wait_for_ready": false }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let frames = parse_frames(&response.text().await.unwrap());
    let (summary, progress) = frames.split_last().unwrap();

    let DeployFrame::Summary(summary) = summary else {
        panic!("last frame must be the summary, got {:?}", summary);
    };
    assert_eq!(summary.status, DeployStage::Completed);
    assert_eq!(summary.results.len(), 2);
    assert!(summary.results[0].deployed);
    assert!(!summary.results[1].deployed);

    let statuses: Vec<(usize, DeployStage)> = progress
        .iter()
        .map(|frame| match frame {
            DeployFrame::Progress(event) => (event.step, event.status),
            DeployFrame::Summary(_) => panic!("summary must come last"),
        })
        .collect();
    assert_eq!(statuses.first(), Some(&(1, DeployStage::Parsing)));
    assert!(statuses.contains(&(1, DeployStage::Completed)));
    assert_eq!(statuses.last(), Some(&(2, DeployStage::Error)));
}

#[tokio::test]
async fn test_logs_and_invalid_service_names() {
    let server = start(Arc::new(MockRuntime::new()), false).await;

    let logs: LogsResponse = reqwest::get(format!("{}/services/alice-todo/logs?tail=5", server.base_url))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(logs.logs, "alice-todo last 5 lines");

    let invalid = reqwest::get(format!("{}/services/Bad_Name/health", server.base_url))
        .await
        .unwrap();
    assert_eq!(invalid.status(), 400);
}

#[tokio::test]
async fn test_follow_logs_streams_line_frames() {
    let runtime = Arc::new(MockRuntime::new());
    let server = start(runtime.clone(), false).await;

    let body = reqwest::get(format!("{}/services/alice-todo/logs?tail=2&follow=true", server.base_url))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();

    let lines: Vec<LogLine> = body
        .split("\n\n")
        .filter(|frame| !frame.is_empty())
        .map(|frame| serde_json::from_str(frame.strip_prefix("data: ").unwrap()).unwrap())
        .collect();
    assert_eq!(
        lines,
        vec![
            LogLine { log: "alice-todo line 1".to_string() },
            LogLine { log: "alice-todo line 2".to_string() },
        ]
    );
    assert_eq!(runtime.calls(), vec!["follow_logs:alice-todo"]);

    let invalid = reqwest::get(format!("{}/services/Bad_Name/logs?follow=true", server.base_url))
        .await
        .unwrap();
    assert_eq!(invalid.status(), 400);
    assert_eq!(runtime.calls().len(), 1);
}

#[tokio::test]
async fn test_destroy_reports_removed_containers() {
    let runtime = Arc::new(
        MockRuntime::new()
            .with_container("alice-todo", true)
            .with_container("alice-todo-sidecar", false),
    );
    let server = start(runtime.clone(), false).await;

    let response = reqwest::Client::new()
        .post(format!("{}/destroy", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["destroyed"], json!(["alice-todo", "alice-todo-sidecar"]));
    assert!(runtime.container_names().is_empty());
}

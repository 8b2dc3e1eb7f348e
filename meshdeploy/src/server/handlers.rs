//! HTTP request handlers

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{rejection::JsonRejection, Path, Query, Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use futures::StreamExt;
use http::{header, StatusCode};
use meshdeploy_api::{
    DeployFrame, DeployRequest, DeployStage, DeploySummary, DestroyResponse, ErrorResponse, HealthResponse,
    LogLine, LogsResponse, ServiceHealthResponse, ServicesResponse, VersionResponse,
};
use serde::Deserialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};

use crate::authn::jwt::bearer_token;
use crate::errors::DeployError;
use crate::mesh::identity::ServiceIdentity;
use crate::server::state::ServerState;
use crate::utils::version_info;

const DEFAULT_LOG_TAIL: usize = 100;

/// Error response with a JSON `{error}` body
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl From<DeployError> for ApiError {
    fn from(err: DeployError) -> Self {
        let status = match &err {
            DeployError::InvalidSlug(_) | DeployError::InvalidIdentity(_) => StatusCode::BAD_REQUEST,
            DeployError::Auth(_) => StatusCode::UNAUTHORIZED,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorResponse::new(self.message))).into_response()
    }
}

/// Rejects requests without a valid bearer token when authentication is
/// configured
pub async fn require_auth(State(state): State<Arc<ServerState>>, request: Request, next: Next) -> Response {
    let Some(verifier) = state.verifier.as_ref() else {
        return next.run(request).await;
    };

    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(bearer_token);
    let Some(token) = token else {
        return ApiError::new(StatusCode::UNAUTHORIZED, "Missing bearer token").into_response();
    };

    match verifier.verify(token) {
        Ok(_) => next.run(request).await,
        Err(e) => {
            warn!("Rejected request to {}: {}", request.uri().path(), e);
            ApiError::from(e).into_response()
        }
    }
}

/// Health check handler
pub async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: "meshdeploy".to_string(),
        version: version_info().version,
        timestamp: Utc::now(),
    })
}

/// Version handler
pub async fn version_handler() -> impl IntoResponse {
    let version = version_info();
    Json(VersionResponse {
        version: version.version,
        git_hash: version.git_hash,
        build_time: version.build_time,
    })
}

/// Deploy handler. Streams `data: {json}\n\n` frames, one per stage
/// transition, followed by a summary frame.
pub async fn deploy_handler(
    State(state): State<Arc<ServerState>>,
    payload: Result<Json<DeployRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = payload.map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, e.body_text()))?;
    if request.slugs.is_empty() {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "No slugs provided"));
    }
    info!("Deploy requested for {} slugs", request.slugs.len());

    let (progress_tx, progress_rx) = mpsc::unbounded_channel();
    let (summary_tx, summary_rx) = oneshot::channel();
    let pipeline = state.pipeline.clone();
    tokio::spawn(async move {
        let results = pipeline
            .deploy_batch(&request.slugs, request.wait_for_ready, Some(&progress_tx))
            .await;
        drop(progress_tx);
        let _ = summary_tx.send(results);
    });

    let progress = futures::stream::unfold(progress_rx, |mut rx| async move {
        rx.recv().await.map(|event| (DeployFrame::Progress(event), rx))
    });
    let summary = futures::stream::once(async move {
        match summary_rx.await {
            Ok(results) => DeployFrame::Summary(DeploySummary {
                status: DeployStage::Completed,
                results,
            }),
            Err(_) => {
                error!("Deploy task ended without a summary");
                DeployFrame::Summary(DeploySummary {
                    status: DeployStage::Error,
                    results: Vec::new(),
                })
            }
        }
    });
    let body = progress
        .chain(summary)
        .map(|frame| Ok::<_, Infallible>(stream_frame(&frame)));

    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        Body::from_stream(body),
    )
        .into_response())
}

/// Wire form of one deploy frame
pub fn stream_frame(frame: &DeployFrame) -> String {
    format!("data: {}\n\n", serde_json::to_string(frame).unwrap_or_default())
}

/// Services list handler
pub async fn services_handler(State(state): State<Arc<ServerState>>) -> Result<Json<ServicesResponse>, ApiError> {
    let services = state.runtime().list_services().await?;
    Ok(Json(ServicesResponse { services }))
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    pub tail: Option<usize>,
    #[serde(default)]
    pub follow: bool,
}

/// Service logs handler. With `follow=true` the response streams one
/// `data: {"log": ...}\n\n` frame per line until the container stops or the
/// client disconnects.
pub async fn logs_handler(
    State(state): State<Arc<ServerState>>,
    Path(name): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<Response, ApiError> {
    let identity = ServiceIdentity::new(name)?;
    let tail = query.tail.unwrap_or(DEFAULT_LOG_TAIL);

    if query.follow {
        let lines = state.runtime().follow_logs(identity.name(), tail).await?;
        let body = lines.map(|log| Ok::<_, Infallible>(log_frame(&LogLine { log })));
        return Ok((
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            Body::from_stream(body),
        )
            .into_response());
    }

    let logs = state.runtime().logs(identity.name(), tail).await;
    Ok(Json(LogsResponse { logs }).into_response())
}

/// Wire form of one followed log line
pub fn log_frame(line: &LogLine) -> String {
    format!("data: {}\n\n", serde_json::to_string(line).unwrap_or_default())
}

/// Service health handler
pub async fn service_health_handler(
    State(state): State<Arc<ServerState>>,
    Path(name): Path<String>,
) -> Result<Json<ServiceHealthResponse>, ApiError> {
    let identity = ServiceIdentity::new(name)?;
    let health_status = state.health().check(&identity).await;
    Ok(Json(ServiceHealthResponse {
        service_name: identity.name().to_string(),
        health_status,
    }))
}

/// Destroy-all handler
pub async fn destroy_handler(State(state): State<Arc<ServerState>>) -> Result<Json<DestroyResponse>, ApiError> {
    let destroyed = state.pipeline.orchestrator().destroy_all().await?;
    Ok(Json(DestroyResponse { destroyed }))
}

//! HTTP and WebSocket surface over the orchestrator.

use std::pin::pin;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        DefaultBodyLimit, Multipart, Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

use crate::catalog::{Catalog, ControlFamily};
use crate::evidence::{EvidenceError, EvidenceFile};
use crate::orchestrator::{Orchestrator, Submission, SubmitError};
use crate::records::ScopeSummary;
use crate::scope::{AssessmentScope, ScopeError};
use crate::session::{SessionError, StatusSnapshot};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Submit(#[from] SubmitError),
    #[error(transparent)]
    Scope(#[from] ScopeError),
    #[error("session {0} not found")]
    BadSessionId(String),
    #[error("{0}")]
    BadRequest(String),
}

impl ServerError {
    fn status(&self) -> StatusCode {
        match self {
            Self::Session(SessionError::NotFound(_)) | Self::BadSessionId(_) => StatusCode::NOT_FOUND,
            Self::Session(SessionError::NotReady(_) | SessionError::Terminal(_)) => StatusCode::CONFLICT,
            Self::Session(SessionError::Poisoned) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Submit(SubmitError::Evidence(EvidenceError::TooLarge { .. })) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Submit(SubmitError::Evidence(EvidenceError::DisallowedType { .. })) => {
                StatusCode::UNSUPPORTED_MEDIA_TYPE
            }
            Self::Submit(_) | Self::Scope(_) | Self::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status();
        let detail = if status.is_server_error() {
            error!(error = %self, "request failed");
            "Internal server error".to_string()
        } else {
            self.to_string()
        };
        (status, Json(json!({ "detail": detail }))).into_response()
    }
}

type ApiResult<T> = Result<T, ServerError>;

fn session_id(raw: &str) -> ApiResult<Uuid> {
    raw.parse().map_err(|_| ServerError::BadSessionId(raw.to_string()))
}

pub fn router(orchestrator: Orchestrator) -> Router {
    let limits = &orchestrator.config().evidence;
    // Whole multipart body: every file at its limit plus form overhead.
    let body_limit = limits
        .max_files
        .saturating_mul(limits.max_file_bytes)
        .saturating_add(1024 * 1024);

    Router::new()
        .route("/health", get(health))
        .route("/api/baselines", get(baselines))
        .route("/api/control-families", get(control_families))
        .route("/api/controls", get(controls))
        .route("/api/predefined-scopes", get(predefined_scopes))
        .route("/api/estimate-scope", post(estimate_scope))
        .route("/api/analyze", post(analyze))
        .route("/api/status/{id}", get(status))
        .route("/api/results/{id}", get(results))
        .route("/api/results/{id}/oscal", get(oscal))
        .route("/api/sessions/{id}/abort", post(abort))
        .route("/api/sessions/{id}", axum::routing::delete(delete_session))
        .route("/ws/{id}", get(status_socket))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(orchestrator)
}

/// Serve until `shutdown` fires, reaping expired sessions meanwhile.
pub async fn serve(orchestrator: Orchestrator, bind: &str, shutdown: CancellationToken) -> std::io::Result<()> {
    let listener = TcpListener::bind(bind).await?;
    info!(addr = %listener.local_addr()?, "listening");
    let reaper = orchestrator.spawn_reaper(shutdown.clone());
    axum::serve(listener, router(orchestrator))
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await?;
    shutdown.cancel();
    let _ = reaper.await;
    Ok(())
}

// =============================================================================
// CATALOG
// =============================================================================

async fn health(State(orch): State<Orchestrator>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "active_sessions": orch.store().len(),
        "reasoning_model": orch.config().reasoning.model,
        "catalog_controls": Catalog::global().all_controls().len(),
    }))
}

async fn baselines() -> Json<Value> {
    Json(json!({ "baselines": Catalog::global().baseline_summaries() }))
}

async fn control_families() -> Json<Value> {
    Json(json!({ "families": Catalog::global().family_summaries() }))
}

#[derive(Debug, Deserialize)]
struct ControlsQuery {
    family: Option<String>,
}

async fn controls(Query(query): Query<ControlsQuery>) -> ApiResult<Json<Value>> {
    let family = match query.family.as_deref().map(str::trim).filter(|f| !f.is_empty()) {
        Some(raw) => Some(
            raw.parse::<ControlFamily>()
                .map_err(|e| ServerError::BadRequest(e.to_string()))?,
        ),
        None => None,
    };
    Ok(Json(json!({ "controls": Catalog::global().control_listing(family) })))
}

async fn predefined_scopes() -> Json<Value> {
    let templates: Vec<_> = Catalog::global().templates().collect();
    Json(json!({ "scopes": templates }))
}

async fn estimate_scope(
    State(orch): State<Orchestrator>,
    Json(request): Json<AssessmentScope>,
) -> ApiResult<Json<Value>> {
    let (resolved, estimate) = orch.estimate_scope(&request)?;
    Ok(Json(json!({
        "scope": ScopeSummary::from(&resolved),
        "controls": resolved.controls,
        "estimate": estimate,
    })))
}

// =============================================================================
// SESSIONS
// =============================================================================

async fn analyze(State(orch): State<Orchestrator>, mut multipart: Multipart) -> ApiResult<Json<Submission>> {
    let mut files = Vec::new();
    let mut scope = AssessmentScope::default();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ServerError::BadRequest(format!("invalid multipart body: {e}")))?
    {
        match field.name() {
            Some("files") => {
                let filename = field.file_name().unwrap_or("upload").to_string();
                let content_type = field
                    .content_type()
                    .unwrap_or("application/octet-stream")
                    .to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ServerError::BadRequest(format!("failed to read {filename}: {e}")))?;
                files.push(EvidenceFile::new(filename, content_type, bytes.to_vec()));
            }
            Some("scope_json") => {
                let raw = field
                    .text()
                    .await
                    .map_err(|e| ServerError::BadRequest(format!("failed to read scope_json: {e}")))?;
                if !raw.trim().is_empty() {
                    scope = serde_json::from_str(&raw)
                        .map_err(|e| ServerError::BadRequest(format!("invalid scope_json: {e}")))?;
                }
            }
            _ => {}
        }
    }

    let submission = orch.submit(&scope, files)?;
    Ok(Json(submission))
}

async fn status(State(orch): State<Orchestrator>, Path(id): Path<String>) -> ApiResult<Json<StatusSnapshot>> {
    Ok(Json(orch.status(&session_id(&id)?)?))
}

async fn results(State(orch): State<Orchestrator>, Path(id): Path<String>) -> ApiResult<Response> {
    let results = orch.results(&session_id(&id)?)?;
    Ok(Json(results).into_response())
}

async fn oscal(State(orch): State<Orchestrator>, Path(id): Path<String>) -> ApiResult<Response> {
    let export = orch.export_oscal(&session_id(&id)?)?;
    Ok(Json(export).into_response())
}

async fn abort(State(orch): State<Orchestrator>, Path(id): Path<String>) -> ApiResult<Json<StatusSnapshot>> {
    Ok(Json(orch.abort(&session_id(&id)?).await?))
}

async fn delete_session(State(orch): State<Orchestrator>, Path(id): Path<String>) -> ApiResult<Json<Value>> {
    let id = session_id(&id)?;
    orch.delete(&id)?;
    Ok(Json(json!({ "session_id": id, "deleted": true })))
}

async fn status_socket(
    ws: WebSocketUpgrade,
    State(orch): State<Orchestrator>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let updates = orch.subscribe(&session_id(&id)?)?;
    Ok(ws.on_upgrade(move |socket| push_status(socket, updates)))
}

async fn push_status(mut socket: WebSocket, updates: impl Stream<Item = StatusSnapshot> + Send) {
    let mut updates = pin!(updates);
    while let Some(snapshot) = updates.next().await {
        let Ok(text) = serde_json::to_string(&snapshot) else {
            break;
        };
        if socket.send(Message::Text(text.into())).await.is_err() {
            return;
        }
    }
    let _ = socket.send(Message::Close(None)).await;
}

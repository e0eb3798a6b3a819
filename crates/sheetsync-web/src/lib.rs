//! HTTP surface: webhook receiver plus the operational endpoints.
//!
//! Routes are parameterized by workflow name so one process serves every
//! configured workflow. Mutating endpoints are gated by the shared channel
//! token; notification identity arrives in request headers and the body is
//! ignored, matching how push channels deliver.

use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use sheetsync_core::Notification;
use sheetsync_sync::{
    verify_channel_token, DedupeCache, NotificationOutcome, SyncError, Workflow,
};
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "sheetsync-web";

pub const CHANNEL_TOKEN_HEADER: &str = "x-channel-token";
pub const RESOURCE_ID_HEADER: &str = "x-resource-id";
pub const MESSAGE_NUMBER_HEADER: &str = "x-message-number";
pub const CHANNEL_ID_HEADER: &str = "x-channel-id";
pub const RESOURCE_STATE_HEADER: &str = "x-resource-state";

#[derive(Clone)]
pub struct AppState {
    workflows: Vec<Arc<Workflow>>,
    dedupe: Arc<DedupeCache>,
    channel_token: String,
}

impl AppState {
    pub fn new(workflows: Vec<Arc<Workflow>>, channel_token: impl Into<String>) -> Self {
        Self {
            workflows,
            dedupe: Arc::new(DedupeCache::default()),
            channel_token: channel_token.into(),
        }
    }

    fn workflow(&self, name: &str) -> Option<&Arc<Workflow>> {
        self.workflows.iter().find(|w| w.name() == name)
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/{workflow}/status", get(status_handler))
        .route("/{workflow}/run", post(run_handler))
        .route("/{workflow}/webhook", post(webhook_handler))
        .route("/{workflow}/watch", post(watch_register_handler))
        .route("/{workflow}/watch/status", get(watch_status_handler))
        .route("/{workflow}/watch/renew", post(watch_renew_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "webhook surface listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

#[derive(Debug, Deserialize, Default)]
struct RunQuery {
    force: Option<bool>,
}

async fn healthz_handler() -> Response {
    Json(serde_json::json!({ "status": "ok" })).into_response()
}

async fn status_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(name): AxumPath<String>,
) -> Response {
    let Some(workflow) = state.workflow(&name) else {
        return not_found(&name);
    };
    let snapshot = workflow.current_state().await;
    Json(serde_json::json!({
        "workflow": workflow.name(),
        "processed_files": snapshot.processed_file_ids.len(),
        "last_processed_time": snapshot.last_processed_time,
        "last_run": snapshot.last_run,
        "last_import_row_count": snapshot.last_import_row_count,
        "change_cursor_set": snapshot.change_cursor.is_some(),
        "watch_active": snapshot.watch.is_some(),
    }))
    .into_response()
}

async fn run_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(name): AxumPath<String>,
    Query(query): Query<RunQuery>,
    headers: HeaderMap,
) -> Response {
    let Some(workflow) = state.workflow(&name) else {
        return not_found(&name);
    };
    if let Err(err) = authorize(&state, &headers) {
        return error_response(err);
    }

    let force = query.force.unwrap_or(false);
    match workflow.reconcile(force).await {
        Ok(outcome) => Json(serde_json::json!({
            "workflow": workflow.name(),
            "forced": force,
            "rows_added": outcome.rows_added,
            "files_merged": outcome.files_merged.len(),
            "newest_modified": outcome.newest_modified,
        }))
        .into_response(),
        Err(err) => error_response(err.into()),
    }
}

async fn webhook_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(name): AxumPath<String>,
    headers: HeaderMap,
) -> Response {
    let Some(workflow) = state.workflow(&name) else {
        return not_found(&name);
    };
    if let Err(err) = authorize(&state, &headers) {
        return error_response(err);
    }

    let note = Notification {
        resource_id: header_value(&headers, RESOURCE_ID_HEADER),
        message_number: header_value(&headers, MESSAGE_NUMBER_HEADER),
        channel_id: header_value(&headers, CHANNEL_ID_HEADER),
        resource_state: header_value(&headers, RESOURCE_STATE_HEADER),
    };

    match workflow.handle_notification(&note, &state.dedupe).await {
        Ok(outcome) => {
            let rows_added = match &outcome {
                NotificationOutcome::Rescanned(inner) => Some(inner.rows_added),
                _ => None,
            };
            Json(serde_json::json!({
                "workflow": workflow.name(),
                "outcome": outcome_label(&outcome),
                "changed": outcome.changed(),
                "rows_added": rows_added,
            }))
            .into_response()
        }
        // Notification deliveries get a generic failure body; the detail
        // stays in the logs.
        Err(SyncError::Unauthorized) => error_response(SyncError::Unauthorized),
        Err(err) => {
            error!(workflow = %workflow.name(), %err, "notification handling failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": "notification handling failed" })),
            )
                .into_response()
        }
    }
}

async fn watch_register_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(name): AxumPath<String>,
    headers: HeaderMap,
) -> Response {
    register_watch(&state, &name, &headers, "registered").await
}

async fn watch_renew_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(name): AxumPath<String>,
    headers: HeaderMap,
) -> Response {
    // Renewal replaces the previous channel wholesale, so it shares the
    // registration path.
    register_watch(&state, &name, &headers, "renewed").await
}

async fn register_watch(
    state: &AppState,
    name: &str,
    headers: &HeaderMap,
    action: &str,
) -> Response {
    let Some(workflow) = state.workflow(name) else {
        return not_found(name);
    };
    if let Err(err) = authorize(state, headers) {
        return error_response(err);
    }

    let secret = if state.channel_token.is_empty() {
        None
    } else {
        Some(state.channel_token.as_str())
    };
    match workflow.register_watch(secret).await {
        Ok(registration) => Json(serde_json::json!({
            "workflow": workflow.name(),
            "action": action,
            "channel_id": registration.channel_id,
            "resource_id": registration.resource_id,
            "expiration": registration.expiration,
        }))
        .into_response(),
        Err(err) => error_response(err),
    }
}

async fn watch_status_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(name): AxumPath<String>,
) -> Response {
    let Some(workflow) = state.workflow(&name) else {
        return not_found(&name);
    };
    let snapshot = workflow.current_state().await;
    match snapshot.watch {
        Some(watch) => Json(serde_json::json!({
            "workflow": workflow.name(),
            "registered": true,
            "channel_id": watch.channel_id,
            "resource_id": watch.resource_id,
            "expiration": watch.expiration,
        }))
        .into_response(),
        None => Json(serde_json::json!({
            "workflow": workflow.name(),
            "registered": false,
        }))
        .into_response(),
    }
}

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), SyncError> {
    let provided = headers
        .get(CHANNEL_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok());
    verify_channel_token(&state.channel_token, provided)
}

fn header_value(headers: &HeaderMap, name: &str) -> String {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

fn outcome_label(outcome: &NotificationOutcome) -> &'static str {
    match outcome {
        NotificationOutcome::Handshake => "handshake",
        NotificationOutcome::Duplicate => "duplicate",
        NotificationOutcome::CursorBootstrapped => "cursor-bootstrapped",
        NotificationOutcome::NoChange => "no-change",
        NotificationOutcome::Rescanned(_) => "rescanned",
        NotificationOutcome::DestinationReset => "destination-reset",
    }
}

fn not_found(name: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({ "error": format!("unknown workflow {name:?}") })),
    )
        .into_response()
}

fn error_response(err: SyncError) -> Response {
    let status = match &err {
        SyncError::Unauthorized => StatusCode::UNAUTHORIZED,
        SyncError::Config(_) => StatusCode::BAD_REQUEST,
        SyncError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(serde_json::json!({ "error": err.to_string() })),
    )
        .into_response()
}

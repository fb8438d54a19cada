//! HTTP surface: session minting, out-of-band interrupts, history reads,
//! health, and the WebSocket attach point.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use chrono::{Duration, Utc};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tracing::info;
use uuid::Uuid;

use crate::config::{Config, SessionConfig};
use crate::journal::Journal;
use crate::registry::Registry;
use crate::relay::{self, InterruptSource};
use crate::session::Session;

/// Advisory lifetime reported by `POST /session`.
const SESSION_TTL_MINUTES: i64 = 30;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Registry,
    pub journal: Arc<Journal>,
}

impl AppState {
    pub fn new(config: Config) -> AppState {
        let journal = Journal::new(config.history_dir.clone(), config.save_history);
        AppState {
            config: Arc::new(config),
            registry: Registry::new(),
            journal: Arc::new(journal),
        }
    }
}

/// Builds the gateway router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/session", post(create_session))
        .route("/interrupt", post(interrupt))
        .route("/history", get(list_history))
        .route("/history/{id}", get(get_history))
        .route("/health", get(health))
        .route("/ws", get(relay::ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Binds and serves until ctrl-c.
pub async fn serve(state: AppState, addr: &str) -> std::io::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "gateway listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

/// `POST /session` — mints a session id and inserts the record before any
/// socket arrives.
async fn create_session(State(state): State<AppState>, body: Bytes) -> Response {
    let config: SessionConfig = if body.is_empty() {
        SessionConfig::default()
    } else {
        match serde_json::from_slice(&body) {
            Ok(config) => config,
            Err(e) => return invalid_config(e),
        }
    };
    if let Err(e) = config.validate() {
        return invalid_config(e);
    }

    let session_id = Uuid::new_v4().to_string();
    let params = state.config.session_params(&config);
    state.registry.insert(Session::new(&session_id, params));
    info!(session_id = %session_id, "session minted");

    relay::journal(
        &state,
        &session_id,
        "session_opened",
        json!({"source": "api", "config": config}),
    )
    .await;

    let expires_at = Utc::now() + Duration::minutes(SESSION_TTL_MINUTES);
    Json(json!({
        "sessionId": session_id,
        "wsPath": format!("/ws?sessionId={}", session_id),
        "expiresAt": expires_at.to_rfc3339(),
    }))
    .into_response()
}

fn invalid_config(error: impl ToString) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"error": "invalid_config", "message": error.to_string()})),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
struct InterruptRequest {
    #[serde(rename = "sessionId")]
    session_id: String,
}

/// `POST /interrupt` — out-of-band interruption.
async fn interrupt(
    State(state): State<AppState>,
    Json(req): Json<InterruptRequest>,
) -> Response {
    let Some(session) = state.registry.get(&req.session_id) else {
        return Json(json!({"ok": true, "interrupted": false})).into_response();
    };

    match relay::interrupt_session(&state, &session, InterruptSource::Api).await {
        Ok(interrupted) => Json(json!({"ok": true, "interrupted": interrupted})).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": "interrupt_failed", "message": e.to_string()})),
        )
            .into_response(),
    }
}

/// `GET /history` — session summaries, newest first.
async fn list_history(State(state): State<AppState>) -> Response {
    let sessions = state.journal.list().await;
    Json(json!({"sessions": sessions})).into_response()
}

/// `GET /history/{id}` — full event log for one session.
async fn get_history(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let events = state.journal.events(&id).await;
    if events.is_empty() {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "session_not_found"})),
        )
            .into_response();
    }
    Json(json!({"sessionId": id, "events": events})).into_response()
}

/// `GET /health`
async fn health() -> Response {
    Json(json!({"ok": true, "now": Utc::now().to_rfc3339()})).into_response()
}

use std::collections::BTreeSet;
use std::time::Duration;

use axum::{
    Json,
    extract::{FromRequestParts, Path, Query, State},
    http::{StatusCode, header::COOKIE, request::Parts},
    response::sse::{Event, KeepAlive, Sse},
};
use futures::stream::{Stream, StreamExt};
use percent_encoding::percent_decode_str;
use serde::Deserialize;
use tokio_stream::wrappers::IntervalStream;
use tracing::{info, warn};

use crate::error::QueueError;
use crate::item::TransferSnapshot;
use crate::state::AppState;

pub const SESSION_HEADER: &str = "x-session-id";
const SESSION_COOKIE: &str = "id";

/// Opaque session identity supplied by the login layer, taken from the
/// `x-session-id` header or the `id` cookie.
#[derive(Debug, Clone)]
pub struct SessionId(pub String);

fn session_from_cookies(parts: &Parts) -> Option<String> {
    parts
        .headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, value)| percent_decode_str(value.trim()).decode_utf8_lossy().to_string())
        .filter(|value| !value.is_empty())
}

impl<S: Send + Sync> FromRequestParts<S> for SessionId {
    type Rejection = (StatusCode, &'static str);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(SESSION_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());

        header
            .or_else(|| session_from_cookies(parts))
            .map(SessionId)
            .ok_or((StatusCode::UNAUTHORIZED, "Missing session"))
    }
}

#[derive(Debug, Deserialize)]
pub struct UrlQuery {
    pub url: String,
}

pub async fn server_info(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "host_url": state.host_url,
        "port": state.settings.server_port,
        "concurrency_limit": state.settings.concurrency_limit,
        "upload_folder": state.settings.upload_folder,
        "sessions": state.registry.all_session_ids().len(),
    }))
}

pub async fn list_sessions(State(state): State<AppState>) -> Json<BTreeSet<String>> {
    Json(state.registry.all_session_ids())
}

pub async fn list_downloads(
    State(state): State<AppState>,
    SessionId(session): SessionId,
) -> Json<Vec<TransferSnapshot>> {
    Json(state.registry.list(&session))
}

pub async fn list_session_downloads(
    State(state): State<AppState>,
    Path(session): Path<String>,
) -> Json<Vec<TransferSnapshot>> {
    Json(state.registry.list(&session))
}

pub async fn add_download(
    State(state): State<AppState>,
    SessionId(session): SessionId,
    Query(query): Query<UrlQuery>,
) -> Result<Json<TransferSnapshot>, (StatusCode, String)> {
    match state.registry.enqueue(&session, &query.url) {
        Ok(item) => Ok(Json(item)),
        Err(QueueError::Closed) => {
            warn!("Session {} logged out while enqueueing", session);
            Err((StatusCode::CONFLICT, "Session closed".to_string()))
        }
        Err(e @ QueueError::InvalidUrl(_)) => {
            warn!("Rejected download for session {}: {}", session, e);
            Err((StatusCode::BAD_REQUEST, "Invalid url".to_string()))
        }
    }
}

fn item_reply(found: bool) -> &'static str {
    if found { "OK" } else { "No such item" }
}

pub async fn stop_download(
    State(state): State<AppState>,
    SessionId(session): SessionId,
    Query(query): Query<UrlQuery>,
) -> &'static str {
    item_reply(state.registry.stop(&session, &query.url))
}

pub async fn restart_download(
    State(state): State<AppState>,
    SessionId(session): SessionId,
    Query(query): Query<UrlQuery>,
) -> &'static str {
    item_reply(state.registry.restart(&session, &query.url))
}

pub async fn remove_download(
    State(state): State<AppState>,
    SessionId(session): SessionId,
    Query(query): Query<UrlQuery>,
) -> &'static str {
    item_reply(state.registry.remove(&session, &query.url))
}

pub async fn logout(
    State(state): State<AppState>,
    SessionId(session): SessionId,
) -> Json<serde_json::Value> {
    let known = state.registry.logout_session(&session);
    info!("Logout requested for session {} (known: {})", session, known);
    Json(serde_json::json!({ "status": if known { "logged_out" } else { "unknown" } }))
}

/// Pushes the session's item list on every progress tick.
pub async fn sse_handler(
    State(state): State<AppState>,
    SessionId(session): SessionId,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    let period = Duration::from_millis(state.settings.progress_interval_ms.max(100));
    let registry = state.registry.clone();
    let stream = IntervalStream::new(tokio::time::interval(period))
        .map(move |_| Event::default().json_data(registry.list(&session)));

    Sse::new(stream).keep_alive(KeepAlive::default())
}

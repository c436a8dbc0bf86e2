use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use cove_proto::{
    ClusterPayload, CreateSessionRequest, HeartbeatRequest, HeartbeatResponse, RuntimeInfo,
};
use tracing::warn;

use crate::auth::Auth;
use crate::cluster::ClusterStore;
use crate::registry::SessionRegistry;
use crate::system::SystemMonitor;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub monitor: Arc<SystemMonitor>,
    pub cluster: Arc<ClusterStore>,
    pub auth: Arc<Auth>,
    /// Fresh per process start; clients watch it to detect restarts.
    pub boot_id: String,
    pub ping_interval_secs: u64,
}

fn require_auth(state: &AppState, headers: &HeaderMap) -> Result<(), StatusCode> {
    let header = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    if state.auth.verify_header(header) {
        Ok(())
    } else {
        Err(StatusCode::UNAUTHORIZED)
    }
}

pub async fn healthz() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

pub async fn create_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateSessionRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    require_auth(&state, &headers)?;
    let session = state
        .registry
        .create(req.cwd.map(PathBuf::from))
        .await
        .map_err(|e| {
            warn!(error = %e, "session create failed");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;
    Ok((StatusCode::CREATED, Json(session.info())))
}

pub async fn delete_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, StatusCode> {
    require_auth(&state, &headers)?;
    // Disposing an already-gone session is fine; reconnecting clients
    // may retry the same delete.
    state.registry.remove(&id).await;
    Ok(StatusCode::NO_CONTENT)
}

/// The sync endpoint: apply the client's pending updates, answer with
/// the full session list plus system and runtime info. Updates naming
/// unknown sessions are skipped so one stale entry cannot fail the
/// whole heartbeat.
pub async fn heartbeat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<HeartbeatRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    require_auth(&state, &headers)?;

    for update in &req.updates.sessions {
        match state.registry.get(&update.id) {
            Some(session) => session.apply_update(update),
            None => warn!(session = %update.id, "heartbeat update for unknown session"),
        }
    }

    Ok(Json(HeartbeatResponse {
        sessions: state.registry.list(),
        system: state.monitor.snapshot(),
        runtime: RuntimeInfo {
            boot_id: state.boot_id.clone(),
        },
    }))
}

pub async fn get_cluster(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, StatusCode> {
    require_auth(&state, &headers)?;
    Ok(Json(state.cluster.get()))
}

pub async fn put_cluster(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<ClusterPayload>,
) -> Result<impl IntoResponse, StatusCode> {
    require_auth(&state, &headers)?;
    state.cluster.put(payload).map_err(|e| {
        warn!(error = %e, "cluster persist failed");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    Ok(Json(state.cluster.get()))
}

//! Control Server
//!
//! Small HTTP surface over the running daemon: status (aggregate
//! recovery state plus per-component health), force-checkpoint, and
//! force-recover. The CLI subcommands talk to it with the client helpers
//! at the bottom.

use crate::persistence::checkpoint::{BackupManager, CheckpointMeta};
use crate::supervisor::heartbeat::{ComponentHealth, HealthStatus, HeartbeatMonitor};
use crate::supervisor::orchestrator::{RecoveryOrchestrator, RecoveryState};
use crate::supervisor::scheduler::{ComponentRegistry, RegistrationInfo};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Shared state behind the control routes.
#[derive(Clone)]
pub struct ControlState {
    pub monitor: Arc<HeartbeatMonitor>,
    pub orchestrator: Arc<RecoveryOrchestrator>,
    pub backup: Arc<BackupManager>,
    pub registry: Arc<ComponentRegistry>,
    pub started_at: DateTime<Utc>,
}

/// Response for `GET /status`.
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub recovery_state: RecoveryState,
    pub aggregate: HealthStatus,
    pub uptime_seconds: u64,
    pub components: Vec<ComponentHealth>,
    pub registrations: Vec<RegistrationInfo>,
    pub checkpoints: Vec<CheckpointMeta>,
}

pub fn router(state: ControlState) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/checkpoint", post(checkpoint))
        .route("/recover", post(recover))
        .with_state(state)
}

/// Serve the control API until the token is cancelled.
pub async fn serve(
    state: ControlState,
    bind: &str,
    cancel: CancellationToken,
) -> crate::error::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!("Control server listening on {}", bind);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;

    Ok(())
}

async fn status(State(state): State<ControlState>) -> Json<StatusResponse> {
    let uptime_seconds = (Utc::now() - state.started_at).num_seconds().max(0) as u64;
    Json(StatusResponse {
        recovery_state: state.orchestrator.state().await,
        aggregate: state.monitor.aggregate_status().await,
        uptime_seconds,
        components: state.monitor.report().await,
        registrations: state.registry.info().await,
        checkpoints: state.backup.list().await,
    })
}

async fn checkpoint(
    State(state): State<ControlState>,
) -> Result<Json<CheckpointMeta>, (StatusCode, String)> {
    match state.backup.create("manual").await {
        Ok(meta) => Ok(Json(meta)),
        Err(e) => {
            error!("Forced checkpoint failed: {}", e);
            Err((StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
        }
    }
}

async fn recover(State(state): State<ControlState>) -> StatusCode {
    state.orchestrator.force_recover("operator request").await;
    StatusCode::ACCEPTED
}

// --- client helpers for the CLI subcommands ---

/// Fetch daemon status from a running control server.
pub async fn fetch_status(addr: &str) -> crate::error::Result<StatusResponse> {
    let response = reqwest::get(format!("http://{}/status", addr))
        .await?
        .error_for_status()?;
    Ok(response.json().await?)
}

/// Ask the daemon to create a checkpoint now.
pub async fn request_checkpoint(addr: &str) -> crate::error::Result<CheckpointMeta> {
    let response = reqwest::Client::new()
        .post(format!("http://{}/checkpoint", addr))
        .send()
        .await?
        .error_for_status()?;
    Ok(response.json().await?)
}

/// Ask the daemon to run a recovery sequence now.
pub async fn request_recover(addr: &str) -> crate::error::Result<()> {
    reqwest::Client::new()
        .post(format!("http://{}/recover", addr))
        .send()
        .await?
        .error_for_status()?;
    Ok(())
}

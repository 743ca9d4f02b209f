//! HTTP control surface.
//!
//! Exposes the worker's stats and scheduler state and forwards
//! enable/disable/drain commands to the scheduler. Runs on its own task and
//! never touches worker state directly.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::scheduler::{Duty, Lifecycle, SchedulerHandle, SchedulerStatus, UnknownDuty};
use crate::stats::WorkerStats;

/// Shared state for the control server.
#[derive(Clone)]
pub struct ControlState {
    pub scheduler: SchedulerHandle,
    pub stats: watch::Receiver<WorkerStats>,
}

#[derive(Debug, Error)]
pub enum ControlError {
    #[error(transparent)]
    UnknownDuty(#[from] UnknownDuty),

    #[error("worker has stopped")]
    WorkerStopped,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ControlError {
    fn into_response(self) -> Response {
        let status = match self {
            ControlError::UnknownDuty(_) => StatusCode::NOT_FOUND,
            ControlError::WorkerStopped => StatusCode::SERVICE_UNAVAILABLE,
        };
        let body = ErrorBody {
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Serialize)]
pub struct StatusResponse {
    pub stats: WorkerStats,
    pub scheduler: SchedulerStatus,
}

#[derive(Serialize)]
pub struct HealthResponse {
    status: &'static str,
    lifecycle: Lifecycle,
}

#[derive(Serialize)]
pub struct CommandResponse {
    accepted: String,
}

/// Build the axum router for control endpoints.
pub fn router(state: ControlState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/duties/:duty/enable", post(enable_handler))
        .route("/duties/:duty/disable", post(disable_handler))
        .route("/drain", post(drain_handler))
        .with_state(state)
}

/// Serve the control router until `shutdown` is cancelled.
pub async fn serve(state: ControlState, port: u16, shutdown: CancellationToken) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind control server on {addr}"))?;
    info!(%addr, "control server listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("control server failed")
}

/// Returns 200 while the worker is running or draining, 503 once stopped.
async fn health_handler(State(state): State<ControlState>) -> (StatusCode, Json<HealthResponse>) {
    let lifecycle = state.scheduler.status().lifecycle;
    let (code, status) = match lifecycle {
        Lifecycle::Running => (StatusCode::OK, "healthy"),
        Lifecycle::Draining => (StatusCode::OK, "draining"),
        Lifecycle::Stopped => (StatusCode::SERVICE_UNAVAILABLE, "stopped"),
    };
    (code, Json(HealthResponse { status, lifecycle }))
}

async fn status_handler(State(state): State<ControlState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        stats: state.stats.borrow().clone(),
        scheduler: state.scheduler.status(),
    })
}

async fn enable_handler(
    State(state): State<ControlState>,
    Path(duty): Path<String>,
) -> Result<(StatusCode, Json<CommandResponse>), ControlError> {
    let duty: Duty = duty.parse()?;
    state
        .scheduler
        .enable(duty)
        .await
        .map_err(|_| ControlError::WorkerStopped)?;
    Ok(accepted(format!("enable {duty}")))
}

async fn disable_handler(
    State(state): State<ControlState>,
    Path(duty): Path<String>,
) -> Result<(StatusCode, Json<CommandResponse>), ControlError> {
    let duty: Duty = duty.parse()?;
    state
        .scheduler
        .disable(duty)
        .await
        .map_err(|_| ControlError::WorkerStopped)?;
    Ok(accepted(format!("disable {duty}")))
}

async fn drain_handler(
    State(state): State<ControlState>,
) -> Result<(StatusCode, Json<CommandResponse>), ControlError> {
    state
        .scheduler
        .drain()
        .await
        .map_err(|_| ControlError::WorkerStopped)?;
    Ok(accepted("drain".to_string()))
}

/// Commands are applied between duty runs, hence 202.
fn accepted(command: String) -> (StatusCode, Json<CommandResponse>) {
    (StatusCode::ACCEPTED, Json(CommandResponse { accepted: command }))
}

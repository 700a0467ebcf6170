//! HTTP surface of the gateway.
//!
//! - `POST /capture` queues a [`CaptureEvent`] and answers `202 Accepted`
//!   without waiting for persistence. A stopped worker or a full queue
//!   yields `503 Service Unavailable`; an event that could not be signed
//!   yields `422 Unprocessable Entity`.
//! - `GET /health` reports worker state and counters.

use std::future::Future;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::batch::CaptureEvent;
use crate::worker::{EnqueueError, EvidenceWorker, WorkerState};

/// Shared handler state.
#[derive(Debug, Clone)]
pub struct AppState {
    worker: Arc<EvidenceWorker>,
}

impl AppState {
    /// Wraps a worker.
    #[must_use]
    pub const fn new(worker: Arc<EvidenceWorker>) -> Self {
        Self { worker }
    }
}

/// Body of `POST /capture` responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureResponse {
    /// `accepted` or `rejected`.
    pub status: String,
    /// Human-readable detail.
    pub message: String,
}

/// Body of `GET /health` responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    /// `healthy` while the worker runs, `unavailable` otherwise.
    pub status: String,
    /// Worker lifecycle state.
    pub state: String,
    /// Events waiting for the consumer.
    pub queue_size: usize,
    /// Events persisted so far.
    pub processed_count: u64,
    /// Batches that failed to persist.
    pub failed_batches: u64,
    /// Events dropped on a full queue.
    pub dropped_count: u64,
    /// Accepted events discarded because their redacted form could not be
    /// signed.
    pub discarded_count: u64,
}

/// Builds the gateway router.
#[must_use]
pub fn router(worker: Arc<EvidenceWorker>) -> Router {
    Router::new()
        .route("/capture", post(capture))
        .route("/health", get(health))
        .with_state(AppState::new(worker))
}

/// Serves the router on `listener` until `shutdown` resolves.
///
/// # Errors
///
/// Returns the listener's I/O error.
pub async fn serve<F>(
    listener: TcpListener,
    worker: Arc<EvidenceWorker>,
    shutdown: F,
) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "capture gateway listening");
    }
    axum::serve(listener, router(worker))
        .with_graceful_shutdown(shutdown)
        .await
}

/// `POST /capture`.
pub async fn capture(
    State(state): State<AppState>,
    Json(event): Json<CaptureEvent>,
) -> (StatusCode, Json<CaptureResponse>) {
    match state.worker.enqueue(event) {
        Ok(()) => {
            debug!(queue_size = state.worker.queue_size(), "capture event accepted");
            (
                StatusCode::ACCEPTED,
                Json(CaptureResponse {
                    status: "accepted".to_string(),
                    message: "Evidence queued for signing".to_string(),
                }),
            )
        },
        Err(err) => {
            let code = match &err {
                EnqueueError::NotRunning => {
                    warn!("capture rejected: worker not running");
                    StatusCode::SERVICE_UNAVAILABLE
                },
                EnqueueError::Unsignable(_) => StatusCode::UNPROCESSABLE_ENTITY,
                EnqueueError::QueueFull { .. } => StatusCode::SERVICE_UNAVAILABLE,
            };
            (
                code,
                Json(CaptureResponse {
                    status: "rejected".to_string(),
                    message: err.to_string(),
                }),
            )
        },
    }
}

/// `GET /health`.
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let worker = &state.worker;
    let worker_state = worker.state();
    let (code, status) = if worker_state == WorkerState::Running {
        (StatusCode::OK, "healthy")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "unavailable")
    };
    (
        code,
        Json(HealthResponse {
            status: status.to_string(),
            state: worker_state.to_string(),
            queue_size: worker.queue_size(),
            processed_count: worker.processed_count(),
            failed_batches: worker.failed_batches(),
            dropped_count: worker.dropped_count(),
            discarded_count: worker.discarded_count(),
        }),
    )
}

//! `GET /health`: liveness plus a check of the delivery queue.

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, Json};
use chrono::{DateTime, Utc};
use mervo_core::Clock;
use mervo_delivery::DeliveryQueue;
use serde::Serialize;
use tracing::{debug, instrument, warn};

use crate::server::AppState;

/// Body of the health response.
#[derive(Debug, Serialize)]
pub struct HealthReport {
    /// `healthy` when every check is up.
    pub status: HealthStatus,
    /// When the report was produced.
    pub timestamp: DateTime<Utc>,
    /// Crate version.
    pub version: &'static str,
    /// Per-component checks.
    pub checks: Checks,
}

/// Overall status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Queue reachable.
    Healthy,
    /// Queue unreachable; deliveries cannot be accepted.
    Unhealthy,
}

/// Component checks included in the report.
#[derive(Debug, Serialize)]
pub struct Checks {
    /// Delivery queue check.
    pub queue: QueueCheck,
}

/// Outcome of reading one row from the queue.
#[derive(Debug, Serialize)]
pub struct QueueCheck {
    /// `up` or `down`.
    pub status: CheckStatus,
    /// Failure reason when down.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Check latency.
    pub response_time_ms: u64,
}

/// Check status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    /// Reachable.
    Up,
    /// Unreachable.
    Down,
}

/// Builds a report by listing a single delivery from `queue`.
pub async fn check_queue(queue: &dyn DeliveryQueue, clock: &Arc<dyn Clock>) -> HealthReport {
    let started = clock.now();
    let result = queue.list(None, 1).await;
    let response_time_ms =
        u64::try_from(clock.now().duration_since(started).as_millis()).unwrap_or(u64::MAX);

    let queue = match result {
        Ok(_) => QueueCheck { status: CheckStatus::Up, message: None, response_time_ms },
        Err(e) => {
            warn!(error = %e, "queue check failed");
            QueueCheck {
                status: CheckStatus::Down,
                message: Some(format!("queue unavailable: {e}")),
                response_time_ms,
            }
        },
    };

    let status = match queue.status {
        CheckStatus::Up => HealthStatus::Healthy,
        CheckStatus::Down => HealthStatus::Unhealthy,
    };

    HealthReport {
        status,
        timestamp: clock.now_utc(),
        version: env!("CARGO_PKG_VERSION"),
        checks: Checks { queue },
    }
}

/// Returns 200 when healthy, 503 otherwise.
#[instrument(name = "health_check", skip(state))]
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthReport>) {
    let report = check_queue(state.queue.as_ref(), &state.clock).await;
    debug!(status = ?report.status, "health check completed");

    let code = match report.status {
        HealthStatus::Healthy => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (code, Json(report))
}

//! Producer and operator endpoints for deliveries.
//!
//! Producers enqueue through `POST /deliveries`; consumers and operators read
//! status, list, cancel, and trigger a single dispatch by hand.

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use mervo_core::{Delivery, DeliveryId, DeliveryStatus, MervoError, NewDelivery};
use mervo_delivery::queue::DEFAULT_LIST_LIMIT;
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use super::ApiError;
use crate::server::AppState;

/// Largest page `GET /deliveries` returns.
const MAX_LIST_LIMIT: usize = 1000;

/// Response to a successful enqueue.
#[derive(Debug, Serialize, Deserialize)]
pub struct EnqueueResponse {
    /// Identifier of the new delivery.
    pub id: DeliveryId,
    /// Always `pending`.
    pub status: DeliveryStatus,
}

/// Delivery as exposed over HTTP; the secret is reduced to a flag.
#[derive(Debug, Serialize)]
pub struct DeliveryView {
    #[serde(flatten)]
    delivery: Delivery,
    has_secret: bool,
}

impl From<Delivery> for DeliveryView {
    fn from(delivery: Delivery) -> Self {
        let has_secret = delivery.has_secret();
        Self { delivery, has_secret }
    }
}

/// Query parameters for `GET /deliveries`.
#[derive(Debug, Default, Deserialize)]
pub struct ListParams {
    /// Only return deliveries in this status.
    pub status: Option<String>,
    /// Page size, default 100.
    pub limit: Option<usize>,
}

/// Enqueues a delivery for asynchronous dispatch.
///
/// # Errors
///
/// - 422: missing or malformed url or payload, or a connector that does not
///   accept the event type
/// - 413: payload too large
/// - 503: queue unavailable
#[instrument(name = "enqueue_delivery", skip(state, body))]
pub async fn enqueue_delivery(
    State(state): State<AppState>,
    body: Result<Json<NewDelivery>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(new) = body.map_err(|rejection| {
        warn!(error = %rejection.body_text(), "rejected malformed delivery");
        MervoError::malformed(rejection.body_text())
    })?;

    if let Err(error) = new.validate() {
        warn!(code = error.code(), error = %error, "rejected malformed delivery");
        return Err(error.into());
    }

    if let Some(connector_id) = new.connector_id.as_deref() {
        state.connectors.authorize(connector_id, new.event_type.as_deref()).await.map_err(
            |error| {
                warn!(code = error.code(), error = %error, "connector refused event type");
                ApiError::from(error)
            },
        )?;
    }

    let delivery = state.queue.enqueue(new).await.map_err(|e| {
        error!(error = %e, "failed to enqueue delivery");
        ApiError::from(e)
    })?;

    info!(
        delivery_id = %delivery.id,
        event_type = delivery.event_type.as_deref().unwrap_or("none"),
        signed = delivery.has_secret(),
        "delivery enqueued"
    );

    Ok((StatusCode::CREATED, Json(EnqueueResponse { id: delivery.id, status: delivery.status }))
        .into_response())
}

/// Returns one delivery.
///
/// # Errors
///
/// Returns 404 when no delivery has the id.
#[instrument(name = "get_delivery", skip(state))]
pub async fn get_delivery(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<DeliveryView>, ApiError> {
    let id = DeliveryId::from(id);
    match state.queue.find(id).await? {
        Some(delivery) => Ok(Json(delivery.into())),
        None => Err(ApiError::NotFound(format!("delivery {id} not found"))),
    }
}

/// Lists deliveries oldest first, optionally filtered by status.
///
/// # Errors
///
/// Returns 400 for an unknown status or a zero limit.
#[instrument(name = "list_deliveries", skip(state))]
pub async fn list_deliveries(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<DeliveryView>>, ApiError> {
    let status = params
        .status
        .as_deref()
        .map(str::parse::<DeliveryStatus>)
        .transpose()
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let limit = params.limit.unwrap_or(DEFAULT_LIST_LIMIT);
    if limit == 0 {
        return Err(ApiError::BadRequest("limit must be greater than zero".to_string()));
    }

    let deliveries = state.queue.list(status, limit.min(MAX_LIST_LIMIT)).await?;
    Ok(Json(deliveries.into_iter().map(DeliveryView::from).collect()))
}

/// Cancels a pending delivery.
///
/// # Errors
///
/// - 404: no delivery has the id
/// - 409: the delivery is not pending
#[instrument(name = "cancel_delivery", skip(state))]
pub async fn cancel_delivery(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<DeliveryView>, ApiError> {
    let delivery = state.queue.cancel(DeliveryId::from(id)).await.map_err(|e| {
        warn!(error = %e, "cancel refused");
        ApiError::from(e)
    })?;

    info!(delivery_id = %delivery.id, "delivery cancelled");
    Ok(Json(delivery.into()))
}

/// Dispatches one due delivery.
///
/// The dispatch runs on its own task, so a request timeout or a client
/// disconnect cannot strand a claimed delivery in-flight. Returns the
/// dispatch outcome, or `{"processed": false}` when nothing is due.
///
/// # Errors
///
/// Returns 503 when the queue cannot be read or written.
#[instrument(name = "process_one", skip(state))]
pub async fn process_one(State(state): State<AppState>) -> Result<Response, ApiError> {
    // Once claimed, a delivery must be resolved even if this request is dropped.
    let dispatcher = state.dispatcher.clone();
    let dispatch = tokio::spawn(async move { dispatcher.process_next().await });
    let result = dispatch.await.map_err(|e| {
        error!(error = %e, "manual dispatch task failed");
        MervoError::QueueUnavailable(format!("dispatch task failed: {e}"))
    })?;

    match result {
        Ok(Some(outcome)) => {
            info!(delivery_id = %outcome.delivery_id(), "manual dispatch completed");
            Ok(Json(outcome).into_response())
        },
        Ok(None) => Ok(Json(serde_json::json!({ "processed": false })).into_response()),
        Err(e) => {
            error!(error = %e, "manual dispatch failed");
            Err(MervoError::QueueUnavailable(e.to_string()).into())
        },
    }
}

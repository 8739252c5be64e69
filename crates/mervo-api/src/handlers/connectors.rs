//! `GET /connectors`: the manifests producers may enqueue under.

use axum::{extract::State, Json};
use mervo_core::ConnectorManifest;
use tracing::{debug, instrument};

use crate::server::AppState;

/// Lists every registered connector, ordered by id.
#[instrument(name = "list_connectors", skip(state))]
pub async fn list_connectors(State(state): State<AppState>) -> Json<Vec<ConnectorManifest>> {
    let connectors = state.connectors.list().await;
    debug!(count = connectors.len(), "listed connectors");
    Json(connectors)
}

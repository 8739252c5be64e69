//! HTTP server configuration and request routing.
//!
//! Requests flow through middleware in order:
//! 1. Request ID generation
//! 2. Request/response logging
//! 3. Timeout enforcement
//! 4. Handler execution
//!
//! # Graceful Shutdown
//!
//! The server stops accepting connections on SIGINT or SIGTERM and waits for
//! in-flight requests before returning, so the caller can then stop the
//! delivery engine.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    extract::Request,
    http::StatusCode,
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Router,
};
use mervo_core::{Clock, ConnectorRegistry, SIGNATURE_HEADER};
use mervo_delivery::{DeliveryQueue, Dispatcher};
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{config::Config, dedupe::DedupeStore, handlers};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    /// Queue producers enqueue into and operators inspect.
    pub queue: Arc<dyn DeliveryQueue>,
    /// Dispatcher used by the manual process-one trigger.
    pub dispatcher: Arc<Dispatcher>,
    /// Connectors allowed to enqueue.
    pub connectors: ConnectorRegistry,
    /// Inbound event ids seen recently.
    pub dedupe: DedupeStore,
    /// Shared secret for inbound receive; `None` rejects every receive.
    pub webhook_secret: Option<Arc<str>>,
    /// Header carrying the inbound signature.
    pub signature_header: Arc<str>,
    /// Time source for health responses.
    pub clock: Arc<dyn Clock>,
}

impl AppState {
    /// Creates state with an empty connector registry, a default dedupe
    /// store and no inbound secret.
    pub fn new(dispatcher: Arc<Dispatcher>, clock: Arc<dyn Clock>) -> Self {
        Self {
            queue: dispatcher.queue().clone(),
            dispatcher,
            connectors: ConnectorRegistry::new(),
            dedupe: DedupeStore::default(),
            webhook_secret: None,
            signature_header: Arc::from(SIGNATURE_HEADER),
            clock,
        }
    }

    /// Sets the inbound shared secret.
    #[must_use]
    pub fn with_webhook_secret(mut self, secret: impl Into<Arc<str>>) -> Self {
        self.webhook_secret = Some(secret.into());
        self
    }

    /// Sets the header carrying the inbound signature.
    #[must_use]
    pub fn with_signature_header(mut self, header: impl Into<Arc<str>>) -> Self {
        self.signature_header = header.into();
        self
    }

    /// Replaces the connector registry.
    #[must_use]
    pub fn with_connectors(mut self, connectors: ConnectorRegistry) -> Self {
        self.connectors = connectors;
        self
    }

    /// Replaces the inbound dedupe store.
    #[must_use]
    pub fn with_dedupe(mut self, dedupe: DedupeStore) -> Self {
        self.dedupe = dedupe;
        self
    }

    /// Applies the inbound settings and connector manifests from `config`.
    ///
    /// # Errors
    ///
    /// Returns an error when the configured connectors cannot be registered.
    pub async fn configured(self, config: &Config) -> anyhow::Result<Self> {
        let connectors = config.connector_registry().await?;
        info!(count = config.connectors.len(), "connectors registered");

        let mut state = self
            .with_signature_header(config.signature_header.as_str())
            .with_dedupe(DedupeStore::new(config.to_dedupe_config()))
            .with_connectors(connectors);
        match config.webhook_secret.as_deref() {
            Some(secret) => state = state.with_webhook_secret(secret),
            None => {
                warn!("no webhook secret configured, inbound receive will reject every request");
            },
        }
        Ok(state)
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("dispatcher", &self.dispatcher)
            .field("dedupe", &self.dedupe)
            .field("webhook_secret", &self.webhook_secret.as_ref().map(|_| "[REDACTED]"))
            .field("signature_header", &self.signature_header)
            .finish_non_exhaustive()
    }
}

/// Creates the Axum router with all routes and middleware.
///
/// # Example
///
/// ```no_run
/// use std::{sync::Arc, time::Duration};
///
/// use mervo_api::{create_router, AppState};
/// use mervo_core::{Clock, RealClock};
/// use mervo_delivery::{DeliveryClient, Dispatcher, InMemoryDeliveryQueue, RetryPolicy};
///
/// # fn build() -> mervo_delivery::Result<()> {
/// let clock: Arc<dyn Clock> = Arc::new(RealClock::new());
/// let queue = Arc::new(InMemoryDeliveryQueue::new(clock.clone()));
/// let client = DeliveryClient::with_defaults()?;
/// let policy = RetryPolicy::default();
/// let dispatcher = Arc::new(Dispatcher::new(queue, client, policy, clock.clone()));
///
/// let app = create_router(AppState::new(dispatcher, clock), Duration::from_secs(30));
/// // Serve the app...
/// # Ok(())
/// # }
/// ```
pub fn create_router(state: AppState, request_timeout: Duration) -> Router {
    let health_routes = Router::new().route("/health", get(handlers::health_check));

    let connector_routes = Router::new().route("/connectors", get(handlers::list_connectors));

    let inbound_routes = Router::new()
        .route("/webhooks/verify", post(handlers::verify_challenge))
        .route("/webhooks/receive", post(handlers::receive_webhook));

    let delivery_routes = Router::new()
        .route("/deliveries", post(handlers::enqueue_delivery).get(handlers::list_deliveries))
        .route("/deliveries/process-one", post(handlers::process_one))
        .route("/deliveries/{id}", get(handlers::get_delivery))
        .route("/deliveries/{id}/cancel", post(handlers::cancel_delivery));

    Router::new()
        .merge(health_routes)
        .merge(inbound_routes)
        .merge(connector_routes)
        .merge(delivery_routes)
        .layer(TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, request_timeout))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(inject_request_id))
        .with_state(state)
}

/// Adds an X-Request-Id header to every response.
async fn inject_request_id(mut req: Request, next: Next) -> Response {
    let request_id = Uuid::new_v4().to_string();
    req.extensions_mut().insert(request_id.clone());

    let mut response = next.run(req).await;

    if let Ok(header_value) = request_id.parse() {
        response.headers_mut().insert("X-Request-Id", header_value);
    }

    response
}

/// Serves the API on `addr` until a shutdown signal arrives.
///
/// # Errors
///
/// Returns `std::io::Error` if the address cannot be bound or the server
/// fails while running.
pub async fn start_server(
    state: AppState,
    addr: SocketAddr,
    request_timeout: Duration,
) -> Result<(), std::io::Error> {
    let app = create_router(state, request_timeout);

    info!(%addr, "starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    info!(addr = %actual_addr, "HTTP server listening");

    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;

    info!("HTTP server stopped gracefully");
    Ok(())
}

/// Waits for CTRL+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("received CTRL+C, starting graceful shutdown");
        },
        () = terminate => {
            info!("received SIGTERM, starting graceful shutdown");
        },
    }

    warn!("waiting for in-flight requests to complete");
}

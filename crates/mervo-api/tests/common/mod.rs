//! Shared helpers for driving the router in-process.

#![allow(dead_code)]

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use axum::{
    body::{to_bytes, Body},
    http::{Request, Response},
    Router,
};
use mervo_api::{create_router, AppState, Config};
use mervo_core::{Clock, TestClock};
use mervo_delivery::{DeliveryClient, Dispatcher, InMemoryDeliveryQueue, RetryPolicy};
use serde_json::Value;

pub const INBOUND_SECRET: &str = "inbound-shared-secret";

/// Router plus handles to the pieces behind it.
pub struct TestApp {
    pub state: AppState,
    pub queue: Arc<InMemoryDeliveryQueue>,
    pub clock: TestClock,
}

impl TestApp {
    pub fn new() -> Self {
        let clock = TestClock::new();
        let shared: Arc<dyn Clock> = Arc::new(clock.clone());
        let queue = Arc::new(InMemoryDeliveryQueue::new(shared.clone()));
        let client = DeliveryClient::with_defaults().expect("client builds");
        let policy = RetryPolicy::default();
        let dispatcher = Arc::new(Dispatcher::new(queue.clone(), client, policy, shared.clone()));

        let state = AppState::new(dispatcher, shared).with_webhook_secret(INBOUND_SECRET);
        Self { state, queue, clock }
    }

    /// Applies `config` on top of the default test state.
    pub async fn configured(config: &Config) -> Result<Self> {
        let mut app = Self::new();
        app.state = app.state.configured(config).await?;
        Ok(app)
    }

    pub fn router(&self) -> Router {
        self.router_with_timeout(Duration::from_secs(30))
    }

    pub fn router_with_timeout(&self, request_timeout: Duration) -> Router {
        create_router(self.state.clone(), request_timeout)
    }
}

pub fn json_request(method: &str, uri: &str, body: &Value) -> Result<Request<Body>> {
    Ok(Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(body)?))?)
}

pub fn empty_request(method: &str, uri: &str) -> Result<Request<Body>> {
    Ok(Request::builder().method(method).uri(uri).body(Body::empty())?)
}

pub async fn body_bytes(response: Response<Body>) -> Result<Vec<u8>> {
    Ok(to_bytes(response.into_body(), usize::MAX).await?.to_vec())
}

pub async fn body_json(response: Response<Body>) -> Result<Value> {
    Ok(serde_json::from_slice(&body_bytes(response).await?)?)
}

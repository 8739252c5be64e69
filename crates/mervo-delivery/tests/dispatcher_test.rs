//! Dispatcher integration tests against a mock HTTP endpoint.
//!
//! Time is driven by `TestClock`, so the full five-attempt retry schedule
//! runs without waiting for real backoff windows.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use std::{sync::Arc, time::Duration};

use mervo_core::{crypto, Clock, DeliveryStatus, NewDelivery, TestClock};
use mervo_delivery::{
    queue::{DeliveryQueue, InMemoryDeliveryQueue},
    DeliveryClient, DeliveryError, DispatchOutcome, Dispatcher, RetryPolicy,
};
use serde_json::json;
use wiremock::{matchers, Match, Mock, MockServer, Request, ResponseTemplate};

struct Harness {
    clock: TestClock,
    queue: Arc<InMemoryDeliveryQueue>,
    dispatcher: Dispatcher,
}

impl Harness {
    fn new() -> Self {
        let clock = TestClock::new();
        let shared: Arc<dyn Clock> = Arc::new(clock.clone());
        let queue = Arc::new(InMemoryDeliveryQueue::new(shared.clone()));
        let dispatcher = Dispatcher::new(
            queue.clone(),
            DeliveryClient::with_defaults().unwrap(),
            RetryPolicy::default(),
            shared,
        );
        Self { clock, queue, dispatcher }
    }

    /// Dispatches until the delivery reaches a terminal outcome, advancing
    /// the clock past each backoff.
    async fn run_to_completion(&self) -> Vec<DispatchOutcome> {
        let mut outcomes = Vec::new();
        loop {
            let outcome = self
                .dispatcher
                .process_next()
                .await
                .unwrap()
                .expect("a delivery should be due");
            let done = !matches!(outcome, DispatchOutcome::Retrying { .. });
            outcomes.push(outcome);
            if done {
                return outcomes;
            }
            assert!(self.dispatcher.process_next().await.unwrap().is_none(), "not due yet");
            self.clock.advance(Duration::from_secs(60));
        }
    }
}

struct ValidSignature(&'static str);

impl Match for ValidSignature {
    fn matches(&self, request: &Request) -> bool {
        request
            .headers
            .get("x-signature")
            .and_then(|value| value.to_str().ok())
            .is_some_and(|signature| crypto::verify(&request.body, self.0, signature))
    }
}

#[tokio::test]
async fn first_call_success_is_delivered_with_no_failures() {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .and(matchers::path("/hooks"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .expect(1)
        .mount(&server)
        .await;

    let harness = Harness::new();
    let url = format!("{}/hooks", server.uri());
    let new = NewDelivery::new(url, json!({"event": "job.created"}));
    let delivery = harness.queue.enqueue(new).await.unwrap();

    let outcomes = harness.run_to_completion().await;
    assert_eq!(outcomes.len(), 1);
    assert!(matches!(outcomes[0], DispatchOutcome::Delivered { status_code: 200, .. }));

    let stored = harness.queue.find(delivery.id).await.unwrap().unwrap();
    assert_eq!(stored.status, DeliveryStatus::Delivered);
    assert_eq!(stored.attempt_count, 0);
    assert!(stored.delivered_at.is_some());
    assert!(stored.diagnostic.is_none());

    // never dispatched again
    harness.clock.advance(Duration::from_secs(3600));
    assert!(harness.dispatcher.process_next().await.unwrap().is_none());
}

#[tokio::test]
async fn always_failing_endpoint_is_dead_lettered_after_five_attempts() {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(500).set_body_string("upstream exploded"))
        .expect(5)
        .mount(&server)
        .await;

    let harness = Harness::new();
    let delivery =
        harness.queue.enqueue(NewDelivery::new(server.uri(), json!({"n": 1}))).await.unwrap();

    let outcomes = harness.run_to_completion().await;
    assert_eq!(outcomes.len(), 5);

    let attempts: Vec<u32> = outcomes
        .iter()
        .filter_map(|o| match o {
            DispatchOutcome::Retrying { attempt_count, .. } => Some(*attempt_count),
            _ => None,
        })
        .collect();
    assert_eq!(attempts, vec![1, 2, 3, 4]);

    let DispatchOutcome::DeadLettered { attempt_count, diagnostic, .. } = &outcomes[4] else {
        panic!("expected dead-letter, got {:?}", outcomes[4]);
    };
    assert_eq!(*attempt_count, 5);
    assert!(diagnostic.contains("upstream exploded"));

    let stored = harness.queue.find(delivery.id).await.unwrap().unwrap();
    assert_eq!(stored.status, DeliveryStatus::DeadLetter);
    assert_eq!(stored.attempt_count, 5);
    assert_eq!(stored.diagnostic.as_deref(), Some("HTTP 500: upstream exploded"));
    assert_eq!(stored.payload, json!({"n": 1}));

    // no sixth attempt
    harness.clock.advance(Duration::from_secs(3600));
    assert!(harness.dispatcher.process_next().await.unwrap().is_none());
}

#[tokio::test]
async fn success_on_third_attempt_counts_two_failures() {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&server)
        .await;

    let harness = Harness::new();
    let delivery =
        harness.queue.enqueue(NewDelivery::new(server.uri(), json!({"n": 3}))).await.unwrap();

    let outcomes = harness.run_to_completion().await;
    assert_eq!(outcomes.len(), 3);
    assert!(matches!(outcomes[2], DispatchOutcome::Delivered { status_code: 202, .. }));

    let stored = harness.queue.find(delivery.id).await.unwrap().unwrap();
    assert_eq!(stored.status, DeliveryStatus::Delivered);
    assert_eq!(stored.attempt_count, 2);
}

#[tokio::test]
async fn retries_follow_backoff_schedule() {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let harness = Harness::new();
    harness.queue.enqueue(NewDelivery::new(server.uri(), json!({}))).await.unwrap();

    let before = harness.clock.now_utc();
    let outcome = harness.dispatcher.process_next().await.unwrap().unwrap();
    let DispatchOutcome::Retrying { attempt_count, next_attempt, .. } = outcome else {
        panic!("expected retry, got {outcome:?}");
    };

    assert_eq!(attempt_count, 1);
    assert_eq!(next_attempt - before, chrono::Duration::seconds(2));

    harness.clock.advance(Duration::from_millis(1_999));
    assert!(harness.dispatcher.process_next().await.unwrap().is_none());
    harness.clock.advance(Duration::from_millis(1));
    assert!(harness.dispatcher.process_next().await.unwrap().is_some());
}

#[tokio::test]
async fn signed_delivery_carries_verifiable_signature() {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .and(matchers::header("content-type", "application/json"))
        .and(ValidSignature("shared-secret"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let harness = Harness::new();
    harness
        .queue
        .enqueue(
            NewDelivery::new(server.uri(), json!({"event": "invoice.paid", "amount": 1200}))
                .with_secret("shared-secret"),
        )
        .await
        .unwrap();

    let outcome = harness.dispatcher.process_next().await.unwrap().unwrap();
    assert!(matches!(outcome, DispatchOutcome::Delivered { .. }));
}

#[tokio::test]
async fn unsigned_delivery_omits_signature_header() {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .and(matchers::header_exists("x-signature"))
        .respond_with(ResponseTemplate::new(401))
        .expect(0)
        .mount(&server)
        .await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let harness = Harness::new();
    harness.queue.enqueue(NewDelivery::new(server.uri(), json!({"a": 1}))).await.unwrap();

    let outcome = harness.dispatcher.process_next().await.unwrap().unwrap();
    assert!(matches!(outcome, DispatchOutcome::Delivered { .. }));
}

#[tokio::test]
async fn transport_errors_count_as_failed_attempts() {
    let harness = Harness::new();
    let delivery = harness
        .queue
        .enqueue(NewDelivery::new("http://127.0.0.1:1/unreachable", json!({"a": 1})))
        .await
        .unwrap();

    let outcomes = harness.run_to_completion().await;
    assert_eq!(outcomes.len(), 5);

    let stored = harness.queue.find(delivery.id).await.unwrap().unwrap();
    assert_eq!(stored.status, DeliveryStatus::DeadLetter);
    assert_eq!(stored.attempt_count, 5);
    assert!(stored.diagnostic.unwrap().contains("network connection failed"));
}

#[tokio::test]
async fn dispatch_refuses_delivery_not_in_flight() {
    let harness = Harness::new();
    let pending =
        harness.queue.enqueue(NewDelivery::new("https://example.com", json!({}))).await.unwrap();

    let err = harness.dispatcher.dispatch(pending).await.unwrap_err();
    assert!(matches!(err, DeliveryError::Queue { .. }));
}

#[tokio::test]
async fn queue_write_failure_is_reported() {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let harness = Harness::new();
    harness.queue.enqueue(NewDelivery::new(server.uri(), json!({}))).await.unwrap();
    let claimed = harness.queue.dequeue_ready(harness.clock.now_utc()).await.unwrap().unwrap();

    // resolve it behind the dispatcher's back so its own write is refused
    harness.queue.finalize(claimed.clone(), mervo_delivery::Resolution::Delivered).await.unwrap();

    let err = harness.dispatcher.dispatch(claimed).await.unwrap_err();
    assert!(matches!(err, DeliveryError::Queue { .. }));
}

#[tokio::test]
async fn unsignable_payload_is_dead_lettered_without_retry() {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let harness = Harness::new();
    let new = NewDelivery::new(server.uri(), json!({"a": 1})).with_secret("s3cr3t");
    harness.queue.enqueue(new).await.unwrap();
    let mut claimed =
        harness.queue.dequeue_ready(harness.clock.now_utc()).await.unwrap().unwrap();
    claimed.secret = Some(String::new());

    let outcome = harness.dispatcher.dispatch(claimed.clone()).await.unwrap();

    match outcome {
        DispatchOutcome::DeadLettered { attempt_count, diagnostic, .. } => {
            assert_eq!(attempt_count, 1);
            assert!(diagnostic.contains("cannot sign payload"), "{diagnostic}");
        },
        other => panic!("expected dead letter, got {other:?}"),
    }
    let stored = harness.queue.find(claimed.id).await.unwrap().unwrap();
    assert_eq!(stored.status, DeliveryStatus::DeadLetter);
}

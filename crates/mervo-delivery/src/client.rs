//! HTTP client for outbound webhook delivery.
//!
//! Performs exactly one POST per call with a bounded timeout. Transport
//! failures are returned as errors; any HTTP response, 2xx or not, is
//! returned as a `DeliveryResponse` for the dispatcher to classify.

use std::time::{Duration, Instant};

use bytes::Bytes;
use mervo_core::{DeliveryId, SIGNATURE_HEADER};
use reqwest::{header::CONTENT_TYPE, Response};
use serde::{Deserialize, Serialize};
use tracing::{info_span, Instrument};

use crate::error::{DeliveryError, Result};

/// Header carrying the delivery id.
pub const DELIVERY_ID_HEADER: &str = "X-Delivery-Id";

/// Header carrying the 1-based attempt number.
pub const DELIVERY_ATTEMPT_HEADER: &str = "X-Delivery-Attempt";

/// Largest response body kept from an endpoint.
pub const MAX_RESPONSE_BODY_BYTES: usize = 64 * 1024;

/// Configuration for the webhook delivery client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Per-call timeout covering connect, send and body read.
    pub timeout: Duration,
    /// User agent string for requests.
    pub user_agent: String,
    /// Maximum number of redirects to follow.
    pub max_redirects: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            user_agent: format!("Mervo-Webhook-Delivery/{}", env!("CARGO_PKG_VERSION")),
            max_redirects: 3,
        }
    }
}

/// One outbound attempt.
#[derive(Debug, Clone)]
pub struct DeliveryRequest {
    /// Delivery being attempted.
    pub delivery_id: DeliveryId,
    /// Destination URL.
    pub url: String,
    /// Serialized JSON payload; the signature covers exactly these bytes.
    pub body: Bytes,
    /// Hex HMAC of `body`, sent as `X-Signature` when present.
    pub signature: Option<String>,
    /// 1-based attempt number.
    pub attempt_number: u32,
}

/// Response to an outbound attempt.
#[derive(Debug, Clone)]
pub struct DeliveryResponse {
    /// HTTP status code.
    pub status_code: u16,
    /// Response body, at most `MAX_RESPONSE_BODY_BYTES` of it.
    pub body: String,
    /// Total duration of the request.
    pub duration: Duration,
    /// Whether the status is 2xx.
    pub is_success: bool,
}

/// Pooled HTTP client used by every worker.
#[derive(Debug, Clone)]
pub struct DeliveryClient {
    client: reqwest::Client,
    config: ClientConfig,
}

impl DeliveryClient {
    /// Creates a delivery client.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` when the timeout is zero or the
    /// HTTP client cannot be built.
    pub fn new(config: ClientConfig) -> Result<Self> {
        if config.timeout.is_zero() {
            return Err(DeliveryError::configuration("delivery timeout must be greater than zero"));
        }

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects as usize))
            .build()
            .map_err(|e| {
                DeliveryError::configuration(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self { client, config })
    }

    /// Creates a delivery client with default configuration.
    ///
    /// # Errors
    ///
    /// See [`DeliveryClient::new`].
    pub fn with_defaults() -> Result<Self> {
        Self::new(ClientConfig::default())
    }

    /// Returns the client configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Sends one webhook POST.
    ///
    /// # Errors
    ///
    /// - `Timeout` when the call exceeds the configured timeout
    /// - `NetworkError` for connection, DNS and other transport failures, or
    ///   a 2xx whose body stream fails
    ///
    /// Non-2xx responses are not errors here.
    pub async fn deliver(&self, request: DeliveryRequest) -> Result<DeliveryResponse> {
        let start_time = Instant::now();

        let span = info_span!(
            "webhook_delivery",
            delivery_id = %request.delivery_id,
            url = %request.url,
            attempt = request.attempt_number,
            signed = request.signature.is_some(),
        );

        async move {
            tracing::debug!("starting webhook delivery");

            let mut http_request = self
                .client
                .post(&request.url)
                .header(CONTENT_TYPE, "application/json")
                .header(DELIVERY_ID_HEADER, request.delivery_id.to_string())
                .header(DELIVERY_ATTEMPT_HEADER, request.attempt_number.to_string())
                .body(request.body);

            if let Some(signature) = &request.signature {
                http_request = http_request.header(SIGNATURE_HEADER, signature);
            }

            let response = match http_request.send().await {
                Ok(response) => response,
                Err(e) => {
                    let duration = start_time.elapsed();
                    tracing::warn!(
                        duration_ms = duration.as_millis(),
                        error = %e,
                        "request failed"
                    );

                    if e.is_timeout() {
                        return Err(DeliveryError::timeout(self.config.timeout));
                    }
                    if e.is_connect() {
                        return Err(DeliveryError::network(format!("connection failed: {e}")));
                    }
                    return Err(DeliveryError::network(e.to_string()));
                },
            };

            let delivery_response =
                read_response(response, start_time, self.config.timeout).await?;

            if delivery_response.is_success {
                tracing::info!(
                    status = delivery_response.status_code,
                    duration_ms = delivery_response.duration.as_millis(),
                    "webhook delivered"
                );
            } else {
                tracing::warn!(
                    status = delivery_response.status_code,
                    duration_ms = delivery_response.duration.as_millis(),
                    "endpoint returned non-success status"
                );
            }

            Ok(delivery_response)
        }
        .instrument(span)
        .await
    }
}

/// Reads at most `MAX_RESPONSE_BODY_BYTES` of the body.
///
/// A 2xx whose body cannot be read in full is a failed attempt; for other
/// statuses the read error is kept as the diagnostic body.
async fn read_response(
    mut response: Response,
    start_time: Instant,
    timeout: Duration,
) -> Result<DeliveryResponse> {
    let status_code = response.status().as_u16();
    let is_success = response.status().is_success();

    let mut buffer = Vec::new();
    let body = loop {
        match response.chunk().await {
            Ok(Some(chunk)) => {
                let remaining = MAX_RESPONSE_BODY_BYTES - buffer.len();
                buffer.extend_from_slice(&chunk[..chunk.len().min(remaining)]);
                if buffer.len() >= MAX_RESPONSE_BODY_BYTES {
                    break String::from_utf8_lossy(&buffer).into_owned();
                }
            },
            Ok(None) => break String::from_utf8_lossy(&buffer).into_owned(),
            Err(e) if is_success => {
                tracing::warn!(status = status_code, error = %e, "response body read failed");
                if e.is_timeout() {
                    return Err(DeliveryError::timeout(timeout));
                }
                return Err(DeliveryError::network(format!(
                    "HTTP {status_code} response body could not be read: {e}"
                )));
            },
            Err(e) => {
                tracing::warn!(error = %e, "failed to read response body");
                break format!("[failed to read response body: {e}]");
            },
        }
    };

    Ok(DeliveryResponse { status_code, body, duration: start_time.elapsed(), is_success })
}

#[cfg(test)]
mod tests {
    use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

    use super::*;

    fn request(url: String, signature: Option<&str>) -> DeliveryRequest {
        DeliveryRequest {
            delivery_id: DeliveryId::new(),
            url,
            body: Bytes::from_static(br#"{"event":"job.created"}"#),
            signature: signature.map(ToString::to_string),
            attempt_number: 1,
        }
    }

    #[tokio::test]
    async fn successful_delivery() {
        let mock_server = MockServer::start().await;

        Mock::given(matchers::method("POST"))
            .and(matchers::path("/webhook"))
            .and(matchers::header("content-type", "application/json"))
            .and(matchers::body_string(r#"{"event":"job.created"}"#))
            .respond_with(ResponseTemplate::new(200).set_body_string("OK"))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = DeliveryClient::with_defaults().unwrap();
        let response =
            client.deliver(request(format!("{}/webhook", mock_server.uri()), None)).await.unwrap();

        assert_eq!(response.status_code, 200);
        assert!(response.is_success);
        assert_eq!(response.body, "OK");
    }

    #[tokio::test]
    async fn non_success_status_is_returned_not_raised() {
        let mock_server = MockServer::start().await;

        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("Internal Server Error"))
            .mount(&mock_server)
            .await;

        let client = DeliveryClient::with_defaults().unwrap();
        let response = client.deliver(request(mock_server.uri(), None)).await.unwrap();

        assert_eq!(response.status_code, 500);
        assert!(!response.is_success);
        assert_eq!(response.body, "Internal Server Error");
    }

    #[tokio::test]
    async fn signature_and_metadata_headers_sent() {
        let mock_server = MockServer::start().await;

        Mock::given(matchers::method("POST"))
            .and(matchers::header("X-Signature", "abc123"))
            .and(matchers::header("X-Delivery-Attempt", "1"))
            .and(matchers::header_exists("X-Delivery-Id"))
            .and(matchers::header_exists("user-agent"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = DeliveryClient::with_defaults().unwrap();
        let response = client.deliver(request(mock_server.uri(), Some("abc123"))).await.unwrap();

        assert!(response.is_success);
    }

    #[tokio::test]
    async fn unsigned_request_has_no_signature_header() {
        let mock_server = MockServer::start().await;

        Mock::given(matchers::method("POST"))
            .and(matchers::header_exists("X-Signature"))
            .respond_with(ResponseTemplate::new(400))
            .mount(&mock_server)
            .await;
        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&mock_server)
            .await;

        let client = DeliveryClient::with_defaults().unwrap();
        let response = client.deliver(request(mock_server.uri(), None)).await.unwrap();

        assert_eq!(response.status_code, 200);
    }

    #[tokio::test]
    async fn large_body_is_capped() {
        let mock_server = MockServer::start().await;

        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(502).set_body_string("e".repeat(200 * 1024)))
            .mount(&mock_server)
            .await;

        let client = DeliveryClient::with_defaults().unwrap();
        let response = client.deliver(request(mock_server.uri(), None)).await.unwrap();

        assert_eq!(response.body.len(), MAX_RESPONSE_BODY_BYTES);
    }

    #[tokio::test]
    async fn timeout_is_reported() {
        let mock_server = MockServer::start().await;

        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&mock_server)
            .await;

        let client = DeliveryClient::new(ClientConfig {
            timeout: Duration::from_millis(50),
            ..ClientConfig::default()
        })
        .unwrap();
        let err = client.deliver(request(mock_server.uri(), None)).await.unwrap_err();

        assert!(matches!(err, DeliveryError::Timeout { timeout_ms: 50 }), "{err:?}");
    }

    #[tokio::test]
    async fn connection_refused_is_network_error() {
        let client = DeliveryClient::with_defaults().unwrap();
        let err =
            client.deliver(request("http://127.0.0.1:1/".to_string(), None)).await.unwrap_err();

        assert!(matches!(err, DeliveryError::NetworkError { .. }), "{err:?}");
    }

    /// Serves one connection: a 200 promising 100 body bytes, 10 of them,
    /// then either holds the socket open or closes it.
    async fn truncated_body_server(hold_open: bool) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = vec![0u8; 4096];
            let _ = socket.read(&mut request).await;
            let head = "HTTP/1.1 200 OK\r\ncontent-length: 100\r\n\r\n0123456789";
            socket.write_all(head.as_bytes()).await.unwrap();
            socket.flush().await.unwrap();
            if hold_open {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        });
        format!("http://{addr}/")
    }

    #[tokio::test]
    async fn stalled_success_body_is_timeout() {
        let url = truncated_body_server(true).await;
        let client = DeliveryClient::new(ClientConfig {
            timeout: Duration::from_millis(200),
            ..ClientConfig::default()
        })
        .unwrap();

        let err = client.deliver(request(url, None)).await.unwrap_err();

        assert!(matches!(err, DeliveryError::Timeout { timeout_ms: 200 }), "{err:?}");
    }

    #[tokio::test]
    async fn truncated_success_body_is_network_error() {
        let url = truncated_body_server(false).await;
        let client = DeliveryClient::with_defaults().unwrap();

        let err = client.deliver(request(url, None)).await.unwrap_err();

        assert!(matches!(err, DeliveryError::NetworkError { .. }), "{err:?}");
        assert!(err.is_retryable());
    }

    #[test]
    fn zero_timeout_rejected() {
        let config = ClientConfig { timeout: Duration::ZERO, ..ClientConfig::default() };
        assert!(matches!(DeliveryClient::new(config), Err(DeliveryError::Configuration { .. })));
    }
}

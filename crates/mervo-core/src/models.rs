//! Delivery records and their lifecycle.
//!
//! A `Delivery` is one event payload bound for one destination URL, tracked
//! from enqueue through retries to a terminal outcome. The status machine is
//!
//! ```text
//! pending -> in-flight -> delivered
//!    |           |-----> pending      (retry with a later next_attempt)
//!    |           '-----> dead-letter  (attempt budget exhausted)
//!    '-> cancelled
//! ```
//!
//! `delivered`, `dead-letter` and `cancelled` are terminal.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoreError, MervoError};

type PgDb = sqlx::Postgres;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult =
    Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>;
type BoxDynError = sqlx::error::BoxDynError;

/// Largest serialized payload accepted at enqueue time.
pub const MAX_PAYLOAD_BYTES: usize = 1024 * 1024;

/// Strongly-typed delivery identifier.
///
/// Assigned at enqueue and immutable for the lifetime of the record.
///
/// # Example
///
/// ```
/// use mervo_core::models::DeliveryId;
/// let id = DeliveryId::new();
/// println!("dispatching delivery {id}");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeliveryId(pub Uuid);

impl DeliveryId {
    /// Creates a new random delivery ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DeliveryId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DeliveryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for DeliveryId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl sqlx::Type<PgDb> for DeliveryId {
    fn type_info() -> PgTypeInfo {
        <Uuid as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for DeliveryId {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(uuid))
    }
}

impl sqlx::Encode<'_, PgDb> for DeliveryId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Delivery lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeliveryStatus {
    /// Waiting for `next_attempt` to pass.
    Pending,

    /// Held by exactly one worker for a single outbound attempt.
    InFlight,

    /// Endpoint answered 2xx. Terminal.
    Delivered,

    /// Attempt budget exhausted. Terminal, carries a diagnostic.
    DeadLetter,

    /// Withdrawn by an operator while pending. Terminal.
    Cancelled,
}

impl DeliveryStatus {
    /// Returns the wire and storage representation.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InFlight => "in-flight",
            Self::Delivered => "delivered",
            Self::DeadLetter => "dead-letter",
            Self::Cancelled => "cancelled",
        }
    }

    /// Returns true when no transition leaves this status.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Delivered | Self::DeadLetter | Self::Cancelled)
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in-flight" => Ok(Self::InFlight),
            "delivered" => Ok(Self::Delivered),
            "dead-letter" => Ok(Self::DeadLetter),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(CoreError::InvalidInput(format!("invalid delivery status: {s}"))),
        }
    }
}

impl sqlx::Type<PgDb> for DeliveryStatus {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for DeliveryStatus {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(s.parse::<Self>()?)
    }
}

impl sqlx::Encode<'_, PgDb> for DeliveryStatus {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <&str as sqlx::Encode<PgDb>>::encode_by_ref(&self.as_str(), buf)
    }
}

/// A delivery as submitted by a producer, before it enters the queue.
#[derive(Clone, Deserialize)]
pub struct NewDelivery {
    /// Destination endpoint.
    pub url: String,

    /// Event body, serialized to JSON on every attempt.
    pub payload: serde_json::Value,

    /// Shared signing key. `None` opts out of signing.
    #[serde(default)]
    pub secret: Option<String>,

    /// Event type, checked against the connector manifest when present.
    #[serde(default)]
    pub event_type: Option<String>,

    /// Connector that produced the event.
    #[serde(default)]
    pub connector_id: Option<String>,
}

impl NewDelivery {
    /// Creates an unsigned delivery of `payload` to `url`.
    pub fn new(url: impl Into<String>, payload: serde_json::Value) -> Self {
        Self { url: url.into(), payload, secret: None, event_type: None, connector_id: None }
    }

    /// Signs every attempt with `secret`.
    #[must_use]
    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    /// Tags the delivery with an event type.
    #[must_use]
    pub fn with_event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    /// Attributes the delivery to a registered connector.
    #[must_use]
    pub fn with_connector(mut self, connector_id: impl Into<String>) -> Self {
        self.connector_id = Some(connector_id.into());
        self
    }

    /// Checks the delivery can enter the queue.
    ///
    /// # Errors
    ///
    /// Returns `MervoError::MalformedDelivery` for a missing or non-HTTP url,
    /// a null payload, or an empty secret, and `MervoError::PayloadTooLarge`
    /// when the serialized payload exceeds `MAX_PAYLOAD_BYTES`.
    pub fn validate(&self) -> Result<(), MervoError> {
        let url = self.url.trim();
        if url.is_empty() {
            return Err(MervoError::malformed("url is required"));
        }

        let has_host = url
            .strip_prefix("https://")
            .or_else(|| url.strip_prefix("http://"))
            .is_some_and(|rest| !rest.is_empty() && !rest.starts_with('/'));
        if !has_host {
            return Err(MervoError::malformed("url must be an absolute http(s) url"));
        }

        if self.payload.is_null() {
            return Err(MervoError::malformed("payload is required"));
        }

        if self.secret.as_deref().is_some_and(str::is_empty) {
            return Err(MervoError::malformed("secret must not be empty; omit it to send unsigned"));
        }

        if self.event_type.as_deref().is_some_and(|t| t.trim().is_empty()) {
            return Err(MervoError::malformed("event_type must not be empty"));
        }

        let size_bytes = serde_json::to_vec(&self.payload)
            .map_err(|e| MervoError::malformed(format!("payload is not serializable: {e}")))?
            .len();
        if size_bytes > MAX_PAYLOAD_BYTES {
            return Err(MervoError::PayloadTooLarge { size_bytes, limit_bytes: MAX_PAYLOAD_BYTES });
        }

        Ok(())
    }
}

impl fmt::Debug for NewDelivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NewDelivery")
            .field("url", &self.url)
            .field("secret", &self.secret.as_ref().map(|_| "[REDACTED]"))
            .field("event_type", &self.event_type)
            .field("connector_id", &self.connector_id)
            .finish_non_exhaustive()
    }
}

/// A queued delivery and its retry state.
///
/// `url`, `payload` and `secret` never change after enqueue. The dead-letter
/// diagnostic lives in its own field and is written exactly once.
#[derive(Clone, Serialize)]
pub struct Delivery {
    /// Unique identifier.
    pub id: DeliveryId,

    /// Destination endpoint.
    pub url: String,

    /// Event body.
    pub payload: serde_json::Value,

    /// Signing key; never serialized or printed.
    #[serde(skip_serializing)]
    pub secret: Option<String>,

    /// Failed attempts so far. Never decreases.
    pub attempt_count: u32,

    /// Current lifecycle status.
    pub status: DeliveryStatus,

    /// Earliest time the delivery may be dequeued while pending.
    pub next_attempt: DateTime<Utc>,

    /// Last response body or error, attached on dead-letter.
    pub diagnostic: Option<String>,

    /// Producer supplied event type.
    pub event_type: Option<String>,

    /// Producer supplied connector id.
    pub connector_id: Option<String>,

    /// When the delivery was enqueued.
    pub created_at: DateTime<Utc>,

    /// When the record last changed.
    pub updated_at: DateTime<Utc>,

    /// When the latest outbound attempt finished.
    pub last_attempt_at: Option<DateTime<Utc>>,

    /// When the endpoint acknowledged the delivery.
    pub delivered_at: Option<DateTime<Utc>>,
}

impl Delivery {
    /// Builds a pending delivery due at `now`.
    pub fn from_new(new: NewDelivery, now: DateTime<Utc>) -> Self {
        Self {
            id: DeliveryId::new(),
            url: new.url.trim().to_string(),
            payload: new.payload,
            secret: new.secret,
            attempt_count: 0,
            status: DeliveryStatus::Pending,
            next_attempt: now,
            diagnostic: None,
            event_type: new.event_type,
            connector_id: new.connector_id,
            created_at: now,
            updated_at: now,
            last_attempt_at: None,
            delivered_at: None,
        }
    }

    /// Returns true when the delivery is pending and its due time has passed.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == DeliveryStatus::Pending && self.next_attempt <= now
    }

    /// Returns true when attempts carry an `X-Signature` header.
    pub fn has_secret(&self) -> bool {
        self.secret.is_some()
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("id", &self.id)
            .field("url", &self.url)
            .field("secret", &self.secret.as_ref().map(|_| "[REDACTED]"))
            .field("attempt_count", &self.attempt_count)
            .field("status", &self.status)
            .field("next_attempt", &self.next_attempt)
            .field("diagnostic", &self.diagnostic)
            .field("event_type", &self.event_type)
            .field("connector_id", &self.connector_id)
            .finish_non_exhaustive()
    }
}

//! Core domain models for outbound webhook delivery.
//!
//! Provides the `Delivery` record and its lifecycle, the HMAC signer and
//! verifier shared by the outbound and inbound paths, connector manifests
//! that gate what producers may enqueue, and the error taxonomy every other
//! crate reports through.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod connectors;
pub mod crypto;
pub mod error;
pub mod models;
pub mod time;

pub use connectors::{ConnectorManifest, ConnectorRegistry, WILDCARD_EVENT};
pub use crypto::{sign, verify, SignatureError, SIGNATURE_HEADER};
pub use error::{CoreError, MervoError, Result};
pub use models::{Delivery, DeliveryId, DeliveryStatus, NewDelivery, MAX_PAYLOAD_BYTES};
pub use time::{Clock, RealClock, TestClock};

//! HMAC-SHA256 signing and verification of webhook bodies.
//!
//! Outbound deliveries carry `X-Signature: <hex>` computed over the exact
//! bytes sent. Inbound requests are checked the same way; a `sha256=` prefix
//! on the supplied value is accepted. Comparison is constant time.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the hex signature of the request body.
pub const SIGNATURE_HEADER: &str = "X-Signature";

/// Signing errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignatureError {
    /// Signing was requested with an empty key.
    ///
    /// Callers that do not want a signature pass no secret at all.
    #[error("signing secret is empty")]
    EmptySecret,

    /// The key was rejected by the MAC implementation.
    #[error("invalid signing secret")]
    InvalidSecret,
}

/// Computes the lowercase hex HMAC-SHA256 of `body` keyed by `secret`.
///
/// Deterministic: the same body and secret always produce the same value.
///
/// # Errors
///
/// Returns `SignatureError::EmptySecret` when `secret` is empty.
///
/// # Example
///
/// ```
/// use mervo_core::crypto::{sign, verify};
///
/// let body = br#"{"event":"job.created"}"#;
/// let signature = sign(body, "shared-secret").unwrap();
/// assert!(verify(body, "shared-secret", &signature));
/// ```
pub fn sign(body: &[u8], secret: &str) -> Result<String, SignatureError> {
    if secret.is_empty() {
        return Err(SignatureError::EmptySecret);
    }

    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| SignatureError::InvalidSecret)?;
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Checks `signature` against the HMAC of `body` under `secret`.
///
/// Fails closed: an empty secret, an empty or non-hex signature, and a
/// mismatch all return `false`. Never panics.
pub fn verify(body: &[u8], secret: &str, signature: &str) -> bool {
    if secret.is_empty() {
        return false;
    }

    let Some(expected) = decode_signature(signature) else {
        return false;
    };

    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);

    // verify_slice compares in constant time
    mac.verify_slice(&expected).is_ok()
}

fn decode_signature(signature: &str) -> Option<Vec<u8>> {
    let trimmed = signature.trim();
    let hex_part = trimmed.strip_prefix("sha256=").unwrap_or(trimmed);
    if hex_part.is_empty() {
        return None;
    }
    hex::decode(hex_part).ok()
}

#![no_main]

//! Fuzz target for HMAC signature verification.
//!
//! Splits the input into a secret, a signature header value and a body, and
//! checks that verification never panics and never accepts a signature it
//! did not produce for that exact body.

use libfuzzer_sys::fuzz_target;
use mervo_core::{sign, verify};

fuzz_target!(|data: &[u8]| {
    if data.len() < 2 {
        return;
    }

    let secret_len = usize::from(data[0]) % data.len();
    let signature_len = usize::from(data[1]) % data.len();
    let rest = &data[2..];
    let (secret, rest) = rest.split_at(secret_len.min(rest.len()));
    let (signature, body) = rest.split_at(signature_len.min(rest.len()));

    let secret = String::from_utf8_lossy(secret);
    let signature = String::from_utf8_lossy(signature);

    // arbitrary header values must not panic
    let accepted = verify(body, &secret, &signature);

    let Ok(genuine) = sign(body, &secret) else {
        assert!(!accepted, "accepted a signature under an unusable secret");
        return;
    };
    if accepted {
        let normalized = signature.trim().trim_start_matches("sha256=").to_ascii_lowercase();
        assert_eq!(normalized, genuine, "accepted a signature for another body");
    }

    assert!(verify(body, &secret, &genuine));
    assert!(verify(body, &secret, &format!("sha256={genuine}")));
});

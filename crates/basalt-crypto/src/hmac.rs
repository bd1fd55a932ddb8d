//! HMAC-SHA256 signing and constant-time verification.
//!
//! Used by `basalt-srpc`'s server-side handshake to recompute the client's
//! signature over `${authv}\n${appv}\n${ts}\n${id}\n${cid}\n` and compare it
//! without leaking timing information about where the mismatch occurred.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HmacError {
    #[error("HMAC key must be non-empty")]
    InvalidKeyLength,
}

/// Computes the lowercase-hex HMAC-SHA256 of `message` under `secret`.
pub fn sign(secret: &str, message: &str) -> Result<String, HmacError> {
    if secret.is_empty() {
        return Err(HmacError::InvalidKeyLength);
    }
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| HmacError::InvalidKeyLength)?;
    mac.update(message.as_bytes());
    Ok(hex_encode(&mac.finalize().into_bytes()))
}

/// Recomputes the HMAC over `message` and compares it to `signature_hex` in
/// constant time. Returns `false` (never errors) on any mismatch, including
/// a malformed key or a signature of the wrong length.
#[must_use]
pub fn verify(secret: &str, message: &str, signature_hex: &str) -> bool {
    let Ok(expected) = sign(secret, message) else {
        return false;
    };
    if expected.len() != signature_hex.len() {
        return false;
    }
    bool::from(expected.as_bytes().ct_eq(signature_hex.as_bytes()))
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        write!(out, "{byte:02x}").expect("writing to String never fails");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_is_deterministic() {
        let a = sign("secret", "hello").unwrap();
        let b = sign("secret", "hello").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn verify_accepts_matching_signature() {
        let sig = sign("secret", "1\n2\n3\nid\ncid\n").unwrap();
        assert!(verify("secret", "1\n2\n3\nid\ncid\n", &sig));
    }

    #[test]
    fn verify_rejects_tampered_message() {
        let sig = sign("secret", "original").unwrap();
        assert!(!verify("secret", "tampered", &sig));
    }

    #[test]
    fn verify_rejects_wrong_secret() {
        let sig = sign("secret-a", "message").unwrap();
        assert!(!verify("secret-b", "message", &sig));
    }

    #[test]
    fn verify_rejects_truncated_signature() {
        let sig = sign("secret", "message").unwrap();
        assert!(!verify("secret", "message", &sig[..sig.len() - 2]));
    }

    #[test]
    fn empty_key_is_rejected() {
        assert_eq!(sign("", "message"), Err(HmacError::InvalidKeyLength));
    }
}

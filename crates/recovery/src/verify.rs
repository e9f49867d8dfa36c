//! Inbound webhook signature verification
//!
//! Validates provider authenticity before any payload is trusted: parses the
//! `t=<ts>,v1=<sig>[,v1=<sig>...]` signature header, rejects stale timestamps
//! (replay mitigation), recomputes the HMAC over `"{timestamp}.{body}"` and
//! compares each candidate in constant time. Multiple `v1` candidates allow
//! secret rotation. Side-effect free, no I/O.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Maximum accepted clock skew between the signature timestamp and now.
pub const TIMESTAMP_TOLERANCE_SECS: i64 = 300;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerificationError {
    #[error("signature header has no timestamp")]
    MissingTimestamp,
    #[error("signature header has no signature candidate")]
    MissingSignature,
    #[error("timestamp outside tolerance window ({skew_secs}s skew)")]
    StaleTimestamp { skew_secs: i64 },
    #[error("no signature candidate matched")]
    SignatureMismatch,
    #[error("shared secret rejected by HMAC")]
    InvalidSecret,
}

/// Verify `signature_header` against `raw_body` using `secret`.
///
/// `now_unix` is injected so verification stays a pure function.
pub fn verify_signature(
    raw_body: &str,
    signature_header: &str,
    secret: &str,
    now_unix: i64,
) -> Result<(), VerificationError> {
    let mut timestamp: Option<i64> = None;
    let mut candidates: Vec<Vec<u8>> = Vec::new();

    for part in signature_header.split(',') {
        let mut kv = part.trim().splitn(2, '=');
        match (kv.next(), kv.next()) {
            (Some("t"), Some(v)) => timestamp = v.parse().ok(),
            (Some("v1"), Some(v)) => {
                if let Ok(bytes) = hex::decode(v) {
                    candidates.push(bytes);
                }
            }
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or(VerificationError::MissingTimestamp)?;
    if candidates.is_empty() {
        return Err(VerificationError::MissingSignature);
    }

    let skew = (now_unix - timestamp).abs();
    if skew > TIMESTAMP_TOLERANCE_SECS {
        return Err(VerificationError::StaleTimestamp { skew_secs: skew });
    }

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| VerificationError::InvalidSecret)?;
    mac.update(format!("{timestamp}.{raw_body}").as_bytes());
    let expected = mac.finalize().into_bytes();

    let matched = candidates
        .iter()
        .any(|candidate| expected.ct_eq(candidate.as_slice()).into());

    if matched {
        Ok(())
    } else {
        Err(VerificationError::SignatureMismatch)
    }
}

/// Build a signature header for `raw_body`. Used by tests and local tooling
/// to produce payloads the verifier accepts.
pub fn sign(raw_body: &str, secret: &str, timestamp: i64) -> Result<String, VerificationError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| VerificationError::InvalidSecret)?;
    mac.update(format!("{timestamp}.{raw_body}").as_bytes());
    let sig = hex::encode(mac.finalize().into_bytes());
    Ok(format!("t={timestamp},v1={sig}"))
}

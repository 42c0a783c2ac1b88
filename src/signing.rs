//! HMAC signing of notifications handed to webhook channels.
//!
//! The signature covers `timestamp || payload` so receivers can reject
//! replays with [`is_timestamp_fresh`].

use std::time::{SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Relay-Signature";
pub const TIMESTAMP_HEADER: &str = "X-Relay-Timestamp";

/// Header pairs to attach to an outbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureHeaders {
    pub signature: (String, String),
    pub timestamp: (String, String),
}

pub fn build_signature_headers(secret: &[u8], payload: &[u8]) -> SignatureHeaders {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
        .to_string();
    let signature = compute_signature(secret, payload, Some(&timestamp));

    SignatureHeaders {
        signature: (SIGNATURE_HEADER.to_string(), signature),
        timestamp: (TIMESTAMP_HEADER.to_string(), timestamp),
    }
}

fn keyed_mac(secret: &[u8], payload: &[u8], timestamp: Option<&str>) -> Option<HmacSha256> {
    let mut mac = HmacSha256::new_from_slice(secret).ok()?;
    if let Some(ts) = timestamp {
        mac.update(ts.as_bytes());
    }
    mac.update(payload);
    Some(mac)
}

/// Hex encoded HMAC-SHA256 of the payload, optionally bound to a timestamp.
pub fn compute_signature(secret: &[u8], payload: &[u8], timestamp: Option<&str>) -> String {
    keyed_mac(secret, payload, timestamp)
        .map(|mac| hex::encode(mac.finalize().into_bytes()))
        .unwrap_or_default()
}

/// Verify a received signature with optional timestamp.
pub fn verify_signature(secret: &[u8], payload: &[u8], timestamp: Option<&str>, signature_hex: &str) -> bool {
    let Ok(signature) = hex::decode(signature_hex) else {
        return false;
    };
    keyed_mac(secret, payload, timestamp).is_some_and(|mac| mac.verify_slice(&signature).is_ok())
}

pub fn is_timestamp_fresh(timestamp_secs: u64, now_secs: u64, max_age_secs: u64) -> bool {
    now_secs >= timestamp_secs && now_secs - timestamp_secs <= max_age_secs
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationError {
    MissingSignature,
    MissingTimestamp,
    InvalidTimestamp,
    StaleTimestamp,
    InvalidSignature,
}

/// Verify a notification received from a webhook channel in one call.
///
/// Header names are matched case-insensitively.
pub fn verify_notification_request<'a, I>(
    headers: I,
    payload: &[u8],
    secret: &[u8],
    max_age_secs: u64,
    now_secs: u64,
) -> Result<(), VerificationError>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut signature = None;
    let mut timestamp = None;
    for (name, value) in headers {
        if name.eq_ignore_ascii_case(SIGNATURE_HEADER) {
            signature = Some(value);
        } else if name.eq_ignore_ascii_case(TIMESTAMP_HEADER) {
            timestamp = Some(value);
        }
    }

    let signature = signature.ok_or(VerificationError::MissingSignature)?;
    let timestamp_str = timestamp.ok_or(VerificationError::MissingTimestamp)?;
    let timestamp = timestamp_str
        .parse::<u64>()
        .map_err(|_| VerificationError::InvalidTimestamp)?;

    if !is_timestamp_fresh(timestamp, now_secs, max_age_secs) {
        return Err(VerificationError::StaleTimestamp);
    }

    if verify_signature(secret, payload, Some(timestamp_str), signature) {
        Ok(())
    } else {
        Err(VerificationError::InvalidSignature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signed_request_verifies() {
        let payload = br#"{"destination":"+15550100"}"#;
        let signature = compute_signature(b"secret", payload, Some("1700000000"));
        let headers = [("x-relay-signature", signature.as_str()), ("X-Relay-Timestamp", "1700000000")];

        assert_eq!(
            verify_notification_request(headers, payload, b"secret", 300, 1_700_000_100),
            Ok(())
        );
        assert_eq!(
            verify_notification_request(headers, payload, b"other", 300, 1_700_000_100),
            Err(VerificationError::InvalidSignature)
        );
        assert_eq!(
            verify_notification_request(headers, payload, b"secret", 60, 1_700_000_100),
            Err(VerificationError::StaleTimestamp)
        );
    }

    #[test]
    fn missing_headers_are_reported() {
        assert_eq!(
            verify_notification_request(std::iter::empty(), b"{}", b"secret", 300, 0),
            Err(VerificationError::MissingSignature)
        );
        assert_eq!(
            verify_notification_request([(SIGNATURE_HEADER, "00")], b"{}", b"secret", 300, 0),
            Err(VerificationError::MissingTimestamp)
        );
    }
}

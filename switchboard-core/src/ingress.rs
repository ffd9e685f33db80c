// src/ingress.rs
//
// Verification for Twitch webhook deliveries. The signature covers the
// concatenation message_id || timestamp || raw_body, so callers must hand in
// the body bytes exactly as received.

use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::Error;

type HmacSha256 = Hmac<Sha256>;

pub const HEADER_MESSAGE_ID: &str = "Twitch-Eventsub-Message-Id";
pub const HEADER_MESSAGE_TIMESTAMP: &str = "Twitch-Eventsub-Message-Timestamp";
pub const HEADER_MESSAGE_SIGNATURE: &str = "Twitch-Eventsub-Message-Signature";
pub const HEADER_MESSAGE_TYPE: &str = "Twitch-Eventsub-Message-Type";

const SIGNATURE_PREFIX: &str = "sha256=";
const TIMESTAMP_TOLERANCE_MINUTES: i64 = 10;

/// The Twitch-Eventsub-* header values of one delivery.
#[derive(Debug, Clone)]
pub struct SignedDelivery<'a> {
    pub message_id: &'a str,
    pub timestamp: &'a str,
    pub signature: &'a str,
}

/// Verify signature first, then timestamp freshness (±10 min). Both reject
/// with a 403-mapped error; they are distinct so callers can log the cause.
pub fn verify_delivery(
    secret: &str,
    delivery: &SignedDelivery<'_>,
    raw_body: &[u8],
) -> Result<(), Error> {
    verify_signature(secret, delivery, raw_body)?;
    verify_freshness(delivery.timestamp, Utc::now())
}

pub fn verify_signature(
    secret: &str,
    delivery: &SignedDelivery<'_>,
    raw_body: &[u8],
) -> Result<(), Error> {
    if delivery.message_id.is_empty() || delivery.timestamp.is_empty() {
        return Err(Error::InvalidSignature);
    }
    let Some(sig_hex) = delivery.signature.strip_prefix(SIGNATURE_PREFIX) else {
        return Err(Error::InvalidSignature);
    };
    let provided = hex::decode(sig_hex).map_err(|_| Error::InvalidSignature)?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| Error::InvalidSignature)?;
    mac.update(delivery.message_id.as_bytes());
    mac.update(delivery.timestamp.as_bytes());
    mac.update(raw_body);
    // verify_slice is the constant-time comparison.
    mac.verify_slice(&provided).map_err(|_| Error::InvalidSignature)
}

fn verify_freshness(timestamp: &str, now: DateTime<Utc>) -> Result<(), Error> {
    let ts = DateTime::parse_from_rfc3339(timestamp)
        .map_err(|_| Error::StaleTimestamp)?
        .with_timezone(&Utc);
    let skew = (now - ts).abs();
    if skew > Duration::minutes(TIMESTAMP_TOLERANCE_MINUTES) {
        return Err(Error::StaleTimestamp);
    }
    Ok(())
}

/// Build the signature value Twitch would send for this payload. Also used
/// to sign outgoing webhook deliveries to downstream services.
pub fn signature_for(secret: &str, parts: &[&[u8]]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("hmac accepts any key length");
    for part in parts {
        mac.update(part);
    }
    format!("{SIGNATURE_PREFIX}{}", hex::encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "0123456789abcdef";

    fn signed(message_id: &str, timestamp: &str, body: &[u8]) -> String {
        signature_for(
            SECRET,
            &[message_id.as_bytes(), timestamp.as_bytes(), body],
        )
    }

    #[test]
    fn valid_signature_verifies() {
        let ts = Utc::now().to_rfc3339();
        let body = br#"{"challenge":"abc"}"#;
        let sig = signed("m1", &ts, body);
        let delivery = SignedDelivery {
            message_id: "m1",
            timestamp: &ts,
            signature: &sig,
        };
        assert!(verify_delivery(SECRET, &delivery, body).is_ok());
    }

    #[test]
    fn flipped_body_bit_is_rejected() {
        let ts = Utc::now().to_rfc3339();
        let body = b"{\"n\":1}".to_vec();
        let sig = signed("m1", &ts, &body);
        let mut tampered = body.clone();
        tampered[3] ^= 0x01;
        let delivery = SignedDelivery {
            message_id: "m1",
            timestamp: &ts,
            signature: &sig,
        };
        assert!(matches!(
            verify_delivery(SECRET, &delivery, &tampered),
            Err(Error::InvalidSignature)
        ));
    }

    #[test]
    fn flipped_message_id_is_rejected() {
        let ts = Utc::now().to_rfc3339();
        let body = b"{}";
        let sig = signed("m1", &ts, body);
        let delivery = SignedDelivery {
            message_id: "m2",
            timestamp: &ts,
            signature: &sig,
        };
        assert!(verify_delivery(SECRET, &delivery, body).is_err());
    }

    #[test]
    fn tampered_timestamp_breaks_signature() {
        let ts = Utc::now().to_rfc3339();
        let other = (Utc::now() + Duration::seconds(1)).to_rfc3339();
        let body = b"{}";
        let sig = signed("m1", &ts, body);
        let delivery = SignedDelivery {
            message_id: "m1",
            timestamp: &other,
            signature: &sig,
        };
        assert!(verify_delivery(SECRET, &delivery, body).is_err());
    }

    #[test]
    fn stale_timestamp_is_rejected_even_with_valid_signature() {
        let old = (Utc::now() - Duration::minutes(11)).to_rfc3339();
        let body = b"{}";
        let sig = signed("m1", &old, body);
        let delivery = SignedDelivery {
            message_id: "m1",
            timestamp: &old,
            signature: &sig,
        };
        assert!(matches!(
            verify_delivery(SECRET, &delivery, body),
            Err(Error::StaleTimestamp)
        ));
    }

    #[test]
    fn future_timestamp_within_tolerance_is_accepted() {
        let ts = (Utc::now() + Duration::minutes(5)).to_rfc3339();
        let body = b"{}";
        let sig = signed("m1", &ts, body);
        let delivery = SignedDelivery {
            message_id: "m1",
            timestamp: &ts,
            signature: &sig,
        };
        assert!(verify_delivery(SECRET, &delivery, body).is_ok());
    }

    #[test]
    fn missing_prefix_is_rejected() {
        let ts = Utc::now().to_rfc3339();
        let delivery = SignedDelivery {
            message_id: "m1",
            timestamp: &ts,
            signature: "deadbeef",
        };
        assert!(verify_delivery(SECRET, &delivery, b"{}").is_err());
    }
}

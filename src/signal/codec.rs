use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::envelope::{Direction, Envelope, SignalPayload};

/// Deterministic JSON for any serializable value: object keys are sorted at
/// every depth, so semantically equal payloads yield identical bytes.
pub fn canonical_json<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let mut json = serde_json::to_value(value)?;
    sort_value(&mut json);
    serde_json::to_string(&json)
}

fn sort_value(value: &mut Value) {
    match value {
        Value::Object(map) => {
            let mut sorted = BTreeMap::new();
            for (k, mut v) in std::mem::take(map) {
                sort_value(&mut v);
                sorted.insert(k, v);
            }
            let mut out = Map::new();
            for (k, v) in sorted {
                out.insert(k, v);
            }
            *map = out;
        }
        Value::Array(items) => {
            for item in items {
                sort_value(item);
            }
        }
        _ => {}
    }
}

/// Hex-encoded SHA-256 of the canonical payload.
pub fn digest(payload: &SignalPayload) -> Result<String, serde_json::Error> {
    let canonical = canonical_json(payload)?;
    Ok(format!("{:x}", Sha256::digest(canonical.as_bytes())))
}

pub fn encode(
    payload: SignalPayload,
    direction: Direction,
    source: Option<&str>,
) -> Result<Envelope, serde_json::Error> {
    encode_at(payload, direction, source, Utc::now())
}

pub fn encode_at(
    payload: SignalPayload,
    direction: Direction,
    source: Option<&str>,
    timestamp: DateTime<Utc>,
) -> Result<Envelope, serde_json::Error> {
    let digest = digest(&payload)?;
    Ok(Envelope {
        nonce: Uuid::new_v4().to_string(),
        direction,
        timestamp,
        source: source.map(str::to_string),
        payload,
        digest,
    })
}

/// Recompute the digest and compare. `false` means the payload was altered.
pub fn verify(envelope: &Envelope) -> bool {
    match digest(&envelope.payload) {
        Ok(computed) => computed == envelope.digest,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn data(body: Value) -> SignalPayload {
        SignalPayload::Data { job_id: None, body }
    }

    #[test]
    fn encoded_envelopes_verify() {
        let env = encode(SignalPayload::cancel("j1"), Direction::Inbound, Some("initiator")).unwrap();
        assert!(verify(&env));
        assert_eq!(env.digest.len(), 64);
        assert_eq!(env.source.as_deref(), Some("initiator"));
    }

    #[test]
    fn key_order_does_not_change_digest() {
        let a: Value = serde_json::from_str(r#"{"b": 1, "a": {"y": [1, {"q": 2, "p": 3}], "x": null}}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"a": {"x": null, "y": [1, {"p": 3, "q": 2}]}, "b": 1}"#).unwrap();
        assert_eq!(digest(&data(a.clone())).unwrap(), digest(&data(b.clone())).unwrap());

        // An envelope built from one ordering verifies against the other.
        let mut env = encode(data(a), Direction::Outbound, None).unwrap();
        env.payload = data(b);
        assert!(verify(&env));
    }

    #[test]
    fn tampered_payload_fails_verification() {
        let mut env = encode(SignalPayload::cancel("j1"), Direction::Inbound, None).unwrap();
        env.payload = SignalPayload::cancel("j2");
        assert!(!verify(&env));
    }

    #[test]
    fn canonical_json_sorts_nested_keys() {
        let text = canonical_json(&json!({"z": 1, "a": {"d": 2, "c": 3}})).unwrap();
        assert_eq!(text, r#"{"a":{"c":3,"d":2},"z":1}"#);
    }

    #[test]
    fn nonces_are_unique() {
        let a = encode(SignalPayload::cancel("j1"), Direction::Inbound, None).unwrap();
        let b = encode(SignalPayload::cancel("j1"), Direction::Inbound, None).unwrap();
        assert_ne!(a.nonce, b.nonce);
        assert_eq!(a.digest, b.digest);
    }
}

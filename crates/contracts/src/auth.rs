//! Message authentication for the station channel
//!
//! Every wire message is signed with HMAC-SHA256 over the canonical
//! serialization of all fields except `hmac_signature` itself. Canonical means
//! compact separators and recursively sorted object keys, so both ends produce
//! identical bytes regardless of field declaration order.

use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;

use crate::TimingError;

type HmacSha256 = Hmac<Sha256>;

/// Wire field carrying the signature.
pub const SIGNATURE_FIELD: &str = "hmac_signature";

/// Render a JSON value in canonical form: object keys sorted, no whitespace.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            out.push('{');
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // serde_json string escaping for the key itself
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        // Scalars already have a single compact rendering
        other => out.push_str(&other.to_string()),
    }
}

/// Compute the hex signature for a payload value (without signature field).
pub fn compute_signature(payload: &Value, secret: &[u8]) -> String {
    let canonical = canonical_json(payload);
    let mut mac = HmacSha256::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(canonical.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Sign a message in place: appends `hmac_signature` to the object.
///
/// # Errors
/// Returns `InvariantViolation` if the value is not a JSON object.
pub fn sign_message(message: &mut Value, secret: &[u8]) -> Result<(), TimingError> {
    let signature = compute_signature(message, secret);
    let map = message
        .as_object_mut()
        .ok_or_else(|| TimingError::invariant("cannot sign a non-object message"))?;
    map.insert(SIGNATURE_FIELD.to_string(), Value::String(signature));
    Ok(())
}

/// Verify and strip the signature of an inbound message.
///
/// On success the message is left without its `hmac_signature` field, ready
/// for typed deserialization. Comparison is constant-time.
///
/// # Errors
/// `AuthenticationError` when the signature is missing, malformed or wrong.
pub fn verify_message(message: &mut Value, secret: &[u8]) -> Result<(), TimingError> {
    let provided = message
        .as_object_mut()
        .and_then(|map| map.remove(SIGNATURE_FIELD))
        .ok_or_else(|| TimingError::authentication("message without hmac_signature"))?;

    let provided_hex = provided
        .as_str()
        .ok_or_else(|| TimingError::authentication("hmac_signature is not a string"))?;
    let provided_bytes = hex::decode(provided_hex)
        .map_err(|_| TimingError::authentication("hmac_signature is not valid hex"))?;

    let canonical = canonical_json(message);
    let mut mac = HmacSha256::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(canonical.as_bytes());
    mac.verify_slice(&provided_bytes)
        .map_err(|_| TimingError::authentication("hmac verification failed"))
}

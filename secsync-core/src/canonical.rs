// SPDX-License-Identifier: MIT OR Apache-2.0

//! Deterministic JSON encoding.
//!
//! The canonical form of a value is the byte-for-byte encoding both sides of
//! the protocol sign and authenticate: object keys sorted lexicographically
//! at every nesting level, no insignificant whitespace, numbers in their
//! shortest JSON form. The canonical encoding of an envelope's public data
//! (base64url-encoded) is the AEAD associated data and part of the signed
//! payload.
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// Serialize a value and return its canonical JSON string.
pub fn canonicalize<T: Serialize>(value: &T) -> Result<String, CanonicalizeError> {
    let value = serde_json::to_value(value)?;
    let mut out = String::new();
    write_canonical(&value, &mut out);
    Ok(out)
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();

            out.push('{');
            for (index, key) in keys.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                // String serialization of a key is infallible.
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        // Scalars already render compact and in shortest form.
        other => out.push_str(&other.to_string()),
    }
}

#[derive(Debug, Error)]
pub enum CanonicalizeError {
    #[error("value could not be represented as json: {0}")]
    Json(#[from] serde_json::Error),
}

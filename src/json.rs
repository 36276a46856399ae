//! Canonical JSON.
//!
//! Hashing and signing operate over a bit-exact encoding: object keys sorted
//! lexicographically by codepoint, minimal separators, UTF-8, integers only
//! and only within the interoperable range. `serde_json`'s default map is
//! BTree-backed, so a serialized [`Value`] already has sorted keys and no
//! insignificant whitespace; this module adds the numeric restrictions and
//! the subset-projection helpers the event model hashes through.

use serde_json::Value;

use crate::error::{Error, Result};

/// Largest integer magnitude that survives every conforming JSON decoder.
pub const MAX_CANONICAL_INT: i64 = 9_007_199_254_740_991; // 2^53 - 1
pub const MIN_CANONICAL_INT: i64 = -9_007_199_254_740_991; // -(2^53 - 1)

/// Serialize a value in canonical form.
///
/// Fails on floats and on integers outside [-2^53+1, 2^53-1] anywhere in the
/// tree; canonical JSON carries no value that decoders may round.
pub fn canonical_string(value: &Value) -> Result<String> {
    check_canonical(value)?;
    serde_json::to_string(value).map_err(Error::from)
}

pub fn canonical_vec(value: &Value) -> Result<Vec<u8>> {
    canonical_string(value).map(String::into_bytes)
}

/// Parse then re-serialize; the result is canonical regardless of the
/// formatting of the input.
pub fn canonicalize(input: &str) -> Result<String> {
    let value: Value =
        serde_json::from_str(input).map_err(|err| Error::BadJson(err.to_string()))?;
    canonical_string(&value)
}

fn check_canonical(value: &Value) -> Result<()> {
    match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                if !(MIN_CANONICAL_INT..=MAX_CANONICAL_INT).contains(&i) {
                    return Err(Error::BadJson(format!(
                        "integer {i} outside canonical range"
                    )));
                }
                Ok(())
            } else if let Some(u) = n.as_u64() {
                if u > MAX_CANONICAL_INT as u64 {
                    return Err(Error::BadJson(format!(
                        "integer {u} outside canonical range"
                    )));
                }
                Ok(())
            } else {
                Err(Error::BadJson(format!(
                    "non-integer number {n} not permitted in canonical json"
                )))
            }
        }
        Value::Array(items) => {
            for item in items {
                check_canonical(item)?;
            }
            Ok(())
        }
        Value::Object(map) => {
            for item in map.values() {
                check_canonical(item)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Clone `value` with the named top-level keys removed. Hash preimages are
/// all "the event minus some keys"; this is that projection.
pub fn without_keys(value: &Value, keys: &[&str]) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (k, v) in map {
                if !keys.contains(&k.as_str()) {
                    out.insert(k.clone(), v.clone());
                }
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

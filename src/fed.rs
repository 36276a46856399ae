//! Federation transaction envelope.
//!
//! Transactions carry persistent events (pdus) and ephemeral data units
//! (edus) between homeservers. Their signature covers the canonical form
//! with `signatures` and `unsigned` removed, like an event's but without
//! redaction: transactions are not content-addressed.

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};
use ed25519_dalek::{Signature, Signer as _, Verifier as _};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    error::{Error, Result},
    json,
    signing::{KeyStore, ServerKeys},
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub origin: String,
    pub origin_server_ts: i64,
    #[serde(default)]
    pub pdus: Vec<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub edus: Vec<Value>,
}

impl Transaction {
    pub fn new(origin: impl Into<String>, origin_server_ts: i64) -> Self {
        Self {
            origin: origin.into(),
            origin_server_ts,
            pdus: Vec::new(),
            edus: Vec::new(),
        }
    }

    /// Serialize and sign, returning the wire object with `signatures`
    /// attached.
    pub fn sign(&self, keys: &ServerKeys) -> Result<Value> {
        let mut value = serde_json::to_value(self)?;
        let preimage = signing_preimage(&value)?;
        let sig = keys.signing_key().sign(&preimage);

        let server = keys.server_name();
        let key_id = keys.key_id();
        value.as_object_mut().expect("transaction is an object").insert(
            "signatures".into(),
            serde_json::json!({
                server: { key_id: STANDARD_NO_PAD.encode(sig.to_bytes()) }
            }),
        );
        Ok(value)
    }
}

/// Verify a received transaction's origin signature and parse it.
pub fn verify(value: &Value, store: &KeyStore) -> Result<Transaction> {
    let origin = value
        .get("origin")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Protocol {
            peer: "?".into(),
            reason: "transaction carries no origin".into(),
        })?;

    let signatures = value
        .get("signatures")
        .and_then(|s| s.get(origin))
        .and_then(Value::as_object)
        .ok_or_else(|| Error::Protocol {
            peer: origin.to_owned(),
            reason: "transaction carries no origin signature".into(),
        })?;

    let preimage = signing_preimage(value)?;
    let mut verified = false;
    for (key_id, sig) in signatures {
        let Some(sig) = sig.as_str() else { continue };
        let Some(key) = store.get(origin, key_id).copied() else {
            continue;
        };
        let raw = STANDARD_NO_PAD
            .decode(sig.trim_end_matches('='))
            .map_err(|err| Error::Crypto(format!("signature is not valid base64: {err}")))?;
        let sig = Signature::from_slice(&raw)
            .map_err(|err| Error::Crypto(format!("signature malformed: {err}")))?;
        if key.verify(&preimage, &sig).is_ok() {
            verified = true;
            break;
        }
    }

    if !verified {
        return Err(Error::Crypto(format!(
            "no verifiable transaction signature from {origin}"
        )));
    }

    serde_json::from_value(value.clone()).map_err(|err| Error::Protocol {
        peer: origin.to_owned(),
        reason: format!("malformed transaction: {err}"),
    })
}

fn signing_preimage(value: &Value) -> Result<Vec<u8>> {
    let preimage = json::without_keys(value, &["signatures", "unsigned"]);
    json::canonical_vec(&preimage)
}

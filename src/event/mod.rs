//! The event model.
//!
//! An event is a canonical-JSON object; the raw [`Value`] is the source of
//! truth for everything cryptographic (hashes, signatures, the event id),
//! while [`Event`] is the typed parse used for field access. The two travel
//! together through the pipeline.
//!
//! Three preimages, all excluding `event_id` (the id is content-derived and
//! cannot cover itself):
//!
//! - content hash: canonical(event − {event_id, hashes, signatures, unsigned})
//! - signature:    canonical(redact(event) − {event_id, signatures, unsigned})
//! - reference:    canonical(redact(event) − {event_id}) — covers hashes and
//!   signatures, so the id pins the signed form.

pub mod conforms;
pub mod id;
pub mod redact;

use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};
use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier as _, VerifyingKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::{
    error::{Error, Result},
    json,
};

pub use conforms::{Code, Conforms};

/// Serialized events larger than this fail conformance before any DB access.
pub const MAX_EVENT_SIZE: usize = 65_507;

/// Typed view of an event. Unknown fields are ignored on parse; optional
/// fields stay `None` rather than defaulting, so the original object shape
/// is recoverable from the raw value, never from this struct.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    #[serde(default)]
    pub room_id: String,
    #[serde(default)]
    pub sender: String,
    #[serde(default)]
    pub origin: String,
    #[serde(rename = "type", default)]
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_key: Option<String>,
    #[serde(default)]
    pub depth: i64,
    #[serde(default)]
    pub prev_events: Vec<String>,
    #[serde(default)]
    pub auth_events: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub prev_state: Vec<String>,
    #[serde(default)]
    pub content: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redacts: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub membership: Option<String>,
    #[serde(default)]
    pub origin_server_ts: i64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub hashes: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub signatures: BTreeMap<String, BTreeMap<String, String>>,
}

impl Event {
    pub fn from_value(value: &Value) -> Result<Self> {
        serde_json::from_value(value.clone()).map_err(|err| Error::BadJson(err.to_string()))
    }

    pub fn from_json(input: &str) -> Result<(Self, Value)> {
        let value: Value =
            serde_json::from_str(input).map_err(|err| Error::BadJson(err.to_string()))?;
        let event = Self::from_value(&value)?;
        Ok((event, value))
    }

    /// State events contribute to room state keyed by `(type, state_key)`.
    pub fn is_state(&self) -> bool {
        self.state_key.is_some()
    }

    pub fn is_create(&self) -> bool {
        self.event_type == "m.room.create"
    }

    /// Top-level `membership` when present, else `content.membership`.
    pub fn membership(&self) -> Option<&str> {
        self.membership
            .as_deref()
            .filter(|m| !m.is_empty())
            .or_else(|| self.content.get("membership").and_then(Value::as_str))
    }

    pub fn state_pair(&self) -> Option<(&str, &str)> {
        self.state_key
            .as_deref()
            .map(|sk| (self.event_type.as_str(), sk))
    }
}

pub fn check_size(value: &Value) -> Result<()> {
    let size = json::canonical_string(value)?.len();
    if size > MAX_EVENT_SIZE {
        return Err(Error::EventTooLarge {
            size,
            max: MAX_EVENT_SIZE,
        });
    }
    Ok(())
}

/// sha256 over the content-hash preimage.
pub fn content_hash(value: &Value) -> Result<[u8; 32]> {
    let preimage = json::without_keys(value, &["event_id", "hashes", "signatures", "unsigned"]);
    let canonical = json::canonical_vec(&preimage)?;
    Ok(Sha256::digest(&canonical).into())
}

/// sha256 over the redacted event; the basis of the event id.
pub fn reference_hash(value: &Value) -> Result<[u8; 32]> {
    let redacted = redact::redact(value);
    let preimage = json::without_keys(&redacted, &["event_id"]);
    let canonical = json::canonical_vec(&preimage)?;
    Ok(Sha256::digest(&canonical).into())
}

/// Mint the content-derived event id: `$<b58(reference_hash)>:<origin>`.
pub fn make_event_id(value: &Value, origin: &str) -> Result<String> {
    let hash = reference_hash(value)?;
    let encoded = bs58::encode(&hash).into_string();
    Ok(id::build(id::Sigil::Event, &encoded, origin))
}

fn signing_preimage(value: &Value) -> Result<Vec<u8>> {
    let redacted = redact::redact(value);
    let preimage = json::without_keys(&redacted, &["event_id", "signatures", "unsigned"]);
    json::canonical_vec(&preimage)
}

/// Sign the event's redacted form, returning the unpadded-base64 signature.
pub fn sign_value(value: &Value, key: &SigningKey) -> Result<String> {
    let preimage = signing_preimage(value)?;
    let sig = key.sign(&preimage);
    Ok(STANDARD_NO_PAD.encode(sig.to_bytes()))
}

/// Verify one signature (unpadded base64) against the redacted form.
pub fn verify_value(value: &Value, key: &VerifyingKey, sig_b64: &str) -> Result<()> {
    let preimage = signing_preimage(value)?;
    let raw = STANDARD_NO_PAD
        .decode(sig_b64.trim_end_matches('='))
        .map_err(|err| Error::Crypto(format!("signature is not valid base64: {err}")))?;
    let sig = Signature::from_slice(&raw)
        .map_err(|err| Error::Crypto(format!("signature malformed: {err}")))?;
    key.verify(&preimage, &sig)
        .map_err(|_| Error::Crypto("signature verification failed".into()))
}

/// Check the `hashes.sha256` field against the recomputed content hash.
pub fn verify_content_hash(value: &Value) -> Result<()> {
    let claimed = value
        .get("hashes")
        .and_then(|h| h.get("sha256"))
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Crypto("event carries no sha256 content hash".into()))?;

    let actual = content_hash(value)?;
    let expected = STANDARD_NO_PAD.encode(actual);
    if claimed.trim_end_matches('=') != expected {
        return Err(Error::Crypto("content hash mismatch".into()));
    }
    Ok(())
}

/// Check that the embedded event id matches the recomputed reference hash
/// and names the claimed origin.
pub fn verify_event_id(value: &Value) -> Result<()> {
    let claimed = value
        .get("event_id")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Crypto("event carries no event_id".into()))?;
    let origin = value
        .get("origin")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Crypto("event carries no origin".into()))?;

    let expected = make_event_id(value, origin)?;
    if claimed != expected {
        return Err(Error::Crypto(format!(
            "event_id {claimed} does not match content (expected {expected})"
        )));
    }
    Ok(())
}

/// Construction of locally-originated events.
///
/// The order matters: content hash over the bare object, then signatures
/// over the redacted object, then the id over the redacted object including
/// both.
#[derive(Debug, Default)]
pub struct Builder {
    pub event_type: String,
    pub room_id: String,
    pub sender: String,
    pub content: Value,
    pub state_key: Option<String>,
    pub depth: i64,
    pub prev_events: Vec<String>,
    pub auth_events: Vec<String>,
    pub redacts: Option<String>,
    pub origin_server_ts: i64,
}

impl Builder {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            content: Value::Object(serde_json::Map::new()),
            ..Default::default()
        }
    }

    /// Hash, sign, and mint the id. Returns the finished raw value and its id.
    pub fn build(
        self,
        origin: &str,
        key_id: &str,
        key: &SigningKey,
    ) -> Result<(String, Value)> {
        let mut map = serde_json::Map::new();
        map.insert("type".into(), Value::String(self.event_type));
        map.insert("room_id".into(), Value::String(self.room_id));
        map.insert("sender".into(), Value::String(self.sender));
        map.insert("origin".into(), Value::String(origin.to_owned()));
        map.insert("origin_server_ts".into(), self.origin_server_ts.into());
        map.insert("depth".into(), self.depth.into());
        map.insert("content".into(), self.content);
        map.insert(
            "prev_events".into(),
            Value::Array(self.prev_events.into_iter().map(Value::String).collect()),
        );
        map.insert(
            "auth_events".into(),
            Value::Array(self.auth_events.into_iter().map(Value::String).collect()),
        );
        if let Some(state_key) = self.state_key {
            map.insert("state_key".into(), Value::String(state_key));
        }
        if let Some(redacts) = self.redacts {
            map.insert("redacts".into(), Value::String(redacts));
        }

        let mut value = Value::Object(map);

        let hash = content_hash(&value)?;
        value.as_object_mut().expect("event is an object").insert(
            "hashes".into(),
            serde_json::json!({ "sha256": STANDARD_NO_PAD.encode(hash) }),
        );

        let sig = sign_value(&value, key)?;
        value.as_object_mut().expect("event is an object").insert(
            "signatures".into(),
            serde_json::json!({ origin: { key_id: sig } }),
        );

        let event_id = make_event_id(&value, origin)?;
        value
            .as_object_mut()
            .expect("event is an object")
            .insert("event_id".into(), Value::String(event_id.clone()));

        check_size(&value)?;
        Ok((event_id, value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::OsRng;
    use serde_json::json;

    fn create_event() -> Value {
        json!({
            "type": "m.room.create",
            "room_id": "!r:h",
            "sender": "@a:h",
            "origin": "h",
            "origin_server_ts": 0,
            "depth": 0,
            "content": {"creator": "@a:h"},
            "prev_events": [],
            "auth_events": [],
            "hashes": {},
            "signatures": {},
        })
    }

    #[test]
    fn reference_hash_matches_pinned_vector() {
        let hash = reference_hash(&create_event()).unwrap();
        assert_eq!(
            hex::encode(hash),
            "253fbf4cd733d4f2a0f9278b46ec115bff2dcb10ae97ca5150a5a10e2765458e"
        );
    }

    #[test]
    fn event_id_matches_pinned_vector() {
        let event_id = make_event_id(&create_event(), "h").unwrap();
        assert_eq!(event_id, "$3WQTsHHcccMfUdhka94W5WgP4YFEeNzXSNESHz8LyWz1:h");
    }

    #[test]
    fn content_hash_matches_pinned_vector() {
        let hash = content_hash(&create_event()).unwrap();
        assert_eq!(
            STANDARD_NO_PAD.encode(hash),
            "pUQ1DtvuUsgSwJkiTKfK8BdQSZ093PfY7O/QiQLVJhU"
        );
    }

    #[test]
    fn typed_parse_round_trips() {
        let value = create_event();
        let event = Event::from_value(&value).unwrap();
        assert_eq!(event.event_type, "m.room.create");
        assert_eq!(event.depth, 0);
        assert!(event.prev_events.is_empty());
        assert_eq!(event.content["creator"], "@a:h");
    }

    #[test]
    fn build_produces_verifiable_event() {
        let key = SigningKey::generate(&mut OsRng);
        let mut builder = Builder::new("m.room.create");
        builder.room_id = "!r:h".into();
        builder.sender = "@a:h".into();
        builder.state_key = Some(String::new());
        builder.content = json!({"creator": "@a:h"});

        let (event_id, value) = builder.build("h", "ed25519:0", &key).unwrap();
        assert!(event_id.starts_with('$'));
        assert!(event_id.ends_with(":h"));

        verify_content_hash(&value).unwrap();
        verify_event_id(&value).unwrap();

        let sig = value["signatures"]["h"]["ed25519:0"].as_str().unwrap();
        verify_value(&value, &key.verifying_key(), sig).unwrap();
    }

    #[test]
    fn flipped_byte_fails_verification() {
        let key = SigningKey::generate(&mut OsRng);
        let mut builder = Builder::new("m.room.message");
        builder.room_id = "!r:h".into();
        builder.sender = "@a:h".into();
        builder.depth = 1;
        builder.prev_events = vec!["$p:h".into()];
        builder.content = json!({"body": "hello"});

        let (_, mut value) = builder.build("h", "ed25519:0", &key).unwrap();

        // tamper with an authorization-relevant field
        value["sender"] = Value::String("@b:h".into());
        let sig = value["signatures"]["h"]["ed25519:0"]
            .as_str()
            .unwrap()
            .to_owned();
        let err = verify_value(&value, &key.verifying_key(), &sig).unwrap_err();
        assert!(matches!(err, Error::Crypto(_)));
    }

    #[test]
    fn tampered_content_fails_hash_check() {
        let key = SigningKey::generate(&mut OsRng);
        let mut builder = Builder::new("m.room.message");
        builder.room_id = "!r:h".into();
        builder.sender = "@a:h".into();
        builder.depth = 1;
        builder.prev_events = vec!["$p:h".into()];
        builder.content = json!({"body": "hello"});

        let (_, mut value) = builder.build("h", "ed25519:0", &key).unwrap();
        value["content"]["body"] = Value::String("tampered".into());

        let err = verify_content_hash(&value).unwrap_err();
        assert!(matches!(err, Error::Crypto(_)));
    }

    #[test]
    fn oversized_event_is_rejected() {
        let mut value = create_event();
        value["content"]["filler"] = Value::String("x".repeat(MAX_EVENT_SIZE));
        let err = check_size(&value).unwrap_err();
        assert!(matches!(err, Error::EventTooLarge { .. }));
    }

    #[test]
    fn membership_falls_back_to_content() {
        let event = Event::from_value(&json!({
            "type": "m.room.member",
            "content": {"membership": "join"},
        }))
        .unwrap();
        assert_eq!(event.membership(), Some("join"));

        let event = Event::from_value(&json!({
            "type": "m.room.member",
            "membership": "ban",
            "content": {"membership": "join"},
        }))
        .unwrap();
        assert_eq!(event.membership(), Some("ban"));
    }
}

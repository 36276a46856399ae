//! Server signing identity and the verify-key registry.
//!
//! Each server holds one active ed25519 keypair named `ed25519:<label>`.
//! The seed lives in a single file under the configured key directory; the
//! public half is written beside it for operators. Remote servers' keys are
//! collected in a [`KeyStore`], current and historical alike, since old
//! events must stay verifiable after a peer rotates.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};
use ed25519_dalek::{SigningKey, VerifyingKey};
use rand_core::OsRng;
use serde_json::Value;
use tracing::info;

use crate::{
    error::{Error, Result},
    event,
};

pub const KEY_ALGORITHM: &str = "ed25519";
const SEED_FILE: &str = "ed25519.key";
const PUBLIC_FILE: &str = "ed25519.pub";

/// The local server's signing identity.
pub struct ServerKeys {
    server_name: String,
    key_id: String,
    signing: SigningKey,
}

impl ServerKeys {
    /// Load the signing seed from `key_dir`, generating one on first run.
    pub fn load_or_generate(server_name: &str, key_dir: &Path) -> Result<Self> {
        fs::create_dir_all(key_dir)?;
        let seed_path = key_dir.join(SEED_FILE);

        let signing = if seed_path.exists() {
            read_seed(&seed_path)?
        } else {
            let signing = SigningKey::generate(&mut OsRng);
            write_seed(&seed_path, &signing)?;
            info!(path = %seed_path.display(), "generated server signing key");
            signing
        };

        let public_path = key_dir.join(PUBLIC_FILE);
        if !public_path.exists() {
            fs::write(
                &public_path,
                STANDARD_NO_PAD.encode(signing.verifying_key().as_bytes()),
            )?;
        }

        Ok(Self {
            server_name: server_name.to_owned(),
            key_id: format!("{KEY_ALGORITHM}:0"),
            signing,
        })
    }

    /// Ephemeral identity for tests and tooling.
    pub fn ephemeral(server_name: &str) -> Self {
        Self {
            server_name: server_name.to_owned(),
            key_id: format!("{KEY_ALGORITHM}:0"),
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn signing_key(&self) -> &SigningKey {
        &self.signing
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing.verifying_key()
    }

    pub fn public_key_b64(&self) -> String {
        STANDARD_NO_PAD.encode(self.signing.verifying_key().as_bytes())
    }

    /// Sign an event value, returning the `signatures`-ready (key_id, sig).
    pub fn sign_event(&self, value: &Value) -> Result<(String, String)> {
        let sig = event::sign_value(value, &self.signing)?;
        Ok((self.key_id.clone(), sig))
    }
}

/// Verify keys known for remote servers, current and historical.
#[derive(Default)]
pub struct KeyStore {
    keys: BTreeMap<String, BTreeMap<String, VerifyingKey>>,
}

impl KeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, server: &str, key_id: &str, key: VerifyingKey) {
        self.keys
            .entry(server.to_owned())
            .or_default()
            .insert(key_id.to_owned(), key);
    }

    pub fn insert_b64(&mut self, server: &str, key_id: &str, key_b64: &str) -> Result<()> {
        let raw = STANDARD_NO_PAD
            .decode(key_b64.trim_end_matches('='))
            .map_err(|err| Error::Crypto(format!("verify key is not valid base64: {err}")))?;
        let bytes: [u8; 32] = raw
            .as_slice()
            .try_into()
            .map_err(|_| Error::Crypto("verify key must be 32 bytes".into()))?;
        let key = VerifyingKey::from_bytes(&bytes)
            .map_err(|err| Error::Crypto(format!("verify key malformed: {err}")))?;
        self.insert(server, key_id, key);
        Ok(())
    }

    pub fn get(&self, server: &str, key_id: &str) -> Option<&VerifyingKey> {
        self.keys.get(server).and_then(|keys| keys.get(key_id))
    }

    pub fn servers(&self) -> impl Iterator<Item = &str> {
        self.keys.keys().map(String::as_str)
    }

    /// Verify that at least one signature from `origin` on the event checks
    /// out against a known key.
    pub fn verify_event(&self, value: &Value, origin: &str) -> Result<()> {
        let signatures = value
            .get("signatures")
            .and_then(|s| s.get(origin))
            .and_then(Value::as_object)
            .ok_or_else(|| Error::Crypto(format!("no signature from origin {origin}")))?;

        let known = self
            .keys
            .get(origin)
            .ok_or_else(|| Error::Crypto(format!("no verify keys known for {origin}")))?;

        let mut last_err = None;
        for (key_id, sig) in signatures {
            let Some(sig) = sig.as_str() else { continue };
            let Some(key) = known.get(key_id) else {
                continue;
            };
            match event::verify_value(value, key, sig) {
                Ok(()) => return Ok(()),
                Err(err) => last_err = Some(err),
            }
        }

        Err(last_err
            .unwrap_or_else(|| Error::Crypto(format!("no verifiable signature from {origin}"))))
    }
}

fn read_seed(path: &Path) -> Result<SigningKey> {
    let contents = fs::read_to_string(path)?;
    let raw = STANDARD_NO_PAD
        .decode(contents.trim().trim_end_matches('='))
        .map_err(|err| Error::Config(format!("signing key at {} unreadable: {err}", path.display())))?;
    let seed: [u8; 32] = raw.as_slice().try_into().map_err(|_| {
        Error::Config(format!(
            "signing key at {} must decode to 32 bytes",
            path.display()
        ))
    })?;
    Ok(SigningKey::from_bytes(&seed))
}

fn write_seed(path: &Path, key: &SigningKey) -> Result<()> {
    fs::write(path, STANDARD_NO_PAD.encode(key.to_bytes()))?;
    Ok(())
}

pub fn seed_path(key_dir: &Path) -> PathBuf {
    key_dir.join(SEED_FILE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn load_or_generate_is_stable_across_restarts() {
        let dir = tempfile::tempdir().unwrap();
        let first = ServerKeys::load_or_generate("h", dir.path()).unwrap();
        let second = ServerKeys::load_or_generate("h", dir.path()).unwrap();
        assert_eq!(first.public_key_b64(), second.public_key_b64());
        assert!(seed_path(dir.path()).exists());
    }

    #[test]
    fn keystore_verifies_origin_signature() {
        let keys = ServerKeys::ephemeral("h1");
        let mut builder = event::Builder::new("m.room.message");
        builder.room_id = "!r:h1".into();
        builder.sender = "@a:h1".into();
        builder.depth = 1;
        builder.prev_events = vec!["$p:h1".into()];
        builder.content = json!({"body": "over the wire"});
        let (_, value) = builder
            .build("h1", keys.key_id(), keys.signing_key())
            .unwrap();

        let mut store = KeyStore::new();
        store
            .insert_b64("h1", keys.key_id(), &keys.public_key_b64())
            .unwrap();

        store.verify_event(&value, "h1").unwrap();
        assert!(store.verify_event(&value, "h2").is_err());
    }

    #[test]
    fn keystore_rejects_unknown_server() {
        let store = KeyStore::new();
        let err = store
            .verify_event(&json!({"signatures": {"h": {"ed25519:0": "x"}}}), "h")
            .unwrap_err();
        assert!(matches!(err, Error::Crypto(_)));
    }
}

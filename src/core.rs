//! Shared context exposing the pipeline and the query surface so the
//! external adapters (federation and client-server HTTP, the CLI) can be
//! layered on top of one consistent API.

use std::{cell::RefCell, rc::Rc, sync::Arc};

use chrono::Utc;
use serde_json::Value;
use tracing::info;

use crate::{
    config::Config,
    dbs::{Dbs, EventIdx},
    error::{Error, Result},
    event::{Builder, Event},
    fed,
    fetch::{EventSource, Fetcher},
    sched::{Note, Offload},
    signing::{KeyStore, ServerKeys},
    state,
    vm::Vm,
};

pub struct Core {
    dbs: Arc<Dbs>,
    vm: Rc<Vm>,
    keys: ServerKeys,
    key_store: Rc<RefCell<KeyStore>>,
}

impl Core {
    pub fn open(config: &Config) -> Result<Self> {
        Self::open_with(config, None)
    }

    pub fn open_with(config: &Config, source: Option<Rc<dyn EventSource>>) -> Result<Self> {
        let dbs = Arc::new(Dbs::open(&config.events_db_path())?);
        let keys = ServerKeys::load_or_generate(&config.server_name, &config.key_dir())?;

        let mut store = KeyStore::new();
        store.insert_b64(keys.server_name(), keys.key_id(), &keys.public_key_b64())?;
        let key_store = Rc::new(RefCell::new(store));

        let fetcher = source.map(|s| Rc::new(Fetcher::new(s, config.fetch_opts())));
        let offload = Rc::new(Offload::new("db", config.offload_threads));
        let vm = Rc::new(Vm::new(
            dbs.clone(),
            key_store.clone(),
            fetcher,
            Some(offload),
            config.vm_opts(),
        ));

        info!(server = %config.server_name, "core ready");
        Ok(Self {
            dbs,
            vm,
            keys,
            key_store,
        })
    }

    pub fn server_keys(&self) -> &ServerKeys {
        &self.keys
    }

    pub fn key_store(&self) -> &Rc<RefCell<KeyStore>> {
        &self.key_store
    }

    pub fn dbs(&self) -> &Arc<Dbs> {
        &self.dbs
    }

    /// Run the VM pipeline for an already-formed event.
    pub async fn submit(&self, room_id: &str, event_json: Value) -> Result<String> {
        self.vm.submit(room_id, event_json).await
    }

    /// Stamp, hash, sign, and submit a locally-originated event.
    pub async fn submit_local(&self, mut builder: Builder) -> Result<String> {
        let room_id = builder.room_id.clone();
        if builder.origin_server_ts == 0 {
            builder.origin_server_ts = Utc::now().timestamp_millis();
        }
        let (_, value) = builder.build(
            self.keys.server_name(),
            self.keys.key_id(),
            self.keys.signing_key(),
        )?;
        self.vm.submit(&room_id, value).await
    }

    /// Verify a federation transaction and run each pdu through the
    /// pipeline. Per-pdu outcomes are reported individually; one bad event
    /// does not sink its siblings.
    pub async fn ingest_transaction(&self, value: &Value) -> Result<Vec<Result<String>>> {
        let txn = fed::verify(value, &self.key_store.borrow())?;

        let mut results = Vec::with_capacity(txn.pdus.len());
        for pdu in txn.pdus {
            let result = match pdu.get("room_id").and_then(Value::as_str) {
                Some(room_id) => {
                    let room_id = room_id.to_owned();
                    self.submit(&room_id, pdu).await
                }
                None => Err(Error::Protocol {
                    peer: txn.origin.clone(),
                    reason: "pdu carries no room_id".into(),
                }),
            };
            results.push(result);
        }
        Ok(results)
    }

    pub fn query_event(&self, event_id: &str) -> Result<Option<Event>> {
        match self.dbs.idx_of(event_id)? {
            Some(idx) => self.dbs.event(idx),
            None => Ok(None),
        }
    }

    /// Resolved state at the current heads, or at a specific event.
    pub fn query_state(
        &self,
        room_id: &str,
        event_type: &str,
        state_key: &str,
        at_event: Option<&str>,
    ) -> Result<Option<Event>> {
        let idx = match at_event {
            None => self.dbs.state_idx(room_id, event_type, state_key)?,
            Some(at) => {
                let at_idx = self
                    .dbs
                    .idx_of(at)?
                    .ok_or_else(|| Error::NotFound(format!("event {at} not persisted")))?;
                let map = state::state_after(&self.dbs, at_idx)?;
                map.get(&(event_type.to_owned(), state_key.to_owned()))
                    .copied()
            }
        };
        match idx {
            Some(idx) => self.dbs.event(idx),
            None => Ok(None),
        }
    }

    /// Lazy sequence of a room's events after `from_token`; finite per
    /// call, resumable via the token.
    pub fn subscribe(&self, room_id: &str, from_token: EventIdx) -> Subscription {
        Subscription {
            dbs: self.dbs.clone(),
            vm: self.vm.clone(),
            room_id: room_id.to_owned(),
            token: from_token,
            note: self.vm.watch(room_id),
        }
    }

    pub fn heads(&self, room_id: &str) -> Result<Vec<(EventIdx, String)>> {
        self.dbs.heads(room_id)
    }
}

/// A resumable per-room event stream. `next` yields events in stream order
/// until it reaches the head, then returns `None`; `wait` suspends until
/// the head advances again.
pub struct Subscription {
    dbs: Arc<Dbs>,
    vm: Rc<Vm>,
    room_id: String,
    token: EventIdx,
    note: Note,
}

impl Subscription {
    pub fn token(&self) -> EventIdx {
        self.token
    }

    pub async fn next(&mut self) -> Result<Option<Event>> {
        let batch = self.dbs.room_events_after(&self.room_id, self.token, 1)?;
        match batch.first() {
            Some((_, idx)) => {
                self.token = *idx;
                self.dbs.event(*idx)
            }
            None => Ok(None),
        }
    }

    /// Suspend until the room's head advances. Lossless: a publish between
    /// `next` and `wait` is not missed.
    pub async fn wait(&self) -> Result<()> {
        self.note.wait().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.vm.unwatch(&self.room_id, &self.note);
    }
}

//! Database schema.
//!
//! Every event attribute lives in its own column keyed by `event_idx`, so a
//! query touches only the fields it needs. Secondary indexes are composite
//! keys whose terminal component (or value) is an `event_idx`:
//!
//! - `room_events`: room_id ∥ 0x00 ∥ depth(8B BE) ∥ event_idx(8B BE) — a
//!   room's events in DAG-depth order.
//! - `room_state`:  room_id ∥ 0x00 ∥ type ∥ 0x00 ∥ state_key → event_idx of
//!   the currently-resolved state event.
//! - `room_joined`: room_id ∥ 0x00 ∥ origin → event_idx of the join.
//! - `room_head`:   room_id ∥ 0x00 ∥ event_idx(8B BE) → event_id; the DAG
//!   tips, mutated on every insert.
//! - `auth_chain`:  event_idx → packed BE u64 list, the transitive closure
//!   of auth_events.
//!
//! One write batch carries every column touched by persisting one event.

use std::path::Path;

use rocksdb::WriteBatch;
use serde_json::Value;

use crate::{
    db::{u64_from, u64_key, Column, Database},
    error::{Error, Result},
    event::Event,
    json,
};

pub const SEP: u8 = 0x00;

pub const EVENT_ID_IDX: &str = "event_id_idx";
pub const EVENT_JSON: &str = "event_json";
pub const EVENT_TYPE: &str = "event_type";
pub const EVENT_SENDER: &str = "event_sender";
pub const EVENT_ORIGIN: &str = "event_origin";
pub const EVENT_ROOM_ID: &str = "event_room_id";
pub const EVENT_STATE_KEY: &str = "event_state_key";
pub const EVENT_DEPTH: &str = "event_depth";
pub const EVENT_CONTENT: &str = "event_content";
pub const EVENT_PREV_EVENTS: &str = "event_prev_events";
pub const EVENT_AUTH_EVENTS: &str = "event_auth_events";
pub const EVENT_ORIGIN_SERVER_TS: &str = "event_origin_server_ts";
pub const EVENT_REDACTS: &str = "event_redacts";
pub const ROOM_EVENTS: &str = "room_events";
pub const ROOM_STATE: &str = "room_state";
pub const ROOM_JOINED: &str = "room_joined";
pub const ROOM_HEAD: &str = "room_head";
pub const AUTH_CHAIN: &str = "auth_chain";
pub const META: &str = "meta";

pub const ALL_COLUMNS: &[&str] = &[
    EVENT_ID_IDX,
    EVENT_JSON,
    EVENT_TYPE,
    EVENT_SENDER,
    EVENT_ORIGIN,
    EVENT_ROOM_ID,
    EVENT_STATE_KEY,
    EVENT_DEPTH,
    EVENT_CONTENT,
    EVENT_PREV_EVENTS,
    EVENT_AUTH_EVENTS,
    EVENT_ORIGIN_SERVER_TS,
    EVENT_REDACTS,
    ROOM_EVENTS,
    ROOM_STATE,
    ROOM_JOINED,
    ROOM_HEAD,
    AUTH_CHAIN,
    META,
];

const NEXT_EVENT_IDX: &[u8] = b"next_event_idx";

/// Dense local id of a persisted event; the key of every secondary index.
pub type EventIdx = u64;

pub struct Dbs {
    db: Database,
    event_id_idx: Column,
    event_json: Column,
    event_type: Column,
    event_sender: Column,
    event_origin: Column,
    event_room_id: Column,
    event_state_key: Column,
    event_depth: Column,
    event_content: Column,
    event_prev_events: Column,
    event_auth_events: Column,
    event_origin_server_ts: Column,
    event_redacts: Column,
    room_events: Column,
    room_state: Column,
    room_joined: Column,
    room_head: Column,
    auth_chain: Column,
    meta: Column,
}

/// Everything `write_event` needs beyond the event itself; resolved by the
/// VM before the batch is assembled.
pub struct WriteOpts {
    pub idx: EventIdx,
    /// Indexes of the event's prev_events; removed from the head set.
    pub prev_idxs: Vec<EventIdx>,
    /// Pre-computed transitive auth closure (excluding the event itself).
    pub auth_chain: Vec<EventIdx>,
}

impl Dbs {
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::open(path, ALL_COLUMNS)?;
        Ok(Self {
            event_id_idx: db.column(EVENT_ID_IDX)?,
            event_json: db.column(EVENT_JSON)?,
            event_type: db.column(EVENT_TYPE)?,
            event_sender: db.column(EVENT_SENDER)?,
            event_origin: db.column(EVENT_ORIGIN)?,
            event_room_id: db.column(EVENT_ROOM_ID)?,
            event_state_key: db.column(EVENT_STATE_KEY)?,
            event_depth: db.column(EVENT_DEPTH)?,
            event_content: db.column(EVENT_CONTENT)?,
            event_prev_events: db.column(EVENT_PREV_EVENTS)?,
            event_auth_events: db.column(EVENT_AUTH_EVENTS)?,
            event_origin_server_ts: db.column(EVENT_ORIGIN_SERVER_TS)?,
            event_redacts: db.column(EVENT_REDACTS)?,
            room_events: db.column(ROOM_EVENTS)?,
            room_state: db.column(ROOM_STATE)?,
            room_joined: db.column(ROOM_JOINED)?,
            room_head: db.column(ROOM_HEAD)?,
            auth_chain: db.column(AUTH_CHAIN)?,
            meta: db.column(META)?,
            db,
        })
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Allocate the next dense event index; the advanced counter rides in
    /// the same batch as the event so allocation commits atomically with it.
    pub fn allocate_idx(&self, batch: &mut WriteBatch) -> Result<EventIdx> {
        let next = match self.meta.get(NEXT_EVENT_IDX)? {
            Some(raw) => u64_from(&raw)?,
            None => 1,
        };
        self.meta
            .batch_put(batch, NEXT_EVENT_IDX, &u64_key(next + 1))?;
        Ok(next)
    }

    /// Append every column write for one event to `batch`.
    pub fn write_event(
        &self,
        batch: &mut WriteBatch,
        event: &Event,
        value: &Value,
        opts: &WriteOpts,
    ) -> Result<()> {
        let idx = u64_key(opts.idx);
        let event_id = event
            .event_id
            .as_deref()
            .ok_or_else(|| Error::Storage("cannot persist an event without an id".into()))?;
        let depth = u64::try_from(event.depth)
            .map_err(|_| Error::Storage("cannot persist a negative depth".into()))?;

        self.event_id_idx
            .batch_put(batch, event_id.as_bytes(), &idx)?;
        self.event_json
            .batch_put(batch, &idx, json::canonical_string(value)?.as_bytes())?;
        self.event_type
            .batch_put(batch, &idx, event.event_type.as_bytes())?;
        self.event_sender
            .batch_put(batch, &idx, event.sender.as_bytes())?;
        self.event_origin
            .batch_put(batch, &idx, event.origin.as_bytes())?;
        self.event_room_id
            .batch_put(batch, &idx, event.room_id.as_bytes())?;
        self.event_depth.batch_put(batch, &idx, &u64_key(depth))?;
        self.event_content.batch_put(
            batch,
            &idx,
            json::canonical_string(&event.content)?.as_bytes(),
        )?;
        self.event_prev_events.batch_put(
            batch,
            &idx,
            serde_json::to_vec(&event.prev_events)?.as_slice(),
        )?;
        self.event_auth_events.batch_put(
            batch,
            &idx,
            serde_json::to_vec(&event.auth_events)?.as_slice(),
        )?;
        self.event_origin_server_ts.batch_put(
            batch,
            &idx,
            &event.origin_server_ts.to_be_bytes(),
        )?;
        if let Some(state_key) = &event.state_key {
            self.event_state_key
                .batch_put(batch, &idx, state_key.as_bytes())?;
        }
        if let Some(redacts) = &event.redacts {
            self.event_redacts
                .batch_put(batch, &idx, redacts.as_bytes())?;
        }

        // room_events in (depth, idx) order
        self.room_events.batch_put(
            batch,
            &room_events_key(&event.room_id, depth, opts.idx),
            &[],
        )?;

        // head set: drop the prevs, insert self
        for prev in &opts.prev_idxs {
            self.room_head
                .batch_delete(batch, &room_scoped_key(&event.room_id, &u64_key(*prev)))?;
        }
        self.room_head.batch_put(
            batch,
            &room_scoped_key(&event.room_id, &idx),
            event_id.as_bytes(),
        )?;

        // pre-computed auth closure
        self.auth_chain
            .batch_put(batch, &idx, &pack_idxs(&opts.auth_chain))?;

        // joined-servers index follows membership transitions
        if event.event_type == "m.room.member" {
            if let Some(target) = event.state_key.as_deref() {
                if let Ok(origin) = crate::event::id::host(target) {
                    let key = room_scoped_key(&event.room_id, origin.as_bytes());
                    match event.membership() {
                        Some("join") => self.room_joined.batch_put(batch, &key, &idx)?,
                        Some("leave") | Some("ban") => {
                            self.room_joined.batch_delete(batch, &key)?
                        }
                        _ => {}
                    }
                }
            }
        }

        Ok(())
    }

    /// Record the resolved holder of one state key.
    pub fn write_room_state(
        &self,
        batch: &mut WriteBatch,
        room_id: &str,
        event_type: &str,
        state_key: &str,
        idx: EventIdx,
    ) -> Result<()> {
        self.room_state.batch_put(
            batch,
            &room_state_key(room_id, event_type, state_key),
            &u64_key(idx),
        )
    }

    /// Drop a state key that no longer resolves.
    pub fn delete_room_state(
        &self,
        batch: &mut WriteBatch,
        room_id: &str,
        event_type: &str,
        state_key: &str,
    ) -> Result<()> {
        self.room_state
            .batch_delete(batch, &room_state_key(room_id, event_type, state_key))
    }

    pub fn commit(&self, batch: WriteBatch) -> Result<()> {
        self.db.write(batch)
    }

    //
    // read surface
    //

    pub fn idx_of(&self, event_id: &str) -> Result<Option<EventIdx>> {
        match self.event_id_idx.get(event_id.as_bytes())? {
            Some(raw) => Ok(Some(u64_from(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn exists(&self, event_id: &str) -> Result<bool> {
        self.event_id_idx.has(event_id.as_bytes())
    }

    pub fn event_value(&self, idx: EventIdx) -> Result<Option<Value>> {
        match self.event_json.get(&u64_key(idx))? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn event(&self, idx: EventIdx) -> Result<Option<Event>> {
        match self.event_value(idx)? {
            Some(value) => Event::from_value(&value).map(Some),
            None => Ok(None),
        }
    }

    pub fn depth_of(&self, idx: EventIdx) -> Result<Option<u64>> {
        match self.event_depth.get(&u64_key(idx))? {
            Some(raw) => Ok(Some(u64_from(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn type_of(&self, idx: EventIdx) -> Result<Option<String>> {
        self.read_string(&self.event_type, idx)
    }

    pub fn sender_of(&self, idx: EventIdx) -> Result<Option<String>> {
        self.read_string(&self.event_sender, idx)
    }

    pub fn room_of(&self, idx: EventIdx) -> Result<Option<String>> {
        self.read_string(&self.event_room_id, idx)
    }

    pub fn state_key_of(&self, idx: EventIdx) -> Result<Option<String>> {
        self.read_string(&self.event_state_key, idx)
    }

    pub fn origin_ts_of(&self, idx: EventIdx) -> Result<Option<i64>> {
        match self.event_origin_server_ts.get(&u64_key(idx))? {
            Some(raw) => {
                let fixed: [u8; 8] = raw
                    .as_slice()
                    .try_into()
                    .map_err(|_| Error::Storage("malformed origin_server_ts cell".into()))?;
                Ok(Some(i64::from_be_bytes(fixed)))
            }
            None => Ok(None),
        }
    }

    pub fn prev_events_of(&self, idx: EventIdx) -> Result<Vec<String>> {
        self.read_id_list(&self.event_prev_events, idx)
    }

    pub fn auth_events_of(&self, idx: EventIdx) -> Result<Vec<String>> {
        self.read_id_list(&self.event_auth_events, idx)
    }

    pub fn auth_chain_of(&self, idx: EventIdx) -> Result<Option<Vec<EventIdx>>> {
        match self.auth_chain.get(&u64_key(idx))? {
            Some(raw) => Ok(Some(unpack_idxs(&raw)?)),
            None => Ok(None),
        }
    }

    /// A room's events as (depth, idx), ascending.
    pub fn room_events(&self, room_id: &str) -> Result<Vec<(u64, EventIdx)>> {
        let prefix = room_prefix(room_id);
        let entries = self.room_events.scan_prefix(&prefix)?;
        entries
            .into_iter()
            .map(|(key, _)| parse_room_events_key(&key, prefix.len()))
            .collect()
    }

    /// Room events strictly after the given index, in (depth, idx) order.
    pub fn room_events_after(
        &self,
        room_id: &str,
        after: EventIdx,
        limit: usize,
    ) -> Result<Vec<(u64, EventIdx)>> {
        let mut out: Vec<(u64, EventIdx)> = self
            .room_events(room_id)?
            .into_iter()
            .filter(|(_, idx)| *idx > after)
            .collect();
        out.truncate(limit);
        Ok(out)
    }

    /// Current DAG tips as (idx, event_id).
    pub fn heads(&self, room_id: &str) -> Result<Vec<(EventIdx, String)>> {
        let prefix = room_prefix(room_id);
        let entries = self.room_head.scan_prefix(&prefix)?;
        entries
            .into_iter()
            .map(|(key, value)| {
                let idx = u64_from(&key[prefix.len()..])?;
                let event_id = String::from_utf8(value)
                    .map_err(|_| Error::Storage("room_head value is not utf-8".into()))?;
                Ok((idx, event_id))
            })
            .collect()
    }

    pub fn state_idx(
        &self,
        room_id: &str,
        event_type: &str,
        state_key: &str,
    ) -> Result<Option<EventIdx>> {
        match self
            .room_state
            .get(&room_state_key(room_id, event_type, state_key))?
        {
            Some(raw) => Ok(Some(u64_from(&raw)?)),
            None => Ok(None),
        }
    }

    /// The full resolved state mapping of a room.
    pub fn room_state(&self, room_id: &str) -> Result<Vec<((String, String), EventIdx)>> {
        let prefix = room_prefix(room_id);
        let entries = self.room_state.scan_prefix(&prefix)?;
        entries
            .into_iter()
            .map(|(key, value)| {
                let rest = &key[prefix.len()..];
                let sep = rest
                    .iter()
                    .position(|b| *b == SEP)
                    .ok_or_else(|| Error::Storage("malformed room_state key".into()))?;
                let event_type = String::from_utf8(rest[..sep].to_vec())
                    .map_err(|_| Error::Storage("room_state key is not utf-8".into()))?;
                let state_key = String::from_utf8(rest[sep + 1..].to_vec())
                    .map_err(|_| Error::Storage("room_state key is not utf-8".into()))?;
                Ok(((event_type, state_key), u64_from(&value)?))
            })
            .collect()
    }

    pub fn joined_origins(&self, room_id: &str) -> Result<Vec<String>> {
        let prefix = room_prefix(room_id);
        let entries = self.room_joined.scan_prefix(&prefix)?;
        entries
            .into_iter()
            .map(|(key, _)| {
                String::from_utf8(key[prefix.len()..].to_vec())
                    .map_err(|_| Error::Storage("room_joined key is not utf-8".into()))
            })
            .collect()
    }

    fn read_string(&self, column: &Column, idx: EventIdx) -> Result<Option<String>> {
        match column.get(&u64_key(idx))? {
            Some(raw) => String::from_utf8(raw)
                .map(Some)
                .map_err(|_| Error::Storage(format!("{} cell is not utf-8", column.name()))),
            None => Ok(None),
        }
    }

    fn read_id_list(&self, column: &Column, idx: EventIdx) -> Result<Vec<String>> {
        match column.get(&u64_key(idx))? {
            Some(raw) => serde_json::from_slice(&raw).map_err(Error::from),
            None => Ok(Vec::new()),
        }
    }
}

fn room_prefix(room_id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(room_id.len() + 1);
    key.extend_from_slice(room_id.as_bytes());
    key.push(SEP);
    key
}

fn room_scoped_key(room_id: &str, tail: &[u8]) -> Vec<u8> {
    let mut key = room_prefix(room_id);
    key.extend_from_slice(tail);
    key
}

pub fn room_events_key(room_id: &str, depth: u64, idx: EventIdx) -> Vec<u8> {
    let mut key = room_prefix(room_id);
    key.extend_from_slice(&u64_key(depth));
    key.extend_from_slice(&u64_key(idx));
    key
}

pub fn room_state_key(room_id: &str, event_type: &str, state_key: &str) -> Vec<u8> {
    let mut key = room_prefix(room_id);
    key.extend_from_slice(event_type.as_bytes());
    key.push(SEP);
    key.extend_from_slice(state_key.as_bytes());
    key
}

fn parse_room_events_key(key: &[u8], prefix_len: usize) -> Result<(u64, EventIdx)> {
    let rest = &key[prefix_len..];
    if rest.len() != 16 {
        return Err(Error::Storage("malformed room_events key".into()));
    }
    Ok((u64_from(&rest[..8])?, u64_from(&rest[8..])?))
}

fn pack_idxs(idxs: &[EventIdx]) -> Vec<u8> {
    let mut out = Vec::with_capacity(idxs.len() * 8);
    for idx in idxs {
        out.extend_from_slice(&u64_key(*idx));
    }
    out
}

fn unpack_idxs(raw: &[u8]) -> Result<Vec<EventIdx>> {
    if raw.len() % 8 != 0 {
        return Err(Error::Storage("malformed auth_chain row".into()));
    }
    raw.chunks_exact(8).map(u64_from).collect()
}

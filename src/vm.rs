//! The event submission pipeline.
//!
//! One entry point per event. Phases, in order, each a suspension point:
//! conformance, duplicate, hash & signature, auth-chain materialization,
//! prev materialization, authorize, persist, publish. A per-room logical
//! lock serializes the authorize-through-publish window, so at most one
//! event per room is validating at a time; submissions to different rooms
//! interleave freely at any await.
//!
//! Terminal failures (conformance, crypto, auth) reject the event with
//! nothing written. Transient failures (fetch, storage) retry with
//! exponential backoff bounded by the per-submission deadline. The persist
//! batch is atomic across every column it touches, so no partial write can
//! survive an abort.

use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    rc::Rc,
    sync::Arc,
    time::Duration,
};

use rocksdb::WriteBatch;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::{
    dbs::{Dbs, EventIdx, WriteOpts},
    error::{Error, Phase, Result},
    event::{self, Conforms, Event},
    fetch::{FetchContext, Fetcher},
    room::{auth, Room},
    sched::{Note, Offload},
    signing::KeyStore,
    state::{self, StateMap, StateView},
};

#[derive(Debug, Clone)]
pub struct VmOpts {
    pub server_name: String,
    /// Wall-clock bound for one submission, fetches included.
    pub submit_deadline: Duration,
    /// Storage retry schedule inside the deadline.
    pub retry_attempts: u32,
    pub retry_backoff: Duration,
    /// Recursion bound for fetched dependencies.
    pub max_fetch_depth: u32,
}

impl Default for VmOpts {
    fn default() -> Self {
        Self {
            server_name: String::new(),
            submit_deadline: Duration::from_secs(30),
            retry_attempts: 3,
            retry_backoff: Duration::from_millis(100),
            max_fetch_depth: 8,
        }
    }
}

/// Per-room control: the validation lock, the publish sequence, and the
/// notes of subscribers waiting on the head advancing.
struct RoomCtl {
    lock: tokio::sync::Mutex<()>,
    sequence: Cell<u64>,
    waiters: RefCell<Vec<Note>>,
}

impl RoomCtl {
    fn new() -> Self {
        Self {
            lock: tokio::sync::Mutex::new(()),
            sequence: Cell::new(0),
            waiters: RefCell::new(Vec::new()),
        }
    }

    fn publish(&self) {
        self.sequence.set(self.sequence.get() + 1);
        for note in self.waiters.borrow().iter() {
            note.notify();
        }
    }
}

pub struct Vm {
    dbs: Arc<Dbs>,
    keys: Rc<RefCell<KeyStore>>,
    fetcher: Option<Rc<Fetcher>>,
    /// Batch commits block; they run on the offload workers when present so
    /// the scheduler thread stays responsive.
    offload: Option<Rc<Offload>>,
    /// One batch in flight at a time: index allocation reads the counter the
    /// previous commit wrote, and commits take their global sequence in
    /// submission order.
    commit_lock: tokio::sync::Mutex<()>,
    rooms: RefCell<HashMap<String, Rc<RoomCtl>>>,
    opts: VmOpts,
}

impl Vm {
    pub fn new(
        dbs: Arc<Dbs>,
        keys: Rc<RefCell<KeyStore>>,
        fetcher: Option<Rc<Fetcher>>,
        offload: Option<Rc<Offload>>,
        opts: VmOpts,
    ) -> Self {
        Self {
            dbs,
            keys,
            fetcher,
            offload,
            commit_lock: tokio::sync::Mutex::new(()),
            rooms: RefCell::new(HashMap::new()),
            opts,
        }
    }

    pub fn dbs(&self) -> &Arc<Dbs> {
        &self.dbs
    }

    /// Run the full pipeline for one event. Idempotent on duplicates.
    pub async fn submit(&self, room_id: &str, value: Value) -> Result<String> {
        match tokio::time::timeout(
            self.opts.submit_deadline,
            self.submit_inner(room_id, value, 0),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout),
        }
    }

    fn submit_boxed<'a>(
        &'a self,
        room_id: &'a str,
        value: Value,
        depth: u32,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<String>> + 'a>> {
        Box::pin(self.submit_inner(room_id, value, depth))
    }

    async fn submit_inner(&self, room_id: &str, value: Value, fetch_depth: u32) -> Result<String> {
        // phase 1: conformance, before any database access
        let event = self.conformance(room_id, &value)?;
        let event_id = event
            .event_id
            .clone()
            .expect("conformance requires an event id");

        // phase 2: duplicate submissions succeed idempotently
        if self
            .dbs
            .exists(&event_id)
            .map_err(|e| e.in_phase(Phase::Duplicate))?
        {
            debug!(event_id, "duplicate submission");
            return Ok(event_id);
        }

        // phase 3: content hash, id, and origin signature
        self.crypto_checks(&event, &value)
            .map_err(|e| e.in_phase(Phase::Crypto))?;

        // phase 4: auth chain present locally, fetching what is missing
        self.materialize(room_id, &event.origin, &event.auth_events, fetch_depth)
            .await
            .map_err(|e| e.in_phase(Phase::AuthChain))?;

        // phase 5 (fetch half): prev events present locally
        if !event.is_create() {
            self.materialize(room_id, &event.origin, &event.prev_events, fetch_depth)
                .await
                .map_err(|e| e.in_phase(Phase::Prev))?;
        }

        // phases 5–8 run under the room's logical lock
        let ctl = self.room_ctl(room_id);
        let _guard = ctl.lock.lock().await;

        let prev_idxs = self
            .resolve_prevs(&event)
            .map_err(|e| e.in_phase(Phase::Prev))?;

        // phase 6: authorize against the state at prev_events
        self.authorize(&event, &prev_idxs)
            .map_err(|e| e.in_phase(Phase::Authorize))?;

        // phase 7: one atomic batch, retried on transient storage errors
        let idx = self
            .persist(&event, &value, &prev_idxs)
            .await
            .map_err(|e| e.in_phase(Phase::Persist))?;

        // phase 8: wake sync waiters on this room
        ctl.publish();
        info!(event_id, idx, room_id, "event persisted");

        Ok(event_id)
    }

    fn conformance(&self, room_id: &str, value: &Value) -> Result<Event> {
        event::check_size(value).map_err(|e| e.in_phase(Phase::Conformance))?;
        let event = Event::from_value(value).map_err(|e| e.in_phase(Phase::Conformance))?;

        if event.room_id != room_id {
            return Err(Error::Conformance(format!(
                "event belongs to {}, submitted for {room_id}",
                event.room_id
            ))
            .in_phase(Phase::Conformance));
        }

        // prev_state is legacy-advisory; modern events do not carry it
        let skip = Conforms::mask(&[event::Code::MISSING_PREV_STATE]);
        let report = Conforms::check_masked(&event, skip);
        if !report.clean() {
            return Err(Error::Conformance(report.to_string()).in_phase(Phase::Conformance));
        }
        Ok(event)
    }

    fn crypto_checks(&self, event: &Event, value: &Value) -> Result<()> {
        event::verify_content_hash(value)?;
        event::verify_event_id(value)?;
        self.keys.borrow().verify_event(value, &event.origin)
    }

    /// Ensure the referenced events exist locally, invoking fetch for any
    /// that are missing. Fetched events are inserted through the pipeline,
    /// which may recurse further, bounded by `max_fetch_depth`.
    async fn materialize(
        &self,
        room_id: &str,
        origin_hint: &str,
        ids: &[String],
        fetch_depth: u32,
    ) -> Result<()> {
        for id in ids {
            if self.dbs.exists(id)? {
                continue;
            }

            let Some(fetcher) = &self.fetcher else {
                return Err(Error::StateMissing(format!(
                    "{id} not present and no fetcher configured"
                )));
            };

            if fetch_depth >= self.opts.max_fetch_depth {
                return Err(Error::StateMissing(format!(
                    "{id} missing beyond fetch depth {fetch_depth}"
                )));
            }

            let ctx = FetchContext {
                room_id: room_id.to_owned(),
                origin_hint: origin_hint.to_owned(),
                peers: self.dbs.joined_origins(room_id)?,
            };
            let fetched = fetcher.fetch(&ctx, id).await?;
            self.submit_boxed(room_id, fetched, fetch_depth + 1).await?;
        }
        Ok(())
    }

    fn resolve_prevs(&self, event: &Event) -> Result<Vec<EventIdx>> {
        let mut prev_idxs = Vec::with_capacity(event.prev_events.len());
        for prev_id in &event.prev_events {
            let idx = self
                .dbs
                .idx_of(prev_id)?
                .ok_or_else(|| Error::StateMissing(format!("prev event {prev_id} not present")))?;
            prev_idxs.push(idx);
        }
        Ok(prev_idxs)
    }

    fn authorize(&self, event: &Event, prev_idxs: &[EventIdx]) -> Result<()> {
        let room = Room::new(&self.dbs, &event.room_id);

        if event.is_create() {
            if room.exists()? {
                return Err(Error::Auth(format!(
                    "room {} already has a create event",
                    event.room_id
                )));
            }
        }

        room.check_dag(event, prev_idxs)?;

        let state = state::state_at(&self.dbs, prev_idxs)?;
        let view = StateView::new(&self.dbs, &state);
        auth::authorize(event, &view)
    }

    async fn persist(
        &self,
        event: &Event,
        value: &Value,
        prev_idxs: &[EventIdx],
    ) -> Result<EventIdx> {
        let mut backoff = self.opts.retry_backoff;
        let mut last_err = None;

        for attempt in 0..self.opts.retry_attempts.max(1) {
            if attempt > 0 {
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }

            let commit_guard = self.commit_lock.lock().await;

            let (batch, idx) = match self.build_batch(event, value, prev_idxs) {
                Ok(built) => built,
                Err(err) if err.is_transient() => {
                    warn!(attempt, %err, "persist batch assembly failed");
                    last_err = Some(err);
                    continue;
                }
                Err(err) => return Err(err),
            };

            let committed = match &self.offload {
                Some(offload) => {
                    let dbs = self.dbs.clone();
                    offload.run(move || dbs.commit(batch)).await?
                }
                None => self.dbs.commit(batch),
            };
            drop(commit_guard);

            match committed {
                Ok(()) => return Ok(idx),
                Err(err) if err.is_transient() => {
                    warn!(attempt, %err, "persist commit failed");
                    last_err = Some(err);
                }
                Err(err) => return Err(err),
            }
        }

        Err(last_err.unwrap_or_else(|| Error::Storage("persist retries exhausted".into())))
    }

    /// Assemble the whole batch: attribute columns, room_events, head
    /// delta, auth_chain row, and the resolved room_state delta.
    fn build_batch(
        &self,
        event: &Event,
        value: &Value,
        prev_idxs: &[EventIdx],
    ) -> Result<(WriteBatch, EventIdx)> {
        let mut batch = WriteBatch::default();
        let idx = self.dbs.allocate_idx(&mut batch)?;

        let auth_chain = state::auth_chain_for(&self.dbs, &event.auth_events)?;
        let opts = WriteOpts {
            idx,
            prev_idxs: prev_idxs.to_vec(),
            auth_chain,
        };
        self.dbs.write_event(&mut batch, event, value, &opts)?;

        let stored = self.dbs.room_state(&event.room_id)?;
        let head_idxs: Vec<EventIdx> = self
            .dbs
            .heads(&event.room_id)?
            .into_iter()
            .map(|(head_idx, _)| head_idx)
            .collect();

        // linear extension of the whole head set takes the incremental
        // path; anything else re-derives and, on forks, resolves
        let linear = !head_idxs.is_empty()
            && head_idxs.len() == prev_idxs.len()
            && head_idxs.iter().all(|h| prev_idxs.contains(h));

        let resolved: StateMap = if linear {
            let mut map: StateMap = stored.iter().cloned().collect();
            if let Some((event_type, state_key)) = event.state_pair() {
                map.insert((event_type.to_owned(), state_key.to_owned()), idx);
            }
            map
        } else {
            let mut new_branch = state::state_at(&self.dbs, prev_idxs)?;
            if let Some((event_type, state_key)) = event.state_pair() {
                new_branch.insert((event_type.to_owned(), state_key.to_owned()), idx);
            }

            let surviving: Vec<EventIdx> = head_idxs
                .iter()
                .copied()
                .filter(|head_idx| !prev_idxs.contains(head_idx))
                .collect();

            if surviving.is_empty() {
                new_branch
            } else {
                let mut branches = vec![new_branch];
                for head in &surviving {
                    branches.push(state::state_after(&self.dbs, *head)?);
                }
                state::resolve_branches(&self.dbs, &branches)?
            }
        };
        for (key, old_idx) in &stored {
            match resolved.get(key) {
                Some(new_idx) if new_idx != old_idx => {
                    self.dbs
                        .write_room_state(&mut batch, &event.room_id, &key.0, &key.1, *new_idx)?;
                }
                Some(_) => {}
                None => {
                    self.dbs
                        .delete_room_state(&mut batch, &event.room_id, &key.0, &key.1)?;
                }
            }
        }
        for (key, new_idx) in &resolved {
            if !stored.iter().any(|(stored_key, _)| stored_key == key) {
                self.dbs
                    .write_room_state(&mut batch, &event.room_id, &key.0, &key.1, *new_idx)?;
            }
        }

        Ok((batch, idx))
    }

    fn room_ctl(&self, room_id: &str) -> Rc<RoomCtl> {
        self.rooms
            .borrow_mut()
            .entry(room_id.to_owned())
            .or_insert_with(|| Rc::new(RoomCtl::new()))
            .clone()
    }

    /// Register a subscriber note woken whenever this room's head advances.
    pub fn watch(&self, room_id: &str) -> Note {
        let ctl = self.room_ctl(room_id);
        let note = Note::new();
        ctl.waiters.borrow_mut().push(note.clone());
        note
    }

    /// Remove a subscriber note registered with [`Vm::watch`].
    pub fn unwatch(&self, room_id: &str, note: &Note) {
        if let Some(ctl) = self.rooms.borrow().get(room_id) {
            ctl.waiters.borrow_mut().retain(|n| !n.same_as(note));
        }
    }

    pub fn room_sequence(&self, room_id: &str) -> u64 {
        self.room_ctl(room_id).sequence.get()
    }
}

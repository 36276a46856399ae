//! Rooms and DAG traversal.
//!
//! A room is the set of validated events belonging to a room id, its head
//! set (tips with no successors), and the resolved current-state mapping.
//! The handle here is a read view over the schema columns; all mutation
//! happens through the VM's write batches.

pub mod auth;

use std::collections::{HashSet, VecDeque};

use crate::{
    dbs::{Dbs, EventIdx},
    error::{Error, Result},
    event::Event,
};

pub struct Room<'a> {
    dbs: &'a Dbs,
    room_id: String,
}

impl<'a> Room<'a> {
    pub fn new(dbs: &'a Dbs, room_id: impl Into<String>) -> Self {
        Self {
            dbs,
            room_id: room_id.into(),
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn exists(&self) -> Result<bool> {
        Ok(!self.dbs.heads(&self.room_id)?.is_empty())
    }

    /// Current DAG tips as (idx, event_id).
    pub fn heads(&self) -> Result<Vec<(EventIdx, String)>> {
        self.dbs.heads(&self.room_id)
    }

    /// Maximum depth across the room.
    pub fn depth(&self) -> Result<u64> {
        let events = self.dbs.room_events(&self.room_id)?;
        Ok(events.last().map(|(depth, _)| *depth).unwrap_or(0))
    }

    /// (depth, idx) pairs in ascending order.
    pub fn events(&self) -> Result<Vec<(u64, EventIdx)>> {
        self.dbs.room_events(&self.room_id)
    }

    pub fn joined_origins(&self) -> Result<Vec<String>> {
        self.dbs.joined_origins(&self.room_id)
    }

    pub fn event(&self, idx: EventIdx) -> Result<Option<Event>> {
        self.dbs.event(idx)
    }

    /// Breadth-first walk of the prev graph from the given indexes,
    /// inclusive, deduplicated.
    pub fn ancestors(&self, from: &[EventIdx]) -> Result<Vec<EventIdx>> {
        let mut seen: HashSet<EventIdx> = from.iter().copied().collect();
        let mut queue: VecDeque<EventIdx> = from.iter().copied().collect();
        let mut out = Vec::new();

        while let Some(idx) = queue.pop_front() {
            out.push(idx);
            for prev_id in self.dbs.prev_events_of(idx)? {
                if let Some(prev_idx) = self.dbs.idx_of(&prev_id)? {
                    if seen.insert(prev_idx) {
                        queue.push_back(prev_idx);
                    }
                }
            }
        }

        Ok(out)
    }

    /// Whether `ancestor` appears in the transitive prev closure of `of`.
    pub fn is_ancestor(&self, ancestor: EventIdx, of: EventIdx) -> Result<bool> {
        if ancestor == of {
            return Ok(false);
        }
        Ok(self.ancestors(&[of])?[1..].contains(&ancestor))
    }

    /// DAG invariants for an incoming event against its resolved prevs:
    /// strict depth monotonicity and no self-ancestry. Existence of the
    /// prevs was established by the VM before this runs.
    pub fn check_dag(&self, event: &Event, prev_idxs: &[EventIdx]) -> Result<()> {
        if event.is_create() {
            if event.depth != 0 || !event.prev_events.is_empty() {
                return Err(Error::Auth(
                    "create events carry depth 0 and no prev_events".into(),
                ));
            }
            return Ok(());
        }

        let mut max_prev_depth = 0u64;
        for prev in prev_idxs {
            let depth = self
                .dbs
                .depth_of(*prev)?
                .ok_or_else(|| Error::StateMissing(format!("prev idx {prev} has no depth")))?;
            max_prev_depth = max_prev_depth.max(depth);
        }

        let depth = u64::try_from(event.depth)
            .map_err(|_| Error::Conformance("depth is negative".into()))?;
        if depth <= max_prev_depth {
            return Err(Error::Auth(format!(
                "depth {depth} does not exceed prev maximum {max_prev_depth}"
            )));
        }

        if let Some(event_id) = event.event_id.as_deref() {
            for prev in prev_idxs {
                for candidate in self.ancestors(&[*prev])? {
                    if self
                        .dbs
                        .event(candidate)?
                        .and_then(|e| e.event_id)
                        .as_deref()
                        == Some(event_id)
                    {
                        return Err(Error::Auth(
                            "event appears in its own prev closure".into(),
                        ));
                    }
                }
            }
        }

        Ok(())
    }
}

//! State application and resolution.
//!
//! Room state is the deterministic result of applying an ordering to the
//! event DAG. A single linear head takes the forward-application path; when
//! heads fork, the conflicting branches are resolved per state key:
//!
//! 1. unconflicted keys (identical in all branches) are adopted directly;
//! 2. conflicted power events are ordered by the auth-chain partial order,
//!    ties broken by origin_server_ts ascending then event_id ascending, and
//!    applied iteratively with an authorization re-check against the partial
//!    resolved state at each step;
//! 3. the remaining conflicted events follow in the same ordering.
//!
//! The first candidate for a key that passes its re-check claims the key;
//! failing candidates are dropped. These orderings are load-bearing: any
//! deviation forks the room's state from the rest of the federation.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use tracing::debug;

use crate::{
    dbs::{Dbs, EventIdx},
    error::{Error, Result},
    event::Event,
    room::auth::{self, AuthState},
};

/// Resolved state: `(type, state_key) → event_idx`.
pub type StateMap = BTreeMap<(String, String), EventIdx>;

/// Read view over a state map, backed by the attribute columns.
pub struct StateView<'a> {
    dbs: &'a Dbs,
    map: &'a StateMap,
}

impl<'a> StateView<'a> {
    pub fn new(dbs: &'a Dbs, map: &'a StateMap) -> Self {
        Self { dbs, map }
    }

    pub fn get(&self, event_type: &str, state_key: &str) -> Result<Option<Event>> {
        match self
            .map
            .get(&(event_type.to_owned(), state_key.to_owned()))
        {
            Some(idx) => self.dbs.event(*idx),
            None => Ok(None),
        }
    }
}

impl AuthState for StateView<'_> {
    fn create(&self) -> Result<Option<Event>> {
        self.get("m.room.create", "")
    }

    fn power_levels(&self) -> Result<Option<Event>> {
        self.get("m.room.power_levels", "")
    }

    fn join_rules(&self) -> Result<Option<Event>> {
        self.get("m.room.join_rules", "")
    }

    fn member(&self, user: &str) -> Result<Option<Event>> {
        self.get("m.room.member", user)
    }
}

/// Transitive auth closure of a set of auth_events ids, as indexes. Errors
/// with `StateMissing` when a referenced event is absent locally.
pub fn auth_chain_for(dbs: &Dbs, auth_ids: &[String]) -> Result<Vec<EventIdx>> {
    let mut closure = BTreeSet::new();
    for auth_id in auth_ids {
        let idx = dbs
            .idx_of(auth_id)?
            .ok_or_else(|| Error::StateMissing(format!("auth event {auth_id} not present")))?;
        closure.insert(idx);
        match dbs.auth_chain_of(idx)? {
            Some(chain) => closure.extend(chain),
            None => closure.extend(walk_auth_chain(dbs, idx)?),
        }
    }
    Ok(closure.into_iter().collect())
}

/// Fallback closure walk for rows written before the memo column existed.
fn walk_auth_chain(dbs: &Dbs, idx: EventIdx) -> Result<Vec<EventIdx>> {
    let mut seen = BTreeSet::new();
    let mut queue = vec![idx];
    while let Some(cur) = queue.pop() {
        for auth_id in dbs.auth_events_of(cur)? {
            let auth_idx = dbs.idx_of(&auth_id)?.ok_or_else(|| {
                Error::StateMissing(format!("auth event {auth_id} not present"))
            })?;
            if seen.insert(auth_idx) {
                queue.push(auth_idx);
            }
        }
    }
    Ok(seen.into_iter().collect())
}

/// Forward-only state application: the state after a persisted event, built
/// by replaying its ancestor closure in (depth, idx) order.
pub fn state_after(dbs: &Dbs, head: EventIdx) -> Result<StateMap> {
    let mut closure = HashSet::new();
    let mut queue = vec![head];
    closure.insert(head);
    while let Some(cur) = queue.pop() {
        for prev_id in dbs.prev_events_of(cur)? {
            if let Some(prev_idx) = dbs.idx_of(&prev_id)? {
                if closure.insert(prev_idx) {
                    queue.push(prev_idx);
                }
            }
        }
    }

    let mut ordered: Vec<(u64, EventIdx)> = Vec::with_capacity(closure.len());
    for idx in closure {
        let depth = dbs
            .depth_of(idx)?
            .ok_or_else(|| Error::StateMissing(format!("event idx {idx} has no depth")))?;
        ordered.push((depth, idx));
    }
    ordered.sort_unstable();

    let mut map = StateMap::new();
    for (_, idx) in ordered {
        if let Some(state_key) = dbs.state_key_of(idx)? {
            if let Some(event_type) = dbs.type_of(idx)? {
                map.insert((event_type, state_key), idx);
            }
        }
    }
    Ok(map)
}

/// Resolved state across a set of persisted heads.
pub fn state_at(dbs: &Dbs, heads: &[EventIdx]) -> Result<StateMap> {
    match heads {
        [] => Ok(StateMap::new()),
        [single] => state_after(dbs, *single),
        many => {
            let mut branches = Vec::with_capacity(many.len());
            for head in many {
                branches.push(state_after(dbs, *head)?);
            }
            resolve_branches(dbs, &branches)
        }
    }
}

/// Resolve conflicting branch states into one mapping.
pub fn resolve_branches(dbs: &Dbs, branches: &[StateMap]) -> Result<StateMap> {
    debug_assert!(branches.len() > 1);

    let mut keys: BTreeSet<&(String, String)> = BTreeSet::new();
    for branch in branches {
        keys.extend(branch.keys());
    }

    let mut resolved = StateMap::new();
    let mut conflicted: Vec<EventIdx> = Vec::new();
    let mut conflicted_keys: BTreeSet<(String, String)> = BTreeSet::new();

    for key in keys {
        let candidates: BTreeSet<EventIdx> = branches
            .iter()
            .filter_map(|branch| branch.get(key))
            .copied()
            .collect();
        let all_present = branches.iter().all(|branch| branch.contains_key(key));

        if candidates.len() == 1 && all_present {
            resolved.insert(key.clone(), *candidates.iter().next().expect("nonempty"));
        } else {
            conflicted_keys.insert(key.clone());
            conflicted.extend(candidates);
        }
    }

    if conflicted.is_empty() {
        return Ok(resolved);
    }
    debug!(
        keys = conflicted_keys.len(),
        candidates = conflicted.len(),
        "resolving conflicted state"
    );

    let mut power = Vec::new();
    let mut rest = Vec::new();
    for idx in conflicted {
        if is_power_event(dbs, idx)? {
            power.push(idx);
        } else {
            rest.push(idx);
        }
    }

    let mut claimed: BTreeSet<(String, String)> = BTreeSet::new();
    apply_ordered(dbs, order_conflicted(dbs, power)?, &mut resolved, &mut claimed)?;
    apply_ordered(dbs, order_conflicted(dbs, rest)?, &mut resolved, &mut claimed)?;

    Ok(resolved)
}

/// Iterative application with re-authorization; first valid candidate per
/// key wins, failures are dropped.
fn apply_ordered(
    dbs: &Dbs,
    ordered: Vec<EventIdx>,
    resolved: &mut StateMap,
    claimed: &mut BTreeSet<(String, String)>,
) -> Result<()> {
    for idx in ordered {
        let Some(event) = dbs.event(idx)? else {
            continue;
        };
        let Some((event_type, state_key)) = event.state_pair() else {
            continue;
        };
        let key = (event_type.to_owned(), state_key.to_owned());
        if claimed.contains(&key) {
            continue;
        }

        let authorized = if event.is_create() {
            true
        } else {
            let view = StateView::new(dbs, resolved);
            match auth::authorize(&event, &view) {
                Ok(()) => true,
                Err(Error::Auth(reason)) | Err(Error::StateMissing(reason)) => {
                    debug!(idx, %reason, "candidate dropped during resolution");
                    false
                }
                Err(other) => return Err(other),
            }
        };

        if authorized {
            resolved.insert(key.clone(), idx);
            claimed.insert(key);
        }
    }
    Ok(())
}

/// Power events steer authorization itself and resolve first.
fn is_power_event(dbs: &Dbs, idx: EventIdx) -> Result<bool> {
    let Some(event_type) = dbs.type_of(idx)? else {
        return Ok(false);
    };
    match event_type.as_str() {
        "m.room.power_levels" | "m.room.join_rules" => Ok(true),
        "m.room.member" => {
            let membership = dbs
                .event(idx)?
                .and_then(|e| e.membership().map(str::to_owned));
            Ok(membership.as_deref() == Some("ban"))
        }
        _ => Ok(false),
    }
}

/// Order conflicted candidates: the auth-chain partial order first (an
/// event ordered after anything in its own auth chain), ties broken by
/// origin_server_ts ascending, then event_id ascending.
fn order_conflicted(dbs: &Dbs, candidates: Vec<EventIdx>) -> Result<Vec<EventIdx>> {
    if candidates.len() <= 1 {
        return Ok(candidates);
    }

    let set: HashSet<EventIdx> = candidates.iter().copied().collect();
    let mut blocking: HashMap<EventIdx, HashSet<EventIdx>> = HashMap::new();
    let mut tiebreak: HashMap<EventIdx, (i64, String)> = HashMap::new();

    for idx in &candidates {
        let chain = match dbs.auth_chain_of(*idx)? {
            Some(chain) => chain,
            None => walk_auth_chain(dbs, *idx)?,
        };
        let within: HashSet<EventIdx> =
            chain.into_iter().filter(|c| set.contains(c)).collect();
        blocking.insert(*idx, within);

        let ts = dbs.origin_ts_of(*idx)?.unwrap_or(0);
        let event_id = dbs
            .event(*idx)?
            .and_then(|e| e.event_id)
            .unwrap_or_default();
        tiebreak.insert(*idx, (ts, event_id));
    }

    let mut emitted: HashSet<EventIdx> = HashSet::new();
    let mut out = Vec::with_capacity(candidates.len());
    let mut remaining: Vec<EventIdx> = candidates;

    while !remaining.is_empty() {
        let mut ready: Vec<EventIdx> = remaining
            .iter()
            .copied()
            .filter(|idx| blocking[idx].iter().all(|dep| emitted.contains(dep)))
            .collect();

        // a cycle cannot arise from a valid auth graph; release everything
        // rather than spin if one ever does
        if ready.is_empty() {
            ready = remaining.clone();
        }

        ready.sort_by(|a, b| tiebreak[a].cmp(&tiebreak[b]));
        let next = ready[0];
        emitted.insert(next);
        remaining.retain(|idx| *idx != next);
        out.push(next);
    }

    Ok(out)
}

//! Federation completion.
//!
//! Missing events, auth chains, and state are obtained from peer servers
//! through an injected [`EventSource`] (the federation client adapter).
//! Concurrency is bounded per origin, transient failures retry with
//! exponential backoff, and permanent failures are memoized so the same
//! unfetchable id cannot thrash the pipeline.

use std::{
    cell::RefCell,
    collections::{HashMap, HashSet},
    rc::Rc,
    time::Duration,
};

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Where fetches go: implemented by the federation HTTP adapter outside the
/// core, and by fakes in tests.
#[async_trait(?Send)]
pub trait EventSource {
    /// Retrieve one event by id from the given origin. May suspend
    /// arbitrarily long; the caller bounds it with a deadline.
    async fn fetch_event(&self, origin: &str, room_id: &str, event_id: &str) -> Result<Value>;
}

#[derive(Debug, Clone)]
pub struct FetchOpts {
    /// In-flight request bound per origin server.
    pub per_origin: usize,
    /// Retry attempts before an id is recorded as permanently failed.
    pub attempts: u32,
    /// Base backoff delay, doubled per attempt.
    pub backoff: Duration,
}

impl Default for FetchOpts {
    fn default() -> Self {
        Self {
            per_origin: 4,
            attempts: 3,
            backoff: Duration::from_millis(250),
        }
    }
}

/// Context for one fetch: the room and the peers believed to hold the event.
#[derive(Debug, Clone)]
pub struct FetchContext {
    pub room_id: String,
    pub origin_hint: String,
    pub peers: Vec<String>,
}

pub struct Fetcher {
    source: Rc<dyn EventSource>,
    opts: FetchOpts,
    limits: RefCell<HashMap<String, Rc<tokio::sync::Semaphore>>>,
    failed: RefCell<HashSet<String>>,
}

impl Fetcher {
    pub fn new(source: Rc<dyn EventSource>, opts: FetchOpts) -> Self {
        Self {
            source,
            opts,
            limits: RefCell::new(HashMap::new()),
            failed: RefCell::new(HashSet::new()),
        }
    }

    /// Whether this id already failed permanently.
    pub fn is_poisoned(&self, event_id: &str) -> bool {
        self.failed.borrow().contains(event_id)
    }

    /// Fetch one event, trying the origin hint first and then each peer.
    /// Returns the raw event for the caller (the VM) to validate and
    /// insert; insertion may recursively fetch.
    pub async fn fetch(&self, ctx: &FetchContext, event_id: &str) -> Result<Value> {
        if self.is_poisoned(event_id) {
            return Err(Error::StateMissing(format!(
                "{event_id} previously failed to fetch"
            )));
        }

        let mut origins = Vec::with_capacity(ctx.peers.len() + 1);
        origins.push(ctx.origin_hint.clone());
        for peer in &ctx.peers {
            if *peer != ctx.origin_hint {
                origins.push(peer.clone());
            }
        }

        let mut last_err = Error::StateMissing(format!("no origins to fetch {event_id} from"));
        for origin in origins {
            match self.fetch_from(&origin, &ctx.room_id, event_id).await {
                Ok(value) => return Ok(value),
                Err(Error::Interrupted) => return Err(Error::Interrupted),
                Err(err) => {
                    debug!(%origin, event_id, %err, "fetch attempt failed");
                    last_err = err;
                }
            }
        }

        self.failed.borrow_mut().insert(event_id.to_owned());
        warn!(event_id, %last_err, "event recorded as permanently unfetchable");
        Err(last_err)
    }

    async fn fetch_from(&self, origin: &str, room_id: &str, event_id: &str) -> Result<Value> {
        let limit = self.limit_for(origin);
        let _permit = limit
            .acquire()
            .await
            .map_err(|_| Error::Interrupted)?;

        let mut backoff = self.opts.backoff;
        let mut last_err = Error::Timeout;
        for attempt in 0..self.opts.attempts.max(1) {
            if attempt > 0 {
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
            match self.source.fetch_event(origin, room_id, event_id).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() => last_err = err,
                Err(err) => return Err(err),
            }
        }
        Err(last_err)
    }

    fn limit_for(&self, origin: &str) -> Rc<tokio::sync::Semaphore> {
        self.limits
            .borrow_mut()
            .entry(origin.to_owned())
            .or_insert_with(|| Rc::new(tokio::sync::Semaphore::new(self.opts.per_origin)))
            .clone()
    }
}

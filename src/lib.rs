//! hearth — a federated room-state database with cryptographic event
//! authentication.
//!
//! Rooms are append-only DAGs of signed, content-addressed events. Incoming
//! events pass a validation pipeline (conformance, cryptography, auth-chain
//! completion, authorization, atomic persist, publish) and materialize into
//! per-room resolved state. Everything runs on one OS thread under a
//! cooperative scheduler; persistence is a RocksDB column-family store.

pub mod config;
pub mod core;
pub mod db;
pub mod dbs;
pub mod error;
pub mod event;
pub mod fed;
pub mod fetch;
pub mod json;
pub mod logging;
pub mod room;
pub mod sched;
pub mod signing;
pub mod state;
pub mod vm;

pub use crate::core::{Core, Subscription};
pub use config::Config;
pub use error::{Error, Phase, Result};
pub use event::{Builder, Conforms, Event};
pub use sched::Scheduler;

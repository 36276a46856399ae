//! End-to-end pipeline scenarios: room bootstrap, concurrent per-room
//! ordering, state-resolution tie-breaks, and fetch cancellation.

use std::{cell::Cell, rc::Rc, time::Duration};

use async_trait::async_trait;
use serde_json::{json, Value};
use tempfile::TempDir;

use hearth::{
    config::Config,
    core::Core,
    error::Error,
    event::Builder,
    fetch::EventSource,
    sched::{self, Scheduler, SliceCfg},
};

fn config(dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.server_name = "h".into();
    config.base_dir = dir.path().to_path_buf();
    config
}

fn run<F: std::future::Future>(f: F) -> F::Output {
    Scheduler::new(SliceCfg::default()).unwrap().block_on(f)
}

fn builder(
    event_type: &str,
    room_id: &str,
    sender: &str,
    state_key: Option<&str>,
    content: Value,
    depth: i64,
    prev: Vec<String>,
    auth: Vec<String>,
) -> Builder {
    let mut b = Builder::new(event_type);
    b.room_id = room_id.into();
    b.sender = sender.into();
    b.state_key = state_key.map(str::to_owned);
    b.content = content;
    b.depth = depth;
    b.prev_events = prev;
    b.auth_events = auth;
    b.origin_server_ts = 1000 + depth;
    b
}

async fn bootstrap(core: &Core, room_id: &str) -> (String, String) {
    let create_id = core
        .submit_local(builder(
            "m.room.create",
            room_id,
            "@a:h",
            Some(""),
            json!({"creator": "@a:h"}),
            0,
            vec![],
            vec![],
        ))
        .await
        .unwrap();

    let join_id = core
        .submit_local(builder(
            "m.room.member",
            room_id,
            "@a:h",
            Some("@a:h"),
            json!({"membership": "join"}),
            1,
            vec![create_id.clone()],
            vec![create_id.clone()],
        ))
        .await
        .unwrap();

    (create_id, join_id)
}

#[test]
fn concurrent_rooms_interleave_without_gaps() {
    run(async {
        let dir = tempfile::tempdir().unwrap();
        let core = Rc::new(Core::open(&config(&dir)).unwrap());

        let (create_a, join_a) = bootstrap(&core, "!alpha:h").await;
        let (create_b, join_b) = bootstrap(&core, "!beta:h").await;

        // pre-build each room's chain; ids are content-derived, so each
        // event must be built after its predecessor
        let chain = |room_id: &str, create_id: &str, join_id: &str| {
            let keys = core.server_keys();
            let mut events = Vec::new();
            let mut prev = join_id.to_owned();
            for i in 0..100i64 {
                let b = builder(
                    "m.room.message",
                    room_id,
                    "@a:h",
                    None,
                    json!({"body": format!("message {i}")}),
                    2 + i,
                    vec![prev.clone()],
                    vec![create_id.to_owned()],
                );
                let (event_id, value) = b
                    .build("h", keys.key_id(), keys.signing_key())
                    .unwrap();
                prev = event_id;
                events.push(value);
            }
            events
        };

        let alpha = chain("!alpha:h", &create_a, &join_a);
        let beta = chain("!beta:h", &create_b, &join_b);

        let submit_all = |room_id: &'static str, events: Vec<Value>| {
            let core = core.clone();
            sched::spawn(room_id, async move {
                for value in events {
                    core.submit(room_id, value).await.unwrap();
                }
            })
        };

        let task_a = submit_all("!alpha:h", alpha);
        let task_b = submit_all("!beta:h", beta);
        task_a.join().await.unwrap();
        task_b.join().await.unwrap();

        let mut all_idxs = Vec::new();
        for room_id in ["!alpha:h", "!beta:h"] {
            let events = core.dbs().room_events(room_id).unwrap();
            assert_eq!(events.len(), 102, "{room_id} is missing events");

            // strictly increasing (depth, idx)
            for pair in events.windows(2) {
                assert!(pair[0] < pair[1], "{room_id} order violated: {pair:?}");
            }
            all_idxs.extend(events.into_iter().map(|(_, idx)| idx));
        }

        // the global index space is dense: both rooms together cover a
        // contiguous range with no gaps
        all_idxs.sort_unstable();
        assert_eq!(all_idxs.len(), 204);
        for (offset, idx) in all_idxs.iter().enumerate() {
            assert_eq!(*idx, all_idxs[0] + offset as u64);
        }
    });
}

#[test]
fn forked_state_resolves_to_smaller_event_id() {
    run(async {
        let dir = tempfile::tempdir().unwrap();
        let core = Core::open(&config(&dir)).unwrap();
        let (create_id, join_id) = bootstrap(&core, "!r:h").await;

        // two name events at equal depth and timestamp, forking the DAG
        let make_name = |name: &str| {
            let b = builder(
                "m.room.name",
                "!r:h",
                "@a:h",
                Some(""),
                json!({"name": name}),
                2,
                vec![join_id.clone()],
                vec![create_id.clone()],
            );
            let keys = core.server_keys();
            b.build("h", keys.key_id(), keys.signing_key()).unwrap()
        };

        let (id_left, left) = make_name("left");
        let (id_right, right) = make_name("right");

        core.submit("!r:h", left).await.unwrap();
        core.submit("!r:h", right).await.unwrap();

        let expected = std::cmp::min(id_left.clone(), id_right.clone());
        let resolved = core
            .query_state("!r:h", "m.room.name", "", None)
            .unwrap()
            .unwrap();
        assert_eq!(resolved.event_id.as_deref(), Some(expected.as_str()));

        // resolution is idempotent: merging the fork re-runs it with the
        // same outcome
        core.submit_local(builder(
            "m.room.message",
            "!r:h",
            "@a:h",
            None,
            json!({"body": "merge"}),
            3,
            vec![id_left, id_right],
            vec![create_id],
        ))
        .await
        .unwrap();

        let after_merge = core
            .query_state("!r:h", "m.room.name", "", None)
            .unwrap()
            .unwrap();
        assert_eq!(after_merge.event_id.as_deref(), Some(expected.as_str()));
    });
}

struct HangingSource {
    dropped: Rc<Cell<bool>>,
}

struct DropGuard(Rc<Cell<bool>>);

impl Drop for DropGuard {
    fn drop(&mut self) {
        self.0.set(true);
    }
}

#[async_trait(?Send)]
impl EventSource for HangingSource {
    async fn fetch_event(&self, _origin: &str, _room: &str, _event_id: &str) -> Result<Value, Error> {
        let _guard = DropGuard(self.dropped.clone());
        tokio::time::sleep(Duration::from_secs(3600)).await;
        unreachable!("the deadline interrupts this wait");
    }
}

#[test]
fn hung_fetch_times_out_and_releases_resources() {
    run(async {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(&dir);
        cfg.submit_deadline_ms = 100;

        let dropped = Rc::new(Cell::new(false));
        let source = Rc::new(HangingSource {
            dropped: dropped.clone(),
        });
        let core = Core::open_with(&cfg, Some(source)).unwrap();
        let (create_id, _) = bootstrap(&core, "!r:h").await;

        // references a prev that only the hung fetcher could supply
        let orphan = builder(
            "m.room.message",
            "!r:h",
            "@a:h",
            None,
            json!({"body": "stranded"}),
            9,
            vec!["$nothere:h".to_owned()],
            vec![create_id],
        );

        let started = std::time::Instant::now();
        let err = core.submit_local(orphan).await.unwrap_err();
        assert!(matches!(err, Error::Timeout), "got {err}");
        assert!(started.elapsed() < Duration::from_secs(5));

        // the fetch future was dropped and its scoped resources released
        assert!(dropped.get());
    });
}

#[test]
fn transactions_carry_pdus_through_the_pipeline() {
    run(async {
        let dir = tempfile::tempdir().unwrap();
        let core = Core::open(&config(&dir)).unwrap();
        let (create_id, join_id) = bootstrap(&core, "!r:h").await;

        let keys = core.server_keys();
        let (msg_id, msg) = builder(
            "m.room.message",
            "!r:h",
            "@a:h",
            None,
            json!({"body": "federated"}),
            2,
            vec![join_id],
            vec![create_id],
        )
        .build("h", keys.key_id(), keys.signing_key())
        .unwrap();

        let mut txn = hearth::fed::Transaction::new("h", 12345);
        txn.pdus.push(msg);
        txn.pdus.push(json!({"type": "m.room.message"})); // no room_id
        let signed = txn.sign(keys).unwrap();

        let results = core.ingest_transaction(&signed).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].as_deref().unwrap(), msg_id);
        assert!(matches!(results[1], Err(Error::Protocol { .. })));

        assert!(core.query_event(&msg_id).unwrap().is_some());
    });
}

#[test]
fn rejected_events_leave_nothing_behind() {
    run(async {
        let dir = tempfile::tempdir().unwrap();
        let core = Core::open(&config(&dir)).unwrap();
        let (create_id, join_id) = bootstrap(&core, "!r:h").await;

        let before = core.dbs().room_events("!r:h").unwrap();

        // stranger cannot rename the room
        let err = core
            .submit_local(builder(
                "m.room.name",
                "!r:h",
                "@stranger:h",
                Some(""),
                json!({"name": "mine now"}),
                2,
                vec![join_id],
                vec![create_id],
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Rejected { .. }));

        let after = core.dbs().room_events("!r:h").unwrap();
        assert_eq!(before, after);
        assert!(core
            .query_state("!r:h", "m.room.name", "", None)
            .unwrap()
            .is_none());
    });
}

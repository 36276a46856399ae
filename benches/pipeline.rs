use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use serde_json::json;

use hearth::{
    config::Config,
    core::Core,
    event::Builder,
    sched::{Scheduler, SliceCfg},
};

const CHAIN_LEN: i64 = 64;

fn bench_config(dir: &tempfile::TempDir) -> Config {
    let mut config = Config::default();
    config.server_name = "bench".into();
    config.base_dir = dir.path().to_path_buf();
    config
}

fn build_message(core: &Core, depth: i64, prev: String, create_id: &str) -> (String, serde_json::Value) {
    let mut b = Builder::new("m.room.message");
    b.room_id = "!bench:bench".into();
    b.sender = "@a:bench".into();
    b.content = json!({"body": format!("payload at {depth}")});
    b.depth = depth;
    b.prev_events = vec![prev];
    b.auth_events = vec![create_id.to_owned()];
    b.origin_server_ts = depth;
    let keys = core.server_keys();
    b.build("bench", keys.key_id(), keys.signing_key()).unwrap()
}

fn submit_throughput(c: &mut Criterion) {
    let scheduler = Scheduler::new(SliceCfg::default()).unwrap();

    c.bench_function("submit_linear_chain", |b| {
        b.iter_batched(
            || {
                let dir = tempfile::tempdir().unwrap();
                let config = bench_config(&dir);
                scheduler.block_on(async {
                    let core = Core::open(&config).unwrap();

                    let mut builder = Builder::new("m.room.create");
                    builder.room_id = "!bench:bench".into();
                    builder.sender = "@a:bench".into();
                    builder.state_key = Some(String::new());
                    builder.content = json!({"creator": "@a:bench"});
                    builder.origin_server_ts = 1;
                    let create_id = core.submit_local(builder).await.unwrap();

                    let mut builder = Builder::new("m.room.member");
                    builder.room_id = "!bench:bench".into();
                    builder.sender = "@a:bench".into();
                    builder.state_key = Some("@a:bench".into());
                    builder.content = json!({"membership": "join"});
                    builder.depth = 1;
                    builder.prev_events = vec![create_id.clone()];
                    builder.auth_events = vec![create_id.clone()];
                    builder.origin_server_ts = 2;
                    let join_id = core.submit_local(builder).await.unwrap();

                    let mut prev = join_id;
                    let mut events = Vec::new();
                    for depth in 2..(2 + CHAIN_LEN) {
                        let (event_id, value) = build_message(&core, depth, prev, &create_id);
                        prev = event_id;
                        events.push(value);
                    }
                    (dir, core, events)
                })
            },
            |(dir, core, events)| {
                scheduler.block_on(async {
                    for value in events {
                        core.submit("!bench:bench", value).await.unwrap();
                    }
                });
                drop(core);
                drop(dir);
            },
            BatchSize::PerIteration,
        );
    });
}

fn event_hashing(c: &mut Criterion) {
    let value = json!({
        "type": "m.room.message",
        "room_id": "!bench:bench",
        "sender": "@a:bench",
        "origin": "bench",
        "origin_server_ts": 1,
        "depth": 7,
        "prev_events": ["$prev:bench"],
        "auth_events": ["$create:bench"],
        "content": {"body": "a moderately sized message body for hashing"},
        "hashes": {},
        "signatures": {},
    });

    c.bench_function("reference_hash", |b| {
        b.iter(|| hearth::event::reference_hash(std::hint::black_box(&value)).unwrap());
    });

    c.bench_function("content_hash", |b| {
        b.iter(|| hearth::event::content_hash(std::hint::black_box(&value)).unwrap());
    });
}

criterion_group!(benches, submit_throughput, event_hashing);
criterion_main!(benches);

//! End-to-end engine tests against a SQLite store

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rowkeep_common::{ErrorCode, Field, FieldValue, NodeConfig};
use rowkeep_core::binlog::list_files;
use rowkeep_core::{CommandKind, Engine, RecordStatus, Request, WriteBackFlag};
use rowkeep_sql::{FieldSelection, TableMeta, install_table, open_connection};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tempfile::tempdir;

const USERS: &str = "name:string:,age:int:0";

fn config(root: &Path) -> NodeConfig {
    let mut config = NodeConfig::default();
    config.cache.shard_count = 2;
    config.cache.evict_interval_ms = 60_000;
    config.binlog.dir = root.join("binlog");
    config.binlog.flush_interval_ms = 5;
    config.sql.path = root.join("store.db");
    config.sql.connections = 2;
    config
}

fn install(config: &NodeConfig, table: &str, conf: &str) {
    let conn = open_connection(&config.sql).unwrap();
    install_table(&conn, &TableMeta::parse(table, conf).unwrap())
        .unwrap();
}

async fn open(config: &NodeConfig) -> Engine {
    install(config, "users", USERS);
    Engine::open(config.clone()).await.unwrap()
}

fn set(key: &str, name: &str) -> Request {
    Request::set("users", key, vec![Field::new("name", name)])
}

fn incr(key: &str, delta: i64) -> Request {
    Request::new(
        "users",
        key,
        CommandKind::IncrBy {
            field: "age".to_string(),
            delta,
            version: None,
        },
    )
}

async fn wait_written_back(engine: &Engine) {
    for _ in 0..500 {
        engine.flush().await.unwrap();
        if !engine.write_back_pending() {
            return;
        }
        // Eviction pass also resubmits failed write-backs
        engine.evict_now();
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("write-back did not finish");
}

fn stored_row(config: &NodeConfig, key: &str) -> Option<(i64, String, i64)> {
    let conn = open_connection(&config.sql).unwrap();
    conn.query_row(
        "SELECT __version__, name, age FROM users WHERE __key__ = ?1",
        [key],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
    )
    .ok()
}

fn copy_dir(from: &Path, to: &Path) {
    fs::create_dir_all(to).unwrap();
    for entry in fs::read_dir(from).unwrap() {
        let entry = entry.unwrap();
        fs::copy(entry.path(), to.join(entry.file_name())).unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_versions_count_mutations() {
    let dir = tempdir().unwrap();
    let config = config(dir.path());
    let engine = open(&config).await;

    let reply = engine.execute(Request::get("users", "alice")).await;
    assert_eq!(reply.code, ErrorCode::RecordNotExist);

    assert_eq!(engine.execute(set("alice", "a")).await.version, 1);
    assert_eq!(engine.execute(set("alice", "b")).await.version, 2);
    let reply = engine.execute(incr("alice", 5)).await;
    assert_eq!(reply.version, 3);
    assert_eq!(reply.field("age"), Some(&FieldValue::Int(5)));

    let reply = engine.execute(Request::get("users", "alice")).await;
    assert_eq!(reply.code, ErrorCode::Ok);
    assert_eq!(reply.version, 3);
    assert_eq!(reply.field("name"), Some(&FieldValue::from("b")));

    let unchanged = Request::new(
        "users",
        "alice",
        CommandKind::Get {
            selection: FieldSelection::Fields(vec!["age".to_string()]),
            version: Some(3),
        },
    );
    assert_eq!(engine.execute(unchanged).await.code, ErrorCode::RecordUnchange);

    let stale = Request::new(
        "users",
        "alice",
        CommandKind::Set {
            fields: vec![Field::new("name", "c")],
            version: Some(1),
        },
    );
    let reply = engine.execute(stale).await;
    assert_eq!(reply.code, ErrorCode::VersionMismatch);
    assert_eq!(reply.version, 3);

    let reply = engine.execute(Request::del("users", "alice")).await;
    assert_eq!(reply.version, 4);
    let view = engine.record_view("users", "alice").unwrap();
    assert_eq!(view.status, RecordStatus::Missing);
    assert!(view.values.is_none());
    assert_eq!(
        engine.execute(Request::del("users", "alice")).await.code,
        ErrorCode::RecordNotExist
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_set_nx() {
    let dir = tempdir().unwrap();
    let config = config(dir.path());
    let engine = open(&config).await;

    let nx = || Request::set_nx("users", "bob", vec![Field::new("name", "bob")]);
    let reply = engine.execute(nx()).await;
    assert_eq!(reply.code, ErrorCode::Ok);
    assert_eq!(reply.version, 1);

    let reply = engine.execute(nx()).await;
    assert_eq!(reply.code, ErrorCode::RecordExist);
    assert_eq!(reply.version, 1);
    assert_eq!(reply.field("name"), Some(&FieldValue::from("bob")));

    let reply = engine.execute(Request::get("users", "bob")).await;
    assert_eq!(reply.field("name"), Some(&FieldValue::from("bob")));
    assert_eq!(reply.field("age"), Some(&FieldValue::Int(0)));

    // Row only in the store
    let conn = open_connection(&config.sql).unwrap();
    conn.execute(
        "INSERT INTO users (__key__, __version__, name, age) VALUES ('carol', 7, 'c', 3)",
        [],
    )
    .unwrap();
    let reply = engine
        .execute(Request::set_nx("users", "carol", vec![Field::new("name", "x")]))
        .await;
    assert_eq!(reply.code, ErrorCode::RecordExist);
    assert_eq!(reply.version, 7);
    assert_eq!(reply.field("name"), Some(&FieldValue::from("c")));
    assert_eq!(stored_row(&config, "carol"), Some((7, "c".to_string(), 3)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_compare_and_set() {
    let dir = tempdir().unwrap();
    let config = config(dir.path());
    let engine = open(&config).await;

    let cas = |kind: fn(String, FieldValue, FieldValue) -> CommandKind, old: i64, new: i64| {
        Request::new(
            "users",
            "dave",
            kind("age".to_string(), FieldValue::Int(old), FieldValue::Int(new)),
        )
    };
    let plain = |field: String, old: FieldValue, new: FieldValue| CommandKind::CompareAndSet {
        field,
        old,
        new,
    };
    let nx = |field: String, old: FieldValue, new: FieldValue| CommandKind::CompareAndSetNx {
        field,
        old,
        new,
    };

    assert_eq!(
        engine.execute(cas(plain, 0, 1)).await.code,
        ErrorCode::RecordNotExist
    );

    let reply = engine.execute(cas(nx, 0, 10)).await;
    assert_eq!(reply.code, ErrorCode::Ok);
    assert_eq!(reply.version, 1);

    let reply = engine.execute(cas(plain, 9, 11)).await;
    assert_eq!(reply.code, ErrorCode::CasNotEqual);
    assert_eq!(reply.field("age"), Some(&FieldValue::Int(10)));

    let reply = engine.execute(cas(nx, 10, 11)).await;
    assert_eq!(reply.code, ErrorCode::Ok);
    assert_eq!(reply.version, 2);
    assert_eq!(reply.field("age"), Some(&FieldValue::Int(11)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_validation() {
    let dir = tempdir().unwrap();
    let config = config(dir.path());
    let engine = open(&config).await;

    let cases = [
        (Request::get("", "k"), ErrorCode::MissingTable),
        (Request::get("users", ""), ErrorCode::MissingKey),
        (Request::get("orders", "k"), ErrorCode::InvalidTable),
        (Request::set("users", "k", vec![]), ErrorCode::MissingFields),
        (
            Request::set("users", "k", vec![Field::new("age", "ten")]),
            ErrorCode::InvalidField,
        ),
        (
            Request::new(
                "users",
                "k",
                CommandKind::DecrBy {
                    field: "name".to_string(),
                    delta: 1,
                    version: None,
                },
            ),
            ErrorCode::InvalidField,
        ),
    ];
    for (request, code) in cases {
        assert_eq!(engine.execute(request).await.code, code);
    }
    assert_eq!(engine.stats().total.misses, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_write_back_reaches_store() {
    let dir = tempdir().unwrap();
    let config = config(dir.path());
    let engine = open(&config).await;

    engine.execute(set("erin", "e1")).await;
    engine.execute(incr("erin", 2)).await;
    engine.execute(set("erin", "e2")).await;
    wait_written_back(&engine).await;
    assert_eq!(stored_row(&config, "erin"), Some((3, "e2".to_string(), 2)));

    let view = engine.record_view("users", "erin").unwrap();
    assert_eq!(view.write_back, WriteBackFlag::None);
    assert!(!view.write_back_locked);

    engine.execute(Request::del("users", "erin")).await;
    wait_written_back(&engine).await;
    assert_eq!(stored_row(&config, "erin"), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_replay_after_crash() {
    let dir = tempdir().unwrap();
    let config = config(dir.path());
    let engine = open(&config).await;

    assert_eq!(engine.execute(set("frank", "a")).await.version, 1);
    assert_eq!(engine.execute(set("frank", "b")).await.version, 2);
    engine.execute(set("gina", "g")).await;
    engine.execute(Request::del("users", "gina")).await;
    engine.flush().await.unwrap();

    // Durable binlog, empty store: as if the node died before write-back
    let crashed = dir.path().join("crashed");
    copy_dir(&config.binlog.dir, &crashed.join("binlog"));
    let replay_config = self::config(&crashed);
    install(&replay_config, "users", USERS);
    let replayed = Engine::open(replay_config.clone()).await.unwrap();
    assert!(replayed.recovery().entries >= 4);

    let reply = replayed.execute(Request::get("users", "frank")).await;
    assert_eq!(reply.code, ErrorCode::Ok);
    assert_eq!(reply.version, 2);
    assert_eq!(reply.field("name"), Some(&FieldValue::from("b")));
    assert_eq!(
        replayed.execute(Request::get("users", "gina")).await.code,
        ErrorCode::RecordNotExist
    );
    // Served from the replayed records, not the store
    assert_eq!(replayed.stats().total.misses, 0);

    wait_written_back(&replayed).await;
    assert_eq!(stored_row(&replay_config, "frank"), Some((2, "b".to_string(), 0)));
    assert_eq!(stored_row(&replay_config, "gina"), None);

    // Replayed files were compacted into one snapshot file per shard at most
    let files = list_files(replay_config.binlog.dir(), &replay_config.binlog.prefix).unwrap();
    assert!(files.len() <= replay_config.cache.shard_count);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_snapshot_compaction_preserves_state() {
    let dir = tempdir().unwrap();
    let mut config = config(dir.path());
    config.cache.shard_count = 1;
    config.binlog.max_entry_count = 8;
    config.binlog.flush_count = 4;
    let engine = open(&config).await;

    let mut rng = StdRng::seed_from_u64(7);
    let mut expected: HashMap<String, (i64, i64)> = HashMap::new();
    for _ in 0..60 {
        let key = format!("k{}", rng.gen_range(0..6));
        let delta = rng.gen_range(1..100);
        let reply = engine.execute(incr(&key, delta)).await;
        assert_eq!(reply.code, ErrorCode::Ok);
        let entry = expected.entry(key).or_insert((0, 0));
        entry.0 += 1;
        entry.1 += delta;
    }
    // Second pass waits for the snapshot triggered by the first one
    engine.flush().await.unwrap();
    engine.flush().await.unwrap();

    let files = list_files(config.binlog.dir(), &config.binlog.prefix).unwrap();
    assert!(files.len() <= 2, "old binlog files kept: {files:?}");

    let crashed = dir.path().join("crashed");
    copy_dir(&config.binlog.dir, &crashed.join("binlog"));
    let mut replay_config = self::config(&crashed);
    replay_config.cache.shard_count = 1;
    install(&replay_config, "users", USERS);
    let replayed = Engine::open(replay_config).await.unwrap();

    for (key, (version, age)) in &expected {
        let reply = replayed.execute(Request::get("users", key.as_str())).await;
        assert_eq!(reply.version, *version, "version of {key}");
        assert_eq!(reply.field("age"), Some(&FieldValue::Int(*age)), "age of {key}");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pending_write_back_blocks_eviction() {
    let dir = tempdir().unwrap();
    let mut config = config(dir.path());
    config.cache.shard_count = 1;
    config.cache.max_records_per_shard = 1;
    let engine = open(&config).await;

    let keys = ["h1", "h2", "h3"];
    for key in keys {
        engine.execute(Request::get("users", key)).await;
    }
    // Resident, so later writes need no load; their write-back will fail
    let conn = open_connection(&config.sql).unwrap();
    conn.execute_batch("DROP TABLE users").unwrap();

    for key in keys {
        assert_eq!(engine.execute(set(key, key)).await.code, ErrorCode::Ok);
    }
    engine.flush().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(engine.evict_now(), 0);
    assert_eq!(engine.stats().total.records, 3);
    for key in keys {
        let view = engine.record_view("users", key).unwrap();
        assert!(view.write_back.is_pending() || view.write_back_locked);
    }

    install(&config, "users", USERS);
    wait_written_back(&engine).await;
    engine.evict_now();
    let stats = engine.stats();
    assert_eq!(stats.total.records, 1);
    assert_eq!(stats.total.evictions, 2);

    // Evicted record comes back from the store
    let reply = engine.execute(Request::get("users", "h1")).await;
    assert_eq!(reply.field("name"), Some(&FieldValue::from("h1")));
    assert_eq!(reply.version, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reload_and_shutdown() {
    let dir = tempdir().unwrap();
    let config = config(dir.path());
    let engine = open(&config).await;

    let order = || Request::set("orders", "o1", vec![Field::new("total", 12.5f64)]);
    assert_eq!(engine.execute(order()).await.code, ErrorCode::InvalidTable);

    install(&config, "orders", "total:float:0");
    engine.reload_table_meta().unwrap();
    assert_eq!(engine.execute(order()).await.code, ErrorCode::Ok);

    // Expired before processing
    let request = Request::get("users", "ivan").with_timeout(Duration::ZERO);
    assert_eq!(engine.execute(request).await.code, ErrorCode::Timeout);

    engine.shutdown();
    assert_eq!(
        engine.execute(Request::get("users", "ivan")).await.code,
        ErrorCode::ServerStopped
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_incr_on_missing_starts_from_default() {
    let dir = tempdir().unwrap();
    let config = config(dir.path());
    let engine = open(&config).await;
    install(&config, "scores", "points:int:100,label:string:");
    engine.reload_table_meta().unwrap();

    let points = |key: &str, kind: CommandKind| Request::new("scores", key, kind);
    let reply = engine
        .execute(points(
            "p1",
            CommandKind::IncrBy {
                field: "points".to_string(),
                delta: 2,
                version: None,
            },
        ))
        .await;
    assert_eq!(reply.code, ErrorCode::Ok);
    assert_eq!(reply.field("points"), Some(&FieldValue::Int(102)));

    let reply = engine
        .execute(points(
            "p2",
            CommandKind::DecrBy {
                field: "points".to_string(),
                delta: 3,
                version: None,
            },
        ))
        .await;
    assert_eq!(reply.field("points"), Some(&FieldValue::Int(97)));

    let reply = engine.execute(Request::get("scores", "p1")).await;
    assert_eq!(reply.version, 1);
    assert_eq!(reply.field("points"), Some(&FieldValue::Int(102)));
    assert_eq!(reply.field("label"), Some(&FieldValue::from("")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_version_survives_delete_and_eviction() {
    let dir = tempdir().unwrap();
    let mut config = config(dir.path());
    config.cache.shard_count = 1;
    config.cache.max_records_per_shard = 0;
    let engine = open(&config).await;

    assert_eq!(engine.execute(set("jack", "a")).await.version, 1);
    assert_eq!(engine.execute(set("jack", "b")).await.version, 2);
    assert_eq!(engine.execute(Request::del("users", "jack")).await.version, 3);
    wait_written_back(&engine).await;
    engine.evict_now();
    assert!(engine.record_view("users", "jack").is_none());
    assert_eq!(stored_row(&config, "jack"), None);

    let reply = engine.execute(Request::get("users", "jack")).await;
    assert_eq!(reply.code, ErrorCode::RecordNotExist);
    assert_eq!(reply.version, 3);
    engine.evict_now();

    // The tombstone also decides SetNx, which the store alone would answer with v1
    let reply = engine
        .execute(Request::set_nx("users", "jack", vec![Field::new("name", "c")]))
        .await;
    assert_eq!(reply.code, ErrorCode::Ok);
    assert_eq!(reply.version, 4);
    assert_eq!(engine.execute(Request::del("users", "jack")).await.version, 5);
    wait_written_back(&engine).await;
    engine.evict_now();
    engine.flush().await.unwrap();

    // Replay restores the tombstone from the binlog
    let crashed = dir.path().join("crashed");
    copy_dir(&config.binlog.dir, &crashed.join("binlog"));
    let mut replay_config = self::config(&crashed);
    replay_config.cache.shard_count = 1;
    install(&replay_config, "users", USERS);
    let replayed = Engine::open(replay_config).await.unwrap();
    assert!(replayed.record_view("users", "jack").is_none());

    let reply = replayed.execute(Request::get("users", "jack")).await;
    assert_eq!(reply.code, ErrorCode::RecordNotExist);
    assert_eq!(reply.version, 5);
    assert_eq!(replayed.execute(set("jack", "d")).await.version, 6);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_partial_block_in_any_shard_file() {
    let dir = tempdir().unwrap();
    let mut config = config(dir.path());
    config.cache.shard_count = 4;
    let engine = open(&config).await;

    let keys: Vec<String> = (0..16).map(|i| format!("u{i}")).collect();
    for key in &keys {
        assert_eq!(engine.execute(set(key, key)).await.code, ErrorCode::Ok);
    }
    engine.flush().await.unwrap();

    let crashed = dir.path().join("crashed");
    copy_dir(&config.binlog.dir, &crashed.join("binlog"));
    let mut replay_config = self::config(&crashed);
    replay_config.cache.shard_count = 4;

    // Every shard was mid-write when the node died
    let files = list_files(replay_config.binlog.dir(), &replay_config.binlog.prefix).unwrap();
    assert!(files.len() >= 2, "expected one file per active shard: {files:?}");
    for (_, path) in &files {
        let mut data = fs::read(path).unwrap();
        data.extend_from_slice(&[0, 0, 1, 0, 7, 7]);
        fs::write(path, data).unwrap();
    }

    install(&replay_config, "users", USERS);
    let replayed = Engine::open(replay_config).await.unwrap();
    assert_eq!(replayed.recovery().files, files.len());
    for key in &keys {
        let reply = replayed.execute(Request::get("users", key.as_str())).await;
        assert_eq!(reply.code, ErrorCode::Ok, "{key}");
        assert_eq!(reply.field("name"), Some(&FieldValue::from(key.as_str())));
    }
}

//! End-to-end migration scenarios.
//!
//! Most scenarios run the whole engine against in-memory stores; the last
//! group puts the stores behind real RESP sockets and goes through the TCP
//! connector, including sharded sources and targets.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use common::*;
use ferrite_migrate::cluster::{ClusterSlotsResolver, HashSlot, SlotOwner, SlotRange};
use ferrite_migrate::config::{EndpointConfig, MigrationConfig};
use ferrite_migrate::connection::RespConnector;
use ferrite_migrate::migration::{
    MigrationController, ProgressEvent, ReportSink, RunState, TransferKind,
};
use ferrite_migrate::testing::{spawn_server, MemoryStore, StoredValue};

// ============================================================================
// Core scenarios
// ============================================================================

#[tokio::test]
async fn test_mixed_types_with_unsupported_key() {
    let source = MemoryStore::new("src");
    source.set("a", "1");
    source.rpush("b", ["x", "y", "y"]);
    source.zadd("c", [("m", 1.5)]);
    source.add_stream("d");
    let target = MemoryStore::new("dst");

    let summary = migrate(&[source], &target, test_config(10)).await;

    assert!(summary.is_complete());
    assert_eq!(summary.counters.migrated, 3);
    assert_eq!(summary.counters.skipped, 1);
    assert_eq!(summary.counters.failed, 0);
    assert_eq!(summary.counters.skipped_by_reason.get("unsupported_type"), Some(&1));

    assert_eq!(target.get_string("a"), Some(Bytes::from("1")));
    assert_eq!(
        target.get_list("b"),
        Some(vec![Bytes::from("x"), Bytes::from("y"), Bytes::from("y")])
    );
    assert_eq!(target.get_zset("c"), Some(vec![(Bytes::from("m"), 1.5)]));
    assert!(target.get("d").is_none());
    assert_eq!(target.len(), 3);
}

#[tokio::test]
async fn test_round_trip_in_both_modes() {
    for prefer_opaque in [true, false] {
        let source = MemoryStore::new("src");
        fill_mixed(&source);
        let target = MemoryStore::new("dst");
        let config = MigrationConfig {
            prefer_opaque_transfer: prefer_opaque,
            ..test_config(3)
        };

        let summary = migrate(&[source.clone()], &target, config).await;

        let expected_kind = if prefer_opaque {
            TransferKind::Opaque
        } else {
            TransferKind::Typed
        };
        assert_eq!(summary.strategy, expected_kind);
        assert_eq!(target.snapshot(), expected_target(&[source]));
        assert_eq!(summary.counters.failed, 0);
    }
}

#[tokio::test]
async fn test_transient_write_failures_are_retried() {
    let source = MemoryStore::new("src");
    source.set("e", "v");
    source.set("f", "w");
    let target = MemoryStore::new("dst");
    target.fail_writes("e", 2, "LOADING Redis is loading the dataset in memory");

    let config = MigrationConfig {
        write_retries: 3,
        ..test_config(10)
    };
    let summary = migrate(&[source], &target, config).await;

    assert_eq!(summary.counters.migrated, 2);
    assert_eq!(summary.counters.failed, 0);
    assert!(summary.failed_keys.is_empty());
    assert_eq!(target.get_string("e"), Some(Bytes::from("v")));
}

#[tokio::test]
async fn test_exhausted_retries_fail_only_that_key() {
    let source = MemoryStore::new("src");
    fill_strings(&source, "k", 5);
    let target = MemoryStore::new("dst");
    target.fail_writes("k0002", 100, "BUSY Redis is busy running a script");

    let config = MigrationConfig {
        write_retries: 2,
        ..test_config(2)
    };
    let summary = migrate(&[source], &target, config).await;

    assert!(summary.is_complete());
    assert_eq!(summary.counters.migrated, 4);
    assert_eq!(summary.counters.failed, 1);
    assert_eq!(summary.failed_keys.len(), 1);
    assert_eq!(summary.failed_keys[0].key, "k0002");
    assert!(summary.failed_keys[0].reason.starts_with("BUSY"));
    assert_eq!(target.len(), 4);
}

#[tokio::test]
async fn test_lost_shard_does_not_stop_the_others() {
    let healthy = MemoryStore::new("shard-a");
    fill_strings(&healthy, "a", 6);
    let flaky = MemoryStore::new("shard-b");
    fill_strings(&flaky, "b", 6);
    // Batch size 2 over 6 keys is 3 scans; the third one drops the node.
    flaky.fail_scans_after(2);
    let target = MemoryStore::new("dst");

    let summary = migrate(&[healthy.clone(), flaky], &target, test_config(2)).await;

    assert_eq!(summary.state, RunState::Done);
    assert_eq!(summary.incomplete_shards.len(), 1);
    assert_eq!(summary.incomplete_shards[0].id, "shard-b");
    assert!(!summary.checkpoint.is_complete());

    for key in healthy.snapshot().keys() {
        assert!(target.get(key).is_some());
    }
    assert_eq!(target.len(), 6 + 4);
}

#[tokio::test]
async fn test_lost_shard_resumes_from_saved_checkpoint() {
    let healthy = MemoryStore::new("shard-a");
    fill_strings(&healthy, "a", 6);
    let flaky = MemoryStore::new("shard-b");
    fill_strings(&flaky, "b", 6);
    flaky.fail_scans_after(2);
    let target = MemoryStore::new("dst");
    let sources = [healthy, flaky.clone()];

    let first = migrate(&sources, &target, test_config(2)).await;
    assert!(first.is_complete());
    assert!(!first.all_shards_done());

    let path = std::env::temp_dir().join(format!("ferrite-migrate-{}.json", first.run_id));
    assert!(first.checkpoint.persist(&path).unwrap());
    let saved = ferrite_migrate::migration::MigrationCursor::load(&path).unwrap();
    assert_eq!(saved, first.checkpoint);

    // the node comes back
    flaky.fail_scans_after(100);
    flaky.set_unreachable(false);
    let second = controller(&sources, &target, test_config(2))
        .resume_from(saved)
        .run()
        .await
        .unwrap();

    assert!(second.all_shards_done());
    assert_eq!(second.counters.fetched, 2);
    assert_eq!(target.len(), 12);
    assert!(!second.checkpoint.persist(&path).unwrap());
    assert!(!path.exists());
}

#[tokio::test]
async fn test_transient_source_replies_are_retried() {
    let source = MemoryStore::new("src");
    source.set("s", "v");
    source.rpush("l", ["x", "y"]);
    source.fail_command("TYPE", "s", 1, "TRYAGAIN Multiple keys request during rehashing of slot");
    source.fail_command("LRANGE", "l", 2, "LOADING Redis is loading the dataset in memory");
    let target = MemoryStore::new("dst");
    let config = MigrationConfig {
        prefer_opaque_transfer: false,
        ..test_config(10)
    };

    let summary = migrate(&[source], &target, config).await;

    assert_eq!(summary.strategy, TransferKind::Typed);
    assert_eq!(summary.counters.migrated, 2);
    assert_eq!(summary.counters.failed, 0);
    assert_eq!(target.get_string("s"), Some(Bytes::from("v")));
    assert_eq!(
        target.get_list("l"),
        Some(vec![Bytes::from("x"), Bytes::from("y")])
    );
}

#[tokio::test]
async fn test_losing_every_shard_aborts() {
    let only = MemoryStore::new("src");
    fill_strings(&only, "k", 4);
    only.fail_scans_after(0);
    let target = MemoryStore::new("dst");

    let summary = migrate(&[only], &target, test_config(2)).await;

    assert!(matches!(summary.state, RunState::Aborted(_)));
    assert_eq!(target.len(), 0);
}

#[tokio::test]
async fn test_second_run_is_idempotent() {
    let source = MemoryStore::new("src");
    fill_mixed(&source);
    let target = MemoryStore::new("dst");
    // Stale values the migration must overwrite, not append to.
    target.rpush("list", ["stale"]);
    target.sadd("set", ["stale"]);

    migrate(&[source.clone()], &target, test_config(2)).await;
    let first = target.snapshot();
    migrate(&[source.clone()], &target, test_config(2)).await;

    assert_eq!(target.snapshot(), first);
    assert_eq!(first, expected_target(&[source]));
}

#[tokio::test]
async fn test_ttl_is_preserved() {
    let source = MemoryStore::new("src");
    source.set("session", "s");
    source.expire("session", Duration::from_secs(60));
    source.hset("profile", [("name", "n")]);
    source.expire("profile", Duration::from_secs(120));
    source.set("forever", "f");
    let target = MemoryStore::new("dst");

    for prefer_opaque in [true, false] {
        let config = MigrationConfig {
            prefer_opaque_transfer: prefer_opaque,
            ..test_config(10)
        };
        migrate(&[source.clone()], &target, config).await;

        let session = target.pttl("session");
        assert!(session > 0 && session <= 60_000, "session ttl {}", session);
        let profile = target.pttl("profile");
        assert!(profile > 60_000 && profile <= 120_000, "profile ttl {}", profile);
        assert_eq!(target.pttl("forever"), -1);
    }
}

#[tokio::test]
async fn test_key_that_expires_before_its_write_is_skipped() {
    let source = MemoryStore::new("src");
    source.set("brief", "v");
    source.expire("brief", Duration::from_millis(200));
    source.set("stays", "v");
    let target = MemoryStore::new("dst");
    // The first write is rejected; by the retry the key has expired.
    target.fail_writes("brief", 1, "TRYAGAIN later");

    let config = MigrationConfig {
        retry_backoff_ms: 400,
        ..test_config(10)
    };
    let summary = migrate(&[source], &target, config).await;

    assert!(target.get("brief").is_none());
    assert_eq!(summary.counters.skipped, 1);
    assert_eq!(summary.counters.failed, 0);
    assert_eq!(target.get_string("stays"), Some(Bytes::from("v")));
}

#[tokio::test]
async fn test_target_without_restore_falls_back_to_typed() {
    let source = MemoryStore::new("src");
    fill_mixed(&source);
    let target = MemoryStore::new("dst");
    target.disable_opaque();

    let summary = migrate(&[source.clone()], &target, test_config(4)).await;

    assert_eq!(summary.strategy, TransferKind::Typed);
    assert_eq!(target.snapshot(), expected_target(&[source]));
}

#[tokio::test]
async fn test_pattern_limits_the_keyspace() {
    let source = MemoryStore::new("src");
    fill_strings(&source, "user:", 5);
    fill_strings(&source, "order:", 5);
    let target = MemoryStore::new("dst");

    let config = MigrationConfig {
        key_pattern: Some("user:*".into()),
        ..test_config(3)
    };
    let summary = migrate(&[source], &target, config).await;

    assert_eq!(summary.counters.migrated, 5);
    assert_eq!(target.len(), 5);
    assert!(target.snapshot().keys().all(|k| k.starts_with(b"user:")));
}

#[tokio::test]
async fn test_many_shards_in_parallel() {
    let sources: Vec<MemoryStore> = (0..6)
        .map(|i| {
            let store = MemoryStore::new(format!("shard-{}", i));
            fill_strings(&store, &format!("s{}:", i), 25);
            store
        })
        .collect();
    let target = MemoryStore::new("dst");
    let config = MigrationConfig {
        shard_parallelism: 3,
        ..test_config(7)
    };

    let summary = migrate(&sources, &target, config).await;

    assert!(summary.is_complete());
    assert!(summary.incomplete_shards.is_empty());
    assert_eq!(summary.counters.fetched, 150);
    assert_eq!(summary.counters.migrated, 150);
    assert_eq!(target.snapshot(), expected_target(&sources));
}

// ============================================================================
// Cancellation and resume
// ============================================================================

/// Cancels the run once `after` batches have been reported.
struct CancelAfter {
    token: CancellationToken,
    after: usize,
    seen: AtomicUsize,
}

impl ReportSink for CancelAfter {
    fn on_event(&self, event: &ProgressEvent) {
        if let ProgressEvent::BatchCompleted { .. } = event {
            if self.seen.fetch_add(1, Ordering::SeqCst) + 1 >= self.after {
                self.token.cancel();
            }
        }
    }
}

#[tokio::test]
async fn test_cancelled_run_resumes_from_checkpoint() {
    let source = MemoryStore::new("src");
    fill_strings(&source, "k", 40);
    let target = MemoryStore::new("dst");
    let config = MigrationConfig {
        shard_parallelism: 1,
        ..test_config(1)
    };

    let token = CancellationToken::new();
    let first = controller(&[source.clone()], &target, config.clone())
        .with_cancellation(token.clone())
        .with_sink(Arc::new(CancelAfter {
            token,
            after: 1,
            seen: AtomicUsize::new(0),
        }))
        .run()
        .await
        .unwrap();

    assert_eq!(first.state, RunState::Aborted("cancelled".into()));
    assert!(!first.checkpoint.is_complete());
    let written = target.len();
    assert!(written > 0 && written < 40);
    assert_eq!(first.checkpoint.keys_fetched(), first.counters.fetched);

    let second = controller(&[source.clone()], &target, config)
        .resume_from(first.checkpoint.clone())
        .run()
        .await
        .unwrap();

    assert!(second.is_complete());
    assert_eq!(first.counters.fetched + second.counters.fetched, 40);
    assert_eq!(target.snapshot(), expected_target(&[source]));
}

#[tokio::test]
async fn test_checkpoint_survives_a_file_round_trip() {
    let source = MemoryStore::new("src");
    fill_strings(&source, "k", 10);
    let target = MemoryStore::new("dst");
    let token = CancellationToken::new();
    let config = MigrationConfig {
        shard_parallelism: 1,
        ..test_config(1)
    };

    let first = controller(&[source.clone()], &target, config.clone())
        .with_cancellation(token.clone())
        .with_sink(Arc::new(CancelAfter {
            token,
            after: 1,
            seen: AtomicUsize::new(0),
        }))
        .run()
        .await
        .unwrap();

    let path = std::env::temp_dir().join(format!("ferrite-migrate-{}.json", first.run_id));
    first.checkpoint.save(&path).unwrap();
    let loaded = ferrite_migrate::migration::MigrationCursor::load(&path).unwrap();
    std::fs::remove_file(&path).unwrap();
    assert_eq!(loaded, first.checkpoint);

    let second = controller(&[source.clone()], &target, config)
        .resume_from(loaded)
        .run()
        .await
        .unwrap();
    assert!(second.is_complete());
    assert_eq!(target.snapshot(), expected_target(&[source]));
}

// ============================================================================
// Over real sockets
// ============================================================================

fn url(addr: std::net::SocketAddr) -> String {
    format!("redis://{}", addr)
}

async fn run_over_tcp(source_url: String, target_url: String) -> ferrite_migrate::MigrationSummary {
    let config = MigrationConfig {
        source: EndpointConfig::new(source_url),
        target: EndpointConfig::new(target_url),
        ..test_config(5)
    };
    let connector = Arc::new(RespConnector::new(&config.source, &config.target).unwrap());
    MigrationController::new(config, connector, Arc::new(ClusterSlotsResolver))
        .run()
        .await
        .unwrap()
}

/// Two nodes splitting the slot space in half, each told about both.
async fn two_node_cluster(name: &str) -> (Vec<MemoryStore>, Vec<std::net::SocketAddr>) {
    let nodes = vec![
        MemoryStore::new(format!("{}-0", name)),
        MemoryStore::new(format!("{}-1", name)),
    ];
    let mut addrs = Vec::new();
    for node in &nodes {
        let (addr, _handle) = spawn_server(node.clone()).await.unwrap();
        addrs.push(addr);
    }
    let owners = vec![
        SlotOwner {
            range: SlotRange::new(0, 8191),
            addr: addrs[0].to_string(),
            node_id: String::new(),
        },
        SlotOwner {
            range: SlotRange::new(8192, 16383),
            addr: addrs[1].to_string(),
            node_id: String::new(),
        },
    ];
    for (node, addr) in nodes.iter().zip(&addrs) {
        node.set_cluster(addr.to_string(), owners.clone());
    }
    (nodes, addrs)
}

fn node_for(key: &[u8]) -> usize {
    if HashSlot::for_key(key) < 8192 {
        0
    } else {
        1
    }
}

#[tokio::test]
async fn test_standalone_to_standalone_over_tcp() {
    let source = MemoryStore::new("src");
    fill_mixed(&source);
    fill_strings(&source, "k", 12);
    let target = MemoryStore::new("dst");
    let (source_addr, _s) = spawn_server(source.clone()).await.unwrap();
    let (target_addr, _t) = spawn_server(target.clone()).await.unwrap();

    let summary = run_over_tcp(url(source_addr), url(target_addr)).await;

    assert!(summary.is_complete());
    assert_eq!(summary.strategy, TransferKind::Opaque);
    assert_eq!(target.snapshot(), expected_target(&[source]));
}

#[tokio::test]
async fn test_standalone_to_cluster_over_tcp() {
    let source = MemoryStore::new("src");
    fill_mixed(&source);
    fill_strings(&source, "user:", 30);
    let (source_addr, _s) = spawn_server(source.clone()).await.unwrap();
    let (targets, target_addrs) = two_node_cluster("dst").await;

    let summary = run_over_tcp(url(source_addr), url(target_addrs[0])).await;

    assert!(summary.is_complete());
    assert_eq!(summary.counters.failed, 0);

    let expected = expected_target(&[source]);
    for (key, value) in &expected {
        let node = &targets[node_for(key)];
        assert_eq!(node.get(key).as_ref(), Some(value), "key {:?}", key);
    }
    assert_eq!(targets[0].len() + targets[1].len(), expected.len());
}

#[tokio::test]
async fn test_cluster_to_standalone_over_tcp() {
    let (sources, source_addrs) = two_node_cluster("src").await;
    for i in 0..40 {
        let key = format!("item:{}", i);
        sources[node_for(key.as_bytes())].set(key, i.to_string());
    }
    let target = MemoryStore::new("dst");
    let (target_addr, _t) = spawn_server(target.clone()).await.unwrap();

    let summary = run_over_tcp(url(source_addrs[0]), url(target_addr)).await;

    assert!(summary.is_complete());
    assert_eq!(summary.checkpoint.shards.len(), 2);
    assert_eq!(summary.counters.migrated, 40);
    let expected: std::collections::BTreeMap<Bytes, StoredValue> = expected_target(&sources);
    assert_eq!(target.snapshot(), expected);
}

//! Shared helpers for the migration integration tests.
//!
//! Import via `mod common;` in integration test files:
//! ```rust,ignore
//! mod common;
//! use common::*;
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;

use ferrite_migrate::config::MigrationConfig;
use ferrite_migrate::migration::{MigrationController, MigrationSummary};
use ferrite_migrate::testing::{MemoryProvider, MemoryStore, StoredValue};

// ============================================================================
// Configuration helpers
// ============================================================================

/// Config with the given batch size and no retry pauses.
#[allow(dead_code)]
pub fn test_config(batch_size: usize) -> MigrationConfig {
    MigrationConfig {
        batch_size,
        retry_backoff_ms: 0,
        ..MigrationConfig::default()
    }
}

// ============================================================================
// Run helpers
// ============================================================================

/// Controller over in-memory stores.
#[allow(dead_code)]
pub fn controller(
    sources: &[MemoryStore],
    target: &MemoryStore,
    config: MigrationConfig,
) -> MigrationController {
    let provider = Arc::new(MemoryProvider::new(sources.to_vec(), target.clone()));
    MigrationController::new(config, provider.clone(), provider)
}

/// Run a migration to its summary, failing the test if it cannot start.
#[allow(dead_code)]
pub async fn migrate(
    sources: &[MemoryStore],
    target: &MemoryStore,
    config: MigrationConfig,
) -> MigrationSummary {
    controller(sources, target, config)
        .run()
        .await
        .expect("migration should start")
}

// ============================================================================
// Data helpers
// ============================================================================

/// Fill `store` with `count` string keys named `{prefix}{i}`.
#[allow(dead_code)]
pub fn fill_strings(store: &MemoryStore, prefix: &str, count: usize) {
    for i in 0..count {
        store.set(format!("{}{:04}", prefix, i), format!("value-{}", i));
    }
}

/// One key of every supported type, plus a stream.
#[allow(dead_code)]
pub fn fill_mixed(store: &MemoryStore) {
    store.set("str", "hello");
    store.set("empty-str", "");
    store.rpush("list", ["x", "y", "y", "z"]);
    store.sadd("set", ["a", "b", "c"]);
    store.zadd("zset", [("m", 1.5), ("n", -2.0), ("o", 1e10)]);
    store.hset("hash", [("f1", "v1"), ("f2", "v2")]);
    store.set(Bytes::from_static(b"bin\x00\xff"), Bytes::from_static(b"\x01\x02"));
    store.add_stream("stream");
}

/// Every migratable key of `sources`, merged.
#[allow(dead_code)]
pub fn expected_target(sources: &[MemoryStore]) -> BTreeMap<Bytes, StoredValue> {
    sources
        .iter()
        .flat_map(|s| s.snapshot())
        .filter(|(_, v)| !matches!(v, StoredValue::Stream(_)))
        .collect()
}

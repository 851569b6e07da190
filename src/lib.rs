//! # Ferrite Migrate
//!
//! Copies every key of a Redis-compatible store (standalone or sharded) to
//! another one, preserving each key's type, value and remaining TTL.
//!
//! The engine walks each source shard with a resumable `SCAN` cursor, reads a
//! batch of keys, writes it to the target in one pipelined round trip and
//! only then advances the cursor. A failing key never stops the run; a
//! failing shard never stops the other shards.
//!
//! ## Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`protocol`] | RESP2 command encoding and reply decoding |
//! | [`connection`] | Store connections: single node, slot-routed cluster, providers |
//! | [`cluster`] | Hash slots and source topology discovery |
//! | [`migration`] | Scanner, coordinator, transfer strategies, writer, controller |
//! | [`config`] | TOML configuration |
//! | `testing` | In-memory stores with fault injection (`testing` feature) |

pub mod cluster;
pub mod config;
pub mod connection;
pub mod error;
pub mod migration;
pub mod protocol;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use config::MigrationConfig;
pub use error::{MigrationError, Result};
pub use migration::{MigrationController, MigrationSummary};

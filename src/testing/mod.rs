//! In-memory stores for exercising the migration engine
//!
//! [`MemoryStore`] understands the commands the engine sends (scanning,
//! type and TTL probes, typed reads and writes, `DUMP`/`RESTORE`,
//! transactions, `CLUSTER SLOTS`) and can inject failures on demand.
//! [`MemoryProvider`] wires stores into a
//! [`MigrationController`](crate::migration::MigrationController), and
//! [`spawn_server`] puts a store behind a real RESP socket.

mod provider;
mod server;
mod store;

pub use provider::MemoryProvider;
pub use server::{serve, spawn_server};
pub use store::{MemoryConnection, MemoryStore, StoredValue};

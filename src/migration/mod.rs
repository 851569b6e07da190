//! Migration engine
//!
//! Copies every key of a (possibly sharded) source store to a target store,
//! keeping each key's type, value and remaining TTL.
//!
//! # Pipeline
//!
//! ```text
//! ShardCoordinator ──▶ TransferStrategy::transcode ──▶ BatchWriter ──▶ outcomes
//!   (ShardScanner)        (opaque or typed)            (retries)       │
//!        ▲                                                             │
//!        └──────────── cursor advanced after the batch is written ◀────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use ferrite_migrate::cluster::ClusterSlotsResolver;
//! use ferrite_migrate::config::MigrationConfig;
//! use ferrite_migrate::connection::RespConnector;
//! use ferrite_migrate::migration::MigrationController;
//!
//! let config = MigrationConfig::default();
//! let connector = Arc::new(RespConnector::new(&config.source, &config.target)?);
//! let controller = MigrationController::new(config, connector, Arc::new(ClusterSlotsResolver));
//! let summary = controller.run().await?;
//! println!("migrated {} keys", summary.counters.migrated);
//! ```

pub mod controller;
pub mod coordinator;
pub mod progress;
pub mod record;
pub mod scan;
pub mod transfer;
pub mod writer;

pub use controller::MigrationController;
pub use coordinator::{
    Batch, MigrationCursor, ShardCoordinator, ShardCursor, ShardState, ShardStatus,
};
pub use progress::{
    BatchTally, ChannelSink, CountersSnapshot, FailedKey, IncompleteShard, MigrationSummary,
    NullSink, ProgressEvent, ReportSink, RunCounters, RunState, TracingSink,
};
pub use record::{KeyOutcome, KeyRecord, KeyType, Outcome, Payload, SkipReason, Transcoded, Ttl};
pub use scan::{ScanPage, ShardScanner, START};
pub use transfer::{
    select_strategy, supports_command, OpaqueTransfer, TransferKind, TransferStrategy,
    TypedTransfer,
};
pub use writer::BatchWriter;

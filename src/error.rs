//! Error types for ferrite-migrate
//!
//! This module defines the error taxonomy shared by the protocol, connection,
//! topology and migration layers. Uses `thiserror` for ergonomic error
//! definitions.
//!
//! Errors are split by how the migration engine reacts to them:
//!
//! - **transient** errors (connection resets, timeouts, `LOADING`, `BUSY`,
//!   `TRYAGAIN`, `OOM`, cluster redirects) are retried a bounded number of
//!   times;
//! - **fatal** errors (bad configuration, broken invariants) abort the whole
//!   run, stopping every shard;
//! - everything else is a data condition attributed to a single key.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Main error type for migration operations
#[derive(Error, Debug)]
pub enum MigrationError {
    /// Could not reach a store, or the connection dropped
    #[error("connection error: {0}")]
    Connection(String),

    /// Underlying I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Malformed or unexpected RESP data
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The store answered with an error reply
    #[error("server error: {0}")]
    Server(String),

    /// A round trip did not complete in time
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// Configuration parsing or validation error
    #[error("configuration error: {0}")]
    Config(String),

    /// Cluster topology could not be resolved
    #[error("topology error: {0}")]
    Topology(String),

    /// The run cannot continue
    #[error("migration aborted: {0}")]
    Aborted(String),
}

/// Result type alias for migration operations
pub type Result<T> = std::result::Result<T, MigrationError>;

/// Error-reply prefixes that describe a temporary condition on the store.
const TRANSIENT_REPLY_PREFIXES: &[&str] = &[
    "LOADING",
    "BUSY ",
    "TRYAGAIN",
    "CLUSTERDOWN",
    "MASTERDOWN",
    "OOM",
    "MOVED",
    "ASK",
];

impl MigrationError {
    /// Returns true if retrying the same operation may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            MigrationError::Connection(_) | MigrationError::Io(_) | MigrationError::Timeout(_) => {
                true
            }
            MigrationError::Server(msg) => is_transient_reply(msg),
            _ => false,
        }
    }

    /// Returns true if this error must abort the run
    #[cold]
    pub fn is_fatal(&self) -> bool {
        matches!(self, MigrationError::Config(_) | MigrationError::Aborted(_))
    }
}

/// Classify a raw error reply (without the leading `-`).
pub fn is_transient_reply(msg: &str) -> bool {
    TRANSIENT_REPLY_PREFIXES
        .iter()
        .any(|prefix| msg.starts_with(prefix))
}

/// `MOVED <slot> <addr>` or `ASK <slot> <addr>`.
pub fn is_redirect_reply(msg: &str) -> bool {
    msg.starts_with("MOVED ") || msg.starts_with("ASK ")
}

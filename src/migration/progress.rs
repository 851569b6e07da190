//! Run counters, progress events and the run summary.
//!
//! Counters are the only state every shard pipeline mutates, so they are
//! plain atomics. Events go to a [`ReportSink`], which must never block the
//! pipeline that emits them.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::coordinator::MigrationCursor;
use super::record::{display_key, KeyOutcome, Outcome, SkipReason};
use super::transfer::TransferKind;

// ---------------------------------------------------------------------------
// Run state
// ---------------------------------------------------------------------------

/// Overall state of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Shard pipelines are running
    Running,
    /// Every reachable shard has been traversed
    Done,
    /// Stopped before completion (the reason)
    Aborted(String),
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Done => write!(f, "done"),
            Self::Aborted(reason) => write!(f, "aborted: {}", reason),
        }
    }
}

// ---------------------------------------------------------------------------
// Counters
// ---------------------------------------------------------------------------

/// Live counters of a run, shared by every shard pipeline.
#[derive(Debug, Default)]
pub struct RunCounters {
    fetched: AtomicU64,
    migrated: AtomicU64,
    failed: AtomicU64,
    skipped_unsupported: AtomicU64,
    skipped_vanished: AtomicU64,
    skipped_expired: AtomicU64,
    skipped_empty: AtomicU64,
    skipped_type_changed: AtomicU64,
}

impl RunCounters {
    /// Fresh counters
    pub fn new() -> Self {
        Self::default()
    }

    /// Count keys handed out by a scan
    pub fn add_fetched(&self, count: u64) {
        self.fetched.fetch_add(count, Ordering::Relaxed);
    }

    /// Count one key outcome
    pub fn record(&self, outcome: &Outcome) {
        let counter = match outcome {
            Outcome::Migrated => &self.migrated,
            Outcome::Failed(_) => &self.failed,
            Outcome::Skipped(reason) => match reason {
                SkipReason::UnsupportedType(_) => &self.skipped_unsupported,
                SkipReason::Vanished => &self.skipped_vanished,
                SkipReason::Expired => &self.skipped_expired,
                SkipReason::Empty => &self.skipped_empty,
                SkipReason::TypeChanged => &self.skipped_type_changed,
            },
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy
    pub fn snapshot(&self) -> CountersSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        let mut skipped_by_reason = BTreeMap::new();
        for (label, counter) in [
            ("unsupported_type", &self.skipped_unsupported),
            ("vanished", &self.skipped_vanished),
            ("expired", &self.skipped_expired),
            ("empty", &self.skipped_empty),
            ("type_changed", &self.skipped_type_changed),
        ] {
            let n = load(counter);
            if n > 0 {
                skipped_by_reason.insert(label.to_string(), n);
            }
        }
        CountersSnapshot {
            fetched: load(&self.fetched),
            migrated: load(&self.migrated),
            skipped: skipped_by_reason.values().sum(),
            failed: load(&self.failed),
            skipped_by_reason,
        }
    }
}

/// Counter values at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountersSnapshot {
    /// Keys returned by scans
    pub fetched: u64,
    /// Keys written to the target
    pub migrated: u64,
    /// Keys skipped by rule
    pub skipped: u64,
    /// Keys that failed
    pub failed: u64,
    /// Skipped keys per reason label
    pub skipped_by_reason: BTreeMap<String, u64>,
}

/// Tally of one batch's outcomes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchTally {
    /// Keys migrated
    pub migrated: u64,
    /// Keys skipped
    pub skipped: u64,
    /// Keys failed
    pub failed: u64,
}

impl BatchTally {
    /// Count the outcomes of a batch
    pub fn of(outcomes: &[KeyOutcome]) -> Self {
        outcomes.iter().fold(Self::default(), |mut tally, o| {
            match o.outcome {
                Outcome::Migrated => tally.migrated += 1,
                Outcome::Skipped(_) => tally.skipped += 1,
                Outcome::Failed(_) => tally.failed += 1,
            }
            tally
        })
    }
}

// ---------------------------------------------------------------------------
// Events and sinks
// ---------------------------------------------------------------------------

/// Something worth reporting while a run is in progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    /// The transfer strategy was chosen
    StrategySelected {
        /// Chosen strategy
        strategy: TransferKind,
    },
    /// A shard pipeline started
    ShardStarted {
        /// Shard id
        shard: String,
        /// Cursor it starts from
        cursor: u64,
    },
    /// One batch was fetched, transcoded and written
    BatchCompleted {
        /// Shard id
        shard: String,
        /// Keys in the batch
        fetched: u64,
        /// Outcomes of the batch
        tally: BatchTally,
        /// Run totals after this batch
        totals: CountersSnapshot,
    },
    /// A key could not be migrated
    KeyFailed {
        /// Shard id
        shard: String,
        /// Key (lossy UTF-8)
        key: String,
        /// Error text
        reason: String,
    },
    /// A shard finished its traversal
    ShardCompleted {
        /// Shard id
        shard: String,
        /// Keys fetched from it
        keys: u64,
    },
    /// A shard became unreachable
    ShardFailed {
        /// Shard id
        shard: String,
        /// Error text
        reason: String,
    },
}

/// Receives progress events and the final summary.
///
/// Called from the shard pipelines; implementations must return promptly.
pub trait ReportSink: Send + Sync {
    /// A progress event
    fn on_event(&self, event: &ProgressEvent);

    /// The run is over
    fn on_summary(&self, _summary: &MigrationSummary) {}
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl ReportSink for NullSink {
    fn on_event(&self, _event: &ProgressEvent) {}
}

/// Renders events as log lines.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl ReportSink for TracingSink {
    fn on_event(&self, event: &ProgressEvent) {
        match event {
            ProgressEvent::StrategySelected { strategy } => {
                info!(strategy = %strategy, "transfer strategy");
            }
            ProgressEvent::ShardStarted { shard, cursor } => {
                info!(shard = %shard, cursor, "shard started");
            }
            ProgressEvent::BatchCompleted {
                shard,
                fetched,
                tally,
                totals,
            } => {
                debug!(
                    shard = %shard,
                    keys = fetched,
                    migrated = tally.migrated,
                    skipped = tally.skipped,
                    failed = tally.failed,
                    total_migrated = totals.migrated,
                    "batch written"
                );
            }
            ProgressEvent::KeyFailed { shard, key, reason } => {
                warn!(shard = %shard, key = %key, reason = %reason, "key failed");
            }
            ProgressEvent::ShardCompleted { shard, keys } => {
                info!(shard = %shard, keys, "shard completed");
            }
            ProgressEvent::ShardFailed { shard, reason } => {
                warn!(shard = %shard, reason = %reason, "shard failed");
            }
        }
    }

    fn on_summary(&self, summary: &MigrationSummary) {
        info!(
            run_id = %summary.run_id,
            state = %summary.state,
            fetched = summary.counters.fetched,
            migrated = summary.counters.migrated,
            skipped = summary.counters.skipped,
            failed = summary.counters.failed,
            incomplete_shards = summary.incomplete_shards.len(),
            "migration finished"
        );
    }
}

/// Forwards events to a channel. Events are dropped when the channel is
/// full or closed.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<ProgressEvent>,
}

impl ChannelSink {
    /// Sink and the receiving end of its channel
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<ProgressEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl ReportSink for ChannelSink {
    fn on_event(&self, event: &ProgressEvent) {
        let _ = self.tx.try_send(event.clone());
    }
}

// ---------------------------------------------------------------------------
// Summary
// ---------------------------------------------------------------------------

/// A key that could not be migrated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedKey {
    /// Key (lossy UTF-8)
    pub key: String,
    /// Error text
    pub reason: String,
}

impl FailedKey {
    /// Failed key from an outcome, if it is a failure
    pub fn from_outcome(outcome: &KeyOutcome) -> Option<Self> {
        match &outcome.outcome {
            Outcome::Failed(reason) => Some(Self {
                key: display_key(&outcome.key),
                reason: reason.clone(),
            }),
            _ => None,
        }
    }
}

/// A shard that was not fully traversed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncompleteShard {
    /// Shard id
    pub id: String,
    /// Why it stopped
    pub reason: String,
}

/// Everything a caller learns about a finished run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationSummary {
    /// Unique run identifier
    pub run_id: Uuid,
    /// Final state
    pub state: RunState,
    /// Transfer strategy used
    pub strategy: TransferKind,
    /// Final counters
    pub counters: CountersSnapshot,
    /// Failed keys, capped at the configured maximum
    pub failed_keys: Vec<FailedKey>,
    /// Failed keys not listed because of the cap
    pub failed_keys_omitted: u64,
    /// Shards that did not finish
    pub incomplete_shards: Vec<IncompleteShard>,
    /// When the run started
    pub started_at: DateTime<Utc>,
    /// Wall-clock duration
    pub duration: Duration,
    /// Where a repeated run would resume
    pub checkpoint: MigrationCursor,
}

impl MigrationSummary {
    /// True if the run reached its end, whatever individual keys did
    pub fn is_complete(&self) -> bool {
        self.state == RunState::Done
    }

    /// True if every shard reached the end of its keyspace. A run can be
    /// complete while a lost shard keeps this false.
    pub fn all_shards_done(&self) -> bool {
        self.checkpoint.is_complete()
    }

    /// Keys per second over the whole run
    pub fn throughput(&self) -> f64 {
        let secs = self.duration.as_secs_f64();
        if secs > 0.0 {
            self.counters.migrated as f64 / secs
        } else {
            0.0
        }
    }
}

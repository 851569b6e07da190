//! Migration controller: drives every shard pipeline to completion.
//!
//! Each source shard gets its own task with its own source and target
//! connections. At most `shard_parallelism` tasks run at once. A pipeline
//! fetches a batch, transcodes it, writes it, advances its cursor, and only
//! then fetches the next one, so each shard has at most one batch in flight.
//! Outcomes flow back through a bounded channel to the controller, which
//! folds them into the run counters.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::coordinator::{Batch, MigrationCursor, ShardCoordinator, ShardStatus};
use super::progress::{
    BatchTally, FailedKey, IncompleteShard, MigrationSummary, ProgressEvent, ReportSink,
    RunCounters, RunState, TracingSink,
};
use super::record::{display_key, KeyOutcome, Transcoded};
use super::scan::ShardScanner;
use super::transfer::{select_strategy, TransferStrategy};
use super::writer::BatchWriter;
use crate::cluster::{ShardDescriptor, TopologyResolver};
use crate::config::MigrationConfig;
use crate::connection::{Connection, ConnectionProvider, Role};
use crate::error::{MigrationError, Result};

/// Outcomes of one written batch, sent from a shard pipeline to the controller.
#[derive(Debug)]
struct BatchReport {
    shard: String,
    fetched: u64,
    outcomes: Vec<KeyOutcome>,
}

/// Failed keys kept for the summary.
struct FailureLog {
    keys: Vec<FailedKey>,
    omitted: u64,
    cap: usize,
}

impl FailureLog {
    fn push(&mut self, failed: FailedKey) {
        if self.keys.len() < self.cap {
            self.keys.push(failed);
        } else {
            self.omitted += 1;
        }
    }
}

/// Runs a migration from the source to the target.
pub struct MigrationController {
    config: MigrationConfig,
    provider: Arc<dyn ConnectionProvider>,
    resolver: Arc<dyn TopologyResolver>,
    sink: Arc<dyn ReportSink>,
    cancel: CancellationToken,
    counters: Arc<RunCounters>,
    resume: Option<MigrationCursor>,
    state: RwLock<RunState>,
}

impl MigrationController {
    /// Controller with a [`TracingSink`] and its own cancellation token
    pub fn new(
        config: MigrationConfig,
        provider: Arc<dyn ConnectionProvider>,
        resolver: Arc<dyn TopologyResolver>,
    ) -> Self {
        Self {
            config,
            provider,
            resolver,
            sink: Arc::new(TracingSink),
            cancel: CancellationToken::new(),
            counters: Arc::new(RunCounters::new()),
            resume: None,
            state: RwLock::new(RunState::Running),
        }
    }

    /// Send progress events to `sink`
    pub fn with_sink(mut self, sink: Arc<dyn ReportSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Stop at the next batch boundary once `token` is cancelled
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Continue from a checkpoint of an earlier run with the same parameters
    pub fn resume_from(mut self, checkpoint: MigrationCursor) -> Self {
        self.resume = Some(checkpoint);
        self
    }

    /// Token that cancels this run
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Live counters
    pub fn counters(&self) -> Arc<RunCounters> {
        self.counters.clone()
    }

    /// Current state
    pub fn state(&self) -> RunState {
        self.state.read().clone()
    }

    /// Run the migration.
    ///
    /// Returns `Err` only when the run cannot start (invalid configuration,
    /// unreachable source or target, unresolvable topology). Everything
    /// after that ends in a summary, whose state says whether the run
    /// completed.
    pub async fn run(&self) -> Result<MigrationSummary> {
        self.config.validate()?;
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let started = Instant::now();
        *self.state.write() = RunState::Running;
        info!(run_id = %run_id, "starting migration");

        let result = self.prepare().await;
        let (coordinator, strategy) = match result {
            Ok(prepared) => prepared,
            Err(e) => {
                *self.state.write() = RunState::Aborted(e.to_string());
                error!(error = %e, "migration could not start");
                return Err(e);
            }
        };
        self.sink.on_event(&ProgressEvent::StrategySelected {
            strategy: strategy.kind(),
        });

        let mut failures = FailureLog {
            keys: Vec::new(),
            omitted: 0,
            cap: self.config.max_reported_failures,
        };

        // Stopped by the caller's token, or by a shard hitting a fatal error.
        let stop = self.cancel.child_token();
        let abort = Arc::new(Mutex::new(None));

        let mut round = 0u32;
        loop {
            self.run_round(&coordinator, &strategy, &mut failures, &stop, &abort)
                .await;

            if stop.is_cancelled() || coordinator.all_exhausted() {
                break;
            }
            let failed = coordinator.failed();
            if failed.is_empty() || round >= self.config.shard_retries {
                break;
            }
            round += 1;
            for (id, reason) in failed {
                info!(shard = %id, round, reason = %reason, "retrying failed shard");
                coordinator.retry(&id);
            }
        }

        let incomplete: Vec<IncompleteShard> = coordinator
            .snapshot()
            .into_iter()
            .filter(|s| s.status != ShardStatus::Done)
            .map(|s| IncompleteShard {
                id: s.descriptor.id,
                reason: s.status.to_string(),
            })
            .collect();

        let fatal = abort.lock().take();
        let state = if let Some(reason) = fatal {
            RunState::Aborted(reason)
        } else if coordinator.all_exhausted() {
            RunState::Done
        } else if self.cancel.is_cancelled() {
            RunState::Aborted("cancelled".into())
        } else if coordinator.done_count() == 0 {
            RunState::Aborted("every shard failed".into())
        } else {
            RunState::Done
        };
        *self.state.write() = state.clone();

        let summary = MigrationSummary {
            run_id,
            state,
            strategy: strategy.kind(),
            counters: self.counters.snapshot(),
            failed_keys: failures.keys,
            failed_keys_omitted: failures.omitted,
            incomplete_shards: incomplete,
            started_at,
            duration: started.elapsed(),
            checkpoint: coordinator.checkpoint(),
        };
        self.sink.on_summary(&summary);
        Ok(summary)
    }

    /// Connect, resolve the shards and pick the transfer strategy.
    async fn prepare(&self) -> Result<(Arc<ShardCoordinator>, Arc<dyn TransferStrategy>)> {
        let mut source = self
            .provider
            .connect(Role::Source)
            .await
            .map_err(|e| MigrationError::Aborted(format!("cannot connect to source: {}", e)))?;
        let mut target = self
            .provider
            .connect(Role::Target)
            .await
            .map_err(|e| MigrationError::Aborted(format!("cannot connect to target: {}", e)))?;

        let shards = self.resolver.shards(source.as_mut()).await?;
        if shards.is_empty() {
            return Err(MigrationError::Topology("source has no shards".into()));
        }
        info!(shards = shards.len(), "resolved source topology");
        for shard in &shards {
            debug!(shard = %shard, "source shard");
        }

        let strategy = select_strategy(
            self.config.prefer_opaque_transfer,
            source.as_mut(),
            target.as_mut(),
        )
        .await?;

        let scanner = ShardScanner::new(self.config.batch_size, self.config.key_pattern.clone());
        let coordinator = Arc::new(ShardCoordinator::new(shards, scanner));
        if let Some(checkpoint) = &self.resume {
            coordinator.resume_from(checkpoint);
        }
        Ok((coordinator, strategy))
    }

    /// Run every pending shard once.
    async fn run_round(
        &self,
        coordinator: &Arc<ShardCoordinator>,
        strategy: &Arc<dyn TransferStrategy>,
        failures: &mut FailureLog,
        stop: &CancellationToken,
        abort: &Arc<Mutex<Option<String>>>,
    ) {
        let parallelism = self.config.shard_parallelism.max(1);
        let semaphore = Arc::new(Semaphore::new(parallelism));
        let (tx, mut rx) = mpsc::channel::<BatchReport>(parallelism * 2);
        let mut tasks = JoinSet::new();

        for shard in coordinator.pending() {
            let span = info_span!("shard", id = %shard.id);
            let pipeline = ShardPipeline {
                shard,
                coordinator: coordinator.clone(),
                strategy: strategy.clone(),
                provider: self.provider.clone(),
                writer: BatchWriter::new(self.config.write_retries, self.config.retry_backoff()),
                sink: self.sink.clone(),
                cancel: stop.clone(),
                abort: abort.clone(),
                tx: tx.clone(),
                retries: self.config.write_retries,
                backoff: self.config.retry_backoff(),
            };
            let semaphore = semaphore.clone();
            tasks.spawn(
                async move {
                    let permit = tokio::select! {
                        permit = semaphore.acquire_owned() => permit,
                        _ = pipeline.cancel.cancelled() => return,
                    };
                    let Ok(_permit) = permit else {
                        return;
                    };
                    pipeline.run().await;
                }
                .instrument(span),
            );
        }
        drop(tx);

        while let Some(report) = rx.recv().await {
            self.fold(report, failures);
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "shard pipeline terminated abnormally");
            }
        }
        coordinator.fail_unsettled("shard pipeline terminated abnormally");
    }

    fn fold(&self, report: BatchReport, failures: &mut FailureLog) {
        self.counters.add_fetched(report.fetched);
        for outcome in &report.outcomes {
            self.counters.record(&outcome.outcome);
            if let Some(failed) = FailedKey::from_outcome(outcome) {
                self.sink.on_event(&ProgressEvent::KeyFailed {
                    shard: report.shard.clone(),
                    key: failed.key.clone(),
                    reason: failed.reason.clone(),
                });
                failures.push(failed);
            }
        }
        self.sink.on_event(&ProgressEvent::BatchCompleted {
            shard: report.shard,
            fetched: report.fetched,
            tally: BatchTally::of(&report.outcomes),
            totals: self.counters.snapshot(),
        });
    }
}

/// Everything one shard task needs.
struct ShardPipeline {
    shard: ShardDescriptor,
    coordinator: Arc<ShardCoordinator>,
    strategy: Arc<dyn TransferStrategy>,
    provider: Arc<dyn ConnectionProvider>,
    writer: BatchWriter,
    sink: Arc<dyn ReportSink>,
    cancel: CancellationToken,
    /// First fatal error of the run
    abort: Arc<Mutex<Option<String>>>,
    tx: mpsc::Sender<BatchReport>,
    retries: u32,
    backoff: Duration,
}

impl ShardPipeline {
    async fn run(self) {
        let id = self.shard.id.clone();

        let mut source = match self.provider.connect_shard(&self.shard).await {
            Ok(conn) => conn,
            Err(e) => return self.fail_on("cannot connect to shard", e),
        };
        let mut target = match self.provider.connect(Role::Target).await {
            Ok(conn) => conn,
            Err(e) => return self.fail_on("cannot connect to target", e),
        };

        let cursor = self
            .coordinator
            .snapshot()
            .into_iter()
            .find(|s| s.descriptor.id == id)
            .map(|s| s.cursor)
            .unwrap_or_default();
        self.sink.on_event(&ProgressEvent::ShardStarted {
            shard: id.clone(),
            cursor,
        });

        loop {
            if self.cancel.is_cancelled() {
                info!("cancelled at batch boundary");
                self.coordinator.pause(&id);
                return;
            }

            let batch = match self.fetch(&mut source).await {
                Ok(Some(batch)) => batch,
                Ok(None) => return,
                Err(e) => return self.fail_on("scan failed", e),
            };

            let transcoded = match self.transcode(&mut source, &batch).await {
                Ok(entries) => entries,
                Err(e) => return self.fail_on("read failed", e),
            };

            let outcomes = match self
                .writer
                .write(target.as_mut(), self.strategy.as_ref(), transcoded)
                .await
            {
                Ok(outcomes) => outcomes,
                Err(e) => return self.fail_on("target unreachable", e),
            };

            if let Err(e) = self.coordinator.commit(&batch) {
                return self.fail_on("commit failed", e);
            }
            let report = BatchReport {
                shard: id.clone(),
                fetched: batch.keys.len() as u64,
                outcomes,
            };
            if self.tx.send(report).await.is_err() {
                warn!("controller stopped listening");
                return;
            }

            if batch.is_last() {
                let keys = self
                    .coordinator
                    .checkpoint()
                    .shards
                    .get(&id)
                    .map(|s| s.keys_fetched)
                    .unwrap_or_default();
                self.sink.on_event(&ProgressEvent::ShardCompleted { shard: id, keys });
                return;
            }
        }
    }

    /// Next batch, reconnecting to the shard on transient errors.
    async fn fetch(&self, source: &mut Box<dyn Connection>) -> Result<Option<Batch>> {
        let mut attempt = 0;
        loop {
            match self.coordinator.next_batch(&self.shard.id, source.as_mut()).await {
                Err(e) if e.is_transient() && attempt < self.retries => {
                    attempt += 1;
                    warn!(attempt, error = %e, "scan failed, reconnecting");
                    self.reconnect(source, attempt).await;
                }
                other => return other,
            }
        }
    }

    /// Transcode a batch. Keys answered with a transient error reply
    /// (`TRYAGAIN`, `LOADING`, ...) are read again on their own, up to the
    /// configured number of retries.
    async fn transcode(
        &self,
        source: &mut Box<dyn Connection>,
        batch: &Batch,
    ) -> Result<Vec<Transcoded>> {
        let mut entries = self.read(source, &batch.keys).await?;

        let mut attempt = 0;
        loop {
            let again: Vec<usize> = entries
                .iter()
                .enumerate()
                .filter(|(_, entry)| entry.is_transient_failure())
                .map(|(i, _)| i)
                .collect();
            if again.is_empty() || attempt >= self.retries {
                break;
            }
            attempt += 1;
            debug!(attempt, keys = again.len(), "transient read failure, will retry");
            self.pause(attempt).await;

            let keys: Vec<Bytes> = again.iter().map(|&i| entries[i].key().clone()).collect();
            let reread = self.read(source, &keys).await?;
            for (i, entry) in again.into_iter().zip(reread) {
                entries[i] = entry;
            }
        }

        for entry in &entries {
            if let Transcoded::Record(record) = entry {
                debug!(
                    key = %display_key(&record.key),
                    key_type = %record.key_type,
                    elements = record.payload.len(),
                    "copying key"
                );
            }
        }
        Ok(entries)
    }

    /// Read `keys`, reconnecting to the shard when the connection fails.
    async fn read(
        &self,
        source: &mut Box<dyn Connection>,
        keys: &[Bytes],
    ) -> Result<Vec<Transcoded>> {
        let mut attempt = 0;
        loop {
            match self.strategy.transcode(source.as_mut(), keys).await {
                Err(e) if e.is_transient() && attempt < self.retries => {
                    attempt += 1;
                    warn!(attempt, error = %e, "read failed, reconnecting");
                    self.reconnect(source, attempt).await;
                }
                other => return other,
            }
        }
    }

    async fn pause(&self, attempt: u32) {
        if !self.backoff.is_zero() {
            tokio::time::sleep(self.backoff * attempt).await;
        }
    }

    async fn reconnect(&self, conn: &mut Box<dyn Connection>, attempt: u32) {
        self.pause(attempt).await;
        if let Err(e) = conn.reconnect().await {
            debug!(error = %e, "reconnect failed");
        }
    }

    /// Fail this shard. A fatal error also stops every other shard.
    fn fail_on(&self, context: &str, e: MigrationError) {
        if e.is_fatal() {
            error!(error = %e, "unrecoverable error, stopping the run");
            self.abort.lock().get_or_insert_with(|| e.to_string());
            self.cancel.cancel();
        }
        let reason = format!("{}: {}", context, e);
        warn!(reason = %reason, "shard failed");
        self.coordinator.fail(&self.shard.id, reason.clone());
        self.sink.on_event(&ProgressEvent::ShardFailed {
            shard: self.shard.id.clone(),
            reason,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::progress::ChannelSink;
    use crate::testing::{MemoryProvider, MemoryStore};

    fn config(batch_size: usize) -> MigrationConfig {
        MigrationConfig {
            batch_size,
            retry_backoff_ms: 0,
            ..MigrationConfig::default()
        }
    }

    fn controller(provider: MemoryProvider, config: MigrationConfig) -> MigrationController {
        let provider = Arc::new(provider);
        MigrationController::new(config, provider.clone(), provider)
    }

    #[tokio::test]
    async fn test_single_shard_run() {
        let source = MemoryStore::new("src");
        for i in 0..10 {
            source.set(format!("k{}", i), i.to_string());
        }
        let target = MemoryStore::new("dst");
        let ctl = controller(MemoryProvider::new(vec![source], target.clone()), config(3));

        let summary = ctl.run().await.unwrap();
        assert!(summary.is_complete());
        assert_eq!(summary.counters.migrated, 10);
        assert_eq!(summary.counters.fetched, 10);
        assert!(summary.checkpoint.is_complete());
        assert_eq!(target.len(), 10);
        assert_eq!(ctl.state(), RunState::Done);
    }

    #[tokio::test]
    async fn test_unreachable_target_is_fatal() {
        let source = MemoryStore::new("src");
        let target = MemoryStore::new("dst");
        target.set_unreachable(true);
        let ctl = controller(MemoryProvider::new(vec![source], target), config(10));

        let err = ctl.run().await.unwrap_err();
        assert!(matches!(err, MigrationError::Aborted(_)));
        assert!(matches!(ctl.state(), RunState::Aborted(_)));
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let ctl = controller(
            MemoryProvider::new(vec![MemoryStore::new("src")], MemoryStore::new("dst")),
            config(0),
        );
        assert!(matches!(ctl.run().await, Err(MigrationError::Config(_))));
    }

    #[tokio::test]
    async fn test_cancel_before_start_keeps_everything_pending() {
        let source = MemoryStore::new("src");
        source.set("a", "1");
        let target = MemoryStore::new("dst");
        let ctl = controller(MemoryProvider::new(vec![source], target.clone()), config(10));
        ctl.cancellation_token().cancel();

        let summary = ctl.run().await.unwrap();
        assert_eq!(summary.state, RunState::Aborted("cancelled".into()));
        assert!(!summary.checkpoint.is_complete());
        assert_eq!(target.len(), 0);
    }

    #[tokio::test]
    async fn test_transient_read_reply_is_retried() {
        let source = MemoryStore::new("src");
        for key in ["a", "e", "z"] {
            source.set(key, "v");
        }
        source.fail_command("DUMP", "e", 1, "TRYAGAIN Multiple keys request during rehashing of slot");
        let target = MemoryStore::new("dst");
        let ctl = controller(MemoryProvider::new(vec![source], target.clone()), config(10));

        let summary = ctl.run().await.unwrap();
        assert_eq!(summary.counters.migrated, 3);
        assert_eq!(summary.counters.failed, 0);
        assert_eq!(target.get_string("e"), Some(Bytes::from("v")));
    }

    #[tokio::test]
    async fn test_read_retries_are_bounded() {
        let source = MemoryStore::new("src");
        source.hset("h", [("f", "v")]);
        source.set("s", "v");
        source.fail_command("HGETALL", "h", 10, "LOADING Redis is loading the dataset in memory");
        let target = MemoryStore::new("dst");
        let ctl = controller(
            MemoryProvider::new(vec![source], target.clone()),
            MigrationConfig {
                write_retries: 2,
                prefer_opaque_transfer: false,
                ..config(10)
            },
        );

        let summary = ctl.run().await.unwrap();
        assert_eq!(summary.counters.migrated, 1);
        assert_eq!(summary.counters.failed, 1);
        assert!(summary.failed_keys[0].reason.starts_with("LOADING"));
        assert_eq!(target.get_hash("h"), None);
    }

    /// Hands out shard connections that can never work.
    struct MisconfiguredShards(MemoryProvider);

    #[async_trait::async_trait]
    impl ConnectionProvider for MisconfiguredShards {
        async fn connect(&self, role: Role) -> Result<Box<dyn Connection>> {
            self.0.connect(role).await
        }

        async fn connect_shard(&self, shard: &ShardDescriptor) -> Result<Box<dyn Connection>> {
            Err(MigrationError::Config(format!("no credentials for {}", shard.addr)))
        }
    }

    #[tokio::test]
    async fn test_fatal_shard_error_stops_the_run() {
        let sources = vec![MemoryStore::new("a"), MemoryStore::new("b")];
        for source in &sources {
            source.set(format!("{}-key", source.name()), "v");
        }
        let provider = MemoryProvider::new(sources, MemoryStore::new("dst"));
        let resolver = Arc::new(provider.clone());
        let ctl = MigrationController::new(
            MigrationConfig {
                shard_parallelism: 1,
                ..config(10)
            },
            Arc::new(MisconfiguredShards(provider)),
            resolver,
        );

        let summary = ctl.run().await.unwrap();
        let RunState::Aborted(reason) = &summary.state else {
            panic!("expected an aborted run, got {:?}", summary.state);
        };
        assert!(reason.contains("no credentials"));
        // the second shard never started
        assert_eq!(summary.counters.fetched, 0);
        assert_eq!(summary.incomplete_shards.len(), 2);
        assert!(!ctl.cancellation_token().is_cancelled());
    }

    #[tokio::test]
    async fn test_events_reach_the_sink() {
        let source = MemoryStore::new("src");
        source.set("a", "1");
        let (sink, mut rx) = ChannelSink::new(64);
        let ctl = controller(
            MemoryProvider::new(vec![source], MemoryStore::new("dst")),
            config(10),
        )
        .with_sink(Arc::new(sink));

        ctl.run().await.unwrap();
        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(serde_json::to_value(&event).unwrap()["event"].clone());
        }
        assert_eq!(kinds.first().unwrap(), "strategy_selected");
        assert!(kinds.iter().any(|k| k == "batch_completed"));
        assert!(kinds.iter().any(|k| k == "shard_completed"));
    }
}

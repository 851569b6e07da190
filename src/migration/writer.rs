//! Batched writes to the target with bounded per-key retries.

use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, warn};

use super::record::{display_key, KeyOutcome, KeyRecord, Outcome, SkipReason, Transcoded};
use super::transfer::TransferStrategy;
use crate::connection::Connection;
use crate::error::{is_transient_reply, Result};
use crate::protocol::{Command, Value};

/// Writes one batch per round trip and retries transient per-key failures.
#[derive(Debug, Clone)]
pub struct BatchWriter {
    retries: u32,
    backoff: Duration,
}

/// A record still waiting to be written, with its position in the batch.
struct PendingWrite {
    index: usize,
    record: KeyRecord,
}

impl BatchWriter {
    /// Writer retrying each key up to `retries` times, pausing `backoff`
    /// times the attempt number in between.
    pub fn new(retries: u32, backoff: Duration) -> Self {
        Self { retries, backoff }
    }

    /// Apply `batch` to the target. Returns one outcome per entry, in order.
    ///
    /// `Err` means the target stayed unreachable through every retry; the
    /// batch must then be considered unwritten.
    pub async fn write(
        &self,
        conn: &mut dyn Connection,
        strategy: &dyn TransferStrategy,
        batch: Vec<Transcoded>,
    ) -> Result<Vec<KeyOutcome>> {
        let mut keys: Vec<Bytes> = Vec::with_capacity(batch.len());
        let mut outcomes: Vec<Option<Outcome>> = Vec::with_capacity(batch.len());
        let mut pending = Vec::new();

        for (index, entry) in batch.into_iter().enumerate() {
            keys.push(entry.key().clone());
            match entry {
                Transcoded::Record(record) if record.payload.is_empty() => {
                    outcomes.push(Some(Outcome::Skipped(SkipReason::Empty)));
                }
                Transcoded::Record(record) => {
                    outcomes.push(None);
                    pending.push(PendingWrite { index, record });
                }
                Transcoded::Skipped { reason, .. } => outcomes.push(Some(Outcome::Skipped(reason))),
                Transcoded::Failed { reason, .. } => outcomes.push(Some(Outcome::Failed(reason))),
            }
        }

        let mut attempt = 0u32;
        while !pending.is_empty() {
            let last_attempt = attempt >= self.retries;

            // Re-derive every TTL right before sending; expired keys drop out.
            let mut commands: Vec<Command> = Vec::new();
            let mut spans: Vec<(PendingWrite, usize)> = Vec::with_capacity(pending.len());
            for write in pending.drain(..) {
                let Some(ttl) = write.record.ttl_now() else {
                    debug!(key = %display_key(&write.record.key), "expired before write");
                    outcomes[write.index] = Some(Outcome::Skipped(SkipReason::Expired));
                    continue;
                };
                let cmds = strategy.write_commands(&write.record, ttl);
                spans.push((write, cmds.len()));
                commands.extend(cmds);
            }
            if spans.is_empty() {
                break;
            }

            let replies = match conn.pipeline(commands).await {
                Ok(replies) => replies,
                Err(e) if e.is_transient() && !last_attempt => {
                    warn!(attempt = attempt + 1, error = %e, "target round trip failed, reconnecting");
                    pending = spans.into_iter().map(|(write, _)| write).collect();
                    self.pause(attempt).await;
                    if let Err(e) = conn.reconnect().await {
                        warn!(error = %e, "reconnect to target failed");
                    }
                    attempt += 1;
                    continue;
                }
                Err(e) => return Err(e),
            };

            let mut replies = replies.into_iter();
            for (write, count) in spans {
                let group: Vec<Value> = replies.by_ref().take(count).collect();
                match first_error(&group) {
                    None if group.len() == count => {
                        outcomes[write.index] = Some(Outcome::Migrated);
                    }
                    None => {
                        outcomes[write.index] = Some(Outcome::Failed("missing reply".into()));
                    }
                    Some(msg) if is_transient_reply(msg) && !last_attempt => {
                        debug!(
                            key = %display_key(&write.record.key),
                            attempt = attempt + 1,
                            reply = %msg,
                            "transient write failure, will retry"
                        );
                        pending.push(write);
                    }
                    Some(msg) => {
                        outcomes[write.index] = Some(Outcome::Failed(msg.to_string()));
                    }
                }
            }

            if !pending.is_empty() {
                self.pause(attempt).await;
                attempt += 1;
            }
        }

        Ok(keys
            .into_iter()
            .zip(outcomes)
            .map(|(key, outcome)| {
                KeyOutcome::new(
                    key,
                    outcome.unwrap_or_else(|| Outcome::Failed("not written".into())),
                )
            })
            .collect())
    }

    async fn pause(&self, attempt: u32) {
        if !self.backoff.is_zero() {
            tokio::time::sleep(self.backoff * (attempt + 1)).await;
        }
    }
}

/// First error reply in a group, looking inside `EXEC` results.
fn first_error(replies: &[Value]) -> Option<&str> {
    replies.iter().find_map(|reply| match reply {
        Value::Error(msg) => Some(msg.as_str()),
        Value::Array(inner) => first_error(inner),
        _ => None,
    })
}

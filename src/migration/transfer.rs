//! Transfer strategies: how a key is read from the source and replayed on
//! the target.
//!
//! Two implementations of [`TransferStrategy`] exist:
//!
//! - [`OpaqueTransfer`] moves the value as a `DUMP` blob and writes it
//!   back with `RESTORE ... REPLACE`. The blob is never interpreted.
//! - [`TypedTransfer`] reads each type with its own command and rebuilds
//!   the key with the matching bulk-insert command inside `MULTI`/`EXEC`.
//!
//! The strategy is picked once per run by [`select_strategy`].

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

use super::record::{KeyRecord, KeyType, Payload, SkipReason, Transcoded, Ttl};
use crate::connection::Connection;
use crate::error::{MigrationError, Result};
use crate::protocol::{parse_score, Command, Value};

/// Elements per bulk-insert command on the typed path.
pub const INSERT_CHUNK: usize = 512;

/// Which transfer strategy a run uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferKind {
    /// DUMP / RESTORE
    Opaque,
    /// Per-type read and rebuild
    Typed,
}

impl fmt::Display for TransferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Opaque => write!(f, "opaque"),
            Self::Typed => write!(f, "typed"),
        }
    }
}

/// Read keys from the source and turn records into target commands.
#[async_trait]
pub trait TransferStrategy: Send + Sync {
    /// Which strategy this is
    fn kind(&self) -> TransferKind;

    /// Read `keys` from the source. One entry per key, in order.
    ///
    /// `Err` means the source connection failed; per-key problems are
    /// reported as [`Transcoded::Skipped`] or [`Transcoded::Failed`].
    async fn transcode(&self, conn: &mut dyn Connection, keys: &[Bytes])
        -> Result<Vec<Transcoded>>;

    /// Commands that replace the target key with `record`, carrying `ttl`.
    /// The key is either fully written or untouched.
    fn write_commands(&self, record: &KeyRecord, ttl: Ttl) -> Vec<Command>;
}

/// TYPE and PTTL of one key, read in the first round trip.
struct Header {
    key_type: KeyType,
    ttl: Ttl,
}

/// Interpret the TYPE and PTTL replies of `key`. `Err` carries the final
/// entry for keys that will not be read further.
fn read_header(
    key: &Bytes,
    type_reply: Value,
    pttl_reply: Value,
) -> std::result::Result<Header, Transcoded> {
    let skipped = |reason| Transcoded::Skipped {
        key: key.clone(),
        reason,
    };
    let failed = |reason: String| Transcoded::Failed {
        key: key.clone(),
        reason,
    };

    let key_type = match type_reply {
        Value::Error(msg) => return Err(failed(msg)),
        reply => match reply.as_str().map(KeyType::from_type_reply) {
            Some(Some(key_type)) => key_type,
            Some(None) => return Err(skipped(SkipReason::Vanished)),
            None => {
                return Err(failed(format!(
                    "unexpected TYPE reply: {}",
                    reply.type_name()
                )))
            }
        },
    };
    if let KeyType::Unsupported(name) = key_type {
        return Err(skipped(SkipReason::UnsupportedType(name)));
    }

    let ttl = match pttl_reply {
        Value::Integer(pttl) => Ttl::from_pttl(pttl).map_err(skipped)?,
        Value::Error(msg) => return Err(failed(msg)),
        other => {
            return Err(failed(format!(
                "unexpected PTTL reply: {}",
                other.type_name()
            )))
        }
    };

    Ok(Header { key_type, ttl })
}

fn expect_replies(replies: &[Value], expected: usize) -> Result<()> {
    if replies.len() != expected {
        return Err(MigrationError::Protocol(format!(
            "expected {} replies, got {}",
            expected,
            replies.len()
        )));
    }
    Ok(())
}

/// Whole-value transfer with `DUMP` / `RESTORE REPLACE`.
#[derive(Debug, Default, Clone)]
pub struct OpaqueTransfer;

#[async_trait]
impl TransferStrategy for OpaqueTransfer {
    fn kind(&self) -> TransferKind {
        TransferKind::Opaque
    }

    async fn transcode(
        &self,
        conn: &mut dyn Connection,
        keys: &[Bytes],
    ) -> Result<Vec<Transcoded>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let commands = keys
            .iter()
            .flat_map(|key| {
                [
                    Command::new("TYPE").arg(key),
                    Command::new("PTTL").arg(key),
                    Command::new("DUMP").arg(key),
                ]
            })
            .collect();

        let observed_at = Instant::now();
        let replies = conn.pipeline(commands).await?;
        expect_replies(&replies, keys.len() * 3)?;

        let mut replies = replies.into_iter();
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            let (Some(type_reply), Some(pttl_reply), Some(dump_reply)) =
                (replies.next(), replies.next(), replies.next())
            else {
                break;
            };
            let header = match read_header(key, type_reply, pttl_reply) {
                Ok(header) => header,
                Err(entry) => {
                    out.push(entry);
                    continue;
                }
            };
            let entry = match dump_reply {
                Value::Bulk(blob) => Transcoded::Record(KeyRecord {
                    key: key.clone(),
                    key_type: header.key_type,
                    ttl: header.ttl,
                    payload: Payload::Opaque(blob),
                    observed_at,
                }),
                Value::Nil => Transcoded::Skipped {
                    key: key.clone(),
                    reason: SkipReason::Vanished,
                },
                Value::Error(msg) => Transcoded::Failed {
                    key: key.clone(),
                    reason: msg,
                },
                other => Transcoded::Failed {
                    key: key.clone(),
                    reason: format!("unexpected DUMP reply: {}", other.type_name()),
                },
            };
            out.push(entry);
        }
        Ok(out)
    }

    fn write_commands(&self, record: &KeyRecord, ttl: Ttl) -> Vec<Command> {
        let blob = match &record.payload {
            Payload::Opaque(blob) => blob.clone(),
            // a typed record can still be replayed through the typed path
            _ => return TypedTransfer.write_commands(record, ttl),
        };
        vec![Command::new("RESTORE")
            .arg(&record.key)
            .arg(ttl.restore_millis())
            .arg(blob)
            .arg("REPLACE")]
    }
}

/// Per-type read and rebuild.
#[derive(Debug, Default, Clone)]
pub struct TypedTransfer;

impl TypedTransfer {
    fn read_command(key: &Bytes, key_type: &KeyType) -> Option<Command> {
        let cmd = match key_type {
            KeyType::String => Command::new("GET").arg(key),
            KeyType::List => Command::new("LRANGE").arg(key).arg(0i64).arg(-1i64),
            KeyType::Set => Command::new("SMEMBERS").arg(key),
            KeyType::SortedSet => Command::new("ZRANGE")
                .arg(key)
                .arg(0i64)
                .arg(-1i64)
                .arg("WITHSCORES"),
            KeyType::Hash => Command::new("HGETALL").arg(key),
            KeyType::Unsupported(_) => return None,
        };
        Some(cmd)
    }

    fn payload(key_type: &KeyType, reply: Value) -> std::result::Result<Payload, ReadError> {
        if let Value::Error(msg) = &reply {
            return Err(if msg.starts_with("WRONGTYPE") {
                ReadError::Skip(SkipReason::TypeChanged)
            } else {
                ReadError::Failed(msg.clone())
            });
        }

        let payload = match key_type {
            KeyType::String => match reply {
                Value::Nil => return Err(ReadError::Skip(SkipReason::Vanished)),
                other => Payload::String(other.into_bytes().map_err(ReadError::from)?),
            },
            KeyType::List => Payload::List(bulk_items(reply)?),
            KeyType::Set => Payload::Set(bulk_items(reply)?),
            KeyType::SortedSet => {
                let flat = bulk_items(reply)?;
                let mut members = Vec::with_capacity(flat.len() / 2);
                for pair in flat.chunks(2) {
                    let [member, score] = pair else {
                        return Err(ReadError::Failed("odd-length ZRANGE reply".into()));
                    };
                    let score = parse_score(score).map_err(ReadError::from)?;
                    members.push((member.clone(), score));
                }
                Payload::SortedSet(members)
            }
            KeyType::Hash => {
                let flat = bulk_items(reply)?;
                let mut fields = Vec::with_capacity(flat.len() / 2);
                for pair in flat.chunks(2) {
                    let [field, value] = pair else {
                        return Err(ReadError::Failed("odd-length HGETALL reply".into()));
                    };
                    fields.push((field.clone(), value.clone()));
                }
                Payload::Hash(fields)
            }
            KeyType::Unsupported(name) => {
                return Err(ReadError::Skip(SkipReason::UnsupportedType(name.clone())))
            }
        };

        if payload.is_empty() {
            return Err(ReadError::Skip(SkipReason::Empty));
        }
        Ok(payload)
    }
}

enum ReadError {
    Skip(SkipReason),
    Failed(String),
}

impl From<MigrationError> for ReadError {
    fn from(e: MigrationError) -> Self {
        ReadError::Failed(e.to_string())
    }
}

fn bulk_items(reply: Value) -> std::result::Result<Vec<Bytes>, ReadError> {
    reply
        .into_array()?
        .into_iter()
        .map(|v| v.into_bytes().map_err(ReadError::from))
        .collect()
}

#[async_trait]
impl TransferStrategy for TypedTransfer {
    fn kind(&self) -> TransferKind {
        TransferKind::Typed
    }

    async fn transcode(
        &self,
        conn: &mut dyn Connection,
        keys: &[Bytes],
    ) -> Result<Vec<Transcoded>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let commands = keys
            .iter()
            .flat_map(|key| [Command::new("TYPE").arg(key), Command::new("PTTL").arg(key)])
            .collect();

        let observed_at = Instant::now();
        let replies = conn.pipeline(commands).await?;
        expect_replies(&replies, keys.len() * 2)?;

        let mut entries: Vec<std::result::Result<Header, Transcoded>> =
            Vec::with_capacity(keys.len());
        let mut replies = replies.into_iter();
        for key in keys {
            let (Some(type_reply), Some(pttl_reply)) = (replies.next(), replies.next()) else {
                break;
            };
            entries.push(read_header(key, type_reply, pttl_reply));
        }

        let reads: Vec<Command> = keys
            .iter()
            .zip(&entries)
            .filter_map(|(key, entry)| match entry {
                Ok(header) => Self::read_command(key, &header.key_type),
                Err(_) => None,
            })
            .collect();
        let read_count = reads.len();
        let values = conn.pipeline(reads).await?;
        expect_replies(&values, read_count)?;

        let mut values = values.into_iter();
        let mut out = Vec::with_capacity(keys.len());
        for (key, entry) in keys.iter().zip(entries) {
            let header = match entry {
                Ok(header) => header,
                Err(done) => {
                    out.push(done);
                    continue;
                }
            };
            let Some(reply) = values.next() else {
                break;
            };
            let entry = match Self::payload(&header.key_type, reply) {
                Ok(payload) => Transcoded::Record(KeyRecord {
                    key: key.clone(),
                    key_type: header.key_type,
                    ttl: header.ttl,
                    payload,
                    observed_at,
                }),
                Err(ReadError::Skip(reason)) => Transcoded::Skipped {
                    key: key.clone(),
                    reason,
                },
                Err(ReadError::Failed(reason)) => Transcoded::Failed {
                    key: key.clone(),
                    reason,
                },
            };
            out.push(entry);
        }
        Ok(out)
    }

    fn write_commands(&self, record: &KeyRecord, ttl: Ttl) -> Vec<Command> {
        let key = &record.key;
        let inserts: Vec<Command> = match &record.payload {
            Payload::String(value) => {
                let mut set = Command::new("SET").arg(key).arg(value);
                if let Ttl::Millis(ms) = ttl {
                    set = set.arg("PX").arg(ms);
                }
                return vec![set];
            }
            Payload::Opaque(blob) => {
                return vec![Command::new("RESTORE")
                    .arg(key)
                    .arg(ttl.restore_millis())
                    .arg(blob)
                    .arg("REPLACE")]
            }
            Payload::List(items) => items
                .chunks(INSERT_CHUNK)
                .map(|chunk| Command::new("RPUSH").arg(key).args(chunk))
                .collect(),
            Payload::Set(members) => members
                .chunks(INSERT_CHUNK)
                .map(|chunk| Command::new("SADD").arg(key).args(chunk))
                .collect(),
            Payload::SortedSet(members) => members
                .chunks(INSERT_CHUNK)
                .map(|chunk| {
                    chunk.iter().fold(Command::new("ZADD").arg(key), |cmd, (member, score)| {
                        cmd.arg(*score).arg(member)
                    })
                })
                .collect(),
            Payload::Hash(fields) => fields
                .chunks(INSERT_CHUNK)
                .map(|chunk| {
                    chunk.iter().fold(Command::new("HSET").arg(key), |cmd, (field, value)| {
                        cmd.arg(field).arg(value)
                    })
                })
                .collect(),
        };

        let mut commands = Vec::with_capacity(inserts.len() + 4);
        commands.push(Command::new("MULTI"));
        commands.push(Command::new("DEL").arg(key));
        commands.extend(inserts);
        if let Ttl::Millis(ms) = ttl {
            commands.push(Command::new("PEXPIRE").arg(key).arg(ms));
        }
        commands.push(Command::new("EXEC"));
        commands
    }
}

/// Whether a store knows `command`, asked with `COMMAND INFO`.
///
/// A store that rejects `COMMAND INFO` itself is given the benefit of the
/// doubt; a `nil` entry means the command is unknown.
pub async fn supports_command(conn: &mut dyn Connection, command: &str) -> Result<bool> {
    let reply = conn
        .execute(Command::new("COMMAND").arg("INFO").arg(command))
        .await?;
    let supported = match reply {
        Value::Error(_) => true,
        Value::Array(entries) => entries.first().map(|e| !e.is_nil()).unwrap_or(false),
        _ => false,
    };
    debug!(addr = %conn.addr(), command, supported, "capability probe");
    Ok(supported)
}

/// Pick the strategy for a run: opaque when preferred and both stores
/// support it, typed otherwise.
pub async fn select_strategy(
    prefer_opaque: bool,
    source: &mut dyn Connection,
    target: &mut dyn Connection,
) -> Result<Arc<dyn TransferStrategy>> {
    let strategy: Arc<dyn TransferStrategy> = if prefer_opaque
        && supports_command(source, "DUMP").await?
        && supports_command(target, "RESTORE").await?
    {
        Arc::new(OpaqueTransfer)
    } else {
        Arc::new(TypedTransfer)
    };
    info!(strategy = %strategy.kind(), "selected transfer strategy");
    Ok(strategy)
}

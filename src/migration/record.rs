//! Key records and per-key outcomes.
//!
//! A [`KeyRecord`] lives for exactly one batch: the transcoder builds it
//! from the source and the writer consumes it.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};

use crate::error::is_transient_reply;

/// Logical value type of a key, as reported by `TYPE`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyType {
    /// Plain string
    String,
    /// List
    List,
    /// Set
    Set,
    /// Sorted set
    SortedSet,
    /// Hash
    Hash,
    /// Any other type (stream, module types, ...). Never written.
    Unsupported(String),
}

impl KeyType {
    /// Map a `TYPE` reply to a key type. `None` means the key does not exist.
    pub fn from_type_reply(name: &str) -> Option<Self> {
        let key_type = match name {
            "none" => return None,
            "string" => KeyType::String,
            "list" => KeyType::List,
            "set" => KeyType::Set,
            "zset" => KeyType::SortedSet,
            "hash" => KeyType::Hash,
            other => KeyType::Unsupported(other.to_string()),
        };
        Some(key_type)
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyType::String => write!(f, "string"),
            KeyType::List => write!(f, "list"),
            KeyType::Set => write!(f, "set"),
            KeyType::SortedSet => write!(f, "zset"),
            KeyType::Hash => write!(f, "hash"),
            KeyType::Unsupported(name) => write!(f, "{}", name),
        }
    }
}

/// Remaining lifetime of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Ttl {
    /// No expiry
    Persistent,
    /// Milliseconds left, always > 0
    Millis(u64),
}

impl Ttl {
    /// Interpret a `PTTL` reply.
    pub fn from_pttl(pttl: i64) -> std::result::Result<Ttl, SkipReason> {
        match pttl {
            -2 => Err(SkipReason::Vanished),
            -1 => Ok(Ttl::Persistent),
            ms if ms > 0 => Ok(Ttl::Millis(ms as u64)),
            _ => Err(SkipReason::Expired),
        }
    }

    /// Lifetime left after `elapsed`; `None` once it has run out.
    pub fn remaining(self, elapsed: Duration) -> Option<Ttl> {
        match self {
            Ttl::Persistent => Some(Ttl::Persistent),
            Ttl::Millis(ms) => {
                let elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
                match ms.saturating_sub(elapsed_ms) {
                    0 => None,
                    left => Some(Ttl::Millis(left)),
                }
            }
        }
    }

    /// Milliseconds for `RESTORE`, where 0 means no expiry.
    pub fn restore_millis(self) -> u64 {
        match self {
            Ttl::Persistent => 0,
            Ttl::Millis(ms) => ms,
        }
    }
}

/// A key's value, shaped by its type.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// String value (may be empty)
    String(Bytes),
    /// List elements in order, duplicates kept
    List(Vec<Bytes>),
    /// Set members
    Set(Vec<Bytes>),
    /// Sorted-set members in store order (score, then member)
    SortedSet(Vec<(Bytes, f64)>),
    /// Hash fields and values
    Hash(Vec<(Bytes, Bytes)>),
    /// Serialized value from `DUMP`, never interpreted
    Opaque(Bytes),
}

impl Payload {
    /// True for a collection with no elements. Strings and blobs are never empty.
    pub fn is_empty(&self) -> bool {
        match self {
            Payload::String(_) | Payload::Opaque(_) => false,
            Payload::List(items) | Payload::Set(items) => items.is_empty(),
            Payload::SortedSet(members) => members.is_empty(),
            Payload::Hash(fields) => fields.is_empty(),
        }
    }

    /// Number of elements (1 for strings and blobs)
    pub fn len(&self) -> usize {
        match self {
            Payload::String(_) | Payload::Opaque(_) => 1,
            Payload::List(items) | Payload::Set(items) => items.len(),
            Payload::SortedSet(members) => members.len(),
            Payload::Hash(fields) => fields.len(),
        }
    }
}

/// One transcoded key, ready to be written.
#[derive(Debug, Clone)]
pub struct KeyRecord {
    /// Key name
    pub key: Bytes,
    /// Logical type on the source
    pub key_type: KeyType,
    /// Lifetime observed on the source
    pub ttl: Ttl,
    /// Value
    pub payload: Payload,
    /// When `ttl` was observed
    pub observed_at: Instant,
}

impl KeyRecord {
    /// Lifetime left now; `None` if the key has expired since it was read.
    pub fn ttl_now(&self) -> Option<Ttl> {
        self.ttl.remaining(self.observed_at.elapsed())
    }
}

/// Why a key was not migrated, without it being an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Type the target cannot be given (the type name)
    UnsupportedType(String),
    /// Deleted between scan and read
    Vanished,
    /// TTL ran out before the key could be written
    Expired,
    /// Collection read back empty
    Empty,
    /// Type changed between `TYPE` and the value read
    TypeChanged,
}

impl SkipReason {
    /// Short stable label, used as a counter name.
    pub fn label(&self) -> &'static str {
        match self {
            SkipReason::UnsupportedType(_) => "unsupported_type",
            SkipReason::Vanished => "vanished",
            SkipReason::Expired => "expired",
            SkipReason::Empty => "empty",
            SkipReason::TypeChanged => "type_changed",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::UnsupportedType(name) => write!(f, "unsupported type '{}'", name),
            SkipReason::Vanished => write!(f, "key vanished"),
            SkipReason::Expired => write!(f, "key expired"),
            SkipReason::Empty => write!(f, "empty collection"),
            SkipReason::TypeChanged => write!(f, "type changed during read"),
        }
    }
}

/// Result of reading one key from the source.
#[derive(Debug, Clone)]
pub enum Transcoded {
    /// Key read successfully
    Record(KeyRecord),
    /// Key deliberately not migrated
    Skipped {
        /// Key name
        key: Bytes,
        /// Why
        reason: SkipReason,
    },
    /// Key could not be read
    Failed {
        /// Key name
        key: Bytes,
        /// Error text
        reason: String,
    },
}

impl Transcoded {
    /// Key this entry is about
    pub fn key(&self) -> &Bytes {
        match self {
            Transcoded::Record(record) => &record.key,
            Transcoded::Skipped { key, .. } | Transcoded::Failed { key, .. } => key,
        }
    }

    /// True for a read that failed on a temporary condition of the store
    /// (`TRYAGAIN`, `LOADING`, ...), worth reading again.
    pub fn is_transient_failure(&self) -> bool {
        matches!(self, Transcoded::Failed { reason, .. } if is_transient_reply(reason))
    }
}

/// What happened to one key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Written to the target
    Migrated,
    /// Not written, by rule
    Skipped(SkipReason),
    /// Not written, because something went wrong
    Failed(String),
}

/// Outcome of one key of a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyOutcome {
    /// Key name
    pub key: Bytes,
    /// Outcome
    pub outcome: Outcome,
}

impl KeyOutcome {
    /// Build an outcome
    pub fn new(key: Bytes, outcome: Outcome) -> Self {
        Self { key, outcome }
    }
}

/// Render a binary key for logs and reports.
pub fn display_key(key: &[u8]) -> String {
    String::from_utf8_lossy(key).into_owned()
}

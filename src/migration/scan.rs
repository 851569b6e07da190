//! Cursor iteration over one shard.

use bytes::Bytes;
use tracing::trace;

use crate::connection::Connection;
use crate::error::{MigrationError, Result};
use crate::protocol::{Command, Value};

/// The cursor a scan starts from, and returns to when the shard is exhausted.
pub const START: u64 = 0;

/// One page of a shard scan.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanPage {
    /// Cursor to continue from; [`START`] once the shard is exhausted
    pub cursor: u64,
    /// Keys in this page (may be empty even if the scan is not done)
    pub keys: Vec<Bytes>,
}

impl ScanPage {
    /// True if this is the final page of the shard
    pub fn is_last(&self) -> bool {
        self.cursor == START
    }
}

/// Pages through a shard with `SCAN`.
///
/// Restarting from a returned cursor resumes at the same position. Keys
/// added or removed meanwhile may be seen zero, one or several times.
#[derive(Debug, Clone)]
pub struct ShardScanner {
    count: usize,
    pattern: Option<String>,
}

impl ShardScanner {
    /// Scanner asking for about `count` keys per page
    pub fn new(count: usize, pattern: Option<String>) -> Self {
        Self {
            count: count.max(1),
            pattern,
        }
    }

    /// Page size hint
    pub fn count(&self) -> usize {
        self.count
    }

    /// Key filter, if any
    pub fn pattern(&self) -> Option<&str> {
        self.pattern.as_deref()
    }

    /// Fetch the page at `cursor`.
    pub async fn next(&self, conn: &mut dyn Connection, cursor: u64) -> Result<ScanPage> {
        let mut cmd = Command::new("SCAN").arg(cursor);
        if let Some(pattern) = &self.pattern {
            cmd = cmd.arg("MATCH").arg(pattern.as_str());
        }
        cmd = cmd.arg("COUNT").arg(self.count);

        let page = parse_scan_reply(conn.execute(cmd).await?)?;
        trace!(cursor, next = page.cursor, keys = page.keys.len(), "scan page");
        Ok(page)
    }
}

/// Parse `[cursor, [key, ...]]`.
pub fn parse_scan_reply(reply: Value) -> Result<ScanPage> {
    let mut parts = reply.into_array()?.into_iter();
    let (Some(cursor), Some(keys), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(MigrationError::Protocol(
            "SCAN reply must have two elements".into(),
        ));
    };

    let cursor = cursor.into_bytes()?;
    let cursor = std::str::from_utf8(&cursor)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .ok_or_else(|| MigrationError::Protocol("invalid SCAN cursor".into()))?;

    let keys = keys
        .into_array()?
        .into_iter()
        .map(Value::into_bytes)
        .collect::<Result<Vec<_>>>()?;

    Ok(ScanPage { cursor, keys })
}

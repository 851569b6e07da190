//! Source topology discovery.
//!
//! A migration fans out one scan per primary. [`ClusterSlotsResolver`]
//! learns the primaries from `CLUSTER SLOTS`; a store with cluster support
//! disabled is a single shard that owns every slot.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::slots::{coalesce, SlotRange};
use crate::connection::Connection;
use crate::error::{MigrationError, Result};
use crate::protocol::{Command, Value};

/// One independently scannable partition of the source keyspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardDescriptor {
    /// Stable identifier (cluster node id, or the address for a standalone store)
    pub id: String,
    /// `host:port` of the primary serving this shard
    pub addr: String,
    /// Slots owned by this shard
    pub slots: Vec<SlotRange>,
}

impl ShardDescriptor {
    /// A non-clustered store: one shard owning the whole keyspace.
    pub fn standalone(addr: impl Into<String>) -> Self {
        let addr = addr.into();
        Self {
            id: addr.clone(),
            addr,
            slots: vec![SlotRange::full()],
        }
    }

    /// Number of slots this shard owns
    pub fn slot_count(&self) -> usize {
        self.slots.iter().map(SlotRange::count).sum()
    }
}

impl std::fmt::Display for ShardDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ranges: Vec<String> = self.slots.iter().map(ToString::to_string).collect();
        write!(f, "{} ({}) [{}]", self.id, self.addr, ranges.join(","))
    }
}

/// Resolves the ordered set of source shards.
#[async_trait]
pub trait TopologyResolver: Send + Sync {
    /// Shards of the store behind `conn`, ordered by their first slot.
    async fn shards(&self, conn: &mut dyn Connection) -> Result<Vec<ShardDescriptor>>;
}

/// Resolver based on `CLUSTER SLOTS`.
#[derive(Debug, Default, Clone)]
pub struct ClusterSlotsResolver;

#[async_trait]
impl TopologyResolver for ClusterSlotsResolver {
    async fn shards(&self, conn: &mut dyn Connection) -> Result<Vec<ShardDescriptor>> {
        let seed_addr = conn.addr();
        let reply = conn
            .execute(Command::new("CLUSTER").arg("SLOTS"))
            .await?;

        match reply {
            Value::Error(msg) if is_cluster_disabled(&msg) => {
                debug!(addr = %seed_addr, "cluster support disabled, using a single shard");
                Ok(vec![ShardDescriptor::standalone(seed_addr)])
            }
            Value::Error(msg) => Err(MigrationError::Topology(msg)),
            reply => {
                let shards = shards_from_slots(&parse_cluster_slots(reply, &seed_addr)?);
                if shards.is_empty() {
                    return Err(MigrationError::Topology(
                        "cluster reports no assigned slots".into(),
                    ));
                }
                Ok(shards)
            }
        }
    }
}

/// `ERR This instance has cluster support disabled`
pub fn is_cluster_disabled(msg: &str) -> bool {
    msg.contains("cluster support disabled")
}

/// One row of `CLUSTER SLOTS`: a slot range and its primary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotOwner {
    /// Slot range
    pub range: SlotRange,
    /// Primary address
    pub addr: String,
    /// Primary node id (empty on very old servers)
    pub node_id: String,
}

/// Parse a `CLUSTER SLOTS` reply.
///
/// An empty host in a node entry means "the node you asked", so it is
/// replaced with the host of `seed_addr`.
pub fn parse_cluster_slots(reply: Value, seed_addr: &str) -> Result<Vec<SlotOwner>> {
    let seed_host = seed_addr
        .rsplit_once(':')
        .map(|(host, _)| host)
        .unwrap_or(seed_addr);

    let mut owners = Vec::new();
    for row in reply.into_array()? {
        let row = row.into_array()?;
        if row.len() < 3 {
            return Err(MigrationError::Topology(
                "malformed CLUSTER SLOTS row".into(),
            ));
        }
        let mut fields = row.into_iter();
        let start = slot_number(fields.next())?;
        let end = slot_number(fields.next())?;
        let primary = fields
            .next()
            .ok_or_else(|| MigrationError::Topology("missing primary".into()))?
            .into_array()?;

        let mut node = primary.into_iter();
        let host = node
            .next()
            .and_then(|v| v.as_str().map(str::to_string))
            .ok_or_else(|| MigrationError::Topology("missing primary host".into()))?;
        let port = node
            .next()
            .and_then(|v| v.as_integer())
            .ok_or_else(|| MigrationError::Topology("missing primary port".into()))?;
        let node_id = node
            .next()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();

        let host = if host.is_empty() { seed_host.to_string() } else { host };
        owners.push(SlotOwner {
            range: SlotRange::new(start, end),
            addr: format!("{}:{}", host, port),
            node_id,
        });
    }
    Ok(owners)
}

fn slot_number(value: Option<Value>) -> Result<u16> {
    value
        .and_then(|v| v.as_integer())
        .and_then(|n| u16::try_from(n).ok())
        .ok_or_else(|| MigrationError::Topology("invalid slot number".into()))
}

/// Group slot rows by primary, ordered by each primary's first slot.
pub fn shards_from_slots(owners: &[SlotOwner]) -> Vec<ShardDescriptor> {
    let mut by_addr: BTreeMap<&str, (String, Vec<SlotRange>)> = BTreeMap::new();
    for owner in owners {
        let entry = by_addr.entry(owner.addr.as_str()).or_insert_with(|| {
            let id = if owner.node_id.is_empty() {
                owner.addr.clone()
            } else {
                owner.node_id.clone()
            };
            (id, Vec::new())
        });
        entry.1.push(owner.range);
    }

    let mut shards: Vec<ShardDescriptor> = by_addr
        .into_iter()
        .map(|(addr, (id, ranges))| ShardDescriptor {
            id,
            addr: addr.to_string(),
            slots: coalesce(ranges),
        })
        .collect();
    shards.sort_by_key(|s| s.slots.first().map(|r| r.start).unwrap_or(u16::MAX));
    shards
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn node(host: &str, port: i64, id: &str) -> Value {
        Value::Array(vec![
            Value::Bulk(Bytes::from(host.to_string())),
            Value::Integer(port),
            Value::Bulk(Bytes::from(id.to_string())),
        ])
    }

    fn row(start: i64, end: i64, primary: Value) -> Value {
        Value::Array(vec![Value::Integer(start), Value::Integer(end), primary])
    }

    #[test]
    fn test_parse_cluster_slots() {
        let reply = Value::Array(vec![
            row(5461, 10922, node("10.0.0.2", 7001, "b")),
            row(0, 5460, node("10.0.0.1", 7000, "a")),
            row(10923, 16383, node("", 7002, "c")),
        ]);
        let owners = parse_cluster_slots(reply, "seed.local:7000").unwrap();
        assert_eq!(owners.len(), 3);
        assert_eq!(owners[2].addr, "seed.local:7002");

        let shards = shards_from_slots(&owners);
        let ids: Vec<&str> = shards.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(shards[0].slots, vec![SlotRange::new(0, 5460)]);
        let total: usize = shards.iter().map(ShardDescriptor::slot_count).sum();
        assert_eq!(total, 16384);
    }

    #[test]
    fn test_ranges_of_one_primary_are_merged() {
        let reply = Value::Array(vec![
            row(0, 99, node("h", 1, "a")),
            row(200, 299, node("h", 2, "b")),
            row(100, 199, node("h", 1, "a")),
        ]);
        let shards = shards_from_slots(&parse_cluster_slots(reply, "h:1").unwrap());
        assert_eq!(shards.len(), 2);
        assert_eq!(shards[0].slots, vec![SlotRange::new(0, 199)]);
    }

    #[test]
    fn test_malformed_reply() {
        let reply = Value::Array(vec![Value::Array(vec![Value::Integer(0)])]);
        assert!(parse_cluster_slots(reply, "h:1").is_err());
        assert!(parse_cluster_slots(Value::Integer(3), "h:1").is_err());
    }

    #[test]
    fn test_standalone_descriptor() {
        let shard = ShardDescriptor::standalone("127.0.0.1:6379");
        assert_eq!(shard.slot_count(), 16384);
        assert_eq!(shard.id, "127.0.0.1:6379");
        assert!(shard.to_string().contains("0-16383"));
    }
}

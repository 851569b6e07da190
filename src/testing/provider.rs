//! Connection provider over in-memory stores.

use async_trait::async_trait;

use super::MemoryStore;
use crate::cluster::{ShardDescriptor, SlotRange, TopologyResolver, CLUSTER_SLOTS};
use crate::connection::{Connection, ConnectionProvider, Role};
use crate::error::{MigrationError, Result};

/// Serves one shard per source store and a single target store.
///
/// With several sources the slot space is split evenly between them, in
/// order; a single source is a standalone server owning every slot. Each
/// shard is addressed by its store's name.
#[derive(Debug, Clone)]
pub struct MemoryProvider {
    sources: Vec<MemoryStore>,
    target: MemoryStore,
}

impl MemoryProvider {
    /// Provider with one shard per store in `sources`, in order.
    pub fn new(sources: Vec<MemoryStore>, target: MemoryStore) -> Self {
        Self { sources, target }
    }

    /// The store every target connection writes to.
    pub fn target(&self) -> &MemoryStore {
        &self.target
    }

    /// The shards this provider reports as the source topology.
    pub fn descriptors(&self) -> Vec<ShardDescriptor> {
        if let [single] = self.sources.as_slice() {
            return vec![ShardDescriptor::standalone(single.name())];
        }
        let n = self.sources.len();
        let total = CLUSTER_SLOTS as usize;
        self.sources
            .iter()
            .enumerate()
            .map(|(i, store)| {
                let start = (i * total / n) as u16;
                let end = ((i + 1) * total / n - 1) as u16;
                ShardDescriptor {
                    id: store.name().to_string(),
                    addr: store.name().to_string(),
                    slots: vec![SlotRange::new(start, end)],
                }
            })
            .collect()
    }

    fn source(&self, addr: &str) -> Result<&MemoryStore> {
        self.sources
            .iter()
            .find(|s| s.name() == addr)
            .ok_or_else(|| MigrationError::Topology(format!("no shard at {}", addr)))
    }
}

#[async_trait]
impl ConnectionProvider for MemoryProvider {
    async fn connect(&self, role: Role) -> Result<Box<dyn Connection>> {
        let store = match role {
            Role::Source => self
                .sources
                .first()
                .ok_or_else(|| MigrationError::Topology("no source stores".into()))?,
            Role::Target => &self.target,
        };
        Ok(Box::new(store.connect()?))
    }

    async fn connect_shard(&self, shard: &ShardDescriptor) -> Result<Box<dyn Connection>> {
        Ok(Box::new(self.source(&shard.addr)?.connect()?))
    }
}

#[async_trait]
impl TopologyResolver for MemoryProvider {
    async fn shards(&self, _conn: &mut dyn Connection) -> Result<Vec<ShardDescriptor>> {
        if self.sources.is_empty() {
            return Err(MigrationError::Topology("no source stores".into()));
        }
        Ok(self.descriptors())
    }
}

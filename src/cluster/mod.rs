//! Cluster topology support
//!
//! - CRC16 hash slots and slot ranges
//! - Discovery of the source shards via `CLUSTER SLOTS`

pub mod slots;
pub mod topology;

pub use slots::{HashSlot, SlotRange, CLUSTER_SLOTS};
pub use topology::{
    is_cluster_disabled, parse_cluster_slots, shards_from_slots, ClusterSlotsResolver,
    ShardDescriptor, SlotOwner, TopologyResolver,
};

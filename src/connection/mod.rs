//! Store connections
//!
//! The migration core only talks to stores through the [`Connection`]
//! trait: one command, or a pipeline of commands answered in order. A
//! [`ConnectionProvider`] hands out connections for the source shards and
//! the target, which lets tests run the whole engine against in-memory
//! stores.

use async_trait::async_trait;

use crate::cluster::ShardDescriptor;
use crate::error::{MigrationError, Result};
use crate::protocol::{Command, Value};

mod cluster;
mod connector;
mod tcp;

pub use cluster::ClusterConnection;
pub use connector::RespConnector;
pub use tcp::RespConnection;

/// A connection to a store.
///
/// Replies are returned raw: an error reply for one command is a
/// [`Value::Error`] in its slot, not an `Err`. `Err` means the transport
/// failed and the state of the whole pipeline is unknown.
#[async_trait]
pub trait Connection: Send {
    /// Send `commands` in one round trip and return one reply per command,
    /// in order.
    async fn pipeline(&mut self, commands: Vec<Command>) -> Result<Vec<Value>>;

    /// Send a single command.
    async fn execute(&mut self, command: Command) -> Result<Value> {
        self.pipeline(vec![command])
            .await?
            .pop()
            .ok_or_else(|| MigrationError::Protocol("empty reply to a single command".into()))
    }

    /// Drop the current socket(s) and connect again.
    async fn reconnect(&mut self) -> Result<()>;

    /// `host:port` of the node (or seed node) behind this connection
    fn addr(&self) -> String;
}

/// Which side of the migration a connection serves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The store keys are read from
    Source,
    /// The store keys are written to
    Target,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Source => write!(f, "source"),
            Role::Target => write!(f, "target"),
        }
    }
}

/// Hands out connections to the source shards and the target.
#[async_trait]
pub trait ConnectionProvider: Send + Sync {
    /// Connection to the seed node of `role`. For the target this routes
    /// each key to the node that owns it.
    async fn connect(&self, role: Role) -> Result<Box<dyn Connection>>;

    /// Connection to the primary serving a source shard.
    async fn connect_shard(&self, shard: &ShardDescriptor) -> Result<Box<dyn Connection>>;
}

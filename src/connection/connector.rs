//! TCP connection provider.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::time::Duration;
use tracing::info;

use super::{ClusterConnection, Connection, ConnectionProvider, RespConnection, Role};
use crate::cluster::{is_cluster_disabled, ShardDescriptor};
use crate::config::{Endpoint, EndpointConfig};
use crate::error::Result;
use crate::protocol::{Command, Value};

#[derive(Debug, Clone)]
struct Side {
    endpoint: Endpoint,
    connect_timeout: Duration,
    io_timeout: Duration,
}

impl Side {
    fn from_config(config: &EndpointConfig) -> Result<Self> {
        Ok(Self {
            endpoint: config.endpoint()?,
            connect_timeout: config.connect_timeout(),
            io_timeout: config.io_timeout(),
        })
    }

    async fn open(&self, endpoint: Endpoint) -> Result<RespConnection> {
        RespConnection::connect(endpoint, self.connect_timeout, self.io_timeout).await
    }
}

/// Opens real TCP connections to the source and target stores.
///
/// Whether the target is a cluster is probed once, on the first target
/// connection, and remembered for the rest of the run.
#[derive(Debug)]
pub struct RespConnector {
    source: Side,
    target: Side,
    target_is_cluster: Mutex<Option<bool>>,
}

impl RespConnector {
    /// Build a connector from the two endpoint configurations.
    pub fn new(source: &EndpointConfig, target: &EndpointConfig) -> Result<Self> {
        Ok(Self {
            source: Side::from_config(source)?,
            target: Side::from_config(target)?,
            target_is_cluster: Mutex::new(None),
        })
    }

    async fn connect_target(&self) -> Result<Box<dyn Connection>> {
        let cached = *self.target_is_cluster.lock();
        let is_cluster = match cached {
            Some(known) => known,
            None => {
                let mut probe = self.target.open(self.target.endpoint.clone()).await?;
                let reply = probe.execute(Command::new("CLUSTER").arg("SLOTS")).await?;
                let is_cluster = match &reply {
                    Value::Error(msg) if is_cluster_disabled(msg) => false,
                    Value::Array(rows) => !rows.is_empty(),
                    _ => false,
                };
                info!(
                    addr = %self.target.endpoint.addr(),
                    cluster = is_cluster,
                    "probed target topology"
                );
                *self.target_is_cluster.lock() = Some(is_cluster);
                if !is_cluster {
                    return Ok(Box::new(probe));
                }
                true
            }
        };

        if is_cluster {
            let conn = ClusterConnection::connect(
                self.target.endpoint.clone(),
                self.target.connect_timeout,
                self.target.io_timeout,
            )
            .await?;
            Ok(Box::new(conn))
        } else {
            Ok(Box::new(
                self.target.open(self.target.endpoint.clone()).await?,
            ))
        }
    }
}

#[async_trait]
impl ConnectionProvider for RespConnector {
    async fn connect(&self, role: Role) -> Result<Box<dyn Connection>> {
        match role {
            Role::Source => Ok(Box::new(
                self.source.open(self.source.endpoint.clone()).await?,
            )),
            Role::Target => self.connect_target().await,
        }
    }

    async fn connect_shard(&self, shard: &ShardDescriptor) -> Result<Box<dyn Connection>> {
        let endpoint = self.source.endpoint.with_addr(&shard.addr)?;
        Ok(Box::new(self.source.open(endpoint).await?))
    }
}

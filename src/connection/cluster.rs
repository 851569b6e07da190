//! Slot-routing connection to a Redis cluster.

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

use super::{Connection, RespConnection};
use crate::cluster::{parse_cluster_slots, HashSlot, SlotOwner};
use crate::config::Endpoint;
use crate::error::{is_redirect_reply, MigrationError, Result};
use crate::protocol::{Command, Value};

/// Routes every command to the node that owns its key.
///
/// A pipeline is split into one sub-pipeline per node and the replies are
/// put back in input order. `MULTI` travels with the next keyed command and
/// `EXEC`/`DISCARD` with the previous one, so a transaction addressing a
/// single key stays on one node.
///
/// A `MOVED` reply is returned as is and schedules a slot map refresh
/// before the next round trip. An `ASK` reply to a command outside a
/// transaction is followed at once: the command is sent again to the
/// importing node, preceded by `ASKING`. Inside `MULTI`/`EXEC` the `ASK`
/// reply is returned as is, and the caller retries the whole transaction.
pub struct ClusterConnection {
    seed: Endpoint,
    connect_timeout: Duration,
    io_timeout: Duration,
    /// Slot owners sorted by range start
    slots: Vec<SlotOwner>,
    nodes: HashMap<String, RespConnection>,
    needs_refresh: bool,
}

impl ClusterConnection {
    /// Connect to the seed node and load the slot map.
    pub async fn connect(
        seed: Endpoint,
        connect_timeout: Duration,
        io_timeout: Duration,
    ) -> Result<Self> {
        let mut conn = Self {
            seed,
            connect_timeout,
            io_timeout,
            slots: Vec::new(),
            nodes: HashMap::new(),
            needs_refresh: true,
        };
        conn.refresh().await?;
        Ok(conn)
    }

    /// Number of distinct primaries in the current slot map
    pub fn node_count(&self) -> usize {
        let mut addrs: Vec<&str> = self.slots.iter().map(|s| s.addr.as_str()).collect();
        addrs.sort_unstable();
        addrs.dedup();
        addrs.len()
    }

    async fn refresh(&mut self) -> Result<()> {
        let seed_addr = self.seed.addr();
        let reply = {
            let node = self.node(&seed_addr).await?;
            node.execute(Command::new("CLUSTER").arg("SLOTS")).await?
        };
        let mut owners = match reply {
            Value::Error(msg) => return Err(MigrationError::Topology(msg)),
            reply => parse_cluster_slots(reply, &seed_addr)?,
        };
        if owners.is_empty() {
            return Err(MigrationError::Topology(
                "cluster reports no assigned slots".into(),
            ));
        }
        owners.sort_by_key(|o| o.range.start);

        self.slots = owners;
        self.needs_refresh = false;
        info!(
            addr = %seed_addr,
            ranges = self.slots.len(),
            nodes = self.node_count(),
            "loaded cluster slot map"
        );
        Ok(())
    }

    /// Connection to `addr`, opened on first use.
    async fn node(&mut self, addr: &str) -> Result<&mut RespConnection> {
        if !self.nodes.contains_key(addr) {
            let endpoint = self.seed.with_addr(addr)?;
            let conn =
                RespConnection::connect(endpoint, self.connect_timeout, self.io_timeout).await?;
            self.nodes.insert(addr.to_string(), conn);
        }
        self.nodes
            .get_mut(addr)
            .ok_or_else(|| MigrationError::Connection(format!("{}: not connected", addr)))
    }

    /// Send `commands` to the node at `addr`. A failed round trip forgets
    /// the node and schedules a slot map refresh.
    async fn send_to(&mut self, addr: &str, commands: Vec<Command>) -> Result<Vec<Value>> {
        let node = self.node(addr).await?;
        match node.pipeline(commands).await {
            Ok(replies) => Ok(replies),
            Err(e) => {
                // the node may be gone for good, forget it and re-learn the map
                self.nodes.remove(addr);
                self.needs_refresh = true;
                Err(e)
            }
        }
    }

    fn owner_of(&self, key: &[u8]) -> Option<&str> {
        let slot = HashSlot::for_key(key);
        self.slots
            .iter()
            .find(|owner| owner.range.contains(slot))
            .map(|owner| owner.addr.as_str())
    }

    /// Node address for every command in `commands`.
    fn route(&self, commands: &[Command]) -> Result<Vec<String>> {
        let default = self
            .slots
            .first()
            .map(|o| o.addr.clone())
            .unwrap_or_else(|| self.seed.addr());

        let keyed: Vec<Option<String>> = commands
            .iter()
            .map(|cmd| {
                cmd.key().map(|key| {
                    self.owner_of(key)
                        .map(str::to_string)
                        .ok_or_else(|| {
                            MigrationError::Topology(format!(
                                "slot {} is not served by any node",
                                HashSlot::for_key(key)
                            ))
                        })
                })
            })
            .map(Option::transpose)
            .collect::<Result<_>>()?;

        let mut routes = Vec::with_capacity(commands.len());
        for (i, cmd) in commands.iter().enumerate() {
            let addr = match &keyed[i] {
                Some(addr) => addr.clone(),
                None => {
                    let tied = match cmd.name().as_str() {
                        "MULTI" => keyed[i + 1..].iter().flatten().next().cloned(),
                        "EXEC" | "DISCARD" => keyed[..i].iter().rev().flatten().next().cloned(),
                        _ => None,
                    };
                    tied.unwrap_or_else(|| default.clone())
                }
            };
            routes.push(addr);
        }
        Ok(routes)
    }
}

#[async_trait]
impl Connection for ClusterConnection {
    async fn pipeline(&mut self, commands: Vec<Command>) -> Result<Vec<Value>> {
        if commands.is_empty() {
            return Ok(Vec::new());
        }
        if self.needs_refresh {
            self.refresh().await?;
        }

        let routes = self.route(&commands)?;
        let transactional = in_transaction(&commands);
        let mut groups: Vec<(String, Vec<usize>, Vec<Command>)> = Vec::new();
        for (index, (cmd, addr)) in commands.iter().cloned().zip(routes).enumerate() {
            match groups.iter_mut().find(|(a, _, _)| *a == addr) {
                Some((_, indices, cmds)) => {
                    indices.push(index);
                    cmds.push(cmd);
                }
                None => groups.push((addr, vec![index], vec![cmd])),
            }
        }

        let mut replies: Vec<Option<Value>> = vec![None; commands.len()];
        let mut asked: Vec<(String, Vec<usize>)> = Vec::new();
        for (addr, indices, cmds) in groups {
            let node_replies = self.send_to(&addr, cmds).await?;
            for (index, reply) in indices.into_iter().zip(node_replies) {
                if let Value::Error(msg) = &reply {
                    match ask_target(msg) {
                        Some(importer) if !transactional[index] => {
                            match asked.iter_mut().find(|(a, _)| a.as_str() == importer) {
                                Some((_, indices)) => indices.push(index),
                                None => asked.push((importer.to_string(), vec![index])),
                            }
                        }
                        _ if is_redirect_reply(msg) => {
                            debug!(addr = %addr, reply = %msg, "redirect, slot map is stale");
                            self.needs_refresh = true;
                        }
                        _ => {}
                    }
                }
                replies[index] = Some(reply);
            }
        }

        for (addr, indices) in asked {
            debug!(addr = %addr, commands = indices.len(), "following ASK redirect");
            let cmds = indices
                .iter()
                .flat_map(|&i| [Command::new("ASKING"), commands[i].clone()])
                .collect();
            let answers = self.send_to(&addr, cmds).await?;
            // every other reply answers ASKING
            for (index, reply) in indices.into_iter().zip(answers.into_iter().skip(1).step_by(2)) {
                replies[index] = Some(reply);
            }
        }

        replies
            .into_iter()
            .map(|r| r.ok_or_else(|| MigrationError::Protocol("missing reply".into())))
            .collect()
    }

    async fn reconnect(&mut self) -> Result<()> {
        self.nodes.clear();
        self.refresh().await
    }

    fn addr(&self) -> String {
        self.seed.addr()
    }
}

/// Importing node of an `ASK <slot> <addr>` reply.
fn ask_target(msg: &str) -> Option<&str> {
    let mut parts = msg.split_whitespace();
    if parts.next()? != "ASK" {
        return None;
    }
    parts.next()?;
    parts.next()
}

/// For each command, whether it belongs to a `MULTI` ... `EXEC` block.
fn in_transaction(commands: &[Command]) -> Vec<bool> {
    let mut open = false;
    commands
        .iter()
        .map(|cmd| match cmd.name().as_str() {
            "MULTI" => {
                open = true;
                true
            }
            "EXEC" | "DISCARD" => std::mem::replace(&mut open, false),
            _ => open,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::SlotRange;

    fn cluster_with(owners: Vec<(u16, u16, &str)>) -> ClusterConnection {
        ClusterConnection {
            seed: Endpoint::parse("seed:7000").unwrap(),
            connect_timeout: Duration::from_secs(1),
            io_timeout: Duration::from_secs(1),
            slots: owners
                .into_iter()
                .map(|(start, end, addr)| SlotOwner {
                    range: SlotRange::new(start, end),
                    addr: addr.to_string(),
                    node_id: String::new(),
                })
                .collect(),
            nodes: HashMap::new(),
            needs_refresh: false,
        }
    }

    #[test]
    fn test_route_by_slot() {
        let conn = cluster_with(vec![(0, 8191, "a:1"), (8192, 16383, "b:1")]);
        // foo -> 12182, bar -> 5061
        let routes = conn
            .route(&[
                Command::new("GET").arg("foo"),
                Command::new("GET").arg("bar"),
                Command::new("PING"),
            ])
            .unwrap();
        assert_eq!(routes, vec!["b:1", "a:1", "a:1"]);
    }

    #[test]
    fn test_transaction_stays_with_its_key() {
        let conn = cluster_with(vec![(0, 8191, "a:1"), (8192, 16383, "b:1")]);
        let routes = conn
            .route(&[
                Command::new("MULTI"),
                Command::new("DEL").arg("foo"),
                Command::new("RPUSH").arg("foo").arg("x"),
                Command::new("EXEC"),
                Command::new("MULTI"),
                Command::new("DEL").arg("bar"),
                Command::new("EXEC"),
            ])
            .unwrap();
        assert_eq!(routes, vec!["b:1", "b:1", "b:1", "b:1", "a:1", "a:1", "a:1"]);
    }

    #[test]
    fn test_ask_target() {
        assert_eq!(ask_target("ASK 12182 10.0.0.2:7001"), Some("10.0.0.2:7001"));
        assert_eq!(ask_target("MOVED 12182 10.0.0.2:7001"), None);
        assert_eq!(ask_target("ASK 12182"), None);
    }

    #[test]
    fn test_transaction_membership() {
        let flags = in_transaction(&[
            Command::new("RESTORE").arg("a"),
            Command::new("MULTI"),
            Command::new("DEL").arg("b"),
            Command::new("EXEC"),
            Command::new("SET").arg("c"),
        ]);
        assert_eq!(flags, vec![false, true, true, true, false]);
    }

    #[tokio::test]
    async fn test_ask_is_followed_to_the_importing_node() {
        use crate::testing::{spawn_server, MemoryStore};

        let importer = MemoryStore::new("a");
        let owner = MemoryStore::new("b");
        let (addr_a, _a) = spawn_server(importer.clone()).await.unwrap();
        let (addr_b, _b) = spawn_server(owner.clone()).await.unwrap();
        let owners = vec![
            SlotOwner {
                range: SlotRange::new(0, 8191),
                addr: addr_a.to_string(),
                node_id: String::new(),
            },
            SlotOwner {
                range: SlotRange::new(8192, 16383),
                addr: addr_b.to_string(),
                node_id: String::new(),
            },
        ];
        importer.set_cluster(addr_a.to_string(), owners.clone());
        owner.set_cluster(addr_b.to_string(), owners);
        // "foo" hashes to slot 12182, which b is handing over to a
        owner.set_migrating(12182, addr_a.to_string());
        importer.set_importing(12182);

        let mut conn = ClusterConnection::connect(
            Endpoint::parse(&addr_a.to_string()).unwrap(),
            Duration::from_secs(1),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        assert_eq!(conn.node_count(), 2);

        let replies = conn
            .pipeline(vec![
                Command::new("SET").arg("foo").arg("v"),
                Command::new("SET").arg("bar").arg("w"),
            ])
            .await
            .unwrap();
        assert_eq!(
            replies,
            vec![Value::Status("OK".into()), Value::Status("OK".into())]
        );
        assert_eq!(importer.get_string("foo"), Some(bytes::Bytes::from("v")));
        assert_eq!(owner.get_string("foo"), None);
        assert!(!conn.needs_refresh);
    }

    #[test]
    fn test_unserved_slot_is_an_error() {
        let conn = cluster_with(vec![(0, 100, "a:1")]);
        assert!(conn.route(&[Command::new("GET").arg("foo")]).is_err());
    }
}

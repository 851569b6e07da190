//! In-memory key-value store speaking the command subset the migration uses.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::Mutex;

use crate::cluster::{HashSlot, SlotOwner};
use crate::connection::Connection;
use crate::error::{MigrationError, Result};
use crate::protocol::{format_score, parse_score, Command, Value};

const WRONGTYPE: &str = "WRONGTYPE Operation against a key holding the wrong kind of value";
const BAD_DUMP: &str = "ERR DUMP payload version or checksum are wrong";
const SYNTAX: &str = "ERR syntax error";

const DUMP_STRING: u8 = 0;
const DUMP_LIST: u8 = 1;
const DUMP_HASH: u8 = 2;
const DUMP_SET: u8 = 3;
const DUMP_ZSET: u8 = 4;

/// A value held by a [`MemoryStore`].
#[derive(Debug, Clone, PartialEq)]
pub enum StoredValue {
    String(Bytes),
    List(Vec<Bytes>),
    Set(BTreeSet<Bytes>),
    /// Kept ordered by score, then member.
    SortedSet(Vec<(Bytes, f64)>),
    Hash(BTreeMap<Bytes, Bytes>),
    /// Opaque stand-in for a type the migration cannot carry.
    Stream(Vec<Bytes>),
}

impl StoredValue {
    fn type_name(&self) -> &'static str {
        match self {
            StoredValue::String(_) => "string",
            StoredValue::List(_) => "list",
            StoredValue::Set(_) => "set",
            StoredValue::SortedSet(_) => "zset",
            StoredValue::Hash(_) => "hash",
            StoredValue::Stream(_) => "stream",
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: StoredValue,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: StoredValue) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Debug)]
struct Fault {
    remaining: u32,
    message: String,
}

impl Fault {
    fn trip(&mut self) -> Option<Value> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        Some(Value::Error(self.message.clone()))
    }
}

#[derive(Debug, Clone)]
struct ClusterView {
    own_addr: String,
    owners: Vec<SlotOwner>,
    /// Slots being handed over, with the address of the importing node
    migrating: HashMap<u16, String>,
    importing: HashSet<u16>,
}

#[derive(Debug, Default)]
struct State {
    data: BTreeMap<Bytes, Entry>,
    write_faults: HashMap<Bytes, Fault>,
    command_faults: HashMap<(String, Bytes), Fault>,
    scan_limit: Option<u64>,
    scans: u64,
    opaque_disabled: bool,
    unreachable: bool,
    cluster: Option<ClusterView>,
}

/// Shared in-memory store. Clones see the same data.
///
/// Besides holding data it can inject the failures a migration has to
/// survive: rejected writes, a node dropping mid-scan, a store without
/// `DUMP`/`RESTORE`, and a store that is unreachable altogether.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    name: String,
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    /// Empty store. `name` doubles as its address.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    /// Name given at construction, also reported as the connection address.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// A client connection, whether or not the store is reachable.
    pub fn connection(&self) -> MemoryConnection {
        MemoryConnection {
            store: self.clone(),
            transaction: None,
            asking: false,
        }
    }

    /// A client connection, refused while the store is unreachable.
    pub fn connect(&self) -> Result<MemoryConnection> {
        if self.state.lock().unreachable {
            return Err(MigrationError::Connection(format!(
                "{}: connection refused",
                self.name
            )));
        }
        Ok(self.connection())
    }

    /// Store a string, replacing any value and TTL.
    pub fn set(&self, key: impl Into<Bytes>, value: impl Into<Bytes>) {
        self.insert(key.into(), StoredValue::String(value.into()));
    }

    /// Store a list with `items` in order.
    pub fn rpush<I, V>(&self, key: impl Into<Bytes>, items: I)
    where
        I: IntoIterator<Item = V>,
        V: Into<Bytes>,
    {
        let items = items.into_iter().map(Into::into).collect();
        self.insert(key.into(), StoredValue::List(items));
    }

    /// Store a set of `members`.
    pub fn sadd<I, V>(&self, key: impl Into<Bytes>, members: I)
    where
        I: IntoIterator<Item = V>,
        V: Into<Bytes>,
    {
        let members = members.into_iter().map(Into::into).collect();
        self.insert(key.into(), StoredValue::Set(members));
    }

    /// Store a sorted set. A repeated member keeps its last score.
    pub fn zadd<I, M>(&self, key: impl Into<Bytes>, members: I)
    where
        I: IntoIterator<Item = (M, f64)>,
        M: Into<Bytes>,
    {
        let mut zset = Vec::new();
        for (member, score) in members {
            zset_insert(&mut zset, member.into(), score);
        }
        self.insert(key.into(), StoredValue::SortedSet(zset));
    }

    /// Store a hash of `fields`.
    pub fn hset<I, F, V>(&self, key: impl Into<Bytes>, fields: I)
    where
        I: IntoIterator<Item = (F, V)>,
        F: Into<Bytes>,
        V: Into<Bytes>,
    {
        let fields = fields
            .into_iter()
            .map(|(f, v)| (f.into(), v.into()))
            .collect();
        self.insert(key.into(), StoredValue::Hash(fields));
    }

    /// Store a key of a type the migration does not support.
    pub fn add_stream(&self, key: impl Into<Bytes>) {
        self.insert(
            key.into(),
            StoredValue::Stream(vec![Bytes::from_static(b"0-1")]),
        );
    }

    /// Give an existing key a time to live.
    pub fn expire(&self, key: impl AsRef<[u8]>, ttl: Duration) {
        let mut state = self.state.lock();
        if let Some(entry) = state.data.get_mut(key.as_ref()) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
    }

    /// Remove `key`; true if it existed.
    pub fn delete(&self, key: impl AsRef<[u8]>) -> bool {
        self.state.lock().data.remove(key.as_ref()).is_some()
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let mut state = self.state.lock();
        state.purge(Instant::now());
        state.data.len()
    }

    /// True when no live key is left.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every live key with its value, in key order.
    pub fn snapshot(&self) -> BTreeMap<Bytes, StoredValue> {
        let mut state = self.state.lock();
        state.purge(Instant::now());
        state
            .data
            .iter()
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect()
    }

    /// Live value of `key`.
    pub fn get(&self, key: impl AsRef<[u8]>) -> Option<StoredValue> {
        let mut state = self.state.lock();
        state.live(key.as_ref(), Instant::now()).map(|e| e.value.clone())
    }

    /// String value of `key`; `None` if missing or of another type.
    pub fn get_string(&self, key: impl AsRef<[u8]>) -> Option<Bytes> {
        match self.get(key)? {
            StoredValue::String(v) => Some(v),
            _ => None,
        }
    }

    /// List value of `key`.
    pub fn get_list(&self, key: impl AsRef<[u8]>) -> Option<Vec<Bytes>> {
        match self.get(key)? {
            StoredValue::List(v) => Some(v),
            _ => None,
        }
    }

    /// Set value of `key`.
    pub fn get_set(&self, key: impl AsRef<[u8]>) -> Option<BTreeSet<Bytes>> {
        match self.get(key)? {
            StoredValue::Set(v) => Some(v),
            _ => None,
        }
    }

    /// Sorted-set value of `key`, ordered by score then member.
    pub fn get_zset(&self, key: impl AsRef<[u8]>) -> Option<Vec<(Bytes, f64)>> {
        match self.get(key)? {
            StoredValue::SortedSet(v) => Some(v),
            _ => None,
        }
    }

    /// Hash value of `key`.
    pub fn get_hash(&self, key: impl AsRef<[u8]>) -> Option<BTreeMap<Bytes, Bytes>> {
        match self.get(key)? {
            StoredValue::Hash(v) => Some(v),
            _ => None,
        }
    }

    /// Remaining TTL in milliseconds: -2 if missing, -1 if persistent.
    pub fn pttl(&self, key: impl AsRef<[u8]>) -> i64 {
        let mut state = self.state.lock();
        let now = Instant::now();
        match state.live(key.as_ref(), now) {
            None => -2,
            Some(entry) => remaining_ms(entry, now),
        }
    }

    /// Reject the next `times` writes to `key` with the error reply `message`.
    pub fn fail_writes(&self, key: impl Into<Bytes>, times: u32, message: impl Into<String>) {
        self.state.lock().write_faults.insert(
            key.into(),
            Fault {
                remaining: times,
                message: message.into(),
            },
        );
    }

    /// Answer the next `times` `command` calls on `key` (reads included)
    /// with the error reply `message`.
    pub fn fail_command(
        &self,
        command: &str,
        key: impl Into<Bytes>,
        times: u32,
        message: impl Into<String>,
    ) {
        self.state.lock().command_faults.insert(
            (command.to_ascii_uppercase(), key.into()),
            Fault {
                remaining: times,
                message: message.into(),
            },
        );
    }

    /// Serve `calls` more `SCAN` calls, then become unreachable.
    pub fn fail_scans_after(&self, calls: u64) {
        let mut state = self.state.lock();
        state.scan_limit = Some(state.scans + calls);
    }

    /// Stop understanding `DUMP` and `RESTORE`.
    pub fn disable_opaque(&self) {
        self.state.lock().opaque_disabled = true;
    }

    /// Refuse new connections and fail every round trip while `unreachable`.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().unreachable = unreachable;
    }

    /// Act as the cluster node at `own_addr` in a cluster laid out as
    /// `owners`. Keys in slots owned elsewhere get `MOVED` replies.
    pub fn set_cluster(&self, own_addr: impl Into<String>, owners: Vec<SlotOwner>) {
        self.state.lock().cluster = Some(ClusterView {
            own_addr: own_addr.into(),
            owners,
            migrating: HashMap::new(),
            importing: HashSet::new(),
        });
    }

    /// Start handing `slot` over to the node at `addr`. Keys of that slot
    /// that are not here get `ASK` replies. Needs a cluster view.
    pub fn set_migrating(&self, slot: u16, addr: impl Into<String>) {
        if let Some(cluster) = self.state.lock().cluster.as_mut() {
            cluster.migrating.insert(slot, addr.into());
        }
    }

    /// Accept keys of `slot` from clients that sent `ASKING` just before.
    /// Needs a cluster view.
    pub fn set_importing(&self, slot: u16) {
        if let Some(cluster) = self.state.lock().cluster.as_mut() {
            cluster.importing.insert(slot);
        }
    }

    fn insert(&self, key: Bytes, value: StoredValue) {
        self.state.lock().data.insert(key, Entry::new(value));
    }
}

/// Client connection to a [`MemoryStore`], with its own `MULTI` state.
#[derive(Debug)]
pub struct MemoryConnection {
    store: MemoryStore,
    transaction: Option<Transaction>,
    asking: bool,
}

#[derive(Debug, Default)]
struct Transaction {
    queued: Vec<Command>,
    aborted: bool,
}

impl MemoryConnection {
    /// Store behind this connection.
    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    fn unreachable(&self) -> MigrationError {
        MigrationError::Connection(format!("{}: connection reset by peer", self.store.name))
    }

    fn dispatch(&mut self, state: &mut State, command: Command) -> Value {
        let name = command.name();
        match name.as_str() {
            "MULTI" => {
                if self.transaction.is_some() {
                    return Value::Error("ERR MULTI calls can not be nested".into());
                }
                self.transaction = Some(Transaction::default());
                Value::Status("OK".into())
            }
            "EXEC" => match self.transaction.take() {
                None => Value::Error("ERR EXEC without MULTI".into()),
                Some(tx) if tx.aborted => Value::Error(
                    "EXECABORT Transaction discarded because of previous errors.".into(),
                ),
                Some(tx) => Value::Array(
                    tx.queued
                        .iter()
                        .map(|cmd| state.execute(cmd, false))
                        .collect(),
                ),
            },
            "DISCARD" => match self.transaction.take() {
                None => Value::Error("ERR DISCARD without MULTI".into()),
                Some(_) => Value::Status("OK".into()),
            },
            "ASKING" => {
                self.asking = true;
                Value::Status("OK".into())
            }
            _ => {
                let asking = std::mem::take(&mut self.asking);
                if let Some(moved) = state.redirect(&command, asking) {
                    if let Some(tx) = self.transaction.as_mut() {
                        tx.aborted = true;
                    }
                    return moved;
                }
                match self.transaction.as_mut() {
                    Some(tx) => {
                        if !tx.aborted {
                            if let Some(fault) = state.write_fault(&command) {
                                tx.aborted = true;
                                return fault;
                            }
                        }
                        tx.queued.push(command);
                        Value::Status("QUEUED".into())
                    }
                    None => state.execute(&command, true),
                }
            }
        }
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn pipeline(&mut self, commands: Vec<Command>) -> Result<Vec<Value>> {
        let store = self.store.clone();
        let mut state = store.state.lock();
        if state.unreachable {
            self.transaction = None;
            return Err(self.unreachable());
        }
        state.purge(Instant::now());

        let mut replies = Vec::with_capacity(commands.len());
        for command in commands {
            if command.name() == "SCAN" {
                state.scans += 1;
                let scans = state.scans;
                if state.scan_limit.is_some_and(|limit| scans > limit) {
                    state.unreachable = true;
                    self.transaction = None;
                    return Err(self.unreachable());
                }
            }
            replies.push(self.dispatch(&mut state, command));
        }
        Ok(replies)
    }

    async fn reconnect(&mut self) -> Result<()> {
        self.transaction = None;
        self.asking = false;
        if self.store.state.lock().unreachable {
            return Err(self.unreachable());
        }
        Ok(())
    }

    fn addr(&self) -> String {
        self.store.name.clone()
    }
}

impl State {
    fn purge(&mut self, now: Instant) {
        self.data.retain(|_, entry| !entry.expired(now));
    }

    fn live(&mut self, key: &[u8], now: Instant) -> Option<&mut Entry> {
        if self.data.get(key).is_some_and(|e| e.expired(now)) {
            self.data.remove(key);
        }
        self.data.get_mut(key)
    }

    fn redirect(&self, command: &Command, asking: bool) -> Option<Value> {
        let cluster = self.cluster.as_ref()?;
        let key = command.key()?;
        let slot = HashSlot::for_key(key);
        if let Some(importer) = cluster.migrating.get(&slot) {
            if self.data.contains_key(key) {
                return None;
            }
            return Some(Value::Error(format!("ASK {} {}", slot, importer)));
        }
        if asking && cluster.importing.contains(&slot) {
            return None;
        }
        let owner = cluster.owners.iter().find(|o| o.range.contains(slot))?;
        if owner.addr == cluster.own_addr {
            return None;
        }
        Some(Value::Error(format!("MOVED {} {}", slot, owner.addr)))
    }

    fn write_fault(&mut self, command: &Command) -> Option<Value> {
        let key = command.key()?;
        if let Some(reply) = self
            .command_faults
            .get_mut(&(command.name(), key.clone()))
            .and_then(Fault::trip)
        {
            return Some(reply);
        }
        if !is_write(&command.name()) {
            return None;
        }
        self.write_faults.get_mut(key).and_then(Fault::trip)
    }

    fn execute(&mut self, command: &Command, check_faults: bool) -> Value {
        if check_faults {
            if let Some(fault) = self.write_fault(command) {
                return fault;
            }
        }
        let args = &command.as_args()[1..];
        let now = Instant::now();
        match command.name().as_str() {
            "PING" => Value::Status("PONG".into()),
            "AUTH" | "SELECT" => Value::Status("OK".into()),
            "DBSIZE" => Value::Integer(self.data.len() as i64),
            "SCAN" => self.scan(args),
            "TYPE" => match args.first() {
                None => arity("type"),
                Some(key) => Value::Status(
                    self.live(key, now)
                        .map_or("none", |e| e.value.type_name())
                        .into(),
                ),
            },
            "PTTL" => match args.first() {
                None => arity("pttl"),
                Some(key) => {
                    Value::Integer(self.live(key, now).map_or(-2, |e| remaining_ms(e, now)))
                }
            },
            "EXISTS" => Value::Integer(
                args.iter()
                    .filter(|k| self.live(k, now).is_some())
                    .count() as i64,
            ),
            "DEL" => Value::Integer(
                args.iter()
                    .filter(|k| self.data.remove(&k[..]).is_some())
                    .count() as i64,
            ),
            "PEXPIRE" => self.pexpire(args, now),
            "GET" => match args.first() {
                None => arity("get"),
                Some(key) => match self.live(key, now).map(|e| &e.value) {
                    None => Value::Nil,
                    Some(StoredValue::String(v)) => Value::Bulk(v.clone()),
                    Some(_) => Value::Error(WRONGTYPE.into()),
                },
            },
            "SET" => self.set(args, now),
            "LRANGE" => self.lrange(args, now),
            "RPUSH" => self.rpush(args, now),
            "SMEMBERS" => match args.first() {
                None => arity("smembers"),
                Some(key) => match self.live(key, now).map(|e| &e.value) {
                    None => Value::Array(vec![]),
                    Some(StoredValue::Set(s)) => {
                        Value::Array(s.iter().cloned().map(Value::Bulk).collect())
                    }
                    Some(_) => Value::Error(WRONGTYPE.into()),
                },
            },
            "SADD" => self.sadd(args, now),
            "ZRANGE" => self.zrange(args, now),
            "ZADD" => self.zadd(args, now),
            "HGETALL" => match args.first() {
                None => arity("hgetall"),
                Some(key) => match self.live(key, now).map(|e| &e.value) {
                    None => Value::Array(vec![]),
                    Some(StoredValue::Hash(h)) => Value::Array(
                        h.iter()
                            .flat_map(|(f, v)| [Value::Bulk(f.clone()), Value::Bulk(v.clone())])
                            .collect(),
                    ),
                    Some(_) => Value::Error(WRONGTYPE.into()),
                },
            },
            "HSET" => self.hset(args, now),
            "DUMP" if self.opaque_disabled => unknown("DUMP"),
            "DUMP" => match args.first() {
                None => arity("dump"),
                Some(key) => match self.live(key, now) {
                    None => Value::Nil,
                    Some(entry) => match dump(&entry.value) {
                        Some(blob) => Value::Bulk(blob),
                        None => Value::Error("ERR DUMP not supported for this type".into()),
                    },
                },
            },
            "RESTORE" if self.opaque_disabled => unknown("RESTORE"),
            "RESTORE" => self.restore(args, now),
            "COMMAND" => self.command_info(args),
            "CLUSTER" => self.cluster_slots(args),
            other => unknown(other),
        }
    }

    fn scan(&mut self, args: &[Bytes]) -> Value {
        let Some(cursor) = args.first().and_then(|c| parse_int::<usize>(c)) else {
            return Value::Error("ERR invalid cursor".into());
        };
        let mut count = 10usize;
        let mut pattern: Option<Vec<char>> = None;
        for pair in args[1..].chunks(2) {
            let [option, value] = pair else {
                return Value::Error(SYNTAX.into());
            };
            match option.to_ascii_uppercase().as_slice() {
                b"COUNT" => match parse_int::<usize>(value) {
                    Some(n) if n > 0 => count = n,
                    _ => return Value::Error(SYNTAX.into()),
                },
                b"MATCH" => pattern = Some(String::from_utf8_lossy(value).chars().collect()),
                _ => return Value::Error(SYNTAX.into()),
            }
        }

        let total = self.data.len();
        let end = cursor.saturating_add(count);
        let next = if end >= total { 0 } else { end };
        let keys = self
            .data
            .keys()
            .skip(cursor)
            .take(count)
            .filter(|key| match &pattern {
                None => true,
                Some(p) => {
                    let text: Vec<char> = String::from_utf8_lossy(key).chars().collect();
                    glob_match(p, &text)
                }
            })
            .cloned()
            .map(Value::Bulk)
            .collect();
        Value::Array(vec![
            Value::Bulk(Bytes::from(next.to_string())),
            Value::Array(keys),
        ])
    }

    fn pexpire(&mut self, args: &[Bytes], now: Instant) -> Value {
        let [key, ms] = args else {
            return arity("pexpire");
        };
        let Some(ms) = parse_int::<i64>(ms) else {
            return Value::Error("ERR value is not an integer or out of range".into());
        };
        if self.live(key, now).is_none() {
            return Value::Integer(0);
        }
        if ms <= 0 {
            self.data.remove(&key[..]);
        } else if let Some(entry) = self.data.get_mut(&key[..]) {
            entry.expires_at = Some(now + Duration::from_millis(ms as u64));
        }
        Value::Integer(1)
    }

    fn set(&mut self, args: &[Bytes], now: Instant) -> Value {
        let [key, value, options @ ..] = args else {
            return arity("set");
        };
        let mut expires_at = None;
        match options {
            [] => {}
            [unit, amount] => {
                let Some(amount) = parse_int::<u64>(amount).filter(|n| *n > 0) else {
                    return Value::Error("ERR invalid expire time in 'set' command".into());
                };
                expires_at = match unit.to_ascii_uppercase().as_slice() {
                    b"PX" => Some(now + Duration::from_millis(amount)),
                    b"EX" => Some(now + Duration::from_secs(amount)),
                    _ => return Value::Error(SYNTAX.into()),
                };
            }
            _ => return Value::Error(SYNTAX.into()),
        }
        self.data.insert(
            key.clone(),
            Entry {
                value: StoredValue::String(value.clone()),
                expires_at,
            },
        );
        Value::Status("OK".into())
    }

    /// Entry for a write to `key`, created empty with `init` if missing.
    /// `None` if the key holds another type.
    fn entry_for_write(
        &mut self,
        key: &Bytes,
        now: Instant,
        init: fn() -> StoredValue,
    ) -> Option<&mut StoredValue> {
        let fresh = init();
        if self.live(key, now).is_none() {
            self.data.insert(key.clone(), Entry::new(fresh));
            return self.data.get_mut(&key[..]).map(|e| &mut e.value);
        }
        let entry = self.data.get_mut(&key[..])?;
        if std::mem::discriminant(&entry.value) == std::mem::discriminant(&fresh) {
            Some(&mut entry.value)
        } else {
            None
        }
    }

    fn lrange(&mut self, args: &[Bytes], now: Instant) -> Value {
        let [key, start, stop] = args else {
            return arity("lrange");
        };
        let (Some(start), Some(stop)) = (parse_int::<i64>(start), parse_int::<i64>(stop)) else {
            return Value::Error("ERR value is not an integer or out of range".into());
        };
        match self.live(key, now).map(|e| &e.value) {
            None => Value::Array(vec![]),
            Some(StoredValue::List(items)) => Value::Array(
                index_range(items.len(), start, stop)
                    .map(|i| Value::Bulk(items[i].clone()))
                    .collect(),
            ),
            Some(_) => Value::Error(WRONGTYPE.into()),
        }
    }

    fn rpush(&mut self, args: &[Bytes], now: Instant) -> Value {
        let [key, items @ ..] = args else {
            return arity("rpush");
        };
        if items.is_empty() {
            return arity("rpush");
        }
        match self.entry_for_write(key, now, || StoredValue::List(Vec::new())) {
            Some(StoredValue::List(list)) => {
                list.extend(items.iter().cloned());
                Value::Integer(list.len() as i64)
            }
            _ => Value::Error(WRONGTYPE.into()),
        }
    }

    fn sadd(&mut self, args: &[Bytes], now: Instant) -> Value {
        let [key, members @ ..] = args else {
            return arity("sadd");
        };
        if members.is_empty() {
            return arity("sadd");
        }
        match self.entry_for_write(key, now, || StoredValue::Set(BTreeSet::new())) {
            Some(StoredValue::Set(set)) => {
                let added = members.iter().filter(|m| set.insert((*m).clone())).count();
                Value::Integer(added as i64)
            }
            _ => Value::Error(WRONGTYPE.into()),
        }
    }

    fn zrange(&mut self, args: &[Bytes], now: Instant) -> Value {
        let [key, start, stop, options @ ..] = args else {
            return arity("zrange");
        };
        let with_scores = match options {
            [] => false,
            [opt] if opt.eq_ignore_ascii_case(b"WITHSCORES") => true,
            _ => return Value::Error(SYNTAX.into()),
        };
        let (Some(start), Some(stop)) = (parse_int::<i64>(start), parse_int::<i64>(stop)) else {
            return Value::Error("ERR value is not an integer or out of range".into());
        };
        match self.live(key, now).map(|e| &e.value) {
            None => Value::Array(vec![]),
            Some(StoredValue::SortedSet(zset)) => {
                let mut out = Vec::new();
                for i in index_range(zset.len(), start, stop) {
                    let (member, score) = &zset[i];
                    out.push(Value::Bulk(member.clone()));
                    if with_scores {
                        out.push(Value::Bulk(Bytes::from(format_score(*score))));
                    }
                }
                Value::Array(out)
            }
            Some(_) => Value::Error(WRONGTYPE.into()),
        }
    }

    fn zadd(&mut self, args: &[Bytes], now: Instant) -> Value {
        let [key, pairs @ ..] = args else {
            return arity("zadd");
        };
        if pairs.is_empty() || pairs.len() % 2 != 0 {
            return Value::Error(SYNTAX.into());
        }
        let mut parsed = Vec::with_capacity(pairs.len() / 2);
        for pair in pairs.chunks(2) {
            match parse_score(&pair[0]) {
                Ok(score) => parsed.push((pair[1].clone(), score)),
                Err(_) => return Value::Error("ERR value is not a valid float".into()),
            }
        }
        match self.entry_for_write(key, now, || StoredValue::SortedSet(Vec::new())) {
            Some(StoredValue::SortedSet(zset)) => {
                let added = parsed
                    .into_iter()
                    .filter(|(member, score)| zset_insert(zset, member.clone(), *score))
                    .count();
                Value::Integer(added as i64)
            }
            _ => Value::Error(WRONGTYPE.into()),
        }
    }

    fn hset(&mut self, args: &[Bytes], now: Instant) -> Value {
        let [key, pairs @ ..] = args else {
            return arity("hset");
        };
        if pairs.is_empty() || pairs.len() % 2 != 0 {
            return arity("hset");
        }
        match self.entry_for_write(key, now, || StoredValue::Hash(BTreeMap::new())) {
            Some(StoredValue::Hash(hash)) => {
                let added = pairs
                    .chunks(2)
                    .filter(|pair| hash.insert(pair[0].clone(), pair[1].clone()).is_none())
                    .count();
                Value::Integer(added as i64)
            }
            _ => Value::Error(WRONGTYPE.into()),
        }
    }

    fn restore(&mut self, args: &[Bytes], now: Instant) -> Value {
        let [key, ttl, blob, options @ ..] = args else {
            return arity("restore");
        };
        let replace = match options {
            [] => false,
            [opt] if opt.eq_ignore_ascii_case(b"REPLACE") => true,
            _ => return Value::Error(SYNTAX.into()),
        };
        let Some(ttl) = parse_int::<i64>(ttl).filter(|t| *t >= 0) else {
            return Value::Error("ERR Invalid TTL value, must be >= 0".into());
        };
        if !replace && self.live(key, now).is_some() {
            return Value::Error("BUSYKEY Target key name already exists.".into());
        }
        let Some(value) = undump(blob.clone()) else {
            return Value::Error(BAD_DUMP.into());
        };
        let expires_at = (ttl > 0).then(|| now + Duration::from_millis(ttl as u64));
        self.data
            .insert(key.clone(), Entry { value, expires_at });
        Value::Status("OK".into())
    }

    fn command_info(&self, args: &[Bytes]) -> Value {
        let [sub, names @ ..] = args else {
            return arity("command");
        };
        if !sub.eq_ignore_ascii_case(b"INFO") {
            return Value::Error("ERR unknown subcommand".into());
        }
        Value::Array(
            names
                .iter()
                .map(|name| {
                    let name = String::from_utf8_lossy(name).to_ascii_lowercase();
                    if self.knows(&name) {
                        Value::Array(vec![Value::Bulk(Bytes::from(name))])
                    } else {
                        Value::Nil
                    }
                })
                .collect(),
        )
    }

    fn knows(&self, name: &str) -> bool {
        match name {
            "dump" | "restore" => !self.opaque_disabled,
            "ping" | "scan" | "type" | "pttl" | "exists" | "del" | "pexpire" | "get" | "set"
            | "lrange" | "rpush" | "smembers" | "sadd" | "zrange" | "zadd" | "hgetall"
            | "hset" | "multi" | "exec" | "discard" | "command" | "cluster" | "dbsize"
            | "asking" => true,
            _ => false,
        }
    }

    fn cluster_slots(&self, args: &[Bytes]) -> Value {
        if !args.first().is_some_and(|a| a.eq_ignore_ascii_case(b"SLOTS")) {
            return Value::Error("ERR unknown subcommand".into());
        }
        let Some(cluster) = &self.cluster else {
            return Value::Error("ERR This instance has cluster support disabled".into());
        };
        Value::Array(
            cluster
                .owners
                .iter()
                .map(|owner| {
                    let (host, port) = owner
                        .addr
                        .rsplit_once(':')
                        .unwrap_or((owner.addr.as_str(), "0"));
                    let mut node = vec![
                        Value::Bulk(Bytes::from(host.to_string())),
                        Value::Integer(port.parse().unwrap_or(0)),
                    ];
                    if !owner.node_id.is_empty() {
                        node.push(Value::Bulk(Bytes::from(owner.node_id.clone())));
                    }
                    Value::Array(vec![
                        Value::Integer(owner.range.start as i64),
                        Value::Integer(owner.range.end as i64),
                        Value::Array(node),
                    ])
                })
                .collect(),
        )
    }
}

fn is_write(name: &str) -> bool {
    matches!(
        name,
        "SET" | "RESTORE" | "DEL" | "RPUSH" | "SADD" | "ZADD" | "HSET" | "PEXPIRE"
    )
}

fn remaining_ms(entry: &Entry, now: Instant) -> i64 {
    match entry.expires_at {
        None => -1,
        Some(at) => at.saturating_duration_since(now).as_millis() as i64,
    }
}

fn arity(command: &str) -> Value {
    Value::Error(format!(
        "ERR wrong number of arguments for '{}' command",
        command
    ))
}

fn unknown(command: &str) -> Value {
    Value::Error(format!("ERR unknown command '{}'", command))
}

fn parse_int<T: std::str::FromStr>(raw: &[u8]) -> Option<T> {
    std::str::from_utf8(raw).ok()?.parse().ok()
}

/// Indices selected by an inclusive `start..=stop` range where negative
/// values count from the end.
fn index_range(len: usize, start: i64, stop: i64) -> std::ops::Range<usize> {
    let len = len as i64;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if start > stop || start >= len {
        0..0
    } else {
        start as usize..stop as usize + 1
    }
}

/// Insert or rescore `member`, keeping score-then-member order. True if new.
fn zset_insert(zset: &mut Vec<(Bytes, f64)>, member: Bytes, score: f64) -> bool {
    let existed = match zset.iter().position(|(m, _)| *m == member) {
        Some(pos) => {
            zset.remove(pos);
            true
        }
        None => false,
    };
    let pos = zset
        .iter()
        .position(|(m, s)| *s > score || (*s == score && *m > member))
        .unwrap_or(zset.len());
    zset.insert(pos, (member, score));
    !existed
}

/// Redis-style glob match supporting `*`, `?`, `[...]` and `\` escapes.
fn glob_match(pattern: &[char], text: &[char]) -> bool {
    let (mut p, mut t) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() {
            match pattern[p] {
                '*' => {
                    star = Some((p, t));
                    p += 1;
                    continue;
                }
                '?' => {
                    p += 1;
                    t += 1;
                    continue;
                }
                '[' => {
                    if let Some((matched, next)) = class_match(pattern, p, text[t]) {
                        if matched {
                            p = next;
                            t += 1;
                            continue;
                        }
                    }
                }
                '\\' if p + 1 < pattern.len() => {
                    if pattern[p + 1] == text[t] {
                        p += 2;
                        t += 1;
                        continue;
                    }
                }
                c if c == text[t] => {
                    p += 1;
                    t += 1;
                    continue;
                }
                _ => {}
            }
        }
        match star {
            Some((sp, st)) => {
                p = sp + 1;
                t = st + 1;
                star = Some((sp, st + 1));
            }
            None => return false,
        }
    }
    pattern[p..].iter().all(|c| *c == '*')
}

/// Match `c` against the class starting at `pattern[open]`. Returns whether
/// it matched and the index just past the closing `]`.
fn class_match(pattern: &[char], open: usize, c: char) -> Option<(bool, usize)> {
    let mut i = open + 1;
    let negate = pattern.get(i) == Some(&'^');
    if negate {
        i += 1;
    }
    let mut matched = false;
    while i < pattern.len() && pattern[i] != ']' {
        if pattern[i] == '\\' && i + 1 < pattern.len() {
            matched |= pattern[i + 1] == c;
            i += 2;
        } else if i + 2 < pattern.len() && pattern[i + 1] == '-' && pattern[i + 2] != ']' {
            let (lo, hi) = if pattern[i] <= pattern[i + 2] {
                (pattern[i], pattern[i + 2])
            } else {
                (pattern[i + 2], pattern[i])
            };
            matched |= lo <= c && c <= hi;
            i += 3;
        } else {
            matched |= pattern[i] == c;
            i += 1;
        }
    }
    if i >= pattern.len() {
        return None;
    }
    Some((matched != negate, i + 1))
}

fn put_chunk(buf: &mut BytesMut, chunk: &[u8]) {
    buf.put_u32_le(chunk.len() as u32);
    buf.put_slice(chunk);
}

fn dump(value: &StoredValue) -> Option<Bytes> {
    let mut buf = BytesMut::new();
    match value {
        StoredValue::String(v) => {
            buf.put_u8(DUMP_STRING);
            put_chunk(&mut buf, v);
        }
        StoredValue::List(items) => {
            buf.put_u8(DUMP_LIST);
            buf.put_u32_le(items.len() as u32);
            items.iter().for_each(|i| put_chunk(&mut buf, i));
        }
        StoredValue::Hash(fields) => {
            buf.put_u8(DUMP_HASH);
            buf.put_u32_le(fields.len() as u32);
            for (f, v) in fields {
                put_chunk(&mut buf, f);
                put_chunk(&mut buf, v);
            }
        }
        StoredValue::Set(members) => {
            buf.put_u8(DUMP_SET);
            buf.put_u32_le(members.len() as u32);
            members.iter().for_each(|m| put_chunk(&mut buf, m));
        }
        StoredValue::SortedSet(members) => {
            buf.put_u8(DUMP_ZSET);
            buf.put_u32_le(members.len() as u32);
            for (m, score) in members {
                put_chunk(&mut buf, m);
                buf.put_f64_le(*score);
            }
        }
        StoredValue::Stream(_) => return None,
    }
    Some(buf.freeze())
}

fn take_chunk(buf: &mut Bytes) -> Option<Bytes> {
    if buf.remaining() < 4 {
        return None;
    }
    let len = buf.get_u32_le() as usize;
    if buf.remaining() < len {
        return None;
    }
    Some(buf.split_to(len))
}

fn take_count(buf: &mut Bytes) -> Option<usize> {
    (buf.remaining() >= 4).then(|| buf.get_u32_le() as usize)
}

fn undump(mut buf: Bytes) -> Option<StoredValue> {
    if !buf.has_remaining() {
        return None;
    }
    let value = match buf.get_u8() {
        DUMP_STRING => StoredValue::String(take_chunk(&mut buf)?),
        DUMP_LIST => {
            let n = take_count(&mut buf)?;
            StoredValue::List((0..n).map(|_| take_chunk(&mut buf)).collect::<Option<_>>()?)
        }
        DUMP_HASH => {
            let n = take_count(&mut buf)?;
            let mut fields = BTreeMap::new();
            for _ in 0..n {
                let f = take_chunk(&mut buf)?;
                fields.insert(f, take_chunk(&mut buf)?);
            }
            StoredValue::Hash(fields)
        }
        DUMP_SET => {
            let n = take_count(&mut buf)?;
            StoredValue::Set((0..n).map(|_| take_chunk(&mut buf)).collect::<Option<_>>()?)
        }
        DUMP_ZSET => {
            let n = take_count(&mut buf)?;
            let mut zset = Vec::with_capacity(n.min(1024));
            for _ in 0..n {
                let member = take_chunk(&mut buf)?;
                if buf.remaining() < 8 {
                    return None;
                }
                zset_insert(&mut zset, member, buf.get_f64_le());
            }
            StoredValue::SortedSet(zset)
        }
        _ => return None,
    };
    (!buf.has_remaining()).then_some(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd(parts: &[&str]) -> Command {
        Command::new(parts[0]).args(parts[1..].iter().copied())
    }

    async fn run(conn: &mut MemoryConnection, parts: &[&str]) -> Value {
        conn.execute(cmd(parts)).await.unwrap()
    }

    fn glob(pattern: &str, text: &str) -> bool {
        let p: Vec<char> = pattern.chars().collect();
        let t: Vec<char> = text.chars().collect();
        glob_match(&p, &t)
    }

    #[test]
    fn test_glob() {
        assert!(glob("user:*", "user:1"));
        assert!(glob("*", ""));
        assert!(glob("h?llo", "hello"));
        assert!(glob("h[ae]llo", "hallo"));
        assert!(!glob("h[^e]llo", "hello"));
        assert!(glob("h[a-c]llo", "hbllo"));
        assert!(glob("a\\*b", "a*b"));
        assert!(!glob("a\\*b", "axb"));
        assert!(glob("*:*:end", "x:y:z:end"));
        assert!(!glob("user:*", "order:1"));
    }

    #[test]
    fn test_index_range() {
        assert_eq!(index_range(3, 0, -1), 0..3);
        assert_eq!(index_range(3, -2, -1), 1..3);
        assert_eq!(index_range(3, 5, 10), 0..0);
        assert_eq!(index_range(0, 0, -1), 0..0);
        assert_eq!(index_range(3, 1, 100), 1..3);
    }

    #[test]
    fn test_dump_round_trip() {
        let values = [
            StoredValue::String(Bytes::from("v")),
            StoredValue::List(vec![Bytes::from("a"), Bytes::from("a")]),
            StoredValue::Hash(BTreeMap::from([(Bytes::from("f"), Bytes::from("v"))])),
            StoredValue::Set(BTreeSet::from([Bytes::from("m")])),
            StoredValue::SortedSet(vec![(Bytes::from("m"), -0.5)]),
        ];
        for value in values {
            let blob = dump(&value).unwrap();
            assert_eq!(undump(blob), Some(value));
        }
        assert_eq!(undump(Bytes::from_static(b"\xffgarbage")), None);
        assert_eq!(undump(Bytes::from_static(b"\x00\x05\x00\x00\x00ab")), None);
    }

    #[tokio::test]
    async fn test_lazy_expiry() {
        let store = MemoryStore::new("s");
        store.set("k", "v");
        store.expire("k", Duration::ZERO);
        assert_eq!(store.pttl("k"), -2);
        assert_eq!(store.len(), 0);
    }

    #[tokio::test]
    async fn test_wrongtype() {
        let store = MemoryStore::new("s");
        store.rpush("l", ["a"]);
        let mut conn = store.connection();
        assert!(run(&mut conn, &["GET", "l"]).await.is_error());
        assert!(run(&mut conn, &["SADD", "l", "x"]).await.is_error());
    }

    #[tokio::test]
    async fn test_transaction_aborts_on_queued_fault() {
        let store = MemoryStore::new("s");
        store.fail_writes("k", 1, "OOM command not allowed");
        let mut conn = store.connection();
        let replies = conn
            .pipeline(vec![
                cmd(&["MULTI"]),
                cmd(&["DEL", "k"]),
                cmd(&["RPUSH", "k", "a"]),
                cmd(&["EXEC"]),
            ])
            .await
            .unwrap();
        assert_eq!(replies[1], Value::Error("OOM command not allowed".into()));
        assert_eq!(replies[2], Value::Status("QUEUED".into()));
        assert!(matches!(&replies[3], Value::Error(m) if m.starts_with("EXECABORT")));
        assert_eq!(store.get_list("k"), None);
    }

    #[tokio::test]
    async fn test_restore_requires_replace_for_existing_key() {
        let store = MemoryStore::new("s");
        store.set("k", "old");
        let mut conn = store.connection();
        let blob = dump(&StoredValue::String(Bytes::from("new"))).unwrap();

        let busy = conn
            .execute(Command::new("RESTORE").arg("k").arg(0i64).arg(blob.clone()))
            .await
            .unwrap();
        assert!(matches!(busy, Value::Error(m) if m.starts_with("BUSYKEY")));

        let ok = conn
            .execute(
                Command::new("RESTORE")
                    .arg("k")
                    .arg(0i64)
                    .arg(blob)
                    .arg("REPLACE"),
            )
            .await
            .unwrap();
        assert_eq!(ok, Value::Status("OK".into()));
        assert_eq!(store.get_string("k"), Some(Bytes::from("new")));
    }

    #[tokio::test]
    async fn test_scan_limit_drops_the_connection() {
        let store = MemoryStore::new("s");
        store.fail_scans_after(1);
        let mut conn = store.connection();
        assert!(conn.execute(cmd(&["SCAN", "0"])).await.is_ok());
        assert!(conn.execute(cmd(&["SCAN", "0"])).await.is_err());
        assert!(store.connect().is_err());
    }

    #[tokio::test]
    async fn test_cluster_view() {
        let store = MemoryStore::new("a");
        let mut conn = store.connection();
        assert!(run(&mut conn, &["CLUSTER", "SLOTS"]).await.is_error());

        store.set_cluster(
            "127.0.0.1:7000",
            vec![
                SlotOwner {
                    range: crate::cluster::SlotRange::new(0, 8191),
                    addr: "127.0.0.1:7000".into(),
                    node_id: String::new(),
                },
                SlotOwner {
                    range: crate::cluster::SlotRange::new(8192, 16383),
                    addr: "127.0.0.1:7001".into(),
                    node_id: String::new(),
                },
            ],
        );
        let slots = run(&mut conn, &["CLUSTER", "SLOTS"]).await;
        assert_eq!(slots.as_array().map(<[Value]>::len), Some(2));

        // "foo" hashes to slot 12182.
        let moved = run(&mut conn, &["GET", "foo"]).await;
        assert_eq!(moved, Value::Error("MOVED 12182 127.0.0.1:7001".into()));
    }

    fn two_node_view(store: &MemoryStore, own_addr: &str) {
        store.set_cluster(
            own_addr,
            vec![
                SlotOwner {
                    range: crate::cluster::SlotRange::new(0, 8191),
                    addr: "127.0.0.1:7000".into(),
                    node_id: String::new(),
                },
                SlotOwner {
                    range: crate::cluster::SlotRange::new(8192, 16383),
                    addr: "127.0.0.1:7001".into(),
                    node_id: String::new(),
                },
            ],
        );
    }

    #[tokio::test]
    async fn test_slot_handover() {
        let owner = MemoryStore::new("b");
        two_node_view(&owner, "127.0.0.1:7001");
        owner.set("foo", "here");
        owner.set_migrating(12182, "127.0.0.1:7000");
        let mut conn = owner.connection();
        assert_eq!(
            run(&mut conn, &["GET", "foo"]).await,
            Value::Bulk(Bytes::from("here"))
        );
        owner.delete("foo");
        assert_eq!(
            run(&mut conn, &["GET", "foo"]).await,
            Value::Error("ASK 12182 127.0.0.1:7000".into())
        );

        let importer = MemoryStore::new("a");
        two_node_view(&importer, "127.0.0.1:7000");
        importer.set_importing(12182);
        let mut conn = importer.connection();
        assert!(run(&mut conn, &["SET", "foo", "v"]).await.is_error());
        let replies = conn
            .pipeline(vec![cmd(&["ASKING"]), cmd(&["SET", "foo", "v"])])
            .await
            .unwrap();
        assert_eq!(replies[1], Value::Status("OK".into()));
        assert_eq!(importer.get_string("foo"), Some(Bytes::from("v")));
        // ASKING covers one command only
        assert!(run(&mut conn, &["GET", "foo"]).await.is_error());
    }

    #[tokio::test]
    async fn test_command_fault_hits_reads() {
        let store = MemoryStore::new("s");
        store.set("k", "v");
        store.fail_command("dump", "k", 2, "TRYAGAIN Multiple keys request during rehashing of slot");
        let mut conn = store.connection();
        for _ in 0..2 {
            let reply = run(&mut conn, &["DUMP", "k"]).await;
            assert!(matches!(reply, Value::Error(m) if m.starts_with("TRYAGAIN")));
        }
        assert!(matches!(run(&mut conn, &["DUMP", "k"]).await, Value::Bulk(_)));
        assert_eq!(
            run(&mut conn, &["GET", "k"]).await,
            Value::Bulk(Bytes::from("v"))
        );
    }

    #[tokio::test]
    async fn test_command_info() {
        let store = MemoryStore::new("s");
        let mut conn = store.connection();
        let info = run(&mut conn, &["COMMAND", "INFO", "DUMP"]).await;
        assert!(!info.as_array().unwrap()[0].is_nil());
        store.disable_opaque();
        let info = run(&mut conn, &["COMMAND", "INFO", "DUMP"]).await;
        assert!(info.as_array().unwrap()[0].is_nil());
        assert!(run(&mut conn, &["DUMP", "k"]).await.is_error());
    }
}

//! Reply values and command arguments.

use bytes::Bytes;
use std::fmt;

use crate::error::{MigrationError, Result};

/// A reply read from a Redis-compatible store.
///
/// Error replies are kept as values so a single failing command inside a
/// pipeline does not poison the replies that follow it.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Simple string reply, e.g. `+OK`.
    Status(String),

    /// Error reply, e.g. `-WRONGTYPE ...` (without the leading `-`).
    Error(String),

    /// Integer reply.
    Integer(i64),

    /// Bulk string reply.
    Bulk(Bytes),

    /// Null bulk string or null array.
    Nil,

    /// Array reply.
    Array(Vec<Value>),
}

impl Value {
    /// Returns the value as a string, if it is one.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Bulk(b) => std::str::from_utf8(b).ok(),
            Value::Status(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Returns the value as an integer, if it is one.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Returns the value as an array, if it is one.
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(arr) => Some(arr),
            _ => None,
        }
    }

    /// Returns `true` if the value is nil/null.
    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    /// Returns `true` if the value is an error reply.
    pub fn is_error(&self) -> bool {
        matches!(self, Value::Error(_))
    }

    /// Converts the value into raw bytes.
    pub fn into_bytes(self) -> Result<Bytes> {
        match self {
            Value::Bulk(b) => Ok(b),
            Value::Status(s) => Ok(Bytes::from(s)),
            Value::Error(msg) => Err(MigrationError::Server(msg)),
            other => Err(unexpected("bulk string", &other)),
        }
    }

    /// Converts the value into a `Vec<Value>`. Nil becomes an empty array.
    pub fn into_array(self) -> Result<Vec<Value>> {
        match self {
            Value::Array(arr) => Ok(arr),
            Value::Nil => Ok(vec![]),
            Value::Error(msg) => Err(MigrationError::Server(msg)),
            other => Err(unexpected("array", &other)),
        }
    }

    /// Returns a human-readable type name for this value.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Status(_) => "status",
            Value::Error(_) => "error",
            Value::Integer(_) => "integer",
            Value::Bulk(_) => "bulk",
            Value::Nil => "nil",
            Value::Array(_) => "array",
        }
    }
}

fn unexpected(expected: &str, actual: &Value) -> MigrationError {
    MigrationError::Protocol(format!(
        "unexpected reply: expected {}, got {}",
        expected,
        actual.type_name()
    ))
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bulk(b) => match std::str::from_utf8(b) {
                Ok(s) => write!(f, "\"{}\"", s),
                Err(_) => write!(f, "<binary {} bytes>", b.len()),
            },
            Value::Integer(n) => write!(f, "(integer) {}", n),
            Value::Array(arr) => {
                for (i, val) in arr.iter().enumerate() {
                    if i > 0 {
                        writeln!(f)?;
                    }
                    write!(f, "{}) {}", i + 1, val)?;
                }
                Ok(())
            }
            Value::Nil => write!(f, "(nil)"),
            Value::Status(s) => write!(f, "{}", s),
            Value::Error(s) => write!(f, "(error) {}", s),
        }
    }
}

/// Trait for types that can be converted into command arguments.
pub trait ToArg {
    /// Encode this value as a RESP bulk string argument.
    fn to_arg(&self) -> Bytes;
}

impl ToArg for &str {
    fn to_arg(&self) -> Bytes {
        Bytes::copy_from_slice(self.as_bytes())
    }
}

impl ToArg for String {
    fn to_arg(&self) -> Bytes {
        Bytes::copy_from_slice(self.as_bytes())
    }
}

impl ToArg for Bytes {
    fn to_arg(&self) -> Bytes {
        self.clone()
    }
}

impl ToArg for &Bytes {
    fn to_arg(&self) -> Bytes {
        (*self).clone()
    }
}

impl ToArg for &[u8] {
    fn to_arg(&self) -> Bytes {
        Bytes::copy_from_slice(self)
    }
}

impl ToArg for i64 {
    fn to_arg(&self) -> Bytes {
        Bytes::from(self.to_string())
    }
}

impl ToArg for u64 {
    fn to_arg(&self) -> Bytes {
        Bytes::from(self.to_string())
    }
}

impl ToArg for usize {
    fn to_arg(&self) -> Bytes {
        Bytes::from(self.to_string())
    }
}

/// Scores travel as their shortest round-trip decimal form, which the store
/// parses back to the identical `f64`.
impl ToArg for f64 {
    fn to_arg(&self) -> Bytes {
        Bytes::from(format_score(*self))
    }
}

/// Format a sorted-set score the way the store accepts it.
pub fn format_score(score: f64) -> String {
    if score.is_infinite() {
        if score > 0.0 {
            "+inf".to_string()
        } else {
            "-inf".to_string()
        }
    } else {
        score.to_string()
    }
}

/// Parse a sorted-set score as returned by `ZRANGE ... WITHSCORES`.
pub fn parse_score(raw: &[u8]) -> Result<f64> {
    let s = std::str::from_utf8(raw)
        .map_err(|_| MigrationError::Protocol("invalid UTF-8 in score".into()))?;
    match s {
        "inf" | "+inf" => Ok(f64::INFINITY),
        "-inf" => Ok(f64::NEG_INFINITY),
        _ => s
            .parse::<f64>()
            .map_err(|_| MigrationError::Protocol(format!("invalid score: {}", s))),
    }
}

/// A single command: a name followed by its arguments, all binary-safe.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    args: Vec<Bytes>,
}

impl Command {
    /// Start a command with the given name.
    pub fn new(name: &str) -> Self {
        Self {
            args: vec![Bytes::copy_from_slice(name.as_bytes())],
        }
    }

    /// Rebuild a command from raw arguments. `None` if there are none.
    pub fn from_args(args: Vec<Bytes>) -> Option<Self> {
        if args.is_empty() {
            None
        } else {
            Some(Self { args })
        }
    }

    /// Append an argument.
    pub fn arg(mut self, arg: impl ToArg) -> Self {
        self.args.push(arg.to_arg());
        self
    }

    /// Append every argument in `args`.
    pub fn args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: ToArg,
    {
        self.args.extend(args.into_iter().map(|a| a.to_arg()));
        self
    }

    /// The command name, upper-cased.
    pub fn name(&self) -> String {
        String::from_utf8_lossy(&self.args[0]).to_ascii_uppercase()
    }

    /// The key this command addresses, if any (its first argument).
    pub fn key(&self) -> Option<&Bytes> {
        match self.name().as_str() {
            "MULTI" | "EXEC" | "DISCARD" | "PING" | "SCAN" | "CLUSTER" | "COMMAND" | "AUTH"
            | "SELECT" | "INFO" | "DBSIZE" => None,
            _ => self.args.get(1),
        }
    }

    /// All arguments including the command name.
    pub fn as_args(&self) -> &[Bytes] {
        &self.args
    }

    /// Consume the command into its arguments.
    pub fn into_args(self) -> Vec<Bytes> {
        self.args
    }
}

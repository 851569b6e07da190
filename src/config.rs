//! Configuration module for ferrite-migrate
//!
//! This module handles loading and parsing configuration from TOML files,
//! with sensible defaults for all optional values. Command-line flags are
//! applied on top of the file by the binary.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{MigrationError, Result};

/// Largest accepted batch size. Bigger pages hold store-side state for too long.
pub const MAX_BATCH_SIZE: usize = 100_000;

/// Full configuration of a migration run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    /// Store the keys are read from
    pub source: EndpointConfig,

    /// Store the keys are written to
    pub target: EndpointConfig,

    /// Keys fetched (SCAN COUNT) and written per round trip
    pub batch_size: usize,

    /// Maximum number of shard pipelines running at once
    pub shard_parallelism: usize,

    /// How many times a transient per-key failure is retried
    pub write_retries: u32,

    /// Pause between retries, in milliseconds
    pub retry_backoff_ms: u64,

    /// How many extra rounds a failed shard gets, resuming from its cursor
    pub shard_retries: u32,

    /// Use DUMP/RESTORE when both stores support it
    pub prefer_opaque_transfer: bool,

    /// Restrict the migration to keys matching this glob (None = all keys)
    pub key_pattern: Option<String>,

    /// Upper bound on failed keys listed individually in the summary
    pub max_reported_failures: usize,

    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            source: EndpointConfig::new("redis://127.0.0.1:6379"),
            target: EndpointConfig::new("redis://127.0.0.1:6380"),
            batch_size: 1000,
            shard_parallelism: 4,
            write_retries: 3,
            retry_backoff_ms: 50,
            shard_retries: 1,
            prefer_opaque_transfer: true,
            key_pattern: None,
            max_reported_failures: 10_000,
            logging: LoggingConfig::default(),
        }
    }
}

impl MigrationConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            MigrationError::Config(format!("Failed to read config file {:?}: {}", path, e))
        })?;

        Self::parse_str(&contents)
    }

    /// Parse configuration from a TOML string
    pub fn parse_str(contents: &str) -> Result<Self> {
        toml::from_str(contents)
            .map_err(|e| MigrationError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.source.endpoint()?;
        self.target.endpoint()?;

        if self.batch_size == 0 {
            return Err(MigrationError::Config("batch_size cannot be 0".to_string()));
        }
        if self.batch_size > MAX_BATCH_SIZE {
            return Err(MigrationError::Config(format!(
                "batch_size cannot exceed {}",
                MAX_BATCH_SIZE
            )));
        }
        if self.shard_parallelism == 0 {
            return Err(MigrationError::Config(
                "shard_parallelism must be at least 1".to_string(),
            ));
        }
        if let Some(pattern) = &self.key_pattern {
            if pattern.is_empty() {
                return Err(MigrationError::Config(
                    "key_pattern cannot be empty".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Pause between retries
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

/// Where a store lives and how long to wait for it
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// `redis://[[user]:password@]host[:port][/db]`
    pub url: String,

    /// TCP connect timeout in milliseconds
    pub connect_timeout_ms: u64,

    /// Timeout for one round trip in milliseconds
    pub io_timeout_ms: u64,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self::new("redis://127.0.0.1:6379")
    }
}

impl EndpointConfig {
    /// Endpoint with default timeouts
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connect_timeout_ms: 5_000,
            io_timeout_ms: 30_000,
        }
    }

    /// Parse the URL
    pub fn endpoint(&self) -> Result<Endpoint> {
        Endpoint::parse(&self.url)
    }

    /// Connect timeout
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Round-trip timeout
    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }
}

/// A parsed `redis://` URL
#[derive(Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Host name or IP
    pub host: String,
    /// TCP port
    pub port: u16,
    /// ACL user name
    pub username: Option<String>,
    /// Password for AUTH
    pub password: Option<String>,
    /// Database index to SELECT
    pub database: u32,
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("database", &self.database)
            .finish()
    }
}

impl Endpoint {
    /// Default Redis port
    pub const DEFAULT_PORT: u16 = 6379;

    /// Parse `redis://[[user]:password@]host[:port][/db]`. A bare `host:port`
    /// is accepted too.
    pub fn parse(url: &str) -> Result<Self> {
        let url = url.trim();
        if url.is_empty() {
            return Err(MigrationError::Config("endpoint URL is empty".to_string()));
        }
        let rest = match url.split_once("://") {
            Some(("redis", rest)) => rest,
            Some((scheme, _)) => {
                return Err(MigrationError::Config(format!(
                    "unsupported URL scheme '{}'",
                    scheme
                )))
            }
            None => url,
        };

        let (credentials, rest) = match rest.rsplit_once('@') {
            Some((creds, rest)) => (Some(creds), rest),
            None => (None, rest),
        };
        let (username, password) = match credentials {
            Some(creds) => match creds.split_once(':') {
                Some((user, pass)) => (
                    (!user.is_empty()).then(|| user.to_string()),
                    Some(pass.to_string()),
                ),
                None => (None, Some(creds.to_string())),
            },
            None => (None, None),
        };

        let (authority, database) = match rest.split_once('/') {
            Some((authority, "")) => (authority, 0),
            Some((authority, db)) => {
                let db = db.parse::<u32>().map_err(|_| {
                    MigrationError::Config(format!("invalid database index '{}'", db))
                })?;
                (authority, db)
            }
            None => (rest, 0),
        };

        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| MigrationError::Config(format!("invalid port '{}'", port)))?;
                (host, port)
            }
            None => (authority, Self::DEFAULT_PORT),
        };
        if host.is_empty() {
            return Err(MigrationError::Config(format!("missing host in '{}'", url)));
        }

        Ok(Self {
            host: host.to_string(),
            port,
            username,
            password,
            database,
        })
    }

    /// `host:port`
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Same credentials and database, different node.
    pub fn with_addr(&self, addr: &str) -> Result<Self> {
        let (host, port) = addr
            .rsplit_once(':')
            .ok_or_else(|| MigrationError::Topology(format!("invalid node address '{}'", addr)))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| MigrationError::Topology(format!("invalid node address '{}'", addr)))?;
        Ok(Self {
            host: host.to_string(),
            port,
            ..self.clone()
        })
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (pretty, json)
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable format
    #[default]
    Pretty,

    /// JSON format
    Json,
}

//! Node configuration loaded from environment variables.

use std::collections::HashMap;
use std::fmt::Display;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use common::NodeId;
use resource_store::Resource;
use saga::{HttpPeerConfig, SagaConfig};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {var}: {reason}")]
    Invalid { var: &'static str, reason: String },
}

fn invalid(var: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        var,
        reason: reason.into(),
    }
}

/// Output format of the `fmt` tracing layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "" | "text" | "pretty" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format {other:?}")),
        }
    }
}

/// Node configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `NODE_ID`: identity of this node (default: `"node-1"`)
/// - `HOST` / `PORT`: HTTP bind address (default: `0.0.0.0:3000`)
/// - `RUST_LOG`: tracing filter directive (default: `"info"`)
/// - `LOG_FORMAT`: `text` or `json` (default: `text`)
/// - `BROKER_ADDR`: pub/sub broker (default: `127.0.0.1:1883`)
/// - `PEERS`: `node-2=http://host:port,node-3=...`
/// - `DATABASE_URL`: selects the PostgreSQL store when set
/// - `SEED_RESOURCES`: `id[:name[:location]],...` for the in-memory store
/// - `LOCK_WAIT_MS`, `PEER_TIMEOUT_MS`, `SAGA_DEADLINE_MS`,
///   `RELEASE_RETRIES`, `RELEASE_BACKOFF_MS`
/// - `JOURNAL_SWEEP_MS`: how often finished sagas are pruned (default: 60s)
/// - `SAGA_RETENTION_SECS`: how long finished sagas are kept (default: 24h)
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub node_id: NodeId,
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    pub broker_addr: SocketAddr,
    pub peers: HashMap<NodeId, String>,
    pub database_url: Option<String>,
    pub seed_resources: Vec<Resource>,
    pub lock_wait: Duration,
    pub peer_timeout: Duration,
    pub saga_deadline: Duration,
    pub release_retries: u32,
    pub release_backoff: Duration,
    pub journal_sweep: Duration,
    pub saga_retention: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: NodeId::from("node-1"),
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            broker_addr: SocketAddr::from(([127, 0, 0, 1], 1883)),
            peers: HashMap::new(),
            database_url: None,
            seed_resources: Vec::new(),
            lock_wait: Duration::ZERO,
            peer_timeout: Duration::from_millis(2000),
            saga_deadline: Duration::from_millis(5000),
            release_retries: 3,
            release_backoff: Duration::from_millis(100),
            journal_sweep: Duration::from_secs(60),
            saga_retention: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl NodeConfig {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Loads configuration through `get`, which returns a variable's value if set.
    pub fn from_lookup<F>(get: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |var: &str| get(var).filter(|v| !v.trim().is_empty());

        let node_id = get("NODE_ID")
            .map(NodeId::from)
            .unwrap_or(defaults.node_id);

        let peers = match get("PEERS") {
            Some(raw) => parse_peers(&raw)?,
            None => defaults.peers,
        };
        let seed_resources = match get("SEED_RESOURCES") {
            Some(raw) => parse_seed(&raw, &node_id),
            None => defaults.seed_resources,
        };

        let config = Self {
            host: get("HOST").unwrap_or(defaults.host),
            port: parse_or(&get, "PORT", defaults.port)?,
            log_level: get("RUST_LOG").unwrap_or(defaults.log_level),
            log_format: parse_or(&get, "LOG_FORMAT", defaults.log_format)?,
            broker_addr: parse_or(&get, "BROKER_ADDR", defaults.broker_addr)?,
            peers,
            database_url: get("DATABASE_URL"),
            seed_resources,
            lock_wait: millis(&get, "LOCK_WAIT_MS", defaults.lock_wait)?,
            peer_timeout: millis(&get, "PEER_TIMEOUT_MS", defaults.peer_timeout)?,
            saga_deadline: millis(&get, "SAGA_DEADLINE_MS", defaults.saga_deadline)?,
            release_retries: parse_or(&get, "RELEASE_RETRIES", defaults.release_retries)?,
            release_backoff: millis(&get, "RELEASE_BACKOFF_MS", defaults.release_backoff)?,
            journal_sweep: millis(&get, "JOURNAL_SWEEP_MS", defaults.journal_sweep)?,
            saga_retention: parse_or(
                &get,
                "SAGA_RETENTION_SECS",
                defaults.saga_retention.as_secs(),
            )
            .map(Duration::from_secs)?,
            node_id,
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_id.is_blank() {
            return Err(invalid("NODE_ID", "must not be empty"));
        }
        if self.saga_deadline <= self.peer_timeout {
            return Err(invalid(
                "SAGA_DEADLINE_MS",
                format!(
                    "saga deadline {:?} must exceed the peer timeout {:?}",
                    self.saga_deadline, self.peer_timeout
                ),
            ));
        }
        if self.peers.contains_key(&self.node_id) {
            return Err(invalid("PEERS", format!("lists this node ({})", self.node_id)));
        }
        if self.journal_sweep.is_zero() {
            return Err(invalid("JOURNAL_SWEEP_MS", "must be positive"));
        }
        if chrono::Duration::from_std(self.saga_retention).is_err() {
            return Err(invalid("SAGA_RETENTION_SECS", "out of range"));
        }
        Ok(())
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn saga_config(&self) -> SagaConfig {
        let defaults = SagaConfig::new(self.node_id.clone());
        SagaConfig {
            deadline: self.saga_deadline,
            retention: chrono::Duration::from_std(self.saga_retention)
                .unwrap_or(defaults.retention),
            ..defaults
        }
    }

    pub fn peer_config(&self) -> HttpPeerConfig {
        HttpPeerConfig {
            peers: self.peers.clone(),
            timeout: self.peer_timeout,
            retries: self.release_retries,
            retry_backoff: self.release_backoff,
        }
    }
}

fn parse_or<T, G>(get: &G, var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
    G: Fn(&str) -> Option<String>,
{
    match get(var) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| invalid(var, format!("{raw:?}: {e}"))),
        None => Ok(default),
    }
}

fn millis<G>(get: &G, var: &'static str, default: Duration) -> Result<Duration, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    parse_or(get, var, default_ms).map(Duration::from_millis)
}

fn parse_peers(raw: &str) -> Result<HashMap<NodeId, String>, ConfigError> {
    let mut peers = HashMap::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (node, url) = entry
            .split_once('=')
            .ok_or_else(|| invalid("PEERS", format!("expected node=url, got {entry:?}")))?;
        let (node, url) = (node.trim(), url.trim());
        if node.is_empty() || url.is_empty() {
            return Err(invalid("PEERS", format!("expected node=url, got {entry:?}")));
        }
        peers.insert(NodeId::from(node), url.to_string());
    }
    Ok(peers)
}

fn parse_seed(raw: &str, owner: &NodeId) -> Vec<Resource> {
    raw.split(',')
        .map(str::trim)
        .filter(|e| !e.is_empty())
        .map(|entry| {
            let mut parts = entry.splitn(3, ':').map(str::trim);
            let id = parts.next().unwrap_or(entry);
            let name = parts.next().unwrap_or(id);
            let location = parts.next().unwrap_or("");
            Resource::new(id, name, location, owner.clone())
        })
        .collect()
}

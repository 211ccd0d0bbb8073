//! Node configuration.
//!
//! [`NodeConfig`] is built once at startup and handed to
//! [`Node::new`](crate::Node::new). The binary collects raw values from
//! flags and environment variables into [`ConfigSources`];
//! [`NodeConfig::from_sources`] validates them.
//!
//! | Source | Meaning | Default |
//! |--------|---------|---------|
//! | `PRIVATE_KEY` | hex Ed25519 secret key (required) | |
//! | `HOST` | listen IP | `0.0.0.0` |
//! | `PORT` | listen port | `5001` |
//! | `TIER2_NODES` | comma-separated `<did>@<host:port>` | empty |
//! | `TIER1_NODES` | same format | empty |
//! | `TOPICS` | comma-separated extra topics | empty |
//! | `GRACE_PERIOD_MS` | shutdown drain bound | `5000` |
//! | `HEARTBEAT_MS` | overlay heartbeat | `1000` |

use std::collections::HashSet;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use crate::discovery::DEFAULT_REDISCOVER_INTERVAL;
use crate::identity::{Identity, InvalidKeyError, Keypair};
use crate::overlay::{is_valid_topic, OverlayConfig};

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 5001;
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_millis(5000);

/// How long `start` waits for configured peers before continuing degraded.
pub const DEFAULT_STARTUP_LINK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required configuration value {field}")]
    Missing { field: &'static str },
    #[error("invalid {field} `{value}`: {reason}")]
    Invalid {
        field: &'static str,
        value: String,
        reason: String,
    },
    #[error("invalid peer `{entry}` in {field}: {reason}")]
    InvalidPeer {
        field: &'static str,
        entry: String,
        reason: String,
    },
    #[error("invalid private key: {0}")]
    InvalidKey(#[from] InvalidKeyError),
}

/// A configured peer: `<did>@<host:port>`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StaticPeer {
    pub identity: Identity,
    pub addr: String,
}

impl FromStr for StaticPeer {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (did, addr) = s
            .trim()
            .split_once('@')
            .ok_or_else(|| "expected <did>@<host:port>".to_string())?;
        let identity = Identity::from_did(did).map_err(|e| e.to_string())?;

        let (host, port) = addr
            .rsplit_once(':')
            .ok_or_else(|| format!("address `{addr}` has no port"))?;
        if host.is_empty() {
            return Err(format!("address `{addr}` has no host"));
        }
        port.parse::<u16>()
            .map_err(|_| format!("port `{port}` is not a number between 0 and 65535"))?;

        Ok(Self {
            identity,
            addr: addr.to_string(),
        })
    }
}

impl fmt::Display for StaticPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.identity, self.addr)
    }
}

/// Raw, unvalidated configuration values.
#[derive(Clone, Debug, Default)]
pub struct ConfigSources {
    pub private_key: Option<String>,
    pub host: Option<String>,
    pub port: Option<String>,
    pub tier2_nodes: Option<String>,
    pub tier1_nodes: Option<String>,
    pub topics: Option<String>,
    pub grace_period_ms: Option<String>,
    pub heartbeat_ms: Option<String>,
}

#[derive(Clone, Debug)]
pub struct NodeConfig {
    pub keypair: Keypair,
    pub listen: SocketAddr,
    pub tier1: Vec<StaticPeer>,
    pub tier2: Vec<StaticPeer>,
    /// Topics subscribed at start, besides the node's own DID topic.
    pub topics: Vec<String>,
    pub subscribe_own_did: bool,
    pub grace_period: Duration,
    pub startup_link_timeout: Duration,
    pub rediscover_interval: Duration,
    pub overlay: OverlayConfig,
}

impl NodeConfig {
    /// Defaults around an existing key, for programmatic use.
    pub fn new(keypair: Keypair) -> Self {
        Self {
            keypair,
            listen: SocketAddr::new(IpAddr::from([0, 0, 0, 0]), DEFAULT_PORT),
            tier1: Vec::new(),
            tier2: Vec::new(),
            topics: Vec::new(),
            subscribe_own_did: true,
            grace_period: DEFAULT_GRACE_PERIOD,
            startup_link_timeout: DEFAULT_STARTUP_LINK_TIMEOUT,
            rediscover_interval: DEFAULT_REDISCOVER_INTERVAL,
            overlay: OverlayConfig::default(),
        }
    }

    pub fn from_sources(sources: ConfigSources) -> Result<Self, ConfigError> {
        let private_key = non_empty(sources.private_key).ok_or(ConfigError::Missing { field: "PRIVATE_KEY" })?;
        let keypair = Keypair::from_secret_hex(&private_key)?;
        let mut config = Self::new(keypair);

        let host = non_empty(sources.host).unwrap_or_else(|| DEFAULT_HOST.to_string());
        let ip: IpAddr = host.parse().map_err(|_| ConfigError::Invalid {
            field: "HOST",
            value: host.clone(),
            reason: "not an IP address".into(),
        })?;
        let port = match non_empty(sources.port) {
            Some(port) => port.parse::<u16>().map_err(|_| ConfigError::Invalid {
                field: "PORT",
                value: port.clone(),
                reason: "not a number between 0 and 65535".into(),
            })?,
            None => DEFAULT_PORT,
        };
        config.listen = SocketAddr::new(ip, port);

        config.tier1 = parse_peers("TIER1_NODES", sources.tier1_nodes.as_deref())?;
        config.tier2 = parse_peers("TIER2_NODES", sources.tier2_nodes.as_deref())?;

        let own = config.keypair.identity();
        let mut seen = HashSet::new();
        for peer in config.tier1.iter().chain(&config.tier2) {
            if peer.identity == own {
                return Err(ConfigError::InvalidPeer {
                    field: "TIER1_NODES/TIER2_NODES",
                    entry: peer.to_string(),
                    reason: "lists this node itself".into(),
                });
            }
            if !seen.insert(peer.identity) {
                return Err(ConfigError::InvalidPeer {
                    field: "TIER1_NODES/TIER2_NODES",
                    entry: peer.to_string(),
                    reason: "listed more than once".into(),
                });
            }
        }
        if config.tier2.is_empty() {
            warn!("TIER2_NODES is empty; no trusted tier-2 peers configured");
        }

        for topic in split_list(sources.topics.as_deref()) {
            if !is_valid_topic(topic) {
                return Err(ConfigError::Invalid {
                    field: "TOPICS",
                    value: topic.to_string(),
                    reason: "topics must be 1 to 256 bytes without control characters".into(),
                });
            }
            if !config.topics.iter().any(|t| t == topic) {
                config.topics.push(topic.to_string());
            }
        }

        if let Some(ms) = parse_millis("GRACE_PERIOD_MS", sources.grace_period_ms)? {
            config.grace_period = ms;
        }
        if let Some(ms) = parse_millis("HEARTBEAT_MS", sources.heartbeat_ms)? {
            if ms.is_zero() {
                return Err(ConfigError::Invalid {
                    field: "HEARTBEAT_MS",
                    value: "0".into(),
                    reason: "heartbeat must be positive".into(),
                });
            }
            config.overlay.heartbeat_interval = ms;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.overlay.validate().map_err(|reason| ConfigError::Invalid {
            field: "overlay",
            value: format!("{:?}", self.overlay),
            reason: reason.to_string(),
        })
    }

    pub fn identity(&self) -> Identity {
        self.keypair.identity()
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn split_list(value: Option<&str>) -> impl Iterator<Item = &str> {
    value
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn parse_peers(field: &'static str, value: Option<&str>) -> Result<Vec<StaticPeer>, ConfigError> {
    split_list(value)
        .map(|entry| {
            entry.parse::<StaticPeer>().map_err(|reason| ConfigError::InvalidPeer {
                field,
                entry: entry.to_string(),
                reason,
            })
        })
        .collect()
}

fn parse_millis(field: &'static str, value: Option<String>) -> Result<Option<Duration>, ConfigError> {
    let Some(value) = non_empty(value) else {
        return Ok(None);
    };
    let ms = value.parse::<u64>().map_err(|_| ConfigError::Invalid {
        field,
        value: value.clone(),
        reason: "expected milliseconds as a whole number".into(),
    })?;
    Ok(Some(Duration::from_millis(ms)))
}

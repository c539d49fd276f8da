//! Node configuration: TOML file, resolved into validated settings.

use crate::transport::pool::PoolOptions;
use drill_core::{DrillError, DrillResult};
use serde::Deserialize;
use std::fmt;
use std::path::Path;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

/// Port used when an address omits one.
pub const DEFAULT_PORT: u16 = 8080;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub password: String,
    pub node_port: Option<u16>,
    pub node_id: Option<String>,
    pub expose_ports: Option<Vec<PortSpec>>,
    #[serde(default)]
    pub nodes: Vec<NodeSection>,
    #[serde(default)]
    pub forward: Vec<ForwardSection>,
    #[serde(default)]
    pub pool: PoolSection,
}

/// A single port or an inclusive `[from, to]` range.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PortSpec {
    Single(u16),
    Range([u16; 2]),
}

/// `"host:port"` or `{ host, port }`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum AddressSpec {
    Text(String),
    Parts { host: String, port: Option<u16> },
}

/// `[[nodes]]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeSection {
    pub address: AddressSpec,
    pub password: Option<String>,
}

/// `[[forward]]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct ForwardSection {
    pub from: AddressSpec,
    pub to: AddressSpec,
}

/// `[pool]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct PoolSection {
    #[serde(default = "default_pool_size")]
    pub size: usize,
    #[serde(default = "default_creation_interval_ms")]
    pub creation_interval_ms: u64,
    #[serde(default = "default_pool_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            size: default_pool_size(),
            creation_interval_ms: default_creation_interval_ms(),
            timeout_ms: default_pool_timeout_ms(),
        }
    }
}

fn default_pool_size() -> usize {
    8
}
fn default_creation_interval_ms() -> u64 {
    1000
}
fn default_pool_timeout_ms() -> u64 {
    5000
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeAddress {
    pub host: String,
    pub port: u16,
}

impl NodeAddress {
    /// Parse `host`, `host:port`, `scheme://host:port`, `[v6]` or `[v6]:port`.
    pub fn parse(input: &str) -> DrillResult<Self> {
        let text = input.trim();
        let text = text.split_once("://").map_or(text, |(_, rest)| rest);
        let text = text.trim_end_matches('/');

        let (host, port) = if let Some(rest) = text.strip_prefix('[') {
            let (host, after) = rest
                .split_once(']')
                .ok_or_else(|| bad_address(input, "unterminated '['"))?;
            match after {
                "" => (host, None),
                _ => {
                    let port = after
                        .strip_prefix(':')
                        .ok_or_else(|| bad_address(input, "expected ':' after ']'"))?;
                    (host, Some(port))
                }
            }
        } else {
            match text.rsplit_once(':') {
                // More than one colon without brackets: a bare IPv6 host.
                Some((host, _)) if host.contains(':') => (text, None),
                Some((host, port)) => (host, Some(port)),
                None => (text, None),
            }
        };

        if host.is_empty() {
            return Err(bad_address(input, "empty host"));
        }
        let port = match port {
            Some(port) => port
                .parse::<u16>()
                .map_err(|_| bad_address(input, "invalid port"))?,
            None => DEFAULT_PORT,
        };
        Self::new(host, port)
    }

    pub fn new(host: &str, port: u16) -> DrillResult<Self> {
        if port == 0 {
            return Err(DrillError::Config(format!("{host}: port 0 is not allowed")));
        }
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }

    fn from_spec(spec: &AddressSpec) -> DrillResult<Self> {
        match spec {
            AddressSpec::Text(text) => Self::parse(text),
            AddressSpec::Parts { host, port } => {
                let host = host.trim_start_matches('[').trim_end_matches(']');
                if host.is_empty() {
                    return Err(DrillError::Config("address with empty host".into()));
                }
                Self::new(host, port.unwrap_or(DEFAULT_PORT))
            }
        }
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

fn bad_address(input: &str, reason: &str) -> DrillError {
    DrillError::Config(format!("invalid address {input:?}: {reason}"))
}

/// Inclusive port range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }

    fn from_spec(spec: &PortSpec) -> DrillResult<Self> {
        let (start, end) = match *spec {
            PortSpec::Single(port) => (port, port),
            PortSpec::Range([start, end]) => (start, end),
        };
        if start == 0 {
            return Err(DrillError::Config("expose_ports: port 0 is not allowed".into()));
        }
        if start > end {
            return Err(DrillError::Config(format!(
                "expose_ports: range [{start}, {end}] is inverted"
            )));
        }
        Ok(Self { start, end })
    }
}

/// A configured peer node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfig {
    pub address: NodeAddress,
    /// Falls back to the node's own password.
    pub password: String,
}

/// Allocate `from.port` on the peer at `from.host`, and dial `to` for every connection it
/// establishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardRule {
    pub from: NodeAddress,
    pub to: NodeAddress,
}

/// Resolved, validated node configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub password: String,
    pub node_port: Option<u16>,
    pub node_id: Option<Uuid>,
    /// `None` disables the inbound forwarder entirely.
    pub expose_ports: Option<Vec<PortRange>>,
    pub nodes: Vec<PeerConfig>,
    pub forward: Vec<ForwardRule>,
    pub pool: PoolOptions,
}

impl Config {
    /// Read and validate a config file. A missing file is an error.
    pub fn load(path: &Path) -> DrillResult<Self> {
        info!(path = %path.display(), "loading config file");
        let content = std::fs::read_to_string(path).map_err(|e| {
            DrillError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> DrillResult<Self> {
        let file = toml::from_str::<ConfigFile>(content)
            .map_err(|e| DrillError::Config(format!("config parse error: {e}")))?;
        Self::resolve(file)
    }

    pub fn resolve(file: ConfigFile) -> DrillResult<Self> {
        if file.node_port == Some(0) {
            return Err(DrillError::Config("node_port: port 0 is not allowed".into()));
        }

        let node_id = file
            .node_id
            .as_deref()
            .map(|id| {
                Uuid::parse_str(id)
                    .map_err(|e| DrillError::Config(format!("node_id {id:?}: {e}")))
            })
            .transpose()?;

        let expose_ports = file
            .expose_ports
            .as_ref()
            .map(|specs| {
                specs
                    .iter()
                    .map(PortRange::from_spec)
                    .collect::<DrillResult<Vec<_>>>()
            })
            .transpose()?;

        let nodes = file
            .nodes
            .iter()
            .map(|node| {
                Ok(PeerConfig {
                    address: NodeAddress::from_spec(&node.address)?,
                    password: node.password.clone().unwrap_or_else(|| file.password.clone()),
                })
            })
            .collect::<DrillResult<Vec<_>>>()?;

        let forward = file
            .forward
            .iter()
            .map(|rule| {
                Ok(ForwardRule {
                    from: NodeAddress::from_spec(&rule.from)?,
                    to: NodeAddress::from_spec(&rule.to)?,
                })
            })
            .collect::<DrillResult<Vec<_>>>()?;

        if file.pool.size == 0 {
            return Err(DrillError::Config("pool.size must be at least 1".into()));
        }
        let pool = PoolOptions {
            size: file.pool.size,
            creation_interval: Duration::from_millis(file.pool.creation_interval_ms),
            timeout: match file.pool.timeout_ms {
                0 => None,
                ms => Some(Duration::from_millis(ms)),
            },
        };

        Ok(Self {
            password: file.password,
            node_port: file.node_port,
            node_id,
            expose_ports,
            nodes,
            forward,
            pool,
        })
    }
}

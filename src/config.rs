//! NetState Configuration
//!
//! This module provides configuration structures for a controller node
//! running the replicated link and group stores.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

use crate::store::link::{DiscoveryMode, LinkBackend};

/// Main NetState configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetStateConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Cluster configuration
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Static device mastership assignments
    #[serde(default)]
    pub mastership: Vec<MastershipEntry>,

    /// Link store configuration
    #[serde(default)]
    pub link: LinkConfig,

    /// Group store configuration
    #[serde(default)]
    pub group: GroupConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node identifier
    pub id: String,

    /// Address to bind for cluster communication
    pub bind_address: String,

    /// Advertised address for other nodes to connect
    #[serde(default)]
    pub advertise_address: Option<String>,
}

/// A known peer controller
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerConfig {
    /// Peer node identifier
    pub id: String,

    /// Peer cluster address (host:port)
    pub address: String,
}

/// Cluster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Peer controllers
    #[serde(default)]
    pub peers: Vec<PeerConfig>,

    /// Number of workers handling inbound peer messages
    #[serde(default = "default_message_handler_threads")]
    pub message_handler_threads: usize,

    /// Capacity of the inbound message queue
    #[serde(default = "default_inbound_queue_size")]
    pub inbound_queue_size: usize,

    /// Connect timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Delay before the first anti-entropy round, in seconds
    #[serde(default = "default_anti_entropy_initial_delay_secs")]
    pub anti_entropy_initial_delay_secs: u64,

    /// Interval between anti-entropy rounds, in seconds
    #[serde(default = "default_anti_entropy_period_secs")]
    pub anti_entropy_period_secs: u64,
}

/// Static assignment of a device to its master node
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MastershipEntry {
    /// Device identifier (e.g. "of:0000000000000001")
    pub device: String,

    /// Node mastering the device
    pub master: String,

    /// Mastership term
    #[serde(default = "default_term")]
    pub term: u64,
}

/// Link store configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LinkConfig {
    /// Whether new links start active or require prior expectation
    #[serde(default)]
    pub discovery_mode: DiscoveryMode,

    /// Replication substrate backing the link store
    #[serde(default)]
    pub backend: LinkBackend,
}

/// Group store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupConfig {
    /// Delete unreferenced groups after `gc_thresh` audit rounds
    #[serde(default)]
    pub garbage_collect: bool,

    /// Number of audit rounds an unreferenced group survives
    #[serde(default = "default_gc_thresh")]
    pub gc_thresh: u32,

    /// Keep groups found on devices that this cluster did not create
    #[serde(default = "default_true")]
    pub allow_extraneous_groups: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default value functions
fn default_message_handler_threads() -> usize {
    4
}

fn default_inbound_queue_size() -> usize {
    10000
}

fn default_connect_timeout_ms() -> u64 {
    1000
}

fn default_anti_entropy_initial_delay_secs() -> u64 {
    5
}

fn default_anti_entropy_period_secs() -> u64 {
    5
}

fn default_term() -> u64 {
    1
}

fn default_gc_thresh() -> u32 {
    6
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            peers: Vec::new(),
            message_handler_threads: default_message_handler_threads(),
            inbound_queue_size: default_inbound_queue_size(),
            connect_timeout_ms: default_connect_timeout_ms(),
            anti_entropy_initial_delay_secs: default_anti_entropy_initial_delay_secs(),
            anti_entropy_period_secs: default_anti_entropy_period_secs(),
        }
    }
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            garbage_collect: false,
            gc_thresh: default_gc_thresh(),
            allow_extraneous_groups: true,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl NetStateConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: NetStateConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.id.is_empty() {
            return Err(crate::Error::Config("node.id cannot be empty".into()));
        }

        if self.node.bind_address.is_empty() {
            return Err(crate::Error::Config("node.bind_address cannot be empty".into()));
        }

        if self.cluster.message_handler_threads == 0 {
            return Err(crate::Error::Config(
                "cluster.message_handler_threads must be at least 1".into(),
            ));
        }

        if self.cluster.anti_entropy_period_secs == 0 {
            return Err(crate::Error::Config(
                "cluster.anti_entropy_period_secs must be positive".into(),
            ));
        }

        let mut seen = HashSet::new();
        for peer in &self.cluster.peers {
            if peer.id == self.node.id {
                return Err(crate::Error::Config(format!(
                    "peer {} has the same id as this node",
                    peer.id
                )));
            }
            if !seen.insert(peer.id.as_str()) {
                return Err(crate::Error::Config(format!("duplicate peer id {}", peer.id)));
            }
        }

        for entry in &self.mastership {
            if entry.master != self.node.id && !seen.contains(entry.master.as_str()) {
                return Err(crate::Error::Config(format!(
                    "mastership for {} names unknown node {}",
                    entry.device, entry.master
                )));
            }
        }

        Ok(())
    }

    /// Get the advertised address (or bind address if not set)
    pub fn advertise_address(&self) -> &str {
        self.node
            .advertise_address
            .as_deref()
            .unwrap_or(&self.node.bind_address)
    }

    /// Get connect timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.cluster.connect_timeout_ms)
    }

    /// Get the delay before the first anti-entropy round
    pub fn anti_entropy_initial_delay(&self) -> Duration {
        Duration::from_secs(self.cluster.anti_entropy_initial_delay_secs)
    }

    /// Get the anti-entropy interval
    pub fn anti_entropy_period(&self) -> Duration {
        Duration::from_secs(self.cluster.anti_entropy_period_secs)
    }

    /// Render a sample configuration for `netstate init`
    pub fn sample(node_id: &str) -> String {
        format!(
            r#"[node]
id = "{node_id}"
bind_address = "0.0.0.0:9876"

[cluster]
peers = []
message_handler_threads = 4
anti_entropy_initial_delay_secs = 5
anti_entropy_period_secs = 5

# [[mastership]]
# device = "of:0000000000000001"
# master = "{node_id}"
# term = 1

[link]
discovery_mode = "permissive"
backend = "gossip"

[group]
garbage_collect = false
gc_thresh = 6
allow_extraneous_groups = true

[logging]
level = "info"
"#
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[node]
id = "node-1"
bind_address = "0.0.0.0:9876"

[cluster]
peers = [
    { id = "node-2", address = "10.0.0.2:9876" },
    { id = "node-3", address = "10.0.0.3:9876" },
]
anti_entropy_period_secs = 2

[[mastership]]
device = "of:1"
master = "node-2"
term = 3

[link]
discovery_mode = "strict"
backend = "eventually-consistent"

[group]
garbage_collect = true
gc_thresh = 2
"#;

        let config = NetStateConfig::from_str(toml).unwrap();
        assert_eq!(config.node.id, "node-1");
        assert_eq!(config.cluster.peers.len(), 2);
        assert_eq!(config.anti_entropy_period(), Duration::from_secs(2));
        assert_eq!(config.anti_entropy_initial_delay(), Duration::from_secs(5));
        assert_eq!(config.mastership[0].term, 3);
        assert_eq!(config.link.discovery_mode, DiscoveryMode::Strict);
        assert_eq!(config.link.backend, LinkBackend::EventuallyConsistent);
        assert!(config.group.garbage_collect);
        assert!(config.group.allow_extraneous_groups);
        assert_eq!(config.advertise_address(), "0.0.0.0:9876");
    }

    #[test]
    fn test_defaults_and_sample() {
        let config = NetStateConfig::from_str(&NetStateConfig::sample("node-7")).unwrap();
        assert_eq!(config.node.id, "node-7");
        assert_eq!(config.link.discovery_mode, DiscoveryMode::Permissive);
        assert_eq!(config.link.backend, LinkBackend::Gossip);
        assert_eq!(config.group.gc_thresh, 6);
        assert_eq!(config.cluster.message_handler_threads, 4);
    }

    #[test]
    fn test_rejects_unknown_master() {
        let toml = r#"
[node]
id = "node-1"
bind_address = "0.0.0.0:9876"

[[mastership]]
device = "of:1"
master = "node-9"
"#;
        assert!(matches!(
            NetStateConfig::from_str(toml),
            Err(crate::Error::Config(_))
        ));
    }

    #[test]
    fn test_rejects_duplicate_peers() {
        let toml = r#"
[node]
id = "node-1"
bind_address = "0.0.0.0:9876"

[cluster]
peers = [
    { id = "node-2", address = "a:1" },
    { id = "node-2", address = "b:1" },
]
"#;
        assert!(NetStateConfig::from_str(toml).is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(NetStateConfig::sample("node-1").as_bytes())
            .unwrap();

        let config = NetStateConfig::from_file(file.path()).unwrap();
        assert_eq!(config.node.id, "node-1");
    }
}

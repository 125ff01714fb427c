use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::env;
use std::net::SocketAddr;
use std::time::Duration;

use libp2p_identity::Keypair;
use tracing_subscriber::EnvFilter;

use crate::connections::{CONNECT_TIMEOUT, RECONNECT_INTERVAL};
use crate::discovery::{to_discovery_methods, DiscoveryMethod, DISCOVERY_INTERVAL};
use crate::error::ConfigError;
use crate::gater::TrustedIdentities;
use crate::host::PeerInfo;
use crate::identity::{generate_keypair, keypair_from_hex, parse_peer_addr};
use crate::pubsub::DEFAULT_TOPIC_BUFFER_SIZE;
use crate::tracker::DEFAULT_CAPACITY;

pub const DEFAULT_LISTEN_ADDRESS: &str = "0.0.0.0:10015";
pub const DEFAULT_TOPIC: &str = "gossip-node";

/// Raw configuration as read from a JSON file and the environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub private_key: Option<String>,
    pub listen_addresses: Vec<String>,
    pub bootstrap_peers: Vec<String>, // PeerId@ip:port format
    pub discovery_methods: Vec<String>,
    pub trusted_identities: TrustedIdentities,
    pub topic: String,
    pub tracker_capacity: usize,
    pub db_path: String,
    pub log_level: String,
    pub send_queue_size: usize,
    pub receive_queue_size: usize,
    pub demo_publisher: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            private_key: None,
            listen_addresses: vec![DEFAULT_LISTEN_ADDRESS.to_string()],
            bootstrap_peers: Vec::new(),
            discovery_methods: vec!["none".to_string()],
            trusted_identities: TrustedIdentities::default(),
            topic: DEFAULT_TOPIC.to_string(),
            tracker_capacity: DEFAULT_CAPACITY,
            db_path: "./data/tracker".to_string(),
            log_level: "info".to_string(),
            send_queue_size: 1,
            receive_queue_size: 1,
            demo_publisher: false,
        }
    }
}

/// Validated settings the node runs with.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub keypair: Keypair,
    pub listen_addrs: Vec<SocketAddr>,
    pub bootstrap_peers: Vec<PeerInfo>,
    pub discovery_methods: HashSet<DiscoveryMethod>,
    pub trusted_identities: TrustedIdentities,
    pub topic: String,
    pub send_queue_size: usize,
    pub receive_queue_size: usize,
    pub topic_buffer_size: usize,
    pub reconnect_interval: Duration,
    pub connect_timeout: Duration,
    pub discovery_interval: Duration,
}

impl NodeConfig {
    pub fn new(keypair: Keypair, listen_addrs: Vec<SocketAddr>) -> Self {
        Self {
            keypair,
            listen_addrs,
            bootstrap_peers: Vec::new(),
            discovery_methods: HashSet::from([DiscoveryMethod::None]),
            trusted_identities: TrustedIdentities::default(),
            topic: DEFAULT_TOPIC.to_string(),
            send_queue_size: 1,
            receive_queue_size: 1,
            topic_buffer_size: DEFAULT_TOPIC_BUFFER_SIZE,
            reconnect_interval: RECONNECT_INTERVAL,
            connect_timeout: CONNECT_TIMEOUT,
            discovery_interval: DISCOVERY_INTERVAL,
        }
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

fn parse_number(key: &str, value: &str) -> Result<usize, ConfigError> {
    value.trim().parse().map_err(|e: std::num::ParseIntError| ConfigError::InvalidValue {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    value.trim().to_lowercase().parse().map_err(|e: std::str::ParseBoolError| ConfigError::InvalidValue {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

impl Config {
    /// Read `GOSSIP_CONFIG_FILE` if set, then apply environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match env::var("GOSSIP_CONFIG_FILE") {
            Ok(path) if !path.trim().is_empty() => {
                let raw = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
                    path: path.clone(),
                    source,
                })?;
                Self::from_json_str(&raw)?
            }
            _ => Self::default(),
        };

        config.apply_overrides(|key| env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Overlay values returned by `lookup` (normally the process environment).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(key) = lookup("GOSSIP_PRIVATE_KEY") {
            self.private_key = Some(key);
        }
        if let Some(addrs) = lookup("GOSSIP_LISTEN_ADDRESSES") {
            self.listen_addresses = split_list(&addrs);
        }
        if let Some(peers) = lookup("GOSSIP_BOOTSTRAP_PEERS") {
            self.bootstrap_peers = split_list(&peers);
        }
        if let Some(methods) = lookup("GOSSIP_DISCOVERY_METHODS") {
            self.discovery_methods = split_list(&methods);
        }
        if let Some(identities) = lookup("GOSSIP_TRUSTED_IDENTITIES") {
            self.trusted_identities = serde_json::from_str(&identities)
                .map_err(|e| ConfigError::InvalidTrustedIdentities(e.to_string()))?;
        }
        if let Some(topic) = lookup("GOSSIP_TOPIC") {
            self.topic = topic.trim().to_string();
        }
        if let Some(capacity) = lookup("GOSSIP_TRACKER_CAPACITY") {
            self.tracker_capacity = parse_number("GOSSIP_TRACKER_CAPACITY", &capacity)?;
        }
        if let Some(path) = lookup("GOSSIP_DB_PATH") {
            self.db_path = path;
        }
        if let Some(level) = lookup("GOSSIP_LOG_LEVEL") {
            self.log_level = level;
        }
        if let Some(size) = lookup("GOSSIP_SEND_QUEUE_SIZE") {
            self.send_queue_size = parse_number("GOSSIP_SEND_QUEUE_SIZE", &size)?;
        }
        if let Some(size) = lookup("GOSSIP_RECEIVE_QUEUE_SIZE") {
            self.receive_queue_size = parse_number("GOSSIP_RECEIVE_QUEUE_SIZE", &size)?;
        }
        if let Some(enabled) = lookup("GOSSIP_DEMO_PUBLISHER") {
            self.demo_publisher = parse_bool("GOSSIP_DEMO_PUBLISHER", &enabled)?;
        }
        Ok(())
    }

    /// `RUST_LOG` if set, otherwise the configured level.
    pub fn log_filter(&self) -> Result<EnvFilter, ConfigError> {
        if let Ok(filter) = EnvFilter::try_from_default_env() {
            return Ok(filter);
        }
        EnvFilter::try_new(&self.log_level).map_err(|e| ConfigError::InvalidValue {
            key: "log_level".to_string(),
            reason: e.to_string(),
        })
    }

    pub fn keypair(&self) -> Result<Keypair, ConfigError> {
        match self.private_key.as_deref().map(str::trim) {
            Some(key) if !key.is_empty() => keypair_from_hex(key),
            _ => {
                tracing::warn!("No private key configured, generating an ephemeral identity");
                Ok(generate_keypair())
            }
        }
    }

    pub fn to_node_config(&self) -> Result<NodeConfig, ConfigError> {
        let keypair = self.keypair()?;

        let listen_addrs = self
            .listen_addresses
            .iter()
            .map(|addr| {
                addr.trim().parse::<SocketAddr>().map_err(|e| ConfigError::InvalidListenAddress {
                    addr: addr.clone(),
                    reason: e.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let bootstrap_peers = self
            .bootstrap_peers
            .iter()
            .map(|peer| parse_peer_addr(peer))
            .collect::<Result<Vec<_>, _>>()?;

        let discovery_methods = to_discovery_methods(&self.discovery_methods)?;

        if self.topic.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "topic".to_string(),
                reason: "must not be empty".to_string(),
            });
        }
        for (key, value) in [
            ("tracker_capacity", self.tracker_capacity),
            ("send_queue_size", self.send_queue_size),
            ("receive_queue_size", self.receive_queue_size),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    reason: "must be greater than zero".to_string(),
                });
            }
        }

        let mut node_config = NodeConfig::new(keypair, listen_addrs);
        node_config.bootstrap_peers = bootstrap_peers;
        node_config.discovery_methods = discovery_methods;
        node_config.trusted_identities = self.trusted_identities.clone();
        node_config.topic = self.topic.clone();
        node_config.send_queue_size = self.send_queue_size;
        node_config.receive_queue_size = self.receive_queue_size;
        Ok(node_config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::keypair_to_hex;
    use std::collections::HashMap;

    fn overrides(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let node = Config::default().to_node_config().unwrap();
        assert_eq!(node.listen_addrs, vec!["0.0.0.0:10015".parse::<SocketAddr>().unwrap()]);
        assert_eq!(node.discovery_methods, HashSet::from([DiscoveryMethod::None]));
        assert_eq!(node.topic, "gossip-node");
        assert_eq!(node.send_queue_size, 1);
        assert!(node.bootstrap_peers.is_empty());
    }

    #[test]
    fn test_env_overrides_file() {
        let key = generate_keypair();
        let hex_key = keypair_to_hex(&key).unwrap();
        let mut config = Config::from_json_str(
            r#"{"topic":"from-file","tracker_capacity":7,"discovery_methods":["dht"],
                "trusted_identities":{"ops":["0xAB"]}}"#,
        )
        .unwrap();
        config
            .apply_overrides(overrides(&[
                ("GOSSIP_TOPIC", "from-env"),
                ("GOSSIP_PRIVATE_KEY", hex_key.as_str()),
                ("GOSSIP_LISTEN_ADDRESSES", "127.0.0.1:1, 127.0.0.1:2"),
            ]))
            .unwrap();

        assert_eq!(config.tracker_capacity, 7);
        let node = config.to_node_config().unwrap();
        assert_eq!(node.topic, "from-env");
        assert_eq!(node.listen_addrs.len(), 2);
        assert_eq!(node.discovery_methods, HashSet::from([DiscoveryMethod::Dht]));
        assert_eq!(node.keypair.public().to_peer_id(), key.public().to_peer_id());
        assert!(node.trusted_identities.address_set().contains("0xab"));
    }

    #[test]
    fn test_invalid_values_are_config_errors() {
        let mut config = Config::default();
        config.discovery_methods = vec!["smoke-signals".to_string()];
        assert!(matches!(config.to_node_config(), Err(ConfigError::InvalidDiscoveryMethod(_))));

        let mut config = Config::default();
        config.listen_addresses = vec!["nowhere".to_string()];
        assert!(matches!(config.to_node_config(), Err(ConfigError::InvalidListenAddress { .. })));

        let mut config = Config::default();
        config.bootstrap_peers = vec!["127.0.0.1:1".to_string()];
        assert!(matches!(config.to_node_config(), Err(ConfigError::InvalidBootstrapPeer { .. })));

        let mut config = Config::default();
        config.tracker_capacity = 0;
        assert!(matches!(config.to_node_config(), Err(ConfigError::InvalidValue { .. })));

        let mut config = Config::default();
        assert!(config
            .apply_overrides(overrides(&[("GOSSIP_TRACKER_CAPACITY", "lots")]))
            .is_err());
        assert!(config
            .apply_overrides(overrides(&[("GOSSIP_TRUSTED_IDENTITIES", "[1,2]")]))
            .is_err());
    }
}

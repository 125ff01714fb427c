//! Peer discovery.
//!
//! A [`DiscoveryService`] advertises the local host under a topic on some
//! [`PeerLookup`] backend and then, once per interval, asks the backend who
//! else advertises that topic. Anything it finds goes into the peer store
//! where the connection manager picks it up.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{ConfigError, DiscoveryError};
use crate::host::{AddrTtl, Host, PeerInfo};
use crate::metrics;

pub const DISCOVERY_INTERVAL: Duration = Duration::from_secs(60);

/// TTL given to addresses learned through discovery.
pub const DISCOVERED_ADDR_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum DiscoveryMethod {
    None,
    Mdns,
    Dht,
}

impl DiscoveryMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscoveryMethod::None => "none",
            DiscoveryMethod::Mdns => "mdns",
            DiscoveryMethod::Dht => "dht",
        }
    }
}

impl fmt::Display for DiscoveryMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DiscoveryMethod {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" => Ok(DiscoveryMethod::None),
            "mdns" => Ok(DiscoveryMethod::Mdns),
            "dht" => Ok(DiscoveryMethod::Dht),
            _ => Err(ConfigError::InvalidDiscoveryMethod(s.to_string())),
        }
    }
}

impl TryFrom<String> for DiscoveryMethod {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Parse a list of method names into the effective method set.
///
/// Duplicates collapse, an empty list means `none`, and `none` anywhere in
/// the list overrides every other method.
pub fn to_discovery_methods<S: AsRef<str>>(methods: &[S]) -> Result<HashSet<DiscoveryMethod>, ConfigError> {
    let mut parsed = HashSet::new();
    for method in methods {
        parsed.insert(method.as_ref().trim().parse::<DiscoveryMethod>()?);
    }

    if parsed.is_empty() || parsed.contains(&DiscoveryMethod::None) {
        return Ok(HashSet::from([DiscoveryMethod::None]));
    }
    Ok(parsed)
}

/// A distributed lookup structure peers advertise topics on.
#[async_trait]
pub trait PeerLookup: Send + Sync {
    async fn advertise(&self, topic: &str, info: PeerInfo) -> Result<(), DiscoveryError>;

    async fn find_peers(&self, topic: &str) -> Result<Vec<PeerInfo>, DiscoveryError>;
}

pub struct DiscoveryService {
    host: Arc<dyn Host>,
    lookup: Arc<dyn PeerLookup>,
    method: DiscoveryMethod,
    interval: Duration,
}

impl DiscoveryService {
    pub fn new(host: Arc<dyn Host>, lookup: Arc<dyn PeerLookup>, method: DiscoveryMethod) -> Self {
        Self {
            host,
            lookup,
            method,
            interval: DISCOVERY_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn method(&self) -> DiscoveryMethod {
        self.method
    }

    pub async fn advertise(&self, topic: &str) -> Result<(), DiscoveryError> {
        let info = PeerInfo::new(self.host.id(), self.host.listen_addrs());
        self.lookup.advertise(topic, info).await
    }

    /// One lookup round. Returns how many peers were added to the peer store.
    pub async fn discover_once(&self, topic: &str) -> Result<usize, DiscoveryError> {
        metrics::DISCOVERY_ROUNDS.inc();
        let found = self.lookup.find_peers(topic).await.inspect_err(|_| {
            metrics::DISCOVERY_FAILURES.inc();
        })?;

        let local = self.host.id();
        let store = self.host.peer_store();
        let mut added = 0;
        for peer in found {
            if peer.id == local || peer.addrs.is_empty() {
                continue;
            }
            store.add_addrs(&peer.id, &peer.addrs, AddrTtl::Temporary(DISCOVERED_ADDR_TTL));
            added += 1;
        }

        metrics::DISCOVERED_PEERS.inc_by(added as u64);
        Ok(added)
    }

    /// Advertise, then look up peers once per interval until cancelled.
    pub async fn run(self, topic: String, cancel: CancellationToken) {
        let mut advertised = self.try_advertise(&topic).await;

        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(service = "discovery", method = %self.method, topic = %topic, "Peer discovery started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if !advertised {
                        advertised = self.try_advertise(&topic).await;
                    }
                    match self.discover_once(&topic).await {
                        Ok(added) => debug!(service = "discovery", method = %self.method, topic = %topic, added, "Discovery round complete"),
                        Err(e) => error!(service = "discovery", method = %self.method, "Error while trying to find peers: {}", e),
                    }
                }
            }
        }

        debug!(service = "discovery", method = %self.method, topic = %topic, "Peer discovery stopped");
    }

    async fn try_advertise(&self, topic: &str) -> bool {
        match self.advertise(topic).await {
            Ok(()) => true,
            Err(e) => {
                warn!(service = "discovery", method = %self.method, "Failed to advertise, retrying next round: {}", e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gater::AllowAllGater;
    use crate::identity::generate_keypair;
    use crate::memory::{MemoryHost, MemoryLookup, MemoryNetwork};
    use std::net::SocketAddr;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn host(network: &MemoryNetwork, port: u16) -> MemoryHost {
        network
            .create_host(generate_keypair(), vec![addr(port)], Arc::new(AllowAllGater))
            .unwrap()
    }

    #[tokio::test]
    async fn test_discover_once_skips_self_and_addressless_peers() {
        let network = MemoryNetwork::new();
        let local = host(&network, 1);
        let lookup = Arc::new(MemoryLookup::new());
        let remote = generate_keypair().public().to_peer_id();
        let silent = generate_keypair().public().to_peer_id();

        lookup.advertise("t", PeerInfo::new(local.id(), vec![addr(99)])).await.unwrap();
        lookup.advertise("t", PeerInfo::new(remote, vec![addr(2)])).await.unwrap();
        lookup.advertise("t", PeerInfo::new(silent, vec![])).await.unwrap();

        let service = DiscoveryService::new(Arc::new(local.clone()), lookup.clone(), DiscoveryMethod::Dht);
        assert_eq!(service.discover_once("t").await.unwrap(), 1);

        let store = local.peer_store();
        assert_eq!(store.peer_info(&remote).addrs, vec![addr(2)]);
        assert!(!store.is_permanent(&remote));
        assert!(!store.peer_info(&local.id()).addrs.contains(&addr(99)));
        assert!(!store.peers().contains(&silent));

        lookup.fail_lookups(true);
        assert!(matches!(
            service.discover_once("t").await,
            Err(DiscoveryError::Lookup { .. })
        ));
    }

    #[tokio::test]
    async fn test_run_recovers_from_failed_lookups() {
        let network = MemoryNetwork::new();
        let local = host(&network, 1);
        let lookup = Arc::new(MemoryLookup::new());
        let remote = generate_keypair().public().to_peer_id();
        lookup.advertise("t", PeerInfo::new(remote, vec![addr(2)])).await.unwrap();
        lookup.advertise("t", PeerInfo::new(local.id(), vec![addr(99)])).await.unwrap();
        lookup.fail_lookups(true);

        let service = DiscoveryService::new(Arc::new(local.clone()), lookup.clone(), DiscoveryMethod::Dht)
            .with_interval(Duration::from_millis(20));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(service.run("t".to_string(), cancel.clone()));

        // A few failing rounds leave the store untouched and the loop alive.
        tokio::time::sleep(Duration::from_millis(70)).await;
        assert!(!local.peer_store().peers().contains(&remote));
        assert!(!task.is_finished());

        lookup.fail_lookups(false);
        let mut found = false;
        for _ in 0..50 {
            if local.peer_store().peers().contains(&remote) {
                found = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(found);

        let store = local.peer_store();
        assert!(!store.is_permanent(&remote));
        assert!(!store.peer_info(&local.id()).addrs.contains(&addr(99)));
        // The run loop advertised this host under its listen address.
        let adverts = lookup.find_peers("t").await.unwrap();
        assert!(adverts.contains(&PeerInfo::new(local.id(), vec![addr(1)])));

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    }

    #[test]
    fn test_parse_single_methods() {
        assert_eq!("none".parse::<DiscoveryMethod>().unwrap(), DiscoveryMethod::None);
        assert_eq!("MDNS".parse::<DiscoveryMethod>().unwrap(), DiscoveryMethod::Mdns);
        assert_eq!("Dht".parse::<DiscoveryMethod>().unwrap(), DiscoveryMethod::Dht);
    }

    #[test]
    fn test_duplicates_collapse() {
        let methods = to_discovery_methods(&["mdns", "mdns", "dht"]).unwrap();
        assert_eq!(methods, HashSet::from([DiscoveryMethod::Mdns, DiscoveryMethod::Dht]));
    }

    #[test]
    fn test_none_wins() {
        let methods = to_discovery_methods(&["mdns", "none"]).unwrap();
        assert_eq!(methods, HashSet::from([DiscoveryMethod::None]));
    }

    #[test]
    fn test_empty_is_none() {
        let methods = to_discovery_methods::<&str>(&[]).unwrap();
        assert_eq!(methods, HashSet::from([DiscoveryMethod::None]));
    }

    #[test]
    fn test_unknown_method_fails() {
        let err = to_discovery_methods(&["mdns", "carrier-pigeon"]).unwrap_err();
        assert_eq!(err.to_string(), r#"not a valid discovery method: "carrier-pigeon""#);
    }

    #[test]
    fn test_display_and_serde() {
        assert_eq!(DiscoveryMethod::Mdns.to_string(), "mdns");
        assert_eq!(serde_json::to_string(&DiscoveryMethod::Dht).unwrap(), r#""dht""#);
        let parsed: DiscoveryMethod = serde_json::from_str(r#""DHT""#).unwrap();
        assert_eq!(parsed, DiscoveryMethod::Dht);
    }
}

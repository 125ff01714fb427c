//! Connection authorization.
//!
//! Outbound intents are never restricted. The only real decision happens
//! once a connection is upgraded and the remote public key is known: the
//! derived address must appear in the trusted set, unless the set is empty.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;

use libp2p_identity::PeerId;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::host::{Direction, UpgradedConnection};
use crate::identity::address_from_raw;
use crate::metrics;

/// Reason code reported to the remote when a connection is closed.
pub type DisconnectReason = u32;

/// The only reason code the whitelist ever reports.
pub const REASON_UNSPECIFIED: DisconnectReason = 0;

pub trait ConnectionGater: Send + Sync {
    fn intercept_peer_dial(&self, _peer: &PeerId) -> bool {
        true
    }

    fn intercept_addr_dial(&self, _peer: &PeerId, _addr: &SocketAddr) -> bool {
        true
    }

    fn intercept_accept(&self, _local: &SocketAddr, _remote: &SocketAddr) -> bool {
        true
    }

    fn intercept_secured(&self, _direction: Direction, _peer: &PeerId, _remote: &SocketAddr) -> bool {
        true
    }

    fn intercept_upgraded(&self, conn: &UpgradedConnection) -> (bool, DisconnectReason);
}

/// Named groups of trusted addresses.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrustedIdentities(pub HashMap<String, Vec<String>>);

impl TrustedIdentities {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_group(mut self, group: impl Into<String>, addresses: Vec<String>) -> Self {
        self.0.insert(group.into(), addresses);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.values().all(|addrs| addrs.is_empty())
    }

    /// Flattened, lowercased address set.
    pub fn address_set(&self) -> HashSet<String> {
        self.0
            .values()
            .flatten()
            .map(|a| a.trim().to_lowercase())
            .collect()
    }
}

/// Allows an upgraded connection iff the remote's derived address is trusted.
pub struct WhitelistGater {
    trusted: HashSet<String>,
}

impl WhitelistGater {
    pub fn new(identities: &TrustedIdentities) -> Self {
        Self {
            trusted: identities.address_set(),
        }
    }

    fn is_authorized(&self, conn: &UpgradedConnection) -> bool {
        if self.trusted.is_empty() {
            return true;
        }
        match address_from_raw(&conn.remote_public_key) {
            Some(address) => self.trusted.contains(&address),
            None => false,
        }
    }
}

impl ConnectionGater for WhitelistGater {
    fn intercept_upgraded(&self, conn: &UpgradedConnection) -> (bool, DisconnectReason) {
        let allowed = self.is_authorized(conn);
        let address = address_from_raw(&conn.remote_public_key).unwrap_or_else(|| "<invalid key>".to_string());

        info!(
            service = "connection_gater",
            peer = %conn.remote_peer,
            address = %address,
            "Peer {} (address {}) authorized? {}",
            conn.remote_peer,
            address,
            allowed
        );

        if !allowed {
            metrics::GATER_DENIALS.inc();
        }

        (allowed, REASON_UNSPECIFIED)
    }
}

/// Accepts everything. Used where no whitelist applies.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAllGater;

impl ConnectionGater for AllowAllGater {
    fn intercept_upgraded(&self, _conn: &UpgradedConnection) -> (bool, DisconnectReason) {
        (true, REASON_UNSPECIFIED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{address_of, generate_keypair, raw_public_key};

    fn upgraded(key: &libp2p_identity::Keypair) -> UpgradedConnection {
        UpgradedConnection {
            remote_peer: key.public().to_peer_id(),
            direction: Direction::Inbound,
            remote_addr: "127.0.0.1:4001".parse().unwrap(),
            remote_public_key: raw_public_key(&key.public()),
        }
    }

    #[test]
    fn test_empty_set_allows_everyone() {
        let gater = WhitelistGater::new(&TrustedIdentities::new());
        let (allowed, reason) = gater.intercept_upgraded(&upgraded(&generate_keypair()));
        assert!(allowed);
        assert_eq!(reason, REASON_UNSPECIFIED);
    }

    #[test]
    fn test_whitelist_is_case_insensitive() {
        let trusted = generate_keypair();
        let stranger = generate_keypair();
        let address = address_of(&trusted.public()).unwrap();

        let identities = TrustedIdentities::new().with_group("validators", vec![address.to_uppercase()]);
        let gater = WhitelistGater::new(&identities);

        assert!(gater.intercept_upgraded(&upgraded(&trusted)).0);
        let (allowed, reason) = gater.intercept_upgraded(&upgraded(&stranger));
        assert!(!allowed);
        assert_eq!(reason, REASON_UNSPECIFIED);
    }

    #[test]
    fn test_bad_key_is_denied() {
        let identities = TrustedIdentities::new().with_group("g", vec!["0xabc".to_string()]);
        let gater = WhitelistGater::new(&identities);
        let mut conn = upgraded(&generate_keypair());
        conn.remote_public_key = vec![0u8; 3];
        assert!(!gater.intercept_upgraded(&conn).0);
    }

    #[test]
    fn test_non_secp256k1_remote_is_denied() {
        let trusted = generate_keypair();
        let identities = TrustedIdentities::new()
            .with_group("g", vec![address_of(&trusted.public()).unwrap()]);
        let gater = WhitelistGater::new(&identities);
        let ed = libp2p_identity::Keypair::generate_ed25519();
        assert!(!gater.intercept_upgraded(&upgraded(&ed)).0);
    }

    #[test]
    fn test_outbound_intents_always_allowed() {
        let identities = TrustedIdentities::new().with_group("g", vec!["0xabc".to_string()]);
        let gater = WhitelistGater::new(&identities);
        let peer = generate_keypair().public().to_peer_id();
        let addr: SocketAddr = "10.0.0.1:1".parse().unwrap();
        assert!(gater.intercept_peer_dial(&peer));
        assert!(gater.intercept_addr_dial(&peer, &addr));
        assert!(gater.intercept_accept(&addr, &addr));
        assert!(gater.intercept_secured(Direction::Outbound, &peer, &addr));
    }

    #[test]
    fn test_empty_groups_count_as_empty() {
        let identities = TrustedIdentities::new().with_group("nobody", vec![]);
        assert!(identities.is_empty());
        let gater = WhitelistGater::new(&identities);
        assert!(gater.intercept_upgraded(&upgraded(&generate_keypair())).0);
    }
}

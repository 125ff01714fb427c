//! In-memory peer store shared by the host implementations.

use std::net::SocketAddr;
use std::time::Duration;

use dashmap::DashMap;
use libp2p_identity::PeerId;
use tokio::time::Instant;

use crate::host::{AddrTtl, PeerInfo, PeerStore};

/// TTL for addresses a host learns from live connections.
pub const CONNECTED_ADDR_TTL: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Clone)]
struct AddrEntry {
    addr: SocketAddr,
    // None never expires.
    expires: Option<Instant>,
}

impl AddrEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires.map_or(true, |at| at > now)
    }
}

/// DashMap backed peer store. The local peer is always listed.
pub struct MemoryPeerStore {
    local: PeerId,
    entries: DashMap<PeerId, Vec<AddrEntry>>,
}

impl MemoryPeerStore {
    pub fn new(local: PeerId) -> Self {
        Self {
            local,
            entries: DashMap::new(),
        }
    }

    /// Add `addr` with [`CONNECTED_ADDR_TTL`] unless the peer already has it.
    pub fn note_connected_addr(&self, peer: &PeerId, addr: SocketAddr) {
        if !self.peer_info(peer).addrs.contains(&addr) {
            self.add_addrs(peer, &[addr], AddrTtl::Temporary(CONNECTED_ADDR_TTL));
        }
    }

    pub fn remove_addr(&self, peer: &PeerId, addr: &SocketAddr) {
        if let Some(mut entry) = self.entries.get_mut(peer) {
            entry.retain(|e| e.addr != *addr);
        }
    }
}

impl PeerStore for MemoryPeerStore {
    fn add_addrs(&self, peer: &PeerId, addrs: &[SocketAddr], ttl: AddrTtl) {
        let expires = match ttl {
            AddrTtl::Permanent => None,
            AddrTtl::Temporary(ttl) => Some(Instant::now() + ttl),
        };
        let mut entry = self.entries.entry(*peer).or_default();
        for addr in addrs {
            match entry.iter().position(|e| e.addr == *addr) {
                Some(i) => {
                    let existing = &mut entry[i];
                    existing.expires = match (existing.expires, expires) {
                        (None, _) | (_, None) => None,
                        (Some(a), Some(b)) => Some(a.max(b)),
                    };
                }
                None => entry.push(AddrEntry { addr: *addr, expires }),
            }
        }
    }

    fn clear_addrs(&self, peer: &PeerId) {
        if let Some(mut entry) = self.entries.get_mut(peer) {
            entry.clear();
        }
    }

    fn remove_peer(&self, peer: &PeerId) {
        if *peer != self.local {
            self.entries.remove(peer);
        }
    }

    fn peers(&self) -> Vec<PeerId> {
        let now = Instant::now();
        let mut peers: Vec<PeerId> = self
            .entries
            .iter()
            .filter(|e| *e.key() != self.local && e.value().iter().any(|a| a.is_live(now)))
            .map(|e| *e.key())
            .collect();
        peers.push(self.local);
        peers
    }

    fn peer_info(&self, peer: &PeerId) -> PeerInfo {
        let now = Instant::now();
        let addrs = self
            .entries
            .get(peer)
            .map(|e| e.iter().filter(|a| a.is_live(now)).map(|a| a.addr).collect())
            .unwrap_or_default();
        PeerInfo::new(*peer, addrs)
    }

    fn is_permanent(&self, peer: &PeerId) -> bool {
        self.entries
            .get(peer)
            .is_some_and(|e| e.iter().any(|a| a.expires.is_none()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::generate_keypair;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_peer_store_ttl_classes() {
        let local = generate_keypair().public().to_peer_id();
        let other = generate_keypair().public().to_peer_id();
        let store = MemoryPeerStore::new(local);

        assert_eq!(store.peers(), vec![local]);

        store.add_addrs(&other, &[addr(5)], AddrTtl::Temporary(Duration::from_secs(60)));
        assert!(!store.is_permanent(&other));
        store.add_addrs(&other, &[addr(5)], AddrTtl::Permanent);
        assert!(store.is_permanent(&other));
        store.add_addrs(&other, &[addr(5)], AddrTtl::Temporary(Duration::from_secs(1)));
        assert!(store.is_permanent(&other));

        store.clear_addrs(&other);
        assert!(!store.peers().contains(&other));
        store.remove_peer(&local);
        assert!(store.peers().contains(&local));
    }

    #[tokio::test]
    async fn test_temporary_addrs_expire() {
        let local = generate_keypair().public().to_peer_id();
        let other = generate_keypair().public().to_peer_id();
        let store = MemoryPeerStore::new(local);

        store.note_connected_addr(&other, addr(7));
        store.note_connected_addr(&other, addr(7));
        assert_eq!(store.peer_info(&other).addrs, vec![addr(7)]);
        store.remove_addr(&other, &addr(7));
        assert!(store.peer_info(&other).addrs.is_empty());

        store.add_addrs(&other, &[addr(8)], AddrTtl::Temporary(Duration::from_millis(30)));
        assert!(store.peers().contains(&other));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(store.peer_info(&other).addrs.is_empty());
        assert!(!store.peers().contains(&other));
    }
}

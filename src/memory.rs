//! In-process implementation of the host contract.
//!
//! A [`MemoryNetwork`] is a switchboard that [`MemoryHost`]s register with.
//! Dialing resolves the target by peer id, runs both sides' gaters through
//! the same interception points a real transport would, and records the
//! connection on both ends. Publishing delivers a record to the publisher's
//! own subscriptions and to those of every directly connected host.
//!
//! Used to run local meshes and simulations without sockets.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use libp2p_identity::{Keypair, PeerId, PublicKey};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::discovery::PeerLookup;
use crate::error::{DiscoveryError, HostError};
use crate::gater::ConnectionGater;
use crate::host::{
    AddrTtl, Connectedness, Direction, Host, PeerInfo, PeerStore, RawRecord, Subscription, TopicHandle,
    UpgradedConnection,
};
use crate::identity::raw_public_key;
use crate::peerstore::{MemoryPeerStore, CONNECTED_ADDR_TTL};
use crate::subscriptions::{ChannelSubscription, SlotOwner, SubscriptionTable};

#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

#[derive(Default)]
struct NetworkInner {
    hosts: DashMap<PeerId, Weak<HostInner>>,
}

impl NetworkInner {
    fn resolve(&self, peer: &PeerId) -> Option<Arc<HostInner>> {
        let host = self.hosts.get(peer)?.upgrade()?;
        if host.closed.load(Ordering::SeqCst) {
            return None;
        }
        Some(host)
    }
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new host on the network.
    pub fn create_host(
        &self,
        keypair: Keypair,
        listen_addrs: Vec<SocketAddr>,
        gater: Arc<dyn ConnectionGater>,
    ) -> Result<MemoryHost, HostError> {
        let public_key = keypair.public();
        let id = public_key.to_peer_id();
        if self.inner.resolve(&id).is_some() {
            return Err(HostError::Transport(format!("peer {} is already registered", id)));
        }

        let peer_store = MemoryPeerStore::new(id);
        peer_store.add_addrs(&id, &listen_addrs, AddrTtl::Permanent);

        let inner = Arc::new(HostInner {
            id,
            public_key,
            listen_addrs,
            peer_store,
            connections: DashMap::new(),
            subscriptions: SubscriptionTable::default(),
            open_handles: DashMap::new(),
            gater,
            network: Arc::downgrade(&self.inner),
            root: CancellationToken::new(),
            closed: AtomicBool::new(false),
            refuse_subscriptions: AtomicBool::new(false),
        });
        self.inner.hosts.insert(id, Arc::downgrade(&inner));

        debug!(peer = %id, "Memory host registered");
        Ok(MemoryHost { inner })
    }

    pub fn host_count(&self) -> usize {
        self.inner.hosts.iter().filter(|h| h.value().strong_count() > 0).count()
    }
}

struct HostInner {
    id: PeerId,
    public_key: PublicKey,
    listen_addrs: Vec<SocketAddr>,
    peer_store: MemoryPeerStore,
    connections: DashMap<PeerId, Direction>,
    subscriptions: SubscriptionTable,
    open_handles: DashMap<String, usize>,
    gater: Arc<dyn ConnectionGater>,
    network: Weak<NetworkInner>,
    root: CancellationToken,
    closed: AtomicBool,
    refuse_subscriptions: AtomicBool,
}

impl SlotOwner for HostInner {
    fn release_slot(&self, topic: &str, id: u64) {
        self.subscriptions.remove(topic, id);
    }
}

impl HostInner {
    fn ensure_open(&self) -> Result<(), HostError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(HostError::Closed);
        }
        Ok(())
    }

    fn local_addr(&self) -> SocketAddr {
        self.listen_addrs
            .first()
            .copied()
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)))
    }

    fn release_handle(&self, topic: &str) {
        let mut emptied = false;
        if let Some(mut count) = self.open_handles.get_mut(topic) {
            *count = count.saturating_sub(1);
            emptied = *count == 0;
        }
        if emptied {
            self.open_handles.remove_if(topic, |_, count| *count == 0);
        }
    }

    fn connected_hosts(&self) -> Vec<Arc<HostInner>> {
        let Some(network) = self.network.upgrade() else {
            return Vec::new();
        };
        let peers: Vec<PeerId> = self.connections.iter().map(|c| *c.key()).collect();
        peers.iter().filter_map(|p| network.resolve(p)).collect()
    }
}

/// Cheaply cloneable handle to an in-process host.
#[derive(Clone)]
pub struct MemoryHost {
    inner: Arc<HostInner>,
}

impl MemoryHost {
    /// Drop the connection with `peer` on both sides.
    pub fn disconnect(&self, peer: &PeerId) {
        self.inner.connections.remove(peer);
        if let Some(other) = self.inner.network.upgrade().and_then(|n| n.resolve(peer)) {
            other.connections.remove(&self.inner.id);
        }
    }

    /// Make every later `subscribe` fail, as a transport that is not ready would.
    pub fn refuse_subscriptions(&self, refuse: bool) {
        self.inner.refuse_subscriptions.store(refuse, Ordering::SeqCst);
    }

    /// Number of topic handles for `topic` that were joined and not yet closed.
    pub fn open_topic_handles(&self, topic: &str) -> usize {
        self.inner.open_handles.get(topic).map(|c| *c).unwrap_or(0)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    fn authorize(&self, target: &Arc<HostInner>, remote_addr: SocketAddr) -> Result<(), HostError> {
        let local = &self.inner;
        let local_addr = local.local_addr();
        let denied = |peer: PeerId, reason: u32| HostError::Denied { peer, reason };

        if !target.gater.intercept_accept(&remote_addr, &local_addr) {
            return Err(denied(target.id, 0));
        }
        if !local.gater.intercept_secured(Direction::Outbound, &target.id, &remote_addr) {
            return Err(denied(target.id, 0));
        }
        if !target.gater.intercept_secured(Direction::Inbound, &local.id, &local_addr) {
            return Err(denied(target.id, 0));
        }

        let outbound = UpgradedConnection {
            remote_peer: target.id,
            direction: Direction::Outbound,
            remote_addr,
            remote_public_key: raw_public_key(&target.public_key),
        };
        let (allowed, reason) = local.gater.intercept_upgraded(&outbound);
        if !allowed {
            return Err(denied(target.id, reason));
        }

        let inbound = UpgradedConnection {
            remote_peer: local.id,
            direction: Direction::Inbound,
            remote_addr: local_addr,
            remote_public_key: raw_public_key(&local.public_key),
        };
        let (allowed, reason) = target.gater.intercept_upgraded(&inbound);
        if !allowed {
            return Err(denied(target.id, reason));
        }

        Ok(())
    }
}

#[async_trait]
impl Host for MemoryHost {
    fn id(&self) -> PeerId {
        self.inner.id
    }

    fn public_key(&self) -> PublicKey {
        self.inner.public_key.clone()
    }

    fn listen_addrs(&self) -> Vec<SocketAddr> {
        self.inner.listen_addrs.clone()
    }

    fn peer_store(&self) -> &dyn PeerStore {
        &self.inner.peer_store
    }

    fn connectedness(&self, peer: &PeerId) -> Connectedness {
        if self.inner.connections.contains_key(peer) {
            Connectedness::Connected
        } else {
            Connectedness::NotConnected
        }
    }

    fn connected_peers(&self) -> Vec<PeerId> {
        self.inner.connections.iter().map(|c| *c.key()).collect()
    }

    async fn connect(&self, peer: &PeerInfo) -> Result<(), HostError> {
        let local = &self.inner;
        local.ensure_open()?;

        if peer.id == local.id {
            return Err(HostError::DialSelf);
        }
        if !local.gater.intercept_peer_dial(&peer.id) {
            return Err(HostError::Denied { peer: peer.id, reason: 0 });
        }
        if local.connections.contains_key(&peer.id) {
            return Ok(());
        }

        let mut candidates = peer.addrs.clone();
        for addr in local.peer_store.peer_info(&peer.id).addrs {
            if !candidates.contains(&addr) {
                candidates.push(addr);
            }
        }
        if candidates.is_empty() {
            return Err(HostError::NoAddresses(peer.id));
        }

        let target = local
            .network
            .upgrade()
            .and_then(|n| n.resolve(&peer.id))
            .ok_or(HostError::Unreachable(peer.id))?;

        let remote_addr = candidates
            .iter()
            .copied()
            .find(|addr| target.listen_addrs.contains(addr) && local.gater.intercept_addr_dial(&peer.id, addr))
            .ok_or(HostError::Unreachable(peer.id))?;

        self.authorize(&target, remote_addr)?;

        local.connections.insert(target.id, Direction::Outbound);
        target.connections.insert(local.id, Direction::Inbound);
        local.peer_store.note_connected_addr(&target.id, remote_addr);
        if !local.listen_addrs.is_empty() {
            target
                .peer_store
                .add_addrs(&local.id, &local.listen_addrs, AddrTtl::Temporary(CONNECTED_ADDR_TTL));
        }

        debug!(peer = %local.id, remote = %target.id, addr = %remote_addr, "Memory connection established");
        Ok(())
    }

    fn join_topic(&self, topic: &str) -> Result<Arc<dyn TopicHandle>, HostError> {
        self.inner.ensure_open()?;
        *self.inner.open_handles.entry(topic.to_string()).or_insert(0) += 1;
        Ok(Arc::new(MemoryTopic {
            host: Arc::clone(&self.inner),
            name: topic.to_string(),
            live_subscriptions: Arc::new(AtomicUsize::new(0)),
            closed: AtomicBool::new(false),
        }))
    }

    async fn close(&self) -> Result<(), HostError> {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        inner.root.cancel();
        inner.subscriptions.clear();

        let peers: Vec<PeerId> = inner.connections.iter().map(|c| *c.key()).collect();
        if let Some(network) = inner.network.upgrade() {
            for peer in &peers {
                if let Some(other) = network.hosts.get(peer).and_then(|w| w.upgrade()) {
                    other.connections.remove(&inner.id);
                }
            }
            network.hosts.remove(&inner.id);
        }
        inner.connections.clear();

        debug!(peer = %inner.id, "Memory host closed");
        Ok(())
    }
}

struct MemoryTopic {
    host: Arc<HostInner>,
    name: String,
    live_subscriptions: Arc<AtomicUsize>,
    closed: AtomicBool,
}

impl MemoryTopic {
    fn ensure_usable(&self) -> Result<(), HostError> {
        self.host.ensure_open()?;
        if self.closed.load(Ordering::SeqCst) {
            return Err(HostError::TopicClosed(self.name.clone()));
        }
        Ok(())
    }
}

#[async_trait]
impl TopicHandle for MemoryTopic {
    fn name(&self) -> &str {
        &self.name
    }

    async fn publish(&self, data: Vec<u8>) -> Result<(), HostError> {
        self.ensure_usable()?;
        let record = RawRecord {
            data,
            received_from: self.host.id,
        };

        self.host.subscriptions.deliver(&self.name, &record);
        for peer in self.host.connected_hosts() {
            peer.subscriptions.deliver(&self.name, &record);
        }
        Ok(())
    }

    fn subscribe(&self) -> Result<Arc<dyn Subscription>, HostError> {
        self.ensure_usable()?;
        if self.host.refuse_subscriptions.load(Ordering::SeqCst) {
            return Err(HostError::Transport("subscriptions are refused".to_string()));
        }

        let slot = self.host.subscriptions.add(&self.name, &self.host.root);
        let owner: Weak<dyn SlotOwner> = Arc::downgrade(&self.host) as Weak<dyn SlotOwner>;
        Ok(Arc::new(ChannelSubscription::new(
            &self.name,
            slot,
            owner,
            Arc::clone(&self.live_subscriptions),
        )))
    }

    fn list_peers(&self) -> Vec<PeerId> {
        self.host
            .connected_hosts()
            .into_iter()
            .filter(|peer| peer.subscriptions.has_subscribers(&self.name))
            .map(|peer| peer.id)
            .collect()
    }

    fn close(&self) -> Result<(), HostError> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        if self.live_subscriptions.load(Ordering::SeqCst) > 0 {
            return Err(HostError::TopicInUse(self.name.clone()));
        }
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.host.release_handle(&self.name);
        }
        Ok(())
    }
}

impl Drop for MemoryTopic {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.host.release_handle(&self.name);
        }
    }
}

/// In-process lookup structure: topic -> advertised peers.
#[derive(Default)]
pub struct MemoryLookup {
    adverts: DashMap<String, Vec<PeerInfo>>,
    failing: AtomicBool,
}

impl MemoryLookup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every later lookup round fail until switched back.
    pub fn fail_lookups(&self, fail: bool) {
        self.failing.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl PeerLookup for MemoryLookup {
    async fn advertise(&self, topic: &str, info: PeerInfo) -> Result<(), DiscoveryError> {
        let mut adverts = self.adverts.entry(topic.to_string()).or_default();
        adverts.retain(|p| p.id != info.id);
        adverts.push(info);
        Ok(())
    }

    async fn find_peers(&self, topic: &str) -> Result<Vec<PeerInfo>, DiscoveryError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(DiscoveryError::Lookup {
                topic: topic.to_string(),
                reason: "lookup unavailable".to_string(),
            });
        }
        Ok(self.adverts.get(topic).map(|a| a.clone()).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gater::{AllowAllGater, TrustedIdentities, WhitelistGater};
    use crate::identity::{address_of, generate_keypair};
    use std::time::Duration;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn host(network: &MemoryNetwork, port: u16) -> MemoryHost {
        network
            .create_host(generate_keypair(), vec![addr(port)], Arc::new(AllowAllGater))
            .unwrap()
    }

    #[tokio::test]
    async fn test_connect_records_both_sides() {
        let network = MemoryNetwork::new();
        let a = host(&network, 1);
        let b = host(&network, 2);

        a.connect(&PeerInfo::new(b.id(), vec![addr(2)])).await.unwrap();

        assert_eq!(a.connectedness(&b.id()), Connectedness::Connected);
        assert_eq!(b.connectedness(&a.id()), Connectedness::Connected);
        assert!(b.peer_store().peers().contains(&a.id()));
    }

    #[tokio::test]
    async fn test_connect_failures() {
        let network = MemoryNetwork::new();
        let a = host(&network, 1);
        let b = host(&network, 2);

        assert_eq!(a.connect(&PeerInfo::new(a.id(), vec![addr(1)])).await, Err(HostError::DialSelf));
        assert_eq!(
            a.connect(&PeerInfo::new(b.id(), vec![])).await,
            Err(HostError::NoAddresses(b.id()))
        );
        assert_eq!(
            a.connect(&PeerInfo::new(b.id(), vec![addr(9)])).await,
            Err(HostError::Unreachable(b.id()))
        );
    }

    #[tokio::test]
    async fn test_whitelist_denies_on_either_side() {
        let network = MemoryNetwork::new();
        let trusted_key = generate_keypair();
        let trusted_addr = address_of(&trusted_key.public()).unwrap();
        let identities = TrustedIdentities::new().with_group("g", vec![trusted_addr]);

        let guarded = network
            .create_host(generate_keypair(), vec![addr(1)], Arc::new(WhitelistGater::new(&identities)))
            .unwrap();
        let trusted = network
            .create_host(trusted_key, vec![addr(2)], Arc::new(AllowAllGater))
            .unwrap();
        let stranger = host(&network, 3);

        trusted.connect(&PeerInfo::new(guarded.id(), vec![addr(1)])).await.unwrap();
        let err = stranger
            .connect(&PeerInfo::new(guarded.id(), vec![addr(1)]))
            .await
            .unwrap_err();
        assert!(matches!(err, HostError::Denied { reason: 0, .. }));
        assert_eq!(guarded.connectedness(&stranger.id()), Connectedness::NotConnected);
    }

    #[tokio::test]
    async fn test_publish_reaches_self_and_connected_peers() {
        let network = MemoryNetwork::new();
        let a = host(&network, 1);
        let b = host(&network, 2);
        let c = host(&network, 3);
        a.connect(&PeerInfo::new(b.id(), vec![addr(2)])).await.unwrap();

        let ta = a.join_topic("t").unwrap();
        let tb = b.join_topic("t").unwrap();
        let tc = c.join_topic("t").unwrap();
        let sa = ta.subscribe().unwrap();
        let sb = tb.subscribe().unwrap();
        let sc = tc.subscribe().unwrap();

        ta.publish(b"hi".to_vec()).await.unwrap();

        assert_eq!(sa.next().await.unwrap().received_from, a.id());
        let record = sb.next().await.unwrap();
        assert_eq!(record.data, b"hi");
        assert_eq!(record.received_from, a.id());

        let nothing = tokio::time::timeout(Duration::from_millis(50), sc.next()).await;
        assert!(nothing.is_err());
        assert_eq!(ta.list_peers(), vec![b.id()]);
    }

    #[tokio::test]
    async fn test_cancel_unblocks_pending_next() {
        let network = MemoryNetwork::new();
        let a = host(&network, 1);
        let topic = a.join_topic("t").unwrap();
        let sub = topic.subscribe().unwrap();

        let waiter = {
            let sub = Arc::clone(&sub);
            tokio::spawn(async move { sub.next().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        sub.cancel();
        sub.cancel();

        let result = waiter.await.unwrap();
        assert_eq!(result.unwrap_err(), HostError::SubscriptionCancelled);
        assert_eq!(sub.next().await.unwrap_err(), HostError::SubscriptionCancelled);
    }

    #[tokio::test]
    async fn test_topic_close_requires_cancelled_subscriptions() {
        let network = MemoryNetwork::new();
        let a = host(&network, 1);
        let topic = a.join_topic("t").unwrap();
        assert_eq!(a.open_topic_handles("t"), 1);

        let sub = topic.subscribe().unwrap();
        assert_eq!(topic.close(), Err(HostError::TopicInUse("t".to_string())));

        sub.cancel();
        topic.close().unwrap();
        topic.close().unwrap();
        assert_eq!(a.open_topic_handles("t"), 0);
        assert_eq!(topic.publish(vec![]).await, Err(HostError::TopicClosed("t".to_string())));
    }

    #[tokio::test]
    async fn test_close_host() {
        let network = MemoryNetwork::new();
        let a = host(&network, 1);
        let b = host(&network, 2);
        a.connect(&PeerInfo::new(b.id(), vec![addr(2)])).await.unwrap();
        let sub = a.join_topic("t").unwrap().subscribe().unwrap();

        a.close().await.unwrap();
        a.close().await.unwrap();

        assert_eq!(sub.next().await.unwrap_err(), HostError::SubscriptionCancelled);
        assert_eq!(b.connectedness(&a.id()), Connectedness::NotConnected);
        assert!(matches!(a.join_topic("t"), Err(HostError::Closed)));
        assert_eq!(
            b.connect(&PeerInfo::new(a.id(), vec![addr(1)])).await,
            Err(HostError::Unreachable(a.id()))
        );
    }

    #[tokio::test]
    async fn test_lookup_replaces_adverts() {
        let lookup = MemoryLookup::new();
        let peer = generate_keypair().public().to_peer_id();
        lookup.advertise("t", PeerInfo::new(peer, vec![addr(1)])).await.unwrap();
        lookup.advertise("t", PeerInfo::new(peer, vec![addr(2)])).await.unwrap();

        let found = lookup.find_peers("t").await.unwrap();
        assert_eq!(found, vec![PeerInfo::new(peer, vec![addr(2)])]);

        lookup.fail_lookups(true);
        assert!(lookup.find_peers("t").await.is_err());
    }
}

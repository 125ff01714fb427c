//! Networking host contract.
//!
//! The node never talks to a transport directly. Everything it needs from
//! one (identity, dialing, the peer store, per-topic pubsub primitives and
//! an orderly close) goes through the traits in this module.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use libp2p_identity::{PeerId, PublicKey};
use serde::{Deserialize, Serialize};

use crate::error::HostError;

/// A peer together with the addresses it is known to listen on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub id: PeerId,
    pub addrs: Vec<SocketAddr>,
}

impl PeerInfo {
    pub fn new(id: PeerId, addrs: Vec<SocketAddr>) -> Self {
        Self { id, addrs }
    }
}

impl fmt::Display for PeerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.addrs.first() {
            Some(addr) => write!(f, "{}@{}", self.id, addr),
            None => write!(f, "{}", self.id),
        }
    }
}

/// Lifetime class of an address entry in the peer store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrTtl {
    /// Never expires and survives failed dials (self, bootstrap peers).
    Permanent,
    Temporary(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Connectedness {
    NotConnected,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// What the authorization hook sees once a connection is secured and muxed.
#[derive(Debug, Clone)]
pub struct UpgradedConnection {
    pub remote_peer: PeerId,
    pub direction: Direction,
    pub remote_addr: SocketAddr,
    /// Compressed secp256k1 public key of the remote side, empty when the
    /// remote uses another key type.
    pub remote_public_key: Vec<u8>,
}

/// A raw record handed out by a topic subscription.
#[derive(Debug, Clone)]
pub struct RawRecord {
    pub data: Vec<u8>,
    pub received_from: PeerId,
}

/// Internally synchronised table of known peers and their addresses.
pub trait PeerStore: Send + Sync {
    fn add_addrs(&self, peer: &PeerId, addrs: &[SocketAddr], ttl: AddrTtl);

    fn clear_addrs(&self, peer: &PeerId);

    fn remove_peer(&self, peer: &PeerId);

    /// Every peer with at least one live address entry, self included.
    fn peers(&self) -> Vec<PeerId>;

    fn peer_info(&self, peer: &PeerId) -> PeerInfo;

    fn is_permanent(&self, peer: &PeerId) -> bool;
}

#[async_trait]
pub trait Subscription: Send + Sync {
    /// Wait for the next record. Fails with [`HostError::SubscriptionCancelled`]
    /// once the subscription is cancelled or its host is closed.
    async fn next(&self) -> Result<RawRecord, HostError>;

    fn cancel(&self);
}

#[async_trait]
pub trait TopicHandle: Send + Sync {
    fn name(&self) -> &str;

    async fn publish(&self, data: Vec<u8>) -> Result<(), HostError>;

    fn subscribe(&self) -> Result<Arc<dyn Subscription>, HostError>;

    /// Peers in the topic mesh, excluding the local host.
    fn list_peers(&self) -> Vec<PeerId>;

    /// Release the handle. Fails while a subscription created from it is
    /// still live; calling it again after success is a no-op.
    fn close(&self) -> Result<(), HostError>;
}

#[async_trait]
pub trait Host: Send + Sync + 'static {
    fn id(&self) -> PeerId;

    fn public_key(&self) -> PublicKey;

    fn listen_addrs(&self) -> Vec<SocketAddr>;

    fn peer_store(&self) -> &dyn PeerStore;

    fn connectedness(&self, peer: &PeerId) -> Connectedness;

    fn connected_peers(&self) -> Vec<PeerId>;

    /// Dial a peer using the given and already known addresses. Callers bound
    /// this with their own timeout.
    async fn connect(&self, peer: &PeerInfo) -> Result<(), HostError>;

    fn join_topic(&self, topic: &str) -> Result<Arc<dyn TopicHandle>, HostError>;

    async fn close(&self) -> Result<(), HostError>;
}

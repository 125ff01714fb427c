pub mod config;
pub mod connections;
pub mod discovery;
pub mod error;
pub mod gater;
pub mod host;
pub mod identity;
pub mod memory;
pub mod message;
pub mod metrics;
pub mod node;
pub mod p2p;
pub mod peerstore;
pub mod processor;
pub mod pubsub;
pub mod storage;
mod subscriptions;
pub mod tracker;

// Re-export commonly used types for easier testing
pub use crate::config::{Config, NodeConfig};
pub use crate::connections::{ConnectionManager, SweepReport};
pub use crate::discovery::{to_discovery_methods, DiscoveryMethod, DiscoveryService, PeerLookup};
pub use crate::error::{
    ConfigError, ConnectionError, DiscoveryError, HostError, JoinError, NodeError, PublishError, StoreError,
    TrackerError,
};
pub use crate::gater::{AllowAllGater, ConnectionGater, TrustedIdentities, WhitelistGater};
pub use crate::host::{AddrTtl, Connectedness, Direction, Host, PeerInfo, PeerStore, RawRecord, UpgradedConnection};
pub use crate::memory::{MemoryHost, MemoryLookup, MemoryNetwork};
pub use crate::message::Message;
pub use crate::node::{Node, NodeQueues, NodeState, TopicHandler};
pub use crate::p2p::Libp2pHost;
pub use crate::peerstore::MemoryPeerStore;
pub use crate::pubsub::PubsubManager;
pub use crate::storage::{MemoryMessageStore, MessageStore, SledMessageStore, TrackedMessage};
pub use crate::tracker::MessageTracker;

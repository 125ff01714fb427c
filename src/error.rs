//! Error taxonomy for the gossip node.
//!
//! Routine network churn (dial failures, malformed records, failed lookup
//! rounds) is absorbed by the component that sees it and only logged.
//! The types here are what callers can actually observe.

use libp2p_identity::PeerId;
use thiserror::Error;

/// Malformed configuration detected at startup. Fatal.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid private key: {0}")]
    InvalidPrivateKey(String),

    #[error("failed to parse listen address '{addr}': {reason}")]
    InvalidListenAddress { addr: String, reason: String },

    #[error("failed to parse bootstrap peer '{peer}': {reason}")]
    InvalidBootstrapPeer { peer: String, reason: String },

    #[error("not a valid discovery method: {0:?}")]
    InvalidDiscoveryMethod(String),

    #[error("invalid trusted identities: {0}")]
    InvalidTrustedIdentities(String),

    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Failure reported by the networking host.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HostError {
    #[error("host is closed")]
    Closed,

    #[error("cannot dial self")]
    DialSelf,

    #[error("no addresses known for peer {0}")]
    NoAddresses(PeerId),

    #[error("peer {0} is unreachable")]
    Unreachable(PeerId),

    #[error("connection with peer {peer} denied (reason {reason})")]
    Denied { peer: PeerId, reason: u32 },

    #[error("subscription cancelled")]
    SubscriptionCancelled,

    #[error("topic {0} is closed")]
    TopicClosed(String),

    #[error("topic {0} still has active subscriptions")]
    TopicInUse(String),

    #[error("transport error: {0}")]
    Transport(String),
}

/// Joining or subscribing to a topic failed. Nothing was registered.
#[derive(Error, Debug)]
pub enum JoinError {
    #[error("failed to join '{topic}': {source}")]
    Join {
        topic: String,
        #[source]
        source: HostError,
    },

    #[error("failed to subscribe to '{topic}': {source}")]
    Subscribe {
        topic: String,
        #[source]
        source: HostError,
    },
}

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("failed to serialize message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("failed to join topic '{topic}': {source}")]
    Join {
        topic: String,
        #[source]
        source: HostError,
    },

    #[error("failed to publish to '{topic}': {source}")]
    Publish {
        topic: String,
        #[source]
        source: HostError,
    },
}

/// Per-peer dial failure. Logged by the connection manager, never fatal.
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("connection timeout to peer: {peer}, timeout: {timeout_ms}ms")]
    Timeout { peer: PeerId, timeout_ms: u64 },

    #[error("failed to dial peer {peer}: {source}")]
    Dial {
        peer: PeerId,
        #[source]
        source: HostError,
    },

    #[error("dial to {0} cancelled")]
    Cancelled(PeerId),
}

/// Failure of a single advertise or lookup round.
#[derive(Error, Debug, Clone)]
pub enum DiscoveryError {
    #[error("failed to advertise on '{topic}': {reason}")]
    Advertise { topic: String, reason: String },

    #[error("failed to find peers on '{topic}': {reason}")]
    Lookup { topic: String, reason: String },
}

/// Backing store failure.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sled database error: {0}")]
    Sled(#[from] sled::Error),

    #[error("record codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("transaction failed: {0}")]
    Transaction(String),

    #[error("blocking task failed: {0}")]
    Join(String),

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

#[derive(Error, Debug)]
pub enum TrackerError {
    #[error("message not found: {0}")]
    NotFound(String),

    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
}

impl TrackerError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, TrackerError::NotFound(_))
    }
}

/// Node lifecycle misuse or startup failure.
#[derive(Error, Debug)]
pub enum NodeError {
    #[error("node already started")]
    AlreadyStarted,

    #[error("node is stopped")]
    Stopped,

    #[error("topic {0} is already joined with a different handler")]
    HandlerConflict(String),

    #[error(transparent)]
    Join(#[from] JoinError),

    #[error("host error: {0}")]
    Host(#[from] HostError),
}

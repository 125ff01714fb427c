//! A single gossip participant.
//!
//! A [`Node`] ties a gated host to a connection manager, discovery services
//! and a pubsub manager, and exposes two queues to the application: one
//! unified stream of received messages and one sink for outbound messages.
//!
//! Lifecycle is `Created -> Started -> Stopped`, one way only.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::join_all;
use libp2p_identity::PeerId;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::NodeConfig;
use crate::connections::{connect_with_timeout, ConnectionManager};
use crate::discovery::{DiscoveryMethod, DiscoveryService, PeerLookup};
use crate::error::{HostError, NodeError, PublishError};
use crate::gater::WhitelistGater;
use crate::host::{AddrTtl, Connectedness, Host};
use crate::identity::address_of;
use crate::memory::{MemoryHost, MemoryNetwork};
use crate::message::Message;
use crate::p2p::Libp2pHost;
use crate::pubsub::PubsubManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Created,
    Started,
    Stopped,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeState::Created => write!(f, "created"),
            NodeState::Started => write!(f, "started"),
            NodeState::Stopped => write!(f, "stopped"),
        }
    }
}

/// What happens to messages delivered on a joined topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicHandler {
    /// Forward into the node's receive queue.
    Bridge,
    /// Stay in the mesh but discard deliveries.
    Drain,
}

/// Application side of the node's two queues.
pub struct NodeQueues {
    pub receive: mpsc::Receiver<Message>,
    pub send: mpsc::Sender<Message>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub struct Node {
    host: Arc<dyn Host>,
    config: NodeConfig,
    connections: Arc<ConnectionManager>,
    pubsub: Arc<PubsubManager>,
    lookups: HashMap<DiscoveryMethod, Arc<dyn PeerLookup>>,
    handlers: Mutex<HashMap<String, TopicHandler>>,
    receive_tx: Mutex<Option<mpsc::Sender<Message>>>,
    send_rx: Mutex<Option<mpsc::Receiver<Message>>>,
    publish_lock: Arc<tokio::sync::Mutex<()>>,
    state: Mutex<NodeState>,
    cancel: CancellationToken,
    tasks: Mutex<JoinSet<()>>,
}

impl Node {
    pub fn new(host: Arc<dyn Host>, config: NodeConfig) -> (Self, NodeQueues) {
        let store = host.peer_store();
        for peer in &config.bootstrap_peers {
            store.add_addrs(&peer.id, &peer.addrs, AddrTtl::Permanent);
        }

        let connections = ConnectionManager::new(Arc::clone(&host))
            .with_interval(config.reconnect_interval)
            .with_timeout(config.connect_timeout);
        let pubsub = PubsubManager::new(Arc::clone(&host)).with_buffer_size(config.topic_buffer_size);

        let (receive_tx, receive_rx) = mpsc::channel(config.receive_queue_size.max(1));
        let (send_tx, send_rx) = mpsc::channel(config.send_queue_size.max(1));

        let handlers = HashMap::from([(config.topic.clone(), TopicHandler::Bridge)]);

        let node = Self {
            host,
            config,
            connections: Arc::new(connections),
            pubsub: Arc::new(pubsub),
            lookups: HashMap::new(),
            handlers: Mutex::new(handlers),
            receive_tx: Mutex::new(Some(receive_tx)),
            send_rx: Mutex::new(Some(send_rx)),
            publish_lock: Arc::new(tokio::sync::Mutex::new(())),
            state: Mutex::new(NodeState::Created),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(JoinSet::new()),
        };

        let queues = NodeQueues {
            receive: receive_rx,
            send: send_tx,
        };
        (node, queues)
    }

    /// Build a node on an in-process network, gated by the configured whitelist.
    pub fn with_memory_network(
        network: &MemoryNetwork,
        config: NodeConfig,
    ) -> Result<(Self, NodeQueues, MemoryHost), HostError> {
        let gater = WhitelistGater::new(&config.trusted_identities);
        let host = network.create_host(config.keypair.clone(), config.listen_addrs.clone(), Arc::new(gater))?;
        let (node, queues) = Self::new(Arc::new(host.clone()), config);
        Ok((node, queues, host))
    }

    /// Build a node on a libp2p host listening on the configured addresses.
    ///
    /// The DHT backend is always registered; mDNS only runs when it is one
    /// of the configured discovery methods.
    pub async fn with_libp2p(config: NodeConfig) -> Result<(Self, NodeQueues, Libp2pHost), HostError> {
        let gater = WhitelistGater::new(&config.trusted_identities);
        let enable_mdns = config.discovery_methods.contains(&DiscoveryMethod::Mdns);
        let host = Libp2pHost::start(
            config.keypair.clone(),
            config.listen_addrs.clone(),
            Arc::new(gater),
            enable_mdns,
        )
        .await?;

        let (node, queues) = Self::new(Arc::new(host.clone()), config);
        let mut node = node.with_lookup(DiscoveryMethod::Dht, host.dht_lookup());
        if let Some(mdns) = host.mdns_lookup() {
            node = node.with_lookup(DiscoveryMethod::Mdns, mdns);
        }
        Ok((node, queues, host))
    }

    /// Register the lookup backend used for `method`.
    pub fn with_lookup(mut self, method: DiscoveryMethod, lookup: Arc<dyn PeerLookup>) -> Self {
        self.lookups.insert(method, lookup);
        self
    }

    pub fn id(&self) -> PeerId {
        self.host.id()
    }

    /// Canonical address derived from the node's public key, `None` when the
    /// key type has no address.
    pub fn address(&self) -> Option<String> {
        address_of(&self.host.public_key())
    }

    pub fn listen_addrs(&self) -> Vec<SocketAddr> {
        self.host.listen_addrs()
    }

    pub fn state(&self) -> NodeState {
        *lock(&self.state)
    }

    pub fn host(&self) -> &Arc<dyn Host> {
        &self.host
    }

    pub fn pubsub(&self) -> &Arc<PubsubManager> {
        &self.pubsub
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn peers_on_topic(&self, topic: &str) -> Vec<PeerId> {
        self.pubsub.peers_on_topic(topic)
    }

    pub fn is_peer_connected(&self, peer: &PeerId) -> bool {
        self.host.connectedness(peer) == Connectedness::Connected
    }

    /// Whether the peer store knows anyone besides this node.
    pub fn has_peers(&self) -> bool {
        let count = self.host.peer_store().peers().len();
        if count <= 1 {
            info!(service = "node", "Peer store holds no peers besides self");
            return false;
        }
        true
    }

    pub async fn start(&self) -> Result<(), NodeError> {
        {
            let mut state = lock(&self.state);
            match *state {
                NodeState::Created => *state = NodeState::Started,
                NodeState::Started => return Err(NodeError::AlreadyStarted),
                NodeState::Stopped => return Err(NodeError::Stopped),
            }
        }

        info!(service = "node", peer = %self.id(), address = ?self.address(), "🚀 Starting node");

        self.connect_to_bootstrap_peers().await;
        self.set_up_peer_discovery(&self.config.topic);

        let handlers: Vec<(String, TopicHandler)> =
            lock(&self.handlers).iter().map(|(t, h)| (t.clone(), *h)).collect();
        for (topic, handler) in handlers {
            self.pubsub.join_topic(&topic)?;
            self.spawn_topic_tasks(&topic, handler);
        }

        self.spawn(Arc::clone(&self.connections).run(self.cancel.child_token()));

        let send_rx = lock(&self.send_rx).take();
        if let Some(send_rx) = send_rx {
            self.spawn(publish_loop(
                Arc::clone(&self.pubsub),
                Arc::clone(&self.publish_lock),
                self.config.topic.clone(),
                send_rx,
                self.cancel.child_token(),
            ));
        }

        info!(service = "node", topics = ?self.pubsub.joined_topics(), "✅ Node started");
        Ok(())
    }

    /// Cancel every task, leave every topic and close the host. Idempotent.
    pub async fn stop(&self) -> Result<(), NodeError> {
        {
            let mut state = lock(&self.state);
            if *state == NodeState::Stopped {
                return Ok(());
            }
            *state = NodeState::Stopped;
        }

        info!(service = "node", peer = %self.id(), "Stopping node");

        self.cancel.cancel();
        self.pubsub.cancel_all_subscriptions();
        lock(&self.receive_tx).take();
        lock(&self.send_rx).take();

        let mut tasks = std::mem::take(&mut *lock(&self.tasks));
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                if e.is_panic() {
                    error!(service = "node", "Background task panicked: {}", e);
                }
            }
        }

        self.host.close().await?;
        info!(service = "node", peer = %self.id(), "Node stopped");
        Ok(())
    }

    /// Join `topic` with the given handler. On a started node its receive
    /// loop and handler start right away, otherwise at `start`.
    ///
    /// Re-joining with the same handler is a no-op. A different handler is
    /// refused until the topic is left.
    pub async fn join_topic(&self, topic: &str, handler: TopicHandler) -> Result<(), NodeError> {
        let state = self.state();
        if state == NodeState::Stopped {
            return Err(NodeError::Stopped);
        }
        if lock(&self.handlers).get(topic).is_some_and(|current| *current != handler) {
            return Err(NodeError::HandlerConflict(topic.to_string()));
        }

        self.pubsub.join_topic(topic)?;
        lock(&self.handlers).insert(topic.to_string(), handler);

        if state == NodeState::Started {
            self.spawn_topic_tasks(topic, handler);
        }
        Ok(())
    }

    pub fn leave_topic(&self, topic: &str) {
        lock(&self.handlers).remove(topic);
        self.pubsub.cancel_subscription(topic);
    }

    /// Publish through the same serialised path as the outbound queue.
    pub async fn publish(&self, topic: &str, message: &Message) -> Result<(), PublishError> {
        let _guard = self.publish_lock.lock().await;
        self.pubsub.publish(topic, message).await
    }

    /// Dial every bootstrap peer concurrently. Failures are logged; bootstrap
    /// peers stay in the peer store regardless. Returns how many connected.
    pub async fn connect_to_bootstrap_peers(&self) -> usize {
        let peers = &self.config.bootstrap_peers;
        if peers.is_empty() {
            return 0;
        }

        let timeout = self.connections.timeout();
        let dials = peers.iter().map(|peer| async move {
            let result = connect_with_timeout(self.host.as_ref(), peer, timeout).await;
            (peer, result)
        });

        let mut connected = 0;
        for (peer, result) in join_all(dials).await {
            match result {
                Ok(()) => {
                    connected += 1;
                    info!(service = "node", peer = %peer, "Connected to bootstrap peer");
                }
                Err(e) => warn!(service = "node", peer = %peer, "Failed to connect to bootstrap peer: {}", e),
            }
        }
        connected
    }

    /// Spawn one discovery service per configured method that has a backend.
    /// Returns how many were started.
    pub fn set_up_peer_discovery(&self, topic: &str) -> usize {
        let mut methods: Vec<DiscoveryMethod> = self.config.discovery_methods.iter().copied().collect();
        methods.sort();

        let mut started = 0;
        for method in methods {
            if method == DiscoveryMethod::None {
                debug!(service = "node", "Peer discovery disabled");
                continue;
            }
            let Some(lookup) = self.lookups.get(&method) else {
                warn!(service = "node", method = %method, "No backend registered for discovery method, skipping");
                continue;
            };
            let service = DiscoveryService::new(Arc::clone(&self.host), Arc::clone(lookup), method)
                .with_interval(self.config.discovery_interval);
            self.spawn(service.run(topic.to_string(), self.cancel.child_token()));
            started += 1;
        }
        started
    }

    fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        lock(&self.tasks).spawn(task);
    }

    fn spawn_topic_tasks(&self, topic: &str, handler: TopicHandler) {
        let started = {
            let mut tasks = lock(&self.tasks);
            self.pubsub.start_receive_loop(topic, &mut tasks, &self.cancel)
        };
        if !started {
            return;
        }
        let Some(queue) = self.pubsub.delivery_queue(topic) else {
            return;
        };

        match handler {
            TopicHandler::Bridge => {
                let receive_tx = lock(&self.receive_tx).clone();
                if let Some(receive_tx) = receive_tx {
                    self.spawn(bridge_topic(topic.to_string(), queue, receive_tx, self.cancel.child_token()));
                }
            }
            TopicHandler::Drain => {
                self.spawn(drain_topic(topic.to_string(), queue, self.cancel.child_token()));
            }
        }
    }
}

async fn publish_loop(
    pubsub: Arc<PubsubManager>,
    publish_lock: Arc<tokio::sync::Mutex<()>>,
    topic: String,
    mut outbound: mpsc::Receiver<Message>,
    cancel: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            message = outbound.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };

        let _guard = publish_lock.lock().await;
        if let Err(e) = pubsub.publish(&topic, &message).await {
            error!(service = "node", topic = %topic, "Failed to publish message: {}", e);
        }
    }
    debug!(service = "node", topic = %topic, "Publish loop stopped");
}

async fn bridge_topic(
    topic: String,
    queue: async_channel::Receiver<Message>,
    receive_tx: mpsc::Sender<Message>,
    cancel: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            message = queue.recv() => match message {
                Ok(message) => message,
                Err(_) => break,
            },
        };

        tokio::select! {
            _ = cancel.cancelled() => break,
            sent = receive_tx.send(message) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }
    debug!(service = "node", topic = %topic, "Receive bridge stopped");
}

async fn drain_topic(topic: String, queue: async_channel::Receiver<Message>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            message = queue.recv() => match message {
                Ok(message) => debug!(service = "node", topic = %topic, id = %message.id, "Discarding message"),
                Err(_) => break,
            },
        }
    }
}

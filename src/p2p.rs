//! libp2p implementation of the host contract.
//!
//! One task owns the swarm (TCP with noise and yamux, gossipsub, Kademlia in
//! server mode, identify and optionally mDNS). The rest of the node talks to
//! it through a command channel and reads the shared state the task keeps
//! current. Connection authorization runs inside the swarm through
//! [`GaterBehaviour`], so denied peers never reach the other behaviours.

use std::collections::{HashMap, HashSet};
use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use libp2p::core::{muxing::StreamMuxerBox, transport::PortUse, upgrade, Endpoint};
use libp2p::gossipsub::{self, IdentTopic, MessageAuthenticity, ValidationMode};
use libp2p::identity::{Keypair, PublicKey};
use libp2p::kad::{self, store::MemoryStore, GetProvidersOk, QueryId, QueryResult, RecordKey};
use libp2p::multiaddr::{Multiaddr, Protocol};
use libp2p::swarm::behaviour::toggle::Toggle;
use libp2p::swarm::dial_opts::{DialOpts, PeerCondition};
use libp2p::swarm::{
    dummy, Config as SwarmConfig, ConnectionDenied, ConnectionId, DialError, FromSwarm, NetworkBehaviour, Swarm,
    SwarmEvent, THandler, THandlerInEvent, THandlerOutEvent, ToSwarm,
};
use libp2p::{identify, mdns, noise, tcp, yamux, PeerId, Transport};
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::discovery::PeerLookup;
use crate::error::{DiscoveryError, HostError};
use crate::gater::{ConnectionGater, REASON_UNSPECIFIED};
use crate::host::{
    AddrTtl, Connectedness, Direction, Host, PeerInfo, PeerStore, RawRecord, Subscription, TopicHandle,
    UpgradedConnection,
};
use crate::identity::{public_key_from_peer_id, raw_public_key};
use crate::peerstore::MemoryPeerStore;
use crate::subscriptions::{ChannelSubscription, SlotOwner, SubscriptionTable};

/// Protocol string announced through identify.
pub const IDENTIFY_PROTOCOL: &str = "/gossip-node/0.1.0";

/// How long [`Libp2pHost::start`] waits for the first listen address.
pub const LISTEN_TIMEOUT: Duration = Duration::from_secs(5);

const GOSSIP_HEARTBEAT: Duration = Duration::from_millis(500);
const IDLE_CONNECTION_TIMEOUT: Duration = Duration::from_secs(60 * 60);

const UNSPECIFIED_ADDR: SocketAddr = SocketAddr::new(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), 0);

/// `/ip4/<ip>/tcp/<port>` (or `/ip6/...`) for a socket address.
pub fn socket_to_multiaddr(addr: SocketAddr) -> Multiaddr {
    let ip = match addr.ip() {
        IpAddr::V4(ip) => Protocol::Ip4(ip),
        IpAddr::V6(ip) => Protocol::Ip6(ip),
    };
    Multiaddr::empty().with(ip).with(Protocol::Tcp(addr.port()))
}

/// The TCP socket address at the head of a multiaddr, if it has one.
pub fn multiaddr_to_socket(addr: &Multiaddr) -> Option<SocketAddr> {
    let mut parts = addr.iter();
    let ip: IpAddr = match parts.next()? {
        Protocol::Ip4(ip) => ip.into(),
        Protocol::Ip6(ip) => ip.into(),
        _ => return None,
    };
    match parts.next()? {
        Protocol::Tcp(port) => Some(SocketAddr::new(ip, port)),
        _ => None,
    }
}

fn topic_key(topic: &str) -> RecordKey {
    RecordKey::new(&Sha256::digest(topic.as_bytes()).to_vec())
}

/// Runs a [`ConnectionGater`] at the swarm's connection hooks.
///
/// Address filtering happens in [`Libp2pHost::connect`] because a behaviour
/// can only add dial addresses, not remove them.
pub struct GaterBehaviour {
    gater: Arc<dyn ConnectionGater>,
}

impl GaterBehaviour {
    pub fn new(gater: Arc<dyn ConnectionGater>) -> Self {
        Self { gater }
    }

    fn check_established(
        &self,
        peer: PeerId,
        direction: Direction,
        remote: &Multiaddr,
    ) -> Result<(), ConnectionDenied> {
        let remote_addr = multiaddr_to_socket(remote).unwrap_or(UNSPECIFIED_ADDR);
        if !self.gater.intercept_secured(direction, &peer, &remote_addr) {
            return Err(ConnectionDenied::new(HostError::Denied {
                peer,
                reason: REASON_UNSPECIFIED,
            }));
        }

        let conn = UpgradedConnection {
            remote_peer: peer,
            direction,
            remote_addr,
            remote_public_key: public_key_from_peer_id(&peer)
                .map(|key| raw_public_key(&key))
                .unwrap_or_default(),
        };
        let (allowed, reason) = self.gater.intercept_upgraded(&conn);
        if !allowed {
            return Err(ConnectionDenied::new(HostError::Denied { peer, reason }));
        }
        Ok(())
    }
}

impl NetworkBehaviour for GaterBehaviour {
    type ConnectionHandler = dummy::ConnectionHandler;
    type ToSwarm = Infallible;

    fn handle_pending_inbound_connection(
        &mut self,
        _connection_id: ConnectionId,
        local_addr: &Multiaddr,
        remote_addr: &Multiaddr,
    ) -> Result<(), ConnectionDenied> {
        let local = multiaddr_to_socket(local_addr).unwrap_or(UNSPECIFIED_ADDR);
        let remote = multiaddr_to_socket(remote_addr).unwrap_or(UNSPECIFIED_ADDR);
        if self.gater.intercept_accept(&local, &remote) {
            Ok(())
        } else {
            Err(ConnectionDenied::new(HostError::Transport(format!(
                "inbound connection from {} refused",
                remote
            ))))
        }
    }

    fn handle_pending_outbound_connection(
        &mut self,
        _connection_id: ConnectionId,
        maybe_peer: Option<PeerId>,
        _addresses: &[Multiaddr],
        _effective_role: Endpoint,
    ) -> Result<Vec<Multiaddr>, ConnectionDenied> {
        if let Some(peer) = maybe_peer {
            if !self.gater.intercept_peer_dial(&peer) {
                return Err(ConnectionDenied::new(HostError::Denied {
                    peer,
                    reason: REASON_UNSPECIFIED,
                }));
            }
        }
        Ok(Vec::new())
    }

    fn handle_established_inbound_connection(
        &mut self,
        _connection_id: ConnectionId,
        peer: PeerId,
        _local_addr: &Multiaddr,
        remote_addr: &Multiaddr,
    ) -> Result<THandler<Self>, ConnectionDenied> {
        self.check_established(peer, Direction::Inbound, remote_addr)?;
        Ok(dummy::ConnectionHandler)
    }

    fn handle_established_outbound_connection(
        &mut self,
        _connection_id: ConnectionId,
        peer: PeerId,
        addr: &Multiaddr,
        _role_override: Endpoint,
        _port_use: PortUse,
    ) -> Result<THandler<Self>, ConnectionDenied> {
        self.check_established(peer, Direction::Outbound, addr)?;
        Ok(dummy::ConnectionHandler)
    }

    fn on_swarm_event(&mut self, _event: FromSwarm) {}

    fn on_connection_handler_event(
        &mut self,
        _peer_id: PeerId,
        _connection_id: ConnectionId,
        event: THandlerOutEvent<Self>,
    ) {
        match event {}
    }

    fn poll(&mut self, _cx: &mut Context<'_>) -> Poll<ToSwarm<Self::ToSwarm, THandlerInEvent<Self>>> {
        Poll::Pending
    }
}

#[derive(NetworkBehaviour)]
#[behaviour(to_swarm = "HostEvent", prelude = "libp2p::swarm::derive_prelude")]
struct HostBehaviour {
    // First, so a denial happens before any other behaviour sees the peer.
    gater: GaterBehaviour,
    gossipsub: gossipsub::Behaviour,
    kademlia: kad::Behaviour<MemoryStore>,
    identify: identify::Behaviour,
    mdns: Toggle<mdns::tokio::Behaviour>,
}

enum HostEvent {
    Gossipsub(gossipsub::Event),
    Kademlia(kad::Event),
    Identify(Box<identify::Event>),
    Mdns(mdns::Event),
}

impl From<Infallible> for HostEvent {
    fn from(never: Infallible) -> Self {
        match never {}
    }
}

impl From<gossipsub::Event> for HostEvent {
    fn from(event: gossipsub::Event) -> Self {
        Self::Gossipsub(event)
    }
}

impl From<kad::Event> for HostEvent {
    fn from(event: kad::Event) -> Self {
        Self::Kademlia(event)
    }
}

impl From<identify::Event> for HostEvent {
    fn from(event: identify::Event) -> Self {
        Self::Identify(Box::new(event))
    }
}

impl From<mdns::Event> for HostEvent {
    fn from(event: mdns::Event) -> Self {
        Self::Mdns(event)
    }
}

fn build_behaviour(
    keypair: &Keypair,
    gater: Arc<dyn ConnectionGater>,
    enable_mdns: bool,
) -> Result<HostBehaviour, HostError> {
    let peer_id = keypair.public().to_peer_id();

    let gossipsub_config = gossipsub::ConfigBuilder::default()
        .heartbeat_interval(GOSSIP_HEARTBEAT)
        .validation_mode(ValidationMode::Strict)
        .build()
        .map_err(|e| HostError::Transport(format!("invalid gossipsub config: {}", e)))?;
    let gossipsub = gossipsub::Behaviour::new(MessageAuthenticity::Signed(keypair.clone()), gossipsub_config)
        .map_err(|e| HostError::Transport(format!("failed to create gossipsub: {}", e)))?;

    let mut kademlia = kad::Behaviour::new(peer_id, MemoryStore::new(peer_id));
    kademlia.set_mode(Some(kad::Mode::Server));

    let identify = identify::Behaviour::new(identify::Config::new(IDENTIFY_PROTOCOL.to_string(), keypair.public()));

    let mdns = if enable_mdns {
        Some(
            mdns::tokio::Behaviour::new(mdns::Config::default(), peer_id)
                .map_err(|e| HostError::Transport(format!("failed to create mdns: {}", e)))?,
        )
    } else {
        None
    };

    Ok(HostBehaviour {
        gater: GaterBehaviour::new(gater),
        gossipsub,
        kademlia,
        identify,
        mdns: Toggle::from(mdns),
    })
}

fn build_swarm(
    keypair: &Keypair,
    gater: Arc<dyn ConnectionGater>,
    enable_mdns: bool,
) -> Result<Swarm<HostBehaviour>, HostError> {
    let peer_id = keypair.public().to_peer_id();
    let noise = noise::Config::new(keypair)
        .map_err(|e| HostError::Transport(format!("failed to initialise noise: {}", e)))?;

    let transport = tcp::tokio::Transport::new(tcp::Config::default().nodelay(true))
        .upgrade(upgrade::Version::V1Lazy)
        .authenticate(noise)
        .multiplex(yamux::Config::default())
        .map(|(peer, muxer), _| (peer, StreamMuxerBox::new(muxer)))
        .boxed();

    let behaviour = build_behaviour(keypair, gater, enable_mdns)?;
    Ok(Swarm::new(
        transport,
        behaviour,
        peer_id,
        SwarmConfig::with_tokio_executor().with_idle_connection_timeout(IDLE_CONNECTION_TIMEOUT),
    ))
}

type DialResponse = oneshot::Sender<Result<(), HostError>>;

enum Command {
    Dial {
        peer: PeerId,
        addrs: Vec<Multiaddr>,
        response: DialResponse,
    },
    Subscribe {
        topic: String,
    },
    Unsubscribe {
        topic: String,
    },
    Publish {
        topic: String,
        data: Vec<u8>,
        response: oneshot::Sender<Result<(), HostError>>,
    },
    Provide {
        topic: String,
        response: oneshot::Sender<Result<(), DiscoveryError>>,
    },
    FindProviders {
        topic: String,
        response: oneshot::Sender<Result<Vec<PeerInfo>, DiscoveryError>>,
    },
}

struct HostShared {
    id: PeerId,
    public_key: PublicKey,
    gater: Arc<dyn ConnectionGater>,
    listen_addrs: Mutex<Vec<SocketAddr>>,
    peer_store: MemoryPeerStore,
    connections: DashMap<PeerId, Direction>,
    subscriptions: SubscriptionTable,
    topic_peers: DashMap<String, HashSet<PeerId>>,
    // Addresses learned from identify and the routing table.
    routable: DashMap<PeerId, Vec<SocketAddr>>,
    mdns_peers: DashMap<PeerId, Vec<SocketAddr>>,
    mdns_enabled: bool,
    commands: mpsc::UnboundedSender<Command>,
    root: CancellationToken,
    closed: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HostShared {
    fn ensure_open(&self) -> Result<(), HostError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(HostError::Closed);
        }
        Ok(())
    }

    fn send(&self, command: Command) -> Result<(), HostError> {
        self.commands.send(command).map_err(|_| HostError::Closed)
    }

    fn listen_addrs(&self) -> MutexGuard<'_, Vec<SocketAddr>> {
        match self.listen_addrs.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Best known addresses of `peer`, from every source this host has.
    fn known_addrs(&self, peer: &PeerId) -> Vec<SocketAddr> {
        let mut addrs = self.peer_store.peer_info(peer).addrs;
        let learned = self.routable.get(peer).map(|a| a.clone()).unwrap_or_default();
        let local = self.mdns_peers.get(peer).map(|a| a.clone()).unwrap_or_default();
        for addr in learned.into_iter().chain(local) {
            if !addrs.contains(&addr) {
                addrs.push(addr);
            }
        }
        addrs
    }
}

impl SlotOwner for HostShared {
    fn release_slot(&self, topic: &str, id: u64) {
        if self.subscriptions.remove(topic, id) && !self.closed.load(Ordering::SeqCst) {
            let _ = self.send(Command::Unsubscribe {
                topic: topic.to_string(),
            });
        }
    }
}

/// Cheaply cloneable handle to a running libp2p host.
#[derive(Clone)]
pub struct Libp2pHost {
    shared: Arc<HostShared>,
}

impl Libp2pHost {
    /// Build the swarm, start listening and spawn the task that drives it.
    ///
    /// Returns once the first listen address is bound, so
    /// [`Host::listen_addrs`] reports real ports even for `:0` requests.
    pub async fn start(
        keypair: Keypair,
        listen_addrs: Vec<SocketAddr>,
        gater: Arc<dyn ConnectionGater>,
        enable_mdns: bool,
    ) -> Result<Self, HostError> {
        let mut swarm = build_swarm(&keypair, Arc::clone(&gater), enable_mdns)?;
        for addr in &listen_addrs {
            swarm
                .listen_on(socket_to_multiaddr(*addr))
                .map_err(|e| HostError::Transport(format!("failed to listen on {}: {}", addr, e)))?;
        }

        let public_key = keypair.public();
        let id = public_key.to_peer_id();
        let (commands, command_rx) = mpsc::unbounded_channel();
        let root = CancellationToken::new();
        let shared = Arc::new(HostShared {
            id,
            public_key,
            gater,
            listen_addrs: Mutex::new(Vec::new()),
            peer_store: MemoryPeerStore::new(id),
            connections: DashMap::new(),
            subscriptions: SubscriptionTable::default(),
            topic_peers: DashMap::new(),
            routable: DashMap::new(),
            mdns_peers: DashMap::new(),
            mdns_enabled: enable_mdns,
            commands,
            root: root.clone(),
            closed: AtomicBool::new(false),
            task: Mutex::new(None),
        });

        let (ready_tx, ready_rx) = oneshot::channel();
        let ready = if listen_addrs.is_empty() {
            let _ = ready_tx.send(Ok(()));
            None
        } else {
            Some(ready_tx)
        };

        let driver = SwarmDriver {
            swarm,
            shared: Arc::clone(&shared),
            ready,
            pending_dials: HashMap::new(),
            pending_provides: HashMap::new(),
            pending_lookups: HashMap::new(),
        };
        let handle = tokio::spawn(driver.run(command_rx, root));
        if let Ok(mut task) = shared.task.lock() {
            *task = Some(handle);
        }

        let host = Self { shared };
        match tokio::time::timeout(LISTEN_TIMEOUT, ready_rx).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => {
                let _ = host.close().await;
                return Err(e);
            }
            Ok(Err(_)) | Err(_) => {
                let _ = host.close().await;
                return Err(HostError::Transport("no listen address became ready".to_string()));
            }
        }

        info!(
            service = "p2p_host",
            peer = %id,
            addrs = ?host.listen_addrs(),
            "libp2p host started"
        );
        Ok(host)
    }

    /// Kademlia provider records keyed by topic.
    pub fn dht_lookup(&self) -> Arc<dyn PeerLookup> {
        Arc::new(DhtLookup {
            shared: Arc::clone(&self.shared),
        })
    }

    /// Peers seen on the local network, when mDNS was enabled at start.
    pub fn mdns_lookup(&self) -> Option<Arc<dyn PeerLookup>> {
        if !self.shared.mdns_enabled {
            return None;
        }
        Some(Arc::new(MdnsLookup {
            shared: Arc::clone(&self.shared),
        }))
    }

    /// A bootstrap entry other hosts can use to reach this one.
    pub fn peer_info(&self) -> PeerInfo {
        PeerInfo::new(self.shared.id, self.listen_addrs())
    }
}

#[async_trait]
impl Host for Libp2pHost {
    fn id(&self) -> PeerId {
        self.shared.id
    }

    fn public_key(&self) -> PublicKey {
        self.shared.public_key.clone()
    }

    fn listen_addrs(&self) -> Vec<SocketAddr> {
        self.shared.listen_addrs().clone()
    }

    fn peer_store(&self) -> &dyn PeerStore {
        &self.shared.peer_store
    }

    fn connectedness(&self, peer: &PeerId) -> Connectedness {
        if self.shared.connections.contains_key(peer) {
            Connectedness::Connected
        } else {
            Connectedness::NotConnected
        }
    }

    fn connected_peers(&self) -> Vec<PeerId> {
        self.shared.connections.iter().map(|c| *c.key()).collect()
    }

    async fn connect(&self, peer: &PeerInfo) -> Result<(), HostError> {
        let shared = &self.shared;
        shared.ensure_open()?;

        if peer.id == shared.id {
            return Err(HostError::DialSelf);
        }
        if !shared.gater.intercept_peer_dial(&peer.id) {
            return Err(HostError::Denied {
                peer: peer.id,
                reason: REASON_UNSPECIFIED,
            });
        }
        if shared.connections.contains_key(&peer.id) {
            return Ok(());
        }

        let mut candidates = peer.addrs.clone();
        for addr in shared.known_addrs(&peer.id) {
            if !candidates.contains(&addr) {
                candidates.push(addr);
            }
        }
        let addrs: Vec<Multiaddr> = candidates
            .into_iter()
            .filter(|addr| shared.gater.intercept_addr_dial(&peer.id, addr))
            .map(socket_to_multiaddr)
            .collect();
        if addrs.is_empty() {
            return Err(HostError::NoAddresses(peer.id));
        }

        let (response, rx) = oneshot::channel();
        shared.send(Command::Dial {
            peer: peer.id,
            addrs,
            response,
        })?;
        rx.await.map_err(|_| HostError::Closed)?
    }

    fn join_topic(&self, topic: &str) -> Result<Arc<dyn TopicHandle>, HostError> {
        self.shared.ensure_open()?;
        Ok(Arc::new(Libp2pTopic {
            shared: Arc::clone(&self.shared),
            name: topic.to_string(),
            live_subscriptions: Arc::new(AtomicUsize::new(0)),
            closed: AtomicBool::new(false),
        }))
    }

    async fn close(&self) -> Result<(), HostError> {
        let shared = &self.shared;
        if shared.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        shared.root.cancel();
        shared.subscriptions.clear();
        let task = match shared.task.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(service = "p2p_host", error = %e, "Swarm task ended abnormally");
            }
        }
        shared.connections.clear();
        shared.topic_peers.clear();

        debug!(service = "p2p_host", peer = %shared.id, "libp2p host closed");
        Ok(())
    }
}

struct Libp2pTopic {
    shared: Arc<HostShared>,
    name: String,
    live_subscriptions: Arc<AtomicUsize>,
    closed: AtomicBool,
}

impl Libp2pTopic {
    fn ensure_usable(&self) -> Result<(), HostError> {
        self.shared.ensure_open()?;
        if self.closed.load(Ordering::SeqCst) {
            return Err(HostError::TopicClosed(self.name.clone()));
        }
        Ok(())
    }
}

#[async_trait]
impl TopicHandle for Libp2pTopic {
    fn name(&self) -> &str {
        &self.name
    }

    async fn publish(&self, data: Vec<u8>) -> Result<(), HostError> {
        self.ensure_usable()?;

        // Local subscribers see their own publications, as with a mesh
        // that loops messages back to the sender.
        let record = RawRecord {
            data: data.clone(),
            received_from: self.shared.id,
        };
        self.shared.subscriptions.deliver(&self.name, &record);

        let (response, rx) = oneshot::channel();
        self.shared.send(Command::Publish {
            topic: self.name.clone(),
            data,
            response,
        })?;
        rx.await.map_err(|_| HostError::Closed)?
    }

    fn subscribe(&self) -> Result<Arc<dyn Subscription>, HostError> {
        self.ensure_usable()?;
        let slot = self.shared.subscriptions.add(&self.name, &self.shared.root);
        if slot.first {
            self.shared.send(Command::Subscribe {
                topic: self.name.clone(),
            })?;
        }
        let owner: Weak<dyn SlotOwner> = Arc::downgrade(&self.shared) as Weak<dyn SlotOwner>;
        Ok(Arc::new(ChannelSubscription::new(
            &self.name,
            slot,
            owner,
            Arc::clone(&self.live_subscriptions),
        )))
    }

    fn list_peers(&self) -> Vec<PeerId> {
        self.shared
            .topic_peers
            .get(&self.name)
            .map(|peers| {
                peers
                    .iter()
                    .filter(|p| self.shared.connections.contains_key(*p))
                    .copied()
                    .collect()
            })
            .unwrap_or_default()
    }

    fn close(&self) -> Result<(), HostError> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        if self.live_subscriptions.load(Ordering::SeqCst) > 0 {
            return Err(HostError::TopicInUse(self.name.clone()));
        }
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct PendingLookup {
    topic: String,
    found: HashSet<PeerId>,
    response: oneshot::Sender<Result<Vec<PeerInfo>, DiscoveryError>>,
}

/// Owns the swarm; everything else reaches it through [`Command`]s.
struct SwarmDriver {
    swarm: Swarm<HostBehaviour>,
    shared: Arc<HostShared>,
    ready: Option<oneshot::Sender<Result<(), HostError>>>,
    pending_dials: HashMap<PeerId, Vec<DialResponse>>,
    pending_provides: HashMap<QueryId, (String, oneshot::Sender<Result<(), DiscoveryError>>)>,
    pending_lookups: HashMap<QueryId, PendingLookup>,
}

impl SwarmDriver {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                command = commands.recv() => match command {
                    Some(command) => self.on_command(command),
                    None => break,
                },
                event = self.swarm.select_next_some() => self.on_event(event),
            }
        }
        debug!(service = "p2p_host", peer = %self.shared.id, "Swarm task stopped");
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Dial { peer, addrs, response } => {
                if self.swarm.is_connected(&peer) {
                    let _ = response.send(Ok(()));
                    return;
                }
                let dialing = self.pending_dials.contains_key(&peer);
                self.pending_dials.entry(peer).or_default().push(response);
                if dialing {
                    return;
                }
                let opts = DialOpts::peer_id(peer)
                    .addresses(addrs)
                    .condition(PeerCondition::Disconnected)
                    .build();
                if let Err(e) = self.swarm.dial(opts) {
                    let error = dial_error(peer, &e);
                    self.finish_dial(peer, Err(error));
                }
            }
            Command::Subscribe { topic } => {
                if let Err(e) = self.swarm.behaviour_mut().gossipsub.subscribe(&IdentTopic::new(topic.clone())) {
                    warn!(service = "p2p_host", topic = %topic, error = %e, "Gossipsub subscribe failed");
                }
            }
            Command::Unsubscribe { topic } => {
                if self.shared.subscriptions.has_subscribers(&topic) {
                    return;
                }
                let _ = self.swarm.behaviour_mut().gossipsub.unsubscribe(&IdentTopic::new(topic));
            }
            Command::Publish { topic, data, response } => {
                let result = match self.swarm.behaviour_mut().gossipsub.publish(IdentTopic::new(topic.clone()), data) {
                    Ok(_) => Ok(()),
                    Err(gossipsub::PublishError::InsufficientPeers) => {
                        debug!(service = "p2p_host", topic = %topic, "Published with no peers on topic");
                        Ok(())
                    }
                    Err(e) => Err(HostError::Transport(format!("publish on {} failed: {}", topic, e))),
                };
                let _ = response.send(result);
            }
            Command::Provide { topic, response } => {
                match self.swarm.behaviour_mut().kademlia.start_providing(topic_key(&topic)) {
                    Ok(query) => {
                        self.pending_provides.insert(query, (topic, response));
                    }
                    Err(e) => {
                        let _ = response.send(Err(DiscoveryError::Advertise {
                            topic,
                            reason: e.to_string(),
                        }));
                    }
                }
            }
            Command::FindProviders { topic, response } => {
                let query = self.swarm.behaviour_mut().kademlia.get_providers(topic_key(&topic));
                self.pending_lookups.insert(
                    query,
                    PendingLookup {
                        topic,
                        found: HashSet::new(),
                        response,
                    },
                );
            }
        }
    }

    fn on_event(&mut self, event: SwarmEvent<HostEvent>) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                info!(service = "p2p_host", %address, "Listening");
                if let Some(addr) = multiaddr_to_socket(&address) {
                    let mut addrs = self.shared.listen_addrs();
                    if !addrs.contains(&addr) {
                        addrs.push(addr);
                    }
                    drop(addrs);
                    self.shared
                        .peer_store
                        .add_addrs(&self.shared.id, &[addr], AddrTtl::Permanent);
                }
                if let Some(ready) = self.ready.take() {
                    let _ = ready.send(Ok(()));
                }
            }
            SwarmEvent::ExpiredListenAddr { address, .. } => {
                if let Some(addr) = multiaddr_to_socket(&address) {
                    self.shared.listen_addrs().retain(|a| *a != addr);
                    self.shared.peer_store.remove_addr(&self.shared.id, &addr);
                }
            }
            SwarmEvent::ListenerError { error, .. } => {
                warn!(service = "p2p_host", error = %error, "Listener error");
            }
            SwarmEvent::ListenerClosed { reason, .. } => {
                if let Some(ready) = self.ready.take() {
                    let reason = match reason {
                        Ok(()) => "listener closed".to_string(),
                        Err(e) => e.to_string(),
                    };
                    let _ = ready.send(Err(HostError::Transport(reason)));
                }
            }
            SwarmEvent::ConnectionEstablished { peer_id, endpoint, .. } => {
                let direction = if endpoint.is_dialer() {
                    Direction::Outbound
                } else {
                    Direction::Inbound
                };
                self.shared.connections.insert(peer_id, direction);
                if endpoint.is_dialer() {
                    let remote = endpoint.get_remote_address().clone();
                    if let Some(addr) = multiaddr_to_socket(&remote) {
                        self.shared.peer_store.note_connected_addr(&peer_id, addr);
                    }
                    self.swarm.behaviour_mut().kademlia.add_address(&peer_id, remote);
                }
                debug!(service = "p2p_host", peer = %peer_id, ?direction, "Connection established");
                self.finish_dial(peer_id, Ok(()));
            }
            SwarmEvent::ConnectionClosed {
                peer_id,
                num_established,
                ..
            } => {
                if num_established == 0 {
                    self.shared.connections.remove(&peer_id);
                    for mut peers in self.shared.topic_peers.iter_mut() {
                        peers.remove(&peer_id);
                    }
                    debug!(service = "p2p_host", peer = %peer_id, "Connection closed");
                }
            }
            SwarmEvent::OutgoingConnectionError {
                peer_id: Some(peer),
                error,
                ..
            } => {
                if self.shared.connections.contains_key(&peer) {
                    return;
                }
                debug!(service = "p2p_host", peer = %peer, error = %error, "Outgoing connection failed");
                let error = dial_error(peer, &error);
                self.finish_dial(peer, Err(error));
            }
            SwarmEvent::IncomingConnectionError {
                send_back_addr, error, ..
            } => {
                debug!(service = "p2p_host", remote = %send_back_addr, error = %error, "Incoming connection failed");
            }
            SwarmEvent::Behaviour(HostEvent::Gossipsub(event)) => self.on_gossipsub(event),
            SwarmEvent::Behaviour(HostEvent::Kademlia(event)) => self.on_kademlia(event),
            SwarmEvent::Behaviour(HostEvent::Identify(event)) => {
                if let identify::Event::Received { peer_id, info, .. } = *event {
                    self.learn_addrs(peer_id, info.listen_addrs);
                }
            }
            SwarmEvent::Behaviour(HostEvent::Mdns(event)) => match event {
                mdns::Event::Discovered(list) => {
                    for (peer, addr) in list {
                        if let Some(sock) = multiaddr_to_socket(&addr) {
                            let mut entry = self.shared.mdns_peers.entry(peer).or_default();
                            if !entry.contains(&sock) {
                                entry.push(sock);
                            }
                        }
                        self.swarm.behaviour_mut().kademlia.add_address(&peer, addr);
                    }
                }
                mdns::Event::Expired(list) => {
                    for (peer, _) in list {
                        self.shared.mdns_peers.remove(&peer);
                    }
                }
            },
            _ => {}
        }
    }

    fn on_gossipsub(&mut self, event: gossipsub::Event) {
        match event {
            gossipsub::Event::Message {
                propagation_source,
                message,
                ..
            } => {
                let record = RawRecord {
                    data: message.data,
                    received_from: propagation_source,
                };
                self.shared.subscriptions.deliver(message.topic.as_str(), &record);
            }
            gossipsub::Event::Subscribed { peer_id, topic } => {
                self.shared
                    .topic_peers
                    .entry(topic.into_string())
                    .or_default()
                    .insert(peer_id);
            }
            gossipsub::Event::Unsubscribed { peer_id, topic } => {
                if let Some(mut peers) = self.shared.topic_peers.get_mut(topic.as_str()) {
                    peers.remove(&peer_id);
                }
            }
            _ => {}
        }
    }

    fn on_kademlia(&mut self, event: kad::Event) {
        match event {
            kad::Event::RoutingUpdated { peer, addresses, .. } => {
                let addrs: Vec<SocketAddr> = addresses.iter().filter_map(multiaddr_to_socket).collect();
                if !addrs.is_empty() {
                    self.shared.routable.insert(peer, addrs);
                }
            }
            kad::Event::OutboundQueryProgressed { id, result, step, .. } => {
                match result {
                    QueryResult::StartProviding(result) => {
                        if let Some((topic, response)) = self.pending_provides.remove(&id) {
                            let result = result.map(|_| ()).map_err(|e| DiscoveryError::Advertise {
                                topic,
                                reason: e.to_string(),
                            });
                            let _ = response.send(result);
                        }
                    }
                    QueryResult::GetProviders(Ok(GetProvidersOk::FoundProviders { providers, .. })) => {
                        if let Some(lookup) = self.pending_lookups.get_mut(&id) {
                            lookup.found.extend(providers);
                        }
                    }
                    QueryResult::GetProviders(Err(e)) => {
                        if let Some(lookup) = self.pending_lookups.remove(&id) {
                            if lookup.found.is_empty() {
                                let _ = lookup.response.send(Err(DiscoveryError::Lookup {
                                    topic: lookup.topic,
                                    reason: e.to_string(),
                                }));
                            } else {
                                self.finish_lookup(lookup);
                            }
                        }
                    }
                    _ => {}
                }
                if step.last {
                    if let Some(lookup) = self.pending_lookups.remove(&id) {
                        self.finish_lookup(lookup);
                    }
                }
            }
            _ => {}
        }
    }

    fn learn_addrs(&mut self, peer: PeerId, addrs: Vec<Multiaddr>) {
        let mut learned = Vec::new();
        for addr in addrs {
            if let Some(sock) = multiaddr_to_socket(&addr) {
                if !sock.ip().is_unspecified() && !learned.contains(&sock) {
                    learned.push(sock);
                }
            }
            self.swarm.behaviour_mut().kademlia.add_address(&peer, addr);
        }
        if !learned.is_empty() {
            self.shared.routable.insert(peer, learned);
        }
    }

    fn finish_lookup(&mut self, lookup: PendingLookup) {
        let peers = lookup
            .found
            .into_iter()
            .map(|peer| PeerInfo::new(peer, self.shared.known_addrs(&peer)))
            .collect();
        let _ = lookup.response.send(Ok(peers));
    }

    fn finish_dial(&mut self, peer: PeerId, result: Result<(), HostError>) {
        if let Some(waiters) = self.pending_dials.remove(&peer) {
            for waiter in waiters {
                let _ = waiter.send(result.clone());
            }
        }
    }
}

fn dial_error(peer: PeerId, error: &DialError) -> HostError {
    match error {
        DialError::Denied { cause } => match cause.downcast_ref::<HostError>() {
            Some(denied @ HostError::Denied { .. }) => denied.clone(),
            _ => HostError::Denied {
                peer,
                reason: REASON_UNSPECIFIED,
            },
        },
        DialError::NoAddresses => HostError::NoAddresses(peer),
        _ => HostError::Unreachable(peer),
    }
}

/// Provider records on the Kademlia DHT, keyed by a hash of the topic.
struct DhtLookup {
    shared: Arc<HostShared>,
}

#[async_trait]
impl PeerLookup for DhtLookup {
    async fn advertise(&self, topic: &str, _info: PeerInfo) -> Result<(), DiscoveryError> {
        let closed = || DiscoveryError::Advertise {
            topic: topic.to_string(),
            reason: "host closed".to_string(),
        };
        let (response, rx) = oneshot::channel();
        self.shared
            .send(Command::Provide {
                topic: topic.to_string(),
                response,
            })
            .map_err(|_| closed())?;
        rx.await.map_err(|_| closed())?
    }

    async fn find_peers(&self, topic: &str) -> Result<Vec<PeerInfo>, DiscoveryError> {
        let closed = || DiscoveryError::Lookup {
            topic: topic.to_string(),
            reason: "host closed".to_string(),
        };
        let (response, rx) = oneshot::channel();
        self.shared
            .send(Command::FindProviders {
                topic: topic.to_string(),
                response,
            })
            .map_err(|_| closed())?;
        rx.await.map_err(|_| closed())?
    }
}

/// Peers announced on the local network. mDNS is not topic scoped, so every
/// peer seen is a candidate for every topic.
struct MdnsLookup {
    shared: Arc<HostShared>,
}

#[async_trait]
impl PeerLookup for MdnsLookup {
    async fn advertise(&self, _topic: &str, _info: PeerInfo) -> Result<(), DiscoveryError> {
        // The mDNS behaviour announces this host on its own.
        Ok(())
    }

    async fn find_peers(&self, topic: &str) -> Result<Vec<PeerInfo>, DiscoveryError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(DiscoveryError::Lookup {
                topic: topic.to_string(),
                reason: "host closed".to_string(),
            });
        }
        Ok(self
            .shared
            .mdns_peers
            .iter()
            .map(|entry| PeerInfo::new(*entry.key(), entry.value().clone()))
            .collect())
    }
}

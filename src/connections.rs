//! Periodic reconnection to known peers.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use libp2p_identity::PeerId;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ConnectionError;
use crate::host::{Connectedness, Host, PeerInfo};
use crate::metrics;

pub const RECONNECT_INTERVAL: Duration = Duration::from_secs(60);
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome of one reconnection sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub attempted: usize,
    pub connected: usize,
    pub evicted: usize,
}

/// Dial `peer`, giving up after `timeout`.
pub async fn connect_with_timeout(host: &dyn Host, peer: &PeerInfo, timeout: Duration) -> Result<(), ConnectionError> {
    metrics::CONNECTION_ATTEMPTS.inc();
    let result = match tokio::time::timeout(timeout, host.connect(peer)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(source)) => Err(ConnectionError::Dial { peer: peer.id, source }),
        Err(_) => Err(ConnectionError::Timeout {
            peer: peer.id,
            timeout_ms: timeout.as_millis() as u64,
        }),
    };
    if result.is_err() {
        metrics::CONNECTION_FAILURES.inc();
    }
    result
}

pub struct ConnectionManager {
    host: Arc<dyn Host>,
    interval: Duration,
    timeout: Duration,
}

impl ConnectionManager {
    pub fn new(host: Arc<dyn Host>) -> Self {
        Self {
            host,
            interval: RECONNECT_INTERVAL,
            timeout: CONNECT_TIMEOUT,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Sweep every interval until cancelled. The first sweep happens one
    /// interval after the call.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(service = "connection_manager", interval_secs = self.interval.as_secs(), "Connection manager started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        report = self.connect_to_peers() => {
                            debug!(
                                service = "connection_manager",
                                attempted = report.attempted,
                                connected = report.connected,
                                evicted = report.evicted,
                                "Reconnection sweep finished"
                            );
                        }
                    }
                }
            }
        }

        debug!(service = "connection_manager", "Connection manager stopped");
    }

    /// Dial every known, unconnected peer concurrently. Ordinary peers that
    /// fail are dropped from the peer store; permanent ones stay for the
    /// next sweep.
    pub async fn connect_to_peers(&self) -> SweepReport {
        let local = self.host.id();
        let store = self.host.peer_store();

        let targets: Vec<PeerInfo> = store
            .peers()
            .into_iter()
            .filter(|peer| *peer != local && self.host.connectedness(peer) != Connectedness::Connected)
            .map(|peer| store.peer_info(&peer))
            .collect();

        let mut report = SweepReport {
            attempted: targets.len(),
            ..Default::default()
        };
        if targets.is_empty() {
            return report;
        }

        let dials = targets.iter().map(|peer| async move {
            let result = connect_with_timeout(self.host.as_ref(), peer, self.timeout).await;
            (peer.id, result)
        });

        for (peer, result) in join_all(dials).await {
            match result {
                Ok(()) => report.connected += 1,
                Err(e) => {
                    warn!(service = "connection_manager", peer = %peer, "Failed to connect to peer: {}", e);
                    if self.evict(&peer) {
                        report.evicted += 1;
                    }
                }
            }
        }

        report
    }

    fn evict(&self, peer: &PeerId) -> bool {
        let store = self.host.peer_store();
        if store.is_permanent(peer) {
            return false;
        }
        store.remove_peer(peer);
        store.clear_addrs(peer);
        metrics::PEER_EVICTIONS.inc();
        true
    }
}

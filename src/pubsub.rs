//! Topic membership and message dissemination.
//!
//! ## Structure
//! - **PubsubManager**: public API (join, publish, cancel, receive loops)
//! - **TopicRegistry**: the topic table, one lock, never held across an await
//! - **TopicSubscription**: publish handle + subscription + delivery queue for one topic
//!
//! A delivery queue is never closed by a consumer. It closes once the
//! receive loop and the registry have both let go of the topic.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use libp2p_identity::PeerId;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{JoinError, PublishError};
use crate::host::{Host, Subscription, TopicHandle};
use crate::message::Message;
use crate::metrics;

/// Capacity of each topic's delivery queue.
pub const DEFAULT_TOPIC_BUFFER_SIZE: usize = 1024;

struct TopicSubscription {
    topic: String,
    handle: Arc<dyn TopicHandle>,
    subscription: Arc<dyn Subscription>,
    queue_tx: async_channel::Sender<Message>,
    queue_rx: async_channel::Receiver<Message>,
    loop_started: AtomicBool,
    // Stops this topic's receive loop, even mid-send on a full queue.
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl TopicSubscription {
    /// Cancel the subscription, then release the publish handle. Idempotent.
    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        self.subscription.cancel();
        if let Err(e) = self.handle.close() {
            warn!(service = "pubsub_manager", topic = %self.topic, "Failed to close topic handle: {}", e);
        }
    }
}

#[derive(Default)]
struct TopicRegistry {
    topics: Mutex<HashMap<String, Arc<TopicSubscription>>>,
}

impl TopicRegistry {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<TopicSubscription>>> {
        match self.topics.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn get(&self, topic: &str) -> Option<Arc<TopicSubscription>> {
        self.lock().get(topic).cloned()
    }

    /// Register `sub` unless the topic is already taken, in which case the
    /// current entry is handed back.
    fn insert_if_absent(&self, sub: Arc<TopicSubscription>) -> Result<(), Arc<TopicSubscription>> {
        let mut topics = self.lock();
        if let Some(existing) = topics.get(&sub.topic) {
            return Err(Arc::clone(existing));
        }
        topics.insert(sub.topic.clone(), sub);
        Ok(())
    }

    fn remove(&self, topic: &str) -> Option<Arc<TopicSubscription>> {
        self.lock().remove(topic)
    }

    /// Remove the entry for `sub.topic` only if it is still `sub`.
    fn remove_if_same(&self, sub: &Arc<TopicSubscription>) -> bool {
        let mut topics = self.lock();
        match topics.get(&sub.topic) {
            Some(current) if Arc::ptr_eq(current, sub) => {
                topics.remove(&sub.topic);
                true
            }
            _ => false,
        }
    }

    fn is_current(&self, sub: &Arc<TopicSubscription>) -> bool {
        self.lock()
            .get(&sub.topic)
            .is_some_and(|current| Arc::ptr_eq(current, sub))
    }

    fn drain(&self) -> Vec<Arc<TopicSubscription>> {
        self.lock().drain().map(|(_, sub)| sub).collect()
    }

    fn snapshot(&self) -> Vec<Arc<TopicSubscription>> {
        self.lock().values().cloned().collect()
    }

    fn topics(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }
}

pub struct PubsubManager {
    host: Arc<dyn Host>,
    registry: Arc<TopicRegistry>,
    buffer_size: usize,
}

impl PubsubManager {
    pub fn new(host: Arc<dyn Host>) -> Self {
        Self {
            host,
            registry: Arc::new(TopicRegistry::default()),
            buffer_size: DEFAULT_TOPIC_BUFFER_SIZE,
        }
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size.max(1);
        self
    }

    /// Join `topic` if not already joined. On failure nothing stays registered
    /// and any handle acquired along the way is released.
    pub fn join_topic(&self, topic: &str) -> Result<(), JoinError> {
        if self.registry.get(topic).is_some() {
            return Ok(());
        }

        let handle = self.host.join_topic(topic).map_err(|source| JoinError::Join {
            topic: topic.to_string(),
            source,
        })?;

        let subscription = match handle.subscribe() {
            Ok(subscription) => subscription,
            Err(source) => {
                if let Err(e) = handle.close() {
                    warn!(service = "pubsub_manager", topic = %topic, "Failed to release topic handle: {}", e);
                }
                return Err(JoinError::Subscribe {
                    topic: topic.to_string(),
                    source,
                });
            }
        };

        let (queue_tx, queue_rx) = async_channel::bounded(self.buffer_size);
        let sub = Arc::new(TopicSubscription {
            topic: topic.to_string(),
            handle,
            subscription,
            queue_tx,
            queue_rx,
            loop_started: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
        });

        match self.registry.insert_if_absent(Arc::clone(&sub)) {
            Ok(()) => {
                metrics::JOINED_TOPICS.inc();
                info!(service = "pubsub_manager", topic = %topic, "Joined topic");
            }
            // Lost a concurrent join for the same topic.
            Err(_) => sub.close(),
        }
        Ok(())
    }

    /// Publish `message` on `topic`. An unjoined topic is joined just for this
    /// call and its handle released afterwards, whatever the outcome.
    pub async fn publish(&self, topic: &str, message: &Message) -> Result<(), PublishError> {
        let bytes = message.encode()?;

        let result = match self.registry.get(topic) {
            Some(sub) => sub.handle.publish(bytes).await,
            None => {
                let handle = self.host.join_topic(topic).map_err(|source| PublishError::Join {
                    topic: topic.to_string(),
                    source,
                })?;
                let result = handle.publish(bytes).await;
                if let Err(e) = handle.close() {
                    warn!(service = "pubsub_manager", topic = %topic, "Failed to release one-shot topic handle: {}", e);
                }
                result
            }
        };

        result.map_err(|source| PublishError::Publish {
            topic: topic.to_string(),
            source,
        })?;

        metrics::MESSAGES_PUBLISHED.inc();
        debug!(service = "pubsub_manager", topic = %topic, id = %message.id, "Published message");
        Ok(())
    }

    /// Receiving end of the topic's delivery queue, `None` when unjoined.
    pub fn delivery_queue(&self, topic: &str) -> Option<async_channel::Receiver<Message>> {
        self.registry.get(topic).map(|sub| sub.queue_rx.clone())
    }

    pub fn peers_on_topic(&self, topic: &str) -> Vec<PeerId> {
        self.registry
            .get(topic)
            .map(|sub| sub.handle.list_peers())
            .unwrap_or_default()
    }

    pub fn is_joined(&self, topic: &str) -> bool {
        self.registry.get(topic).is_some()
    }

    pub fn joined_topics(&self) -> Vec<String> {
        self.registry.topics()
    }

    pub fn cancel_subscription(&self, topic: &str) {
        if let Some(sub) = self.registry.remove(topic) {
            sub.close();
            metrics::JOINED_TOPICS.dec();
            info!(service = "pubsub_manager", topic = %topic, "Cancelled topic subscription");
        }
    }

    pub fn cancel_all_subscriptions(&self) {
        for sub in self.registry.drain() {
            sub.close();
            metrics::JOINED_TOPICS.dec();
            info!(service = "pubsub_manager", topic = %sub.topic, "Cancelled topic subscription");
        }
    }

    /// Start a receive loop for every joined topic that does not have one yet.
    pub fn start_receive_loops(&self, tasks: &mut JoinSet<()>, cancel: &CancellationToken) -> usize {
        self.registry
            .snapshot()
            .into_iter()
            .filter(|sub| self.spawn_loop(sub, tasks, cancel))
            .count()
    }

    /// Start the receive loop for one topic. Returns false if the topic is not
    /// joined or already has a loop.
    pub fn start_receive_loop(&self, topic: &str, tasks: &mut JoinSet<()>, cancel: &CancellationToken) -> bool {
        match self.registry.get(topic) {
            Some(sub) => self.spawn_loop(&sub, tasks, cancel),
            None => false,
        }
    }

    fn spawn_loop(&self, sub: &Arc<TopicSubscription>, tasks: &mut JoinSet<()>, cancel: &CancellationToken) -> bool {
        if sub.loop_started.swap(true, Ordering::SeqCst) {
            return false;
        }
        tasks.spawn(receive_loop(
            Arc::clone(&self.registry),
            Arc::clone(sub),
            self.host.id(),
            cancel.clone(),
        ));
        true
    }
}

async fn receive_loop(
    registry: Arc<TopicRegistry>,
    sub: Arc<TopicSubscription>,
    local: PeerId,
    cancel: CancellationToken,
) {
    debug!(service = "pubsub_manager", topic = %sub.topic, "Receive loop started");

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sub.cancel.cancelled() => break,
            next = sub.subscription.next() => next,
        };

        let record = match next {
            Ok(record) => record,
            Err(e) => {
                // Only happens once the topic was cancelled.
                debug!(service = "pubsub_manager", topic = %sub.topic, "Subscription closed: {}", e);
                if registry.remove_if_same(&sub) {
                    metrics::JOINED_TOPICS.dec();
                }
                sub.close();
                break;
            }
        };

        if record.received_from == local {
            metrics::SELF_SUPPRESSED.inc();
            continue;
        }

        let message = match Message::decode(&record.data) {
            Ok(message) => message,
            Err(e) => {
                metrics::DECODE_FAILURES.inc();
                debug!(service = "pubsub_manager", topic = %sub.topic, from = %record.received_from, "Dropping undecodable record: {}", e);
                continue;
            }
        };

        if !registry.is_current(&sub) {
            sub.close();
            break;
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sub.cancel.cancelled() => break,
            sent = sub.queue_tx.send(message) => {
                if sent.is_err() {
                    break;
                }
                metrics::MESSAGES_RECEIVED.inc();
            }
        }
    }

    debug!(service = "pubsub_manager", topic = %sub.topic, "Receive loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gater::AllowAllGater;
    use crate::host::PeerInfo;
    use crate::identity::generate_keypair;
    use crate::memory::{MemoryHost, MemoryNetwork};
    use std::net::SocketAddr;
    use std::time::Duration;

    fn memory_host(network: &MemoryNetwork, port: u16) -> MemoryHost {
        network
            .create_host(
                generate_keypair(),
                vec![SocketAddr::from(([127, 0, 0, 1], port))],
                Arc::new(AllowAllGater),
            )
            .unwrap()
    }

    #[tokio::test]
    async fn test_join_is_idempotent() {
        let network = MemoryNetwork::new();
        let host = memory_host(&network, 1);
        let pubsub = PubsubManager::new(Arc::new(host.clone()));

        pubsub.join_topic("blocks").unwrap();
        pubsub.join_topic("blocks").unwrap();

        assert_eq!(pubsub.joined_topics(), vec!["blocks".to_string()]);
        assert_eq!(host.open_topic_handles("blocks"), 1);
    }

    #[tokio::test]
    async fn test_failed_subscribe_leaks_nothing() {
        let network = MemoryNetwork::new();
        let host = memory_host(&network, 1);
        host.refuse_subscriptions(true);
        let pubsub = PubsubManager::new(Arc::new(host.clone()));

        let err = pubsub.join_topic("blocks").unwrap_err();
        assert!(matches!(err, JoinError::Subscribe { .. }));
        assert!(!pubsub.is_joined("blocks"));
        assert!(pubsub.delivery_queue("blocks").is_none());
        assert_eq!(host.open_topic_handles("blocks"), 0);
    }

    #[tokio::test]
    async fn test_one_shot_publish_releases_handle() {
        let network = MemoryNetwork::new();
        let host = memory_host(&network, 1);
        let pubsub = PubsubManager::new(Arc::new(host.clone()));

        pubsub.publish("elsewhere", &Message::new("1", "p", vec![1])).await.unwrap();

        assert!(!pubsub.is_joined("elsewhere"));
        assert_eq!(host.open_topic_handles("elsewhere"), 0);
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let network = MemoryNetwork::new();
        let host = memory_host(&network, 1);
        let pubsub = PubsubManager::new(Arc::new(host.clone()));

        pubsub.cancel_subscription("never-joined");
        pubsub.join_topic("a").unwrap();
        pubsub.cancel_subscription("a");
        pubsub.cancel_subscription("a");

        assert!(pubsub.joined_topics().is_empty());
        assert_eq!(host.open_topic_handles("a"), 0);
        assert!(pubsub.peers_on_topic("a").is_empty());
    }

    #[tokio::test]
    async fn test_receive_loop_delivers_remote_and_skips_bad_records() {
        let network = MemoryNetwork::new();
        let a = memory_host(&network, 1);
        let b = memory_host(&network, 2);
        a.connect(&PeerInfo::new(b.id(), b.listen_addrs())).await.unwrap();

        let pubsub = PubsubManager::new(Arc::new(a.clone()));
        pubsub.join_topic("t").unwrap();
        let cancel = CancellationToken::new();
        let mut tasks = JoinSet::new();
        assert_eq!(pubsub.start_receive_loops(&mut tasks, &cancel), 1);
        assert_eq!(pubsub.start_receive_loops(&mut tasks, &cancel), 0);

        let remote = b.join_topic("t").unwrap();
        remote.publish(b"garbage".to_vec()).await.unwrap();
        remote
            .publish(Message::new("m1", b.id().to_string(), vec![]).encode().unwrap())
            .await
            .unwrap();

        let queue = pubsub.delivery_queue("t").unwrap();
        let got = tokio::time::timeout(Duration::from_secs(1), queue.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.id, "m1");
        assert!(got.data.is_empty());
        assert_eq!(pubsub.peers_on_topic("t"), Vec::<PeerId>::new());

        cancel.cancel();
        while tasks.join_next().await.is_some() {}
    }

    #[tokio::test]
    async fn test_cancel_stops_loop_blocked_on_full_queue() {
        let network = MemoryNetwork::new();
        let a = memory_host(&network, 1);
        let b = memory_host(&network, 2);
        a.connect(&PeerInfo::new(b.id(), b.listen_addrs())).await.unwrap();

        let pubsub = PubsubManager::new(Arc::new(a.clone())).with_buffer_size(1);
        pubsub.join_topic("t").unwrap();
        let queue = pubsub.delivery_queue("t").unwrap();

        // The node-wide token is never cancelled here.
        let cancel = CancellationToken::new();
        let mut tasks = JoinSet::new();
        pubsub.start_receive_loops(&mut tasks, &cancel);

        let remote = b.join_topic("t").unwrap();
        for i in 0..3 {
            let message = Message::new(format!("m{}", i), b.id().to_string(), vec![]);
            remote.publish(message.encode().unwrap()).await.unwrap();
        }
        // Nobody consumes, so the loop parks sending the second message.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(queue.len(), 1);

        pubsub.cancel_subscription("t");

        let stopped = tokio::time::timeout(Duration::from_secs(1), async {
            while let Some(res) = tasks.join_next().await {
                res.unwrap();
            }
        })
        .await;
        assert!(stopped.is_ok());
        assert!(!cancel.is_cancelled());

        let mut leftover = 0;
        while queue.recv().await.is_ok() {
            leftover += 1;
        }
        assert!(leftover <= 1);
        assert_eq!(a.open_topic_handles("t"), 0);
    }

    #[tokio::test]
    async fn test_cancel_all_stops_blocked_loop() {
        let network = MemoryNetwork::new();
        let host = memory_host(&network, 1);
        let pubsub = PubsubManager::new(Arc::new(host.clone()));
        pubsub.join_topic("a").unwrap();
        pubsub.join_topic("b").unwrap();
        let queue = pubsub.delivery_queue("a").unwrap();

        let cancel = CancellationToken::new();
        let mut tasks = JoinSet::new();
        pubsub.start_receive_loops(&mut tasks, &cancel);
        tokio::time::sleep(Duration::from_millis(20)).await;

        pubsub.cancel_all_subscriptions();

        let drained = tokio::time::timeout(Duration::from_secs(1), async {
            while let Some(res) = tasks.join_next().await {
                res.unwrap();
            }
        })
        .await;
        assert!(drained.is_ok());
        assert!(queue.recv().await.is_err());
        assert_eq!(host.open_topic_handles("a"), 0);
        assert_eq!(host.open_topic_handles("b"), 0);
    }
}

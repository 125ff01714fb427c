//! Per-topic subscription slots shared by the host implementations.
//!
//! A host keeps one [`SubscriptionTable`]; every subscription on a topic owns
//! a bounded channel in it. Records delivered to the topic are copied into
//! each live slot, and dropped for slots whose buffer is full.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::error::HostError;
use crate::host::{RawRecord, Subscription};

/// Records buffered per subscription before new ones are dropped.
pub const SUBSCRIPTION_BUFFER: usize = 10_000;

/// Whoever owns the table a subscription lives in.
pub(crate) trait SlotOwner: Send + Sync {
    fn release_slot(&self, topic: &str, id: u64);
}

struct Slot {
    id: u64,
    tx: mpsc::Sender<RawRecord>,
    token: CancellationToken,
}

/// A freshly registered slot.
pub(crate) struct NewSlot {
    pub id: u64,
    pub rx: mpsc::Receiver<RawRecord>,
    pub token: CancellationToken,
    /// Whether this is the only slot on the topic.
    pub first: bool,
}

#[derive(Default)]
pub(crate) struct SubscriptionTable {
    slots: Mutex<HashMap<String, Vec<Slot>>>,
    next_id: AtomicU64,
}

impl SubscriptionTable {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<Slot>>> {
        match self.slots.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn add(&self, topic: &str, parent: &CancellationToken) -> NewSlot {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let token = parent.child_token();
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);

        let mut slots = self.lock();
        let entry = slots.entry(topic.to_string()).or_default();
        entry.push(Slot {
            id,
            tx,
            token: token.clone(),
        });
        NewSlot {
            id,
            rx,
            token,
            first: entry.len() == 1,
        }
    }

    pub fn deliver(&self, topic: &str, record: &RawRecord) {
        let slots = self.lock();
        let Some(slots) = slots.get(topic) else {
            return;
        };
        for slot in slots.iter().filter(|s| !s.token.is_cancelled()) {
            if let Err(mpsc::error::TrySendError::Full(_)) = slot.tx.try_send(record.clone()) {
                trace!(topic = %topic, "Subscription buffer full, dropping record");
            }
        }
    }

    pub fn has_subscribers(&self, topic: &str) -> bool {
        self.lock().get(topic).is_some_and(|slots| !slots.is_empty())
    }

    /// Remove a slot. Returns true when that left the topic without slots.
    pub fn remove(&self, topic: &str, id: u64) -> bool {
        let mut slots = self.lock();
        let Some(entry) = slots.get_mut(topic) else {
            return false;
        };
        let before = entry.len();
        entry.retain(|s| s.id != id);
        let emptied = entry.is_empty() && before > 0;
        if entry.is_empty() {
            slots.remove(topic);
        }
        emptied
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}

/// Subscription backed by one slot of a [`SubscriptionTable`].
pub(crate) struct ChannelSubscription {
    id: u64,
    topic: String,
    owner: Weak<dyn SlotOwner>,
    rx: tokio::sync::Mutex<mpsc::Receiver<RawRecord>>,
    token: CancellationToken,
    live: Arc<AtomicUsize>,
    cancelled: AtomicBool,
}

impl ChannelSubscription {
    /// Wrap `slot`, counting it in `live` until it is cancelled or dropped.
    pub fn new(topic: &str, slot: NewSlot, owner: Weak<dyn SlotOwner>, live: Arc<AtomicUsize>) -> Self {
        live.fetch_add(1, Ordering::SeqCst);
        Self {
            id: slot.id,
            topic: topic.to_string(),
            owner,
            rx: tokio::sync::Mutex::new(slot.rx),
            token: slot.token,
            live,
            cancelled: AtomicBool::new(false),
        }
    }

    fn release(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        self.token.cancel();
        self.live.fetch_sub(1, Ordering::SeqCst);
        if let Some(owner) = self.owner.upgrade() {
            owner.release_slot(&self.topic, self.id);
        }
    }
}

#[async_trait]
impl Subscription for ChannelSubscription {
    async fn next(&self) -> Result<RawRecord, HostError> {
        if self.token.is_cancelled() {
            return Err(HostError::SubscriptionCancelled);
        }
        let mut rx = self.rx.lock().await;
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(HostError::SubscriptionCancelled),
            record = rx.recv() => record.ok_or(HostError::SubscriptionCancelled),
        }
    }

    fn cancel(&self) {
        self.release();
    }
}

impl Drop for ChannelSubscription {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::generate_keypair;

    #[derive(Default)]
    struct Owner {
        table: SubscriptionTable,
    }

    impl SlotOwner for Owner {
        fn release_slot(&self, topic: &str, id: u64) {
            self.table.remove(topic, id);
        }
    }

    fn record() -> RawRecord {
        RawRecord {
            data: b"x".to_vec(),
            received_from: generate_keypair().public().to_peer_id(),
        }
    }

    #[tokio::test]
    async fn test_slots_come_and_go() {
        let owner = Arc::new(Owner::default());
        let root = CancellationToken::new();
        let live = Arc::new(AtomicUsize::new(0));

        let first = owner.table.add("t", &root);
        assert!(first.first);
        let second = owner.table.add("t", &root);
        assert!(!second.first);

        let weak: Weak<dyn SlotOwner> = Arc::downgrade(&owner) as Weak<dyn SlotOwner>;
        let a = ChannelSubscription::new("t", first, weak.clone(), Arc::clone(&live));
        let b = ChannelSubscription::new("t", second, weak, Arc::clone(&live));
        assert_eq!(live.load(Ordering::SeqCst), 2);

        owner.table.deliver("t", &record());
        assert_eq!(a.next().await.unwrap().data, b"x");
        assert_eq!(b.next().await.unwrap().data, b"x");

        a.cancel();
        drop(b);
        assert_eq!(live.load(Ordering::SeqCst), 0);
        assert!(!owner.table.has_subscribers("t"));
    }

    #[tokio::test]
    async fn test_root_cancel_ends_subscription() {
        let owner = Arc::new(Owner::default());
        let root = CancellationToken::new();
        let slot = owner.table.add("t", &root);
        let weak: Weak<dyn SlotOwner> = Arc::downgrade(&owner) as Weak<dyn SlotOwner>;
        let sub = ChannelSubscription::new("t", slot, weak, Arc::new(AtomicUsize::new(0)));

        root.cancel();
        assert_eq!(sub.next().await.unwrap_err(), HostError::SubscriptionCancelled);
    }

    #[test]
    fn test_remove_reports_emptied_topic() {
        let table = SubscriptionTable::default();
        let root = CancellationToken::new();
        let a = table.add("t", &root);
        let b = table.add("t", &root);
        assert!(!table.remove("t", a.id));
        assert!(table.remove("t", b.id));
        assert!(!table.remove("t", b.id));
    }
}

//! Bounded, deduplicating log of recently seen messages.
//!
//! At most `capacity` distinct logical ids are kept. Re-adding an id that is
//! already present stores another row but never evicts and never changes
//! what `list` or `get` return. When a new id arrives at capacity, the id of
//! the oldest row is evicted completely before the insert.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use crate::error::TrackerError;
use crate::message::Message;
use crate::metrics;
use crate::storage::{MessageStore, NewTrackedMessage, TrackedMessage};

pub const DEFAULT_CAPACITY: usize = 100;

pub struct MessageTracker {
    store: Arc<dyn MessageStore>,
    capacity: usize,
    // Serialises add/delete so the distinct count read before an insert is
    // still accurate when the insert happens.
    write_lock: Mutex<()>,
}

impl MessageTracker {
    pub fn new(store: Arc<dyn MessageStore>, capacity: usize) -> Self {
        Self {
            store,
            capacity: capacity.max(1),
            write_lock: Mutex::new(()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub async fn add(&self, message: &Message) -> Result<(), TrackerError> {
        let _guard = self.write_lock.lock().await;

        let already_tracked = self.store.find_by_logical_id(&message.id).await?.is_some();
        if !already_tracked {
            let count = self.store.count_distinct().await?;
            if count >= self.capacity {
                self.evict_oldest().await?;
            }
        }

        self.store
            .insert(NewTrackedMessage {
                id: message.id.clone(),
                peer_id: message.peer_id.clone(),
                data: message.data.clone(),
            })
            .await?;

        metrics::TRACKED_MESSAGES.set(self.store.count_distinct().await? as i64);
        Ok(())
    }

    async fn evict_oldest(&self) -> Result<(), TrackerError> {
        if let Some(oldest) = self.store.delete_oldest().await? {
            let duplicates = self.store.delete_by_logical_id(&oldest.id).await?;
            metrics::TRACKER_EVICTIONS.inc();
            debug!(id = %oldest.id, duplicates, "Evicted oldest tracked message");
        }
        Ok(())
    }

    pub async fn delete(&self, id: &str) -> Result<(), TrackerError> {
        let _guard = self.write_lock.lock().await;
        if self.store.delete_by_logical_id(id).await? == 0 {
            return Err(TrackerError::NotFound(id.to_string()));
        }
        metrics::TRACKED_MESSAGES.set(self.store.count_distinct().await? as i64);
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Message, TrackerError> {
        self.store
            .find_by_logical_id(id)
            .await?
            .map(into_message)
            .ok_or_else(|| TrackerError::NotFound(id.to_string()))
    }

    /// Oldest first, one entry per logical id (its first row).
    pub async fn list(&self) -> Result<Vec<Message>, TrackerError> {
        let rows = self.store.list_ordered().await?;
        let mut seen = std::collections::HashSet::new();
        Ok(rows
            .into_iter()
            .filter(|row| seen.insert(row.id.clone()))
            .map(into_message)
            .collect())
    }

    /// Number of distinct logical ids held.
    pub async fn len(&self) -> Result<usize, TrackerError> {
        Ok(self.store.count_distinct().await?)
    }

    pub async fn is_empty(&self) -> Result<bool, TrackerError> {
        Ok(self.len().await? == 0)
    }
}

fn into_message(row: TrackedMessage) -> Message {
    Message {
        id: row.id,
        peer_id: row.peer_id,
        data: row.data,
    }
}

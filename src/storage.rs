//! Storage Module
//!
//! Persistence behind the message tracker.
//!
//! ## Architecture
//! - **MessageStore**: the storage contract the tracker depends on
//! - **SledMessageStore**: embedded, persistent backend (sled + bincode)
//! - **MemoryMessageStore**: ordered in-memory backend with the same semantics
//!
//! Rows carry a storage assigned UUID and a monotonically increasing sequence
//! number. Creation order is sequence order. The same logical id may be
//! stored more than once.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::{Transactional, Tree};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::StoreError;
use crate::metrics::{self, Timer};

/// A message as handed to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTrackedMessage {
    pub id: String,
    pub peer_id: String,
    pub data: Vec<u8>,
}

/// A stored row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedMessage {
    pub row_id: Uuid,
    pub seq: u64,
    pub id: String,
    pub peer_id: String,
    pub data: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn insert(&self, message: NewTrackedMessage) -> Result<TrackedMessage, StoreError>;

    /// Returns whether a row was removed.
    async fn delete_row(&self, row_id: Uuid) -> Result<bool, StoreError>;

    /// Remove every row carrying `id`. Returns how many were removed.
    async fn delete_by_logical_id(&self, id: &str) -> Result<usize, StoreError>;

    /// Remove and return the row created first.
    async fn delete_oldest(&self) -> Result<Option<TrackedMessage>, StoreError>;

    /// Earliest row carrying `id`.
    async fn find_by_logical_id(&self, id: &str) -> Result<Option<TrackedMessage>, StoreError>;

    /// Every row, oldest first.
    async fn list_ordered(&self) -> Result<Vec<TrackedMessage>, StoreError>;

    async fn count_distinct(&self) -> Result<usize, StoreError>;
}

// Index keys are `len(id) as u32 BE ++ id ++ seq as u64 BE`, so all rows of a
// logical id are contiguous and sorted by creation.
fn index_prefix(id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(4 + id.len() + 8);
    key.extend_from_slice(&(id.len() as u32).to_be_bytes());
    key.extend_from_slice(id.as_bytes());
    key
}

fn index_key(id: &str, seq: u64) -> Vec<u8> {
    let mut key = index_prefix(id);
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

fn seq_from_bytes(bytes: &[u8]) -> Result<u64, StoreError> {
    let raw: [u8; 8] = bytes
        .try_into()
        .map_err(|_| StoreError::Corrupt(format!("bad sequence key of {} bytes", bytes.len())))?;
    Ok(u64::from_be_bytes(raw))
}

fn prefix_of_index_key(key: &[u8]) -> Result<&[u8], StoreError> {
    if key.len() < 12 {
        return Err(StoreError::Corrupt("index key too short".to_string()));
    }
    Ok(&key[..key.len() - 8])
}

fn transaction_error(e: TransactionError<StoreError>) -> StoreError {
    match e {
        TransactionError::Abort(e) => e,
        TransactionError::Storage(e) => StoreError::Sled(e),
    }
}

/// Sled backed message store.
#[derive(Clone)]
pub struct SledMessageStore {
    db: sled::Db,
    messages: Tree,
    index: Tree,
}

impl SledMessageStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path: PathBuf = path.as_ref().to_path_buf();
        tracing::info!("Opening message store at {:?}", path);

        let db = sled::Config::new()
            .path(&path)
            .cache_capacity(64 * 1024 * 1024)
            .flush_every_ms(Some(1000))
            .mode(sled::Mode::HighThroughput)
            .use_compression(true)
            .open()?;

        Self::from_db(db)
    }

    /// Throwaway store that is removed when dropped.
    pub fn temporary() -> Result<Self, StoreError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self, StoreError> {
        let messages = db.open_tree("messages")?;
        let index = db.open_tree("message_ids")?;
        Ok(Self { db, messages, index })
    }

    pub async fn flush(&self) -> Result<(), StoreError> {
        self.db.flush_async().await?;
        Ok(())
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(Tree, Tree) -> Result<T, StoreError> + Send + 'static,
    {
        let messages = self.messages.clone();
        let index = self.index.clone();
        tokio::task::spawn_blocking(move || f(messages, index))
            .await
            .map_err(|e| StoreError::Join(format!("Thread join error: {}", e)))?
    }

    fn decode(bytes: &[u8]) -> Result<TrackedMessage, StoreError> {
        Ok(bincode::deserialize(bytes)?)
    }

    fn remove_rows(messages: &Tree, index: &Tree, rows: &[TrackedMessage]) -> Result<(), StoreError> {
        if rows.is_empty() {
            return Ok(());
        }
        (messages, index)
            .transaction(|(tx_messages, tx_index)| {
                for row in rows {
                    tx_messages.remove(row.seq.to_be_bytes().to_vec())?;
                    tx_index.remove(index_key(&row.id, row.seq))?;
                }
                Ok::<(), ConflictableTransactionError<StoreError>>(())
            })
            .map_err(transaction_error)
    }
}

#[async_trait]
impl MessageStore for SledMessageStore {
    async fn insert(&self, message: NewTrackedMessage) -> Result<TrackedMessage, StoreError> {
        let timer = Timer::new();
        let seq = self.db.generate_id()?;
        let row = TrackedMessage {
            row_id: Uuid::new_v4(),
            seq,
            id: message.id,
            peer_id: message.peer_id,
            data: message.data,
            created_at: Utc::now(),
        };

        let stored = row.clone();
        self.blocking(move |messages, index| {
            let value = bincode::serialize(&stored)?;
            let key = index_key(&stored.id, stored.seq);
            (&messages, &index)
                .transaction(|(tx_messages, tx_index)| {
                    tx_messages.insert(stored.seq.to_be_bytes().to_vec(), value.as_slice())?;
                    tx_index.insert(key.as_slice(), Vec::<u8>::new())?;
                    Ok::<(), ConflictableTransactionError<StoreError>>(())
                })
                .map_err(transaction_error)
        })
        .await?;

        timer.observe_duration_seconds(&metrics::STORE_WRITE_LATENCY);
        Ok(row)
    }

    async fn delete_row(&self, row_id: Uuid) -> Result<bool, StoreError> {
        self.blocking(move |messages, index| {
            let mut found = None;
            for item in messages.iter() {
                let (_, value) = item?;
                let row = Self::decode(&value)?;
                if row.row_id == row_id {
                    found = Some(row);
                    break;
                }
            }
            match found {
                Some(row) => {
                    Self::remove_rows(&messages, &index, std::slice::from_ref(&row))?;
                    Ok(true)
                }
                None => Ok(false),
            }
        })
        .await
    }

    async fn delete_by_logical_id(&self, id: &str) -> Result<usize, StoreError> {
        let id = id.to_string();
        self.blocking(move |messages, index| {
            let mut rows = Vec::new();
            for item in index.scan_prefix(index_prefix(&id)) {
                let (key, _) = item?;
                let seq = seq_from_bytes(&key[key.len() - 8..])?;
                if let Some(value) = messages.get(seq.to_be_bytes())? {
                    rows.push(Self::decode(&value)?);
                }
            }
            Self::remove_rows(&messages, &index, &rows)?;
            Ok(rows.len())
        })
        .await
    }

    async fn delete_oldest(&self) -> Result<Option<TrackedMessage>, StoreError> {
        self.blocking(|messages, index| {
            let Some((_, value)) = messages.first()? else {
                return Ok(None);
            };
            let row = Self::decode(&value)?;
            Self::remove_rows(&messages, &index, std::slice::from_ref(&row))?;
            Ok(Some(row))
        })
        .await
    }

    async fn find_by_logical_id(&self, id: &str) -> Result<Option<TrackedMessage>, StoreError> {
        let id = id.to_string();
        self.blocking(move |messages, index| {
            let Some(item) = index.scan_prefix(index_prefix(&id)).next() else {
                return Ok(None);
            };
            let (key, _) = item?;
            let seq = seq_from_bytes(&key[key.len() - 8..])?;
            match messages.get(seq.to_be_bytes())? {
                Some(value) => Ok(Some(Self::decode(&value)?)),
                None => Err(StoreError::Corrupt(format!("index entry for '{}' has no row", id))),
            }
        })
        .await
    }

    async fn list_ordered(&self) -> Result<Vec<TrackedMessage>, StoreError> {
        self.blocking(|messages, _| {
            messages
                .iter()
                .map(|item| {
                    let (_, value) = item?;
                    Self::decode(&value)
                })
                .collect()
        })
        .await
    }

    async fn count_distinct(&self) -> Result<usize, StoreError> {
        self.blocking(|_, index| {
            let mut count = 0;
            let mut last: Option<Vec<u8>> = None;
            for item in index.iter() {
                let (key, _) = item?;
                let prefix = prefix_of_index_key(&key)?;
                if last.as_deref() != Some(prefix) {
                    count += 1;
                    last = Some(prefix.to_vec());
                }
            }
            Ok(count)
        })
        .await
    }
}

#[derive(Default)]
struct MemoryRows {
    next_seq: u64,
    rows: BTreeMap<u64, TrackedMessage>,
}

/// In-memory message store, mainly for tests and ephemeral nodes.
#[derive(Default)]
pub struct MemoryMessageStore {
    inner: Mutex<MemoryRows>,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn insert(&self, message: NewTrackedMessage) -> Result<TrackedMessage, StoreError> {
        let mut inner = self.inner.lock().await;
        let seq = inner.next_seq;
        inner.next_seq += 1;
        let row = TrackedMessage {
            row_id: Uuid::new_v4(),
            seq,
            id: message.id,
            peer_id: message.peer_id,
            data: message.data,
            created_at: Utc::now(),
        };
        inner.rows.insert(seq, row.clone());
        Ok(row)
    }

    async fn delete_row(&self, row_id: Uuid) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        let seq = inner.rows.values().find(|r| r.row_id == row_id).map(|r| r.seq);
        Ok(seq.and_then(|seq| inner.rows.remove(&seq)).is_some())
    }

    async fn delete_by_logical_id(&self, id: &str) -> Result<usize, StoreError> {
        let mut inner = self.inner.lock().await;
        let before = inner.rows.len();
        inner.rows.retain(|_, row| row.id != id);
        Ok(before - inner.rows.len())
    }

    async fn delete_oldest(&self) -> Result<Option<TrackedMessage>, StoreError> {
        let mut inner = self.inner.lock().await;
        Ok(inner.rows.pop_first().map(|(_, row)| row))
    }

    async fn find_by_logical_id(&self, id: &str) -> Result<Option<TrackedMessage>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.rows.values().find(|r| r.id == id).cloned())
    }

    async fn list_ordered(&self) -> Result<Vec<TrackedMessage>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.rows.values().cloned().collect())
    }

    async fn count_distinct(&self) -> Result<usize, StoreError> {
        let inner = self.inner.lock().await;
        let ids: std::collections::HashSet<&str> = inner.rows.values().map(|r| r.id.as_str()).collect();
        Ok(ids.len())
    }
}

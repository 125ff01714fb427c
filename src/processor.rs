//! Feeds received messages into the tracker.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::message::Message;
use crate::tracker::MessageTracker;

/// Drain `receive` into `tracker` until cancelled or the queue closes.
pub async fn run(mut receive: mpsc::Receiver<Message>, tracker: Arc<MessageTracker>, cancel: CancellationToken) {
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            message = receive.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };

        debug!(service = "processor", id = %message.id, from = %message.peer_id, "Tracking message");
        if let Err(e) = tracker.add(&message).await {
            error!(service = "processor", id = %message.id, "Failed to track message: {}", e);
        }
    }
    debug!(service = "processor", "Processor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryMessageStore;

    #[tokio::test]
    async fn test_drains_until_queue_closes() {
        let tracker = Arc::new(MessageTracker::new(Arc::new(MemoryMessageStore::new()), 10));
        let (tx, rx) = mpsc::channel(4);
        let task = tokio::spawn(run(rx, Arc::clone(&tracker), CancellationToken::new()));

        tx.send(Message::new("a", "p", vec![])).await.unwrap();
        tx.send(Message::new("b", "p", vec![])).await.unwrap();
        tx.send(Message::new("a", "p", vec![])).await.unwrap();
        drop(tx);
        task.await.unwrap();

        let ids: Vec<String> = tracker.list().await.unwrap().into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_stops_on_cancel() {
        let tracker = Arc::new(MessageTracker::new(Arc::new(MemoryMessageStore::new()), 10));
        let (_tx, rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(rx, tracker, cancel.clone()));
        cancel.cancel();
        task.await.unwrap();
    }
}

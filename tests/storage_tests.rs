use gossip_node::message::Message;
use gossip_node::storage::{MessageStore, SledMessageStore};
use gossip_node::tracker::MessageTracker;
use gossip_node::metrics;
use serial_test::serial;
use std::sync::Arc;
use tempfile::TempDir;

fn create_test_tracker(dir: &TempDir, capacity: usize) -> (MessageTracker, Arc<SledMessageStore>) {
    let store = Arc::new(SledMessageStore::open(dir.path().join("tracker")).unwrap());
    (MessageTracker::new(store.clone(), capacity), store)
}

fn msg(id: impl ToString) -> Message {
    Message::new(id.to_string(), "peer", Vec::new())
}

async fn listed(tracker: &MessageTracker) -> Vec<String> {
    tracker.list().await.unwrap().into_iter().map(|m| m.id).collect()
}

#[tokio::test]
#[serial]
async fn test_bounded_tracker_on_sled() {
    let dir = TempDir::new().unwrap();
    let (tracker, _) = create_test_tracker(&dir, 5);

    for i in 0..10 {
        tracker.add(&msg(i)).await.unwrap();
    }
    assert_eq!(listed(&tracker).await, vec!["5", "6", "7", "8", "9"]);

    // Re-adding what is already tracked changes nothing visible.
    for i in 5..10 {
        tracker.add(&msg(i)).await.unwrap();
    }
    assert_eq!(listed(&tracker).await, vec!["5", "6", "7", "8", "9"]);
    assert_eq!(tracker.len().await.unwrap(), 5);
}

#[tokio::test]
#[serial]
async fn test_duplicates_collapse_on_sled() {
    let dir = TempDir::new().unwrap();
    let (tracker, store) = create_test_tracker(&dir, 5);

    for id in [0, 1, 2, 3, 0, 1, 2, 3] {
        tracker.add(&msg(id)).await.unwrap();
    }
    assert_eq!(listed(&tracker).await, vec!["0", "1", "2", "3"]);
    assert_eq!(tracker.len().await.unwrap(), 4);
    // Duplicate rows are still stored.
    assert_eq!(store.list_ordered().await.unwrap().len(), 8);
}

#[tokio::test]
#[serial]
async fn test_delete_get_on_sled() {
    let dir = TempDir::new().unwrap();
    let (tracker, _) = create_test_tracker(&dir, 5);

    assert!(tracker.get("a").await.unwrap_err().is_not_found());
    assert!(tracker.delete("a").await.unwrap_err().is_not_found());

    tracker.add(&Message::new("a", "peer", b"payload".to_vec())).await.unwrap();
    assert_eq!(tracker.get("a").await.unwrap().data, b"payload");

    tokio_test::assert_ok!(tracker.delete("a").await);
    assert!(tracker.get("a").await.unwrap_err().is_not_found());
    assert!(tracker.list().await.unwrap().is_empty());
}

#[tokio::test]
#[serial]
async fn test_tracker_survives_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let (tracker, store) = create_test_tracker(&dir, 3);
        for id in ["x", "y"] {
            tracker.add(&msg(id)).await.unwrap();
        }
        tokio_test::assert_ok!(store.flush().await);
    }

    let (tracker, _) = create_test_tracker(&dir, 3);
    tracker.add(&msg("z")).await.unwrap();
    tracker.add(&msg("w")).await.unwrap();
    assert_eq!(listed(&tracker).await, vec!["y", "z", "w"]);
}

#[tokio::test]
#[serial]
async fn test_tracker_metrics_exported() {
    metrics::init_metrics();
    let dir = TempDir::new().unwrap();
    let (tracker, _) = create_test_tracker(&dir, 1);
    let before = metrics::TRACKER_EVICTIONS.get();

    tracker.add(&msg("a")).await.unwrap();
    tracker.add(&msg("b")).await.unwrap();

    assert_eq!(metrics::TRACKER_EVICTIONS.get(), before + 1);
    assert!(metrics::export_metrics().contains("gossip_tracker_evictions_total"));
}

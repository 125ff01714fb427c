use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use gossip_node::config::{Config, NodeConfig};
use gossip_node::host::PeerInfo;
use gossip_node::identity::generate_keypair;
use gossip_node::message::Message;
use gossip_node::node::Node;
use gossip_node::storage::SledMessageStore;
use gossip_node::tracker::MessageTracker;
use gossip_node::{metrics, processor};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[cfg(feature = "jemalloc")]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

const DEMO_PUBLISH_INTERVAL: Duration = Duration::from_secs(10);

/// Second peer on an ephemeral loopback port that bootstraps to the main node
/// and publishes a message on the main topic every few seconds.
async fn spawn_demo_publisher(target: &Node, cancel: CancellationToken) -> Result<tokio::task::JoinHandle<()>> {
    let mut config = NodeConfig::new(generate_keypair(), vec![SocketAddr::from(([127, 0, 0, 1], 0))]);
    config.topic = target.config().topic.clone();
    config.bootstrap_peers = vec![PeerInfo::new(target.id(), target.listen_addrs())];
    config.trusted_identities = target.config().trusted_identities.clone();

    let (publisher, queues, _host) = Node::with_libp2p(config).await?;
    let publisher = Arc::new(publisher);

    Ok(tokio::spawn(async move {
        if let Err(e) = publisher.start().await {
            tracing::error!("Demo publisher failed to start: {}", e);
            return;
        }
        tracing::info!("📣 Demo publisher {} running", publisher.id());

        let mut ticker = tokio::time::interval(DEMO_PUBLISH_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let message = Message::new(
                        uuid::Uuid::new_v4().to_string(),
                        publisher.id().to_string(),
                        hex::encode(rand::random::<[u8; 16]>()),
                    );
                    tracing::info!("Publishing demo message {}", message.id);
                    if queues.send.send(message).await.is_err() {
                        break;
                    }
                }
            }
        }

        if let Err(e) = publisher.stop().await {
            tracing::warn!("Demo publisher did not stop cleanly: {}", e);
        }
    }))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;

    tracing_subscriber::fmt()
        .with_env_filter(config.log_filter()?)
        .init();

    tracing::info!("Starting gossip node...");
    metrics::init_metrics();

    let node_config = config.to_node_config()?;

    let store = SledMessageStore::open(&config.db_path)?;
    let tracker = Arc::new(MessageTracker::new(Arc::new(store.clone()), config.tracker_capacity));
    tracing::info!("Message tracker ready (capacity {})", tracker.capacity());

    let (node, queues, _host) = Node::with_libp2p(node_config).await?;
    tracing::info!(
        "Node {} (address {}) listening on {:?}",
        node.id(),
        node.address().as_deref().unwrap_or("-"),
        node.listen_addrs()
    );

    let cancel = CancellationToken::new();
    let processor_task = tokio::spawn(processor::run(queues.receive, Arc::clone(&tracker), cancel.child_token()));

    node.start().await?;

    let demo = if config.demo_publisher {
        Some(spawn_demo_publisher(&node, cancel.child_token()).await?)
    } else {
        None
    };

    // The outbound queue stays open for the lifetime of the process.
    let _send: mpsc::Sender<Message> = queues.send;

    shutdown_signal().await;
    tracing::info!("Shutdown signal received");

    cancel.cancel();
    if let Some(demo) = demo {
        let _ = demo.await;
    }
    node.stop().await?;
    let _ = processor_task.await;
    store.flush().await?;

    tracing::debug!("{}", metrics::export_metrics());
    tracing::info!("👋 Gossip node stopped");
    Ok(())
}

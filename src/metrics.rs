use lazy_static::lazy_static;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Registry};
use std::sync::Once;
use std::time::Instant;

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // Pubsub metrics
    pub static ref MESSAGES_PUBLISHED: IntCounter = IntCounter::new(
        "gossip_messages_published_total",
        "Total number of messages published to topics"
    ).unwrap();

    pub static ref MESSAGES_RECEIVED: IntCounter = IntCounter::new(
        "gossip_messages_received_total",
        "Total number of messages pushed onto delivery queues"
    ).unwrap();

    pub static ref DECODE_FAILURES: IntCounter = IntCounter::new(
        "gossip_decode_failures_total",
        "Total number of inbound records dropped because they failed to decode"
    ).unwrap();

    pub static ref SELF_SUPPRESSED: IntCounter = IntCounter::new(
        "gossip_self_suppressed_total",
        "Total number of inbound records dropped because this node sent them"
    ).unwrap();

    pub static ref JOINED_TOPICS: IntGauge = IntGauge::new(
        "gossip_joined_topics",
        "Current number of joined topics"
    ).unwrap();

    // Connection metrics
    pub static ref CONNECTION_ATTEMPTS: IntCounter = IntCounter::new(
        "gossip_connection_attempts_total",
        "Total number of outbound dial attempts"
    ).unwrap();

    pub static ref CONNECTION_FAILURES: IntCounter = IntCounter::new(
        "gossip_connection_failures_total",
        "Total number of failed or timed out dial attempts"
    ).unwrap();

    pub static ref PEER_EVICTIONS: IntCounter = IntCounter::new(
        "gossip_peer_evictions_total",
        "Total number of peers removed from the peer store after a failed dial"
    ).unwrap();

    pub static ref GATER_DENIALS: IntCounter = IntCounter::new(
        "gossip_gater_denials_total",
        "Total number of upgraded connections rejected by the whitelist"
    ).unwrap();

    // Discovery metrics
    pub static ref DISCOVERY_ROUNDS: IntCounter = IntCounter::new(
        "gossip_discovery_rounds_total",
        "Total number of discovery lookup rounds"
    ).unwrap();

    pub static ref DISCOVERY_FAILURES: IntCounter = IntCounter::new(
        "gossip_discovery_failures_total",
        "Total number of failed discovery lookup rounds"
    ).unwrap();

    pub static ref DISCOVERED_PEERS: IntCounter = IntCounter::new(
        "gossip_discovered_peers_total",
        "Total number of peers added to the peer store by discovery"
    ).unwrap();

    // Tracker metrics
    pub static ref TRACKER_EVICTIONS: IntCounter = IntCounter::new(
        "gossip_tracker_evictions_total",
        "Total number of logical ids evicted from the message tracker"
    ).unwrap();

    pub static ref TRACKED_MESSAGES: IntGauge = IntGauge::new(
        "gossip_tracked_messages",
        "Current number of distinct messages held by the tracker"
    ).unwrap();

    pub static ref STORE_WRITE_LATENCY: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "gossip_store_write_duration_seconds",
            "Message store write latency in seconds"
        )
        .buckets(vec![0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0])
    ).unwrap();
}

static INIT: Once = Once::new();

/// Register every collector with [`REGISTRY`]. Safe to call more than once.
pub fn init_metrics() {
    INIT.call_once(|| {
        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(MESSAGES_PUBLISHED.clone()),
            Box::new(MESSAGES_RECEIVED.clone()),
            Box::new(DECODE_FAILURES.clone()),
            Box::new(SELF_SUPPRESSED.clone()),
            Box::new(JOINED_TOPICS.clone()),
            Box::new(CONNECTION_ATTEMPTS.clone()),
            Box::new(CONNECTION_FAILURES.clone()),
            Box::new(PEER_EVICTIONS.clone()),
            Box::new(GATER_DENIALS.clone()),
            Box::new(DISCOVERY_ROUNDS.clone()),
            Box::new(DISCOVERY_FAILURES.clone()),
            Box::new(DISCOVERED_PEERS.clone()),
            Box::new(TRACKER_EVICTIONS.clone()),
            Box::new(TRACKED_MESSAGES.clone()),
            Box::new(STORE_WRITE_LATENCY.clone()),
        ];

        for collector in collectors {
            if let Err(e) = REGISTRY.register(collector) {
                tracing::warn!("Failed to register metric collector: {}", e);
            }
        }

        tracing::info!("Metrics registry initialized with {} collectors", REGISTRY.gather().len());
    });
}

/// Helper struct for timing operations
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn observe_duration_seconds(&self, histogram: &Histogram) {
        histogram.observe(self.start.elapsed().as_secs_f64());
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

/// Export metrics in Prometheus format
pub fn export_metrics() -> String {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!("Failed to encode metrics: {}", e);
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_init_is_idempotent() {
        init_metrics();
        init_metrics();
        MESSAGES_PUBLISHED.inc();

        let text = export_metrics();
        assert!(text.contains("gossip_messages_published_total"));
        assert!(text.contains("gossip_joined_topics"));
    }
}

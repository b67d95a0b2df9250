use std::sync::LazyLock;
use std::sync::atomic::AtomicU64;

use prometheus::{IntCounter, Registry};

pub static METRICS: LazyLock<Metrics> = LazyLock::new(Metrics::default);

/// Fast-path counters are plain atomics; the registered counters feed the
/// node's scrape endpoint.
#[derive(Debug)]
pub struct Metrics {
    _registry: Registry,

    pub downloaded_headers: AtomicU64,
    pub downloaded_bodies: AtomicU64,
    pub downloaded_receipts: AtomicU64,
    pub state_nodes_saved: AtomicU64,
    pub state_nodes_missing: AtomicU64,

    pub blacklisted_peers: IntCounter,
    pub pivot_updates: IntCounter,
    pub chain_rewinds: IntCounter,
}

impl Default for Metrics {
    fn default() -> Self {
        let registry = Registry::new();

        let blacklisted_peers = IntCounter::new(
            "fast_sync_blacklisted_peers",
            "Total number of peers blacklisted during fast sync",
        )
        .expect("Failed to create blacklisted_peers counter");
        let pivot_updates = IntCounter::new(
            "fast_sync_pivot_updates",
            "Total number of pivot block updates",
        )
        .expect("Failed to create pivot_updates counter");
        let chain_rewinds = IntCounter::new(
            "fast_sync_chain_rewinds",
            "Total number of chain rewinds triggered by invalid data",
        )
        .expect("Failed to create chain_rewinds counter");

        registry
            .register(Box::new(blacklisted_peers.clone()))
            .expect("Failed to register blacklisted_peers counter");
        registry
            .register(Box::new(pivot_updates.clone()))
            .expect("Failed to register pivot_updates counter");
        registry
            .register(Box::new(chain_rewinds.clone()))
            .expect("Failed to register chain_rewinds counter");

        Metrics {
            _registry: registry,
            downloaded_headers: AtomicU64::new(0),
            downloaded_bodies: AtomicU64::new(0),
            downloaded_receipts: AtomicU64::new(0),
            state_nodes_saved: AtomicU64::new(0),
            state_nodes_missing: AtomicU64::new(0),
            blacklisted_peers,
            pivot_updates,
            chain_rewinds,
        }
    }
}

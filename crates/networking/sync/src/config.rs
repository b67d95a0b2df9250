use std::time::Duration;

/// Tuning knobs for the fast sync engine. The defaults are conservative
/// mainnet values; tests shrink the intervals aggressively.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Headers requested per `GetBlockHeaders`.
    pub block_headers_per_request: u64,
    /// Bodies requested per `GetBlockBodies`.
    pub block_bodies_per_request: usize,
    /// Blocks per `GetReceipts` request.
    pub receipts_per_request: usize,
    /// Trie node hashes per `GetNodeData` request.
    pub nodes_per_request: usize,

    /// Cap on outstanding requests across all peers.
    pub max_concurrent_requests: usize,
    /// Minimum spacing between two requests to the same peer.
    pub fast_sync_throttle: Duration,
    /// How long a request handler waits for the matching response.
    pub peer_response_timeout: Duration,
    /// Heartbeat driving the central dispatcher.
    pub sync_retry_interval: Duration,

    /// Ban length for ordinary protocol violations.
    pub blacklist_duration: Duration,
    /// Ban length for validation failures.
    pub critical_blacklist_duration: Duration,

    /// The pivot is elected this many blocks behind the best advertised tip.
    pub pivot_block_offset: u64,
    /// The pivot counts as stale once enough peers advertise tips this far
    /// past it (measured at the offset point).
    pub max_pivot_block_age: u64,
    /// An elected pivot no further than this ahead of the current one keeps
    /// the current pivot and starts the state download.
    pub max_target_difference: u64,
    /// Quorum required for a pivot election.
    pub min_peers_to_choose_pivot_block: usize,
    /// Backoff between pivot election rounds.
    pub pivot_block_reschedule_interval: Duration,
    /// Pivot update failures tolerated before giving up entirely.
    pub maximum_target_update_failures: u32,

    /// Blocks discarded below a header that failed validation.
    pub fast_sync_block_validation_n: u64,
    /// Stride of full header validation; headers in between get the cheap
    /// chain check only.
    pub fast_sync_block_validation_k: u64,
    /// Headers fetched past the pivot so validation momentum carries
    /// through it.
    pub fast_sync_block_validation_x: u64,

    /// Cadence of sync state snapshots.
    pub persist_state_snapshot_interval: Duration,
    /// Cadence of the progress log line.
    pub print_status_interval: Duration,

    /// Bits in the known-trie-node bloom filter.
    pub state_sync_bloom_filter_size: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            block_headers_per_request: 200,
            block_bodies_per_request: 128,
            receipts_per_request: 60,
            nodes_per_request: 384,

            max_concurrent_requests: 50,
            fast_sync_throttle: Duration::from_secs(2),
            peer_response_timeout: Duration::from_secs(30),
            sync_retry_interval: Duration::from_secs(5),

            blacklist_duration: Duration::from_secs(200),
            critical_blacklist_duration: Duration::from_secs(1800),

            pivot_block_offset: 32,
            max_pivot_block_age: 96,
            max_target_difference: 5,
            min_peers_to_choose_pivot_block: 3,
            pivot_block_reschedule_interval: Duration::from_secs(15),
            maximum_target_update_failures: 3,

            fast_sync_block_validation_n: 2048,
            fast_sync_block_validation_k: 10,
            fast_sync_block_validation_x: 50,

            persist_state_snapshot_interval: Duration::from_secs(60),
            print_status_interval: Duration::from_secs(30),

            state_sync_bloom_filter_size: 10_000_000,
        }
    }
}

impl SyncConfig {
    /// `pivot + X`, the highest header fetched during fast sync.
    pub fn safe_download_target(&self, pivot_number: u64) -> u64 {
        pivot_number + self.fast_sync_block_validation_x
    }
}

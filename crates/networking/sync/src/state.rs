//! Downloads the world state trie rooted at the pivot's state root: keeps
//! a frontier of missing node hashes, batches them into `GetNodeData`
//! requests across idle peers, verifies every returned blob against its
//! requested hash, and walks accepted nodes to discover child references.
//! State leaves additionally reference a storage trie root and a code
//! hash, which join the frontier as their own kinds of work.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use bytes::Bytes;
use ember_common::constants::{EMPTY_CODE_HASH, EMPTY_TRIE_ROOT};
use ember_storage::{Store, StoreError};
use ethereum_types::H256;
use keccak_hash::keccak;
use rlp::{DecoderError, Rlp};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::SyncConfig;
use crate::coordinator::SyncEvent;
use crate::message::{GetNodeData, Message};
use crate::metrics::METRICS;
use crate::peers::{PeerId, PeerTable};
use crate::request::{self, RequestError};

/// Pace at which progress statistics are reported to the coordinator.
const STATS_INTERVAL: Duration = Duration::from_secs(1);
/// Pace of the dispatch sweep when no responses are arriving.
const DISPATCH_INTERVAL: Duration = Duration::from_millis(100);

/// What a frontier hash refers to. Only trie nodes are walked for
/// children; code blobs are opaque.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    State,
    Storage,
    Code,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeRequest {
    pub hash: H256,
    pub kind: NodeKind,
}

impl NodeRequest {
    pub fn state(hash: H256) -> Self {
        Self { hash, kind: NodeKind::State }
    }
}

/// Fixed-size bloom filter over node hashes. Keys are keccak output, so
/// the probe indexes are sliced straight out of the hash bytes. False
/// positives fall through to a storage lookup, false negatives cannot
/// happen.
pub struct NodeBloom {
    bits: Vec<u64>,
    bit_count: u64,
}

impl NodeBloom {
    pub fn new(size_in_bits: usize) -> Self {
        let words = size_in_bits.div_ceil(64).max(1);
        Self { bits: vec![0; words], bit_count: (words * 64) as u64 }
    }

    fn indexes(&self, hash: &H256) -> [u64; 4] {
        let bytes = hash.as_bytes();
        let mut out = [0u64; 4];
        for (i, slot) in out.iter_mut().enumerate() {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&bytes[i * 8..(i + 1) * 8]);
            *slot = u64::from_be_bytes(buf) % self.bit_count;
        }
        out
    }

    pub fn insert(&mut self, hash: &H256) {
        for index in self.indexes(hash) {
            self.bits[(index / 64) as usize] |= 1 << (index % 64);
        }
    }

    pub fn maybe_contains(&self, hash: &H256) -> bool {
        self.indexes(hash)
            .iter()
            .all(|index| self.bits[(index / 64) as usize] & (1 << (index % 64)) != 0)
    }
}

impl std::fmt::Debug for NodeBloom {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeBloom").field("bit_count", &self.bit_count).finish()
    }
}

/// Child references of a trie node blob. Branch nodes reference up to
/// sixteen children, extension nodes one; state leaves reference their
/// account's storage root and code hash. Inline (shorter than 32 bytes)
/// children cannot themselves contain hash references and are skipped.
pub fn node_children(blob: &[u8], kind: NodeKind) -> Result<Vec<NodeRequest>, DecoderError> {
    let rlp = Rlp::new(blob);
    let mut children = Vec::new();
    match rlp.item_count()? {
        17 => {
            for i in 0..16 {
                let item = rlp.at(i)?;
                if item.is_data() && item.data()?.len() == 32 {
                    children.push(NodeRequest { hash: H256::from_slice(item.data()?), kind });
                }
            }
        }
        2 => {
            let path = rlp.at(0)?.data()?;
            let is_leaf = path.first().is_some_and(|byte| byte & 0x20 != 0);
            if is_leaf {
                if kind == NodeKind::State {
                    let account = rlp.at(1)?;
                    let account = Rlp::new(account.data()?);
                    let storage_root: H256 = account.val_at(2)?;
                    let code_hash: H256 = account.val_at(3)?;
                    if storage_root != EMPTY_TRIE_ROOT {
                        children.push(NodeRequest { hash: storage_root, kind: NodeKind::Storage });
                    }
                    if code_hash != EMPTY_CODE_HASH {
                        children.push(NodeRequest { hash: code_hash, kind: NodeKind::Code });
                    }
                }
            } else {
                let child = rlp.at(1)?;
                if child.is_data() && child.data()?.len() == 32 {
                    children.push(NodeRequest { hash: H256::from_slice(child.data()?), kind });
                }
            }
        }
        _ => return Err(DecoderError::Custom("unexpected trie node arity")),
    }
    Ok(children)
}

#[derive(Debug)]
pub enum StateCommand {
    StartSyncingTo { root: H256, block_number: u64 },
    Restart,
}

/// Control handle held by the coordinator.
#[derive(Debug, Clone)]
pub struct StateSchedulerHandle {
    commands: mpsc::Sender<StateCommand>,
}

impl StateSchedulerHandle {
    pub async fn start_syncing_to(&self, root: H256, block_number: u64) {
        let _ = self
            .commands
            .send(StateCommand::StartSyncingTo { root, block_number })
            .await;
    }

    pub async fn restart(&self) {
        let _ = self.commands.send(StateCommand::Restart).await;
    }
}

struct BatchOutcome {
    peer: PeerId,
    epoch: u64,
    requested: Vec<NodeRequest>,
    result: Result<Vec<Bytes>, RequestError>,
}

pub struct StateScheduler {
    config: SyncConfig,
    store: Store,
    peers: PeerTable,
    events: mpsc::Sender<SyncEvent>,
    commands: mpsc::Receiver<StateCommand>,
    outcomes: mpsc::Receiver<BatchOutcome>,
    outcome_sender: mpsc::Sender<BatchOutcome>,

    frontier: VecDeque<NodeRequest>,
    /// Hashes queued or in flight; guards against double scheduling.
    pending: HashSet<H256>,
    bloom: NodeBloom,
    in_flight: usize,
    busy_peers: HashSet<PeerId>,
    last_request: HashMap<PeerId, Instant>,
    /// Bumped on every restart; responses from older epochs are not walked.
    epoch: u64,
    active: bool,
    saved_nodes: u64,
    total_nodes: u64,
}

impl StateScheduler {
    /// Spawns the scheduler task and returns its control handle.
    pub fn spawn(
        config: SyncConfig,
        store: Store,
        peers: PeerTable,
        events: mpsc::Sender<SyncEvent>,
        cancel: CancellationToken,
    ) -> (StateSchedulerHandle, JoinHandle<()>) {
        let (command_sender, commands) = mpsc::channel(16);
        let (outcome_sender, outcomes) = mpsc::channel(256);
        let bloom = NodeBloom::new(config.state_sync_bloom_filter_size);
        let scheduler = StateScheduler {
            config,
            store,
            peers,
            events,
            commands,
            outcomes,
            outcome_sender,
            frontier: VecDeque::new(),
            pending: HashSet::new(),
            bloom,
            in_flight: 0,
            busy_peers: HashSet::new(),
            last_request: HashMap::new(),
            epoch: 0,
            active: false,
            saved_nodes: 0,
            total_nodes: 0,
        };
        let handle = StateSchedulerHandle { commands: command_sender };
        let join = tokio::spawn(scheduler.run(cancel));
        (handle, join)
    }

    async fn run(mut self, cancel: CancellationToken) {
        let mut stats = tokio::time::interval(STATS_INTERVAL);
        stats.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut dispatch = tokio::time::interval(DISPATCH_INTERVAL);
        dispatch.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("State scheduler shutting down");
                    return;
                }
                command = self.commands.recv() => {
                    match command {
                        Some(StateCommand::StartSyncingTo { root, block_number }) => {
                            self.start(root, block_number).await;
                        }
                        Some(StateCommand::Restart) => self.handle_restart(),
                        None => return,
                    }
                }
                Some(outcome) = self.outcomes.recv() => self.handle_outcome(outcome).await,
                _ = stats.tick() => self.report_stats().await,
                _ = dispatch.tick() => {}
            }
            if self.active {
                self.dispatch().await;
                self.check_finished().await;
            }
        }
    }

    async fn start(&mut self, root: H256, block_number: u64) {
        info!("Starting state download for block {block_number} with root {root:?}");
        self.epoch += 1;
        self.frontier.clear();
        self.pending.clear();
        self.active = true;
        if root == EMPTY_TRIE_ROOT {
            info!("Pivot state root is the empty trie, state download already complete");
            self.finish().await;
            return;
        }
        if let Err(err) = self.seed(NodeRequest::state(root)) {
            warn!("Failed to seed state download frontier: {err}");
        }
        self.check_finished().await;
    }

    fn handle_restart(&mut self) {
        info!("State download restart requested, discarding current frontier");
        self.epoch += 1;
        self.frontier.clear();
        self.pending.clear();
        self.active = false;
    }

    /// Walks the stored prefix below `request`, warming the bloom filter and
    /// enqueueing only the nodes that are actually missing. Resuming after a
    /// restart or rebasing onto a root that shares subtrees with the old one
    /// re-uses everything already on disk.
    fn seed(&mut self, request: NodeRequest) -> Result<(), StoreError> {
        let mut stack = vec![request];
        while let Some(request) = stack.pop() {
            if self.pending.contains(&request.hash) {
                continue;
            }
            match self.stored_blob(&request)? {
                Some(blob) => {
                    self.bloom.insert(&request.hash);
                    if request.kind != NodeKind::Code {
                        match node_children(&blob, request.kind) {
                            Ok(children) => stack.extend(children),
                            Err(err) => warn!("Undecodable stored trie node: {err}"),
                        }
                    }
                }
                None => self.enqueue(request),
            }
        }
        Ok(())
    }

    fn stored_blob(&self, request: &NodeRequest) -> Result<Option<Vec<u8>>, StoreError> {
        match request.kind {
            NodeKind::Code => Ok(self
                .store
                .code_exists(&request.hash)?
                .then(Vec::new)),
            _ => self.store.get_trie_node(&request.hash),
        }
    }

    fn enqueue(&mut self, request: NodeRequest) {
        self.bloom.insert(&request.hash);
        self.pending.insert(request.hash);
        self.frontier.push_back(request);
        self.total_nodes += 1;
    }

    /// Schedules a child reference discovered in a downloaded node.
    fn schedule(&mut self, request: NodeRequest) {
        if self.pending.contains(&request.hash) {
            return;
        }
        if self.bloom.maybe_contains(&request.hash) {
            // Probably known already; the storage-backed walk sorts out
            // bloom false positives and partially stored subtrees.
            if let Err(err) = self.seed(request) {
                warn!("Failed to schedule trie node {:?}: {err}", request.hash);
            }
        } else {
            self.enqueue(request);
        }
    }

    async fn dispatch(&mut self) {
        while self.in_flight < self.config.max_concurrent_requests && !self.frontier.is_empty() {
            let mut candidates = self.peers.peers_to_download_from().await;
            candidates.retain(|(peer_id, _, _)| {
                !self.busy_peers.contains(peer_id)
                    && self
                        .last_request
                        .get(peer_id)
                        .is_none_or(|at| at.elapsed() >= self.config.fast_sync_throttle)
            });
            candidates.sort_by(|a, b| b.1.max_block_number.cmp(&a.1.max_block_number));
            let Some((peer_id, _, channels)) = candidates.into_iter().next() else {
                trace!("No idle peer for state download");
                break;
            };

            let count = self.config.nodes_per_request.min(self.frontier.len());
            let batch: Vec<NodeRequest> = self.frontier.drain(..count).collect();
            let hashes: Vec<H256> = batch.iter().map(|request| request.hash).collect();

            self.busy_peers.insert(peer_id);
            self.last_request.insert(peer_id, Instant::now());
            self.in_flight += 1;

            let outcome_sender = self.outcome_sender.clone();
            let timeout = self.config.peer_response_timeout;
            let epoch = self.epoch;
            let request = Message::GetNodeData(GetNodeData { id: rand::random(), hashes });
            trace!("Requesting {count} trie nodes from peer {peer_id}");
            tokio::spawn(async move {
                let result = match request::exchange(&channels, request, timeout).await {
                    Ok(Message::NodeData(response)) => Ok(response.nodes),
                    Ok(_) => Err(RequestError::Timeout),
                    Err(err) => Err(err),
                };
                let _ = outcome_sender
                    .send(BatchOutcome { peer: peer_id, epoch, requested: batch, result })
                    .await;
            });
        }
    }

    async fn handle_outcome(&mut self, outcome: BatchOutcome) {
        self.in_flight -= 1;
        self.busy_peers.remove(&outcome.peer);

        if outcome.epoch != self.epoch {
            // Response to a request issued before a restart. The blobs are
            // content addressed, so whatever verifies is kept; nothing is
            // walked because the frontier it belonged to is gone.
            if let Ok(nodes) = outcome.result {
                let requested: HashMap<H256, NodeKind> = outcome
                    .requested
                    .iter()
                    .map(|request| (request.hash, request.kind))
                    .collect();
                for blob in nodes {
                    let hash = keccak(&blob);
                    if let Some(kind) = requested.get(&hash) {
                        let _ = self.persist_node(&hash, *kind, &blob);
                    }
                }
            }
            return;
        }

        let nodes = match outcome.result {
            Err(reason) => {
                debug!("Node data request to peer {} failed: {reason}", outcome.peer);
                self.requeue(outcome.requested);
                return;
            }
            Ok(nodes) if nodes.is_empty() => {
                self.peers
                    .blacklist(
                        outcome.peer,
                        self.config.blacklist_duration,
                        "empty node data response for known hashes",
                    )
                    .await;
                self.requeue(outcome.requested);
                return;
            }
            Ok(nodes) => nodes,
        };

        let mut remaining: HashMap<H256, NodeKind> = outcome
            .requested
            .iter()
            .map(|request| (request.hash, request.kind))
            .collect();
        let mut accepted: Vec<(H256, NodeKind, Bytes)> = Vec::new();
        for blob in nodes {
            let hash = keccak(&blob);
            match remaining.remove(&hash) {
                Some(kind) => accepted.push((hash, kind, blob)),
                None => {
                    self.peers
                        .blacklist(
                            outcome.peer,
                            self.config.critical_blacklist_duration,
                            "node data blob does not hash to a requested key",
                        )
                        .await;
                    self.requeue(outcome.requested);
                    return;
                }
            }
        }

        for (hash, kind, blob) in accepted {
            if let Err(err) = self.accept_node(hash, kind, &blob) {
                warn!("Failed to persist trie node {hash:?}: {err}");
                self.frontier.push_front(NodeRequest { hash, kind });
                continue;
            }
        }

        // Hashes the peer chose not to answer go back to the head of the
        // frontier so another peer picks them up next.
        let unanswered: Vec<NodeRequest> = outcome
            .requested
            .into_iter()
            .filter(|request| remaining.contains_key(&request.hash))
            .collect();
        if !unanswered.is_empty() {
            trace!("Peer {} left {} node hashes unanswered", outcome.peer, unanswered.len());
            self.requeue(unanswered);
        }
    }

    fn accept_node(&mut self, hash: H256, kind: NodeKind, blob: &[u8]) -> Result<(), StoreError> {
        self.persist_node(&hash, kind, blob)?;
        self.pending.remove(&hash);
        self.saved_nodes += 1;
        METRICS.state_nodes_saved.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        if kind != NodeKind::Code {
            match node_children(blob, kind) {
                Ok(children) => {
                    for child in children {
                        self.schedule(child);
                    }
                }
                // The blob hashed correctly, so this cannot be peer abuse;
                // leave it stored and move on.
                Err(err) => warn!("Trie node {hash:?} does not decode: {err}"),
            }
        }
        Ok(())
    }

    fn persist_node(&self, hash: &H256, kind: NodeKind, blob: &[u8]) -> Result<(), StoreError> {
        match kind {
            NodeKind::Code => self.store.put_code(hash, blob.to_vec()),
            _ => self.store.put_trie_node(hash, blob.to_vec()),
        }
    }

    fn requeue(&mut self, batch: Vec<NodeRequest>) {
        for request in batch.into_iter().rev() {
            self.frontier.push_front(request);
        }
    }

    async fn report_stats(&self) {
        if !self.active {
            return;
        }
        let missing = self.pending.len() as u64;
        METRICS
            .state_nodes_missing
            .store(missing, std::sync::atomic::Ordering::Relaxed);
        let _ = self
            .events
            .send(SyncEvent::StateSyncStats { saved: self.saved_nodes, missing })
            .await;
    }

    async fn check_finished(&mut self) {
        if self.active && self.frontier.is_empty() && self.in_flight == 0 && self.pending.is_empty()
        {
            self.finish().await;
        }
    }

    async fn finish(&mut self) {
        info!("State download finished: {} nodes saved", self.saved_nodes);
        self.active = false;
        let _ = self.events.send(SyncEvent::StateSyncFinished).await;
    }
}

//! The fast sync coordinator: a single event-driven task that owns the
//! sync control state. Peer responses, request failures, pivot election
//! results and state-download notifications all arrive as messages in its
//! inbox; periodic timers drive dispatching, status reporting and
//! persistence. Nothing else mutates the [`SyncState`].

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use ember_common::constants::EMPTY_TRIE_ROOT;
use ember_common::types::{BlockBody, BlockHash, BlockHeader, Receipt};
use ember_storage::{Store, StoreError};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SyncConfig;
use crate::message::{GetBlockBodies, GetBlockHeaders, GetReceipts, HashOrNumber, Message};
use crate::metrics::METRICS;
use crate::peers::{PeerChannels, PeerId, PeerInfo, PeerTable};
use crate::pivot;
use crate::request::{self, RequestError};
use crate::state::{StateScheduler, StateSchedulerHandle};
use crate::sync_state::SyncState;
use crate::validator::{BlockValidationResult, BlockValidator};

/// Everything the coordinator can be woken up by.
#[derive(Debug)]
pub enum SyncEvent {
    ResponseReceived {
        peer: PeerId,
        message: Message,
        elapsed: Duration,
    },
    RequestFailed {
        peer: PeerId,
        reason: RequestError,
    },
    PivotResult {
        header: Option<BlockHeader>,
    },
    StateSyncStats {
        saved: u64,
        missing: u64,
    },
    StateSyncFinished,
    PeerHandshaked {
        peer: PeerId,
        info: PeerInfo,
        channels: PeerChannels,
    },
    PeerDisconnected {
        peer: PeerId,
    },
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("{0}")]
    Send(String),
}

/// Why a pivot election is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PivotUpdateReason {
    /// The header at the safe download target was imported.
    ImportedLastBlock,
    /// A rewind crossed the pivot.
    LastBlockValidationFailed,
    /// The pivot aged out against the network tip.
    SyncRestart,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyncPhase {
    Initialising,
    Syncing,
    WaitingForPivotUpdate(PivotUpdateReason),
    Terminated,
}

/// The work a peer is currently assigned.
#[derive(Debug, Clone)]
enum RequestKind {
    Headers { start: u64 },
    Bodies { hashes: Vec<BlockHash> },
    Receipts { hashes: Vec<BlockHash> },
}

pub struct FastSync {
    config: SyncConfig,
    store: Store,
    peers: PeerTable,
    validator: BlockValidator,
    scheduler: StateSchedulerHandle,
    events_tx: mpsc::Sender<SyncEvent>,
    inbox: mpsc::Receiver<SyncEvent>,
    cancel: CancellationToken,

    phase: SyncPhase,
    state: SyncState,
    assignments: HashMap<PeerId, RequestKind>,
    last_assigned: HashMap<PeerId, Instant>,
    /// Whether `StartSyncingTo` was sent for the current pivot root. Not
    /// persisted; a restart goes through [`FastSync::start_state_download`]
    /// again.
    state_download_started: bool,
}

impl FastSync {
    /// Builds the coordinator and its inbox sender. The caller feeds peer
    /// lifecycle events through the returned sender and drives everything
    /// else by awaiting [`FastSync::run`].
    pub fn new(
        config: SyncConfig,
        store: Store,
        peers: PeerTable,
        validator: BlockValidator,
        cancel: CancellationToken,
    ) -> (Self, mpsc::Sender<SyncEvent>) {
        let (events_tx, inbox) = mpsc::channel(512);
        let (scheduler, _scheduler_task) = StateScheduler::spawn(
            config.clone(),
            store.clone(),
            peers.clone(),
            events_tx.clone(),
            cancel.clone(),
        );
        // The pivot is not known yet; this placeholder is inert while the
        // phase is `Initialising` and replaced by the first election result.
        let state = SyncState::new(BlockHeader::default(), &config);
        let coordinator = FastSync {
            config,
            store,
            peers,
            validator,
            scheduler,
            events_tx: events_tx.clone(),
            inbox,
            cancel,
            phase: SyncPhase::Initialising,
            state,
            assignments: HashMap::new(),
            last_assigned: HashMap::new(),
            state_download_started: false,
        };
        (coordinator, events_tx)
    }

    /// Runs fast sync to completion. Returns once the chain and the pivot
    /// state are fully downloaded and the done marker is persisted, or when
    /// the cancellation token fires (after persisting progress).
    pub async fn run(mut self) -> Result<(), SyncError> {
        self.startup().await?;

        let mut heartbeat = tokio::time::interval(self.config.sync_retry_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut status = tokio::time::interval(self.config.print_status_interval);
        status.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut persist = tokio::time::interval(self.config.persist_state_snapshot_interval);
        persist.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.persist()?;
                    info!("Fast sync interrupted, progress persisted");
                    return Ok(());
                }
                Some(event) = self.inbox.recv() => self.handle_event(event).await?,
                _ = heartbeat.tick() => self.process_syncing().await?,
                _ = status.tick() => self.print_status().await,
                _ = persist.tick() => self.persist()?,
            }
            if self.phase == SyncPhase::Terminated {
                return Ok(());
            }
        }
    }

    /// Resumes from a persisted snapshot when one exists, otherwise kicks
    /// off the initial pivot election.
    async fn startup(&mut self) -> Result<(), SyncError> {
        match self.store.load_sync_state()? {
            Some(blob) => match SyncState::from_bytes(&blob) {
                Ok(mut state) => {
                    // Any election or in-flight request died with the
                    // previous process.
                    state.updating_pivot_block = false;
                    info!(
                        "Resuming fast sync: best header {}, full block {}, pivot {}",
                        state.best_block_header_number,
                        state.last_full_block_number,
                        state.pivot_block.number
                    );
                    self.state = state;
                    self.phase = SyncPhase::Syncing;
                }
                Err(err) => {
                    warn!("Persisted sync state is unreadable ({err}), starting from scratch");
                    self.spawn_election(Duration::ZERO);
                }
            },
            None => {
                info!("Selecting the initial pivot block");
                self.spawn_election(Duration::ZERO);
            }
        }
        Ok(())
    }

    async fn handle_event(&mut self, event: SyncEvent) -> Result<(), SyncError> {
        match event {
            SyncEvent::ResponseReceived { peer, message, elapsed } => {
                let Some(kind) = self.assignments.remove(&peer) else {
                    debug!("Unsolicited response from peer {peer}");
                    return Ok(());
                };
                debug!(
                    "Peer {peer} answered a {:#04x} request in {}ms",
                    message.code(),
                    elapsed.as_millis()
                );
                match (kind, message) {
                    (RequestKind::Headers { start, .. }, Message::BlockHeaders(response)) => {
                        self.handle_block_headers(peer, start, response.headers).await?;
                    }
                    (RequestKind::Bodies { hashes }, Message::BlockBodies(response)) => {
                        self.handle_block_bodies(peer, hashes, response.bodies).await?;
                    }
                    (RequestKind::Receipts { hashes }, Message::Receipts(response)) => {
                        self.handle_receipts(peer, hashes, response.receipts).await?;
                    }
                    (kind, _) => {
                        self.peers
                            .blacklist(
                                peer,
                                self.config.blacklist_duration,
                                "response type does not match the request",
                            )
                            .await;
                        self.requeue_assignment(kind);
                    }
                }
                self.process_syncing().await?;
            }
            SyncEvent::RequestFailed { peer, reason } => {
                if let Some(kind) = self.assignments.remove(&peer) {
                    debug!("Request to peer {peer} failed: {reason}");
                    self.requeue_assignment(kind);
                }
                self.process_syncing().await?;
            }
            SyncEvent::PivotResult { header } => {
                self.handle_pivot_result(header).await?;
            }
            SyncEvent::StateSyncStats { saved, missing } => {
                self.state.downloaded_nodes_count = saved;
                self.state.total_nodes_count = saved + missing;
            }
            SyncEvent::StateSyncFinished => {
                info!("State download complete");
                self.state.state_sync_finished = true;
                self.process_syncing().await?;
            }
            SyncEvent::PeerHandshaked { peer, info, channels } => {
                self.peers.insert_peer(peer, info, channels).await;
            }
            SyncEvent::PeerDisconnected { peer } => {
                self.peers.remove_peer(&peer).await;
                self.last_assigned.remove(&peer);
                if let Some(kind) = self.assignments.remove(&peer) {
                    self.requeue_assignment(kind);
                }
            }
        }
        Ok(())
    }

    /// The central dispatcher, run on every heartbeat and after every
    /// response or failure.
    async fn process_syncing(&mut self) -> Result<(), SyncError> {
        match self.phase {
            SyncPhase::Initialising | SyncPhase::Terminated => return Ok(()),
            SyncPhase::WaitingForPivotUpdate(reason) => {
                debug!("Blockchain work paused while the pivot updates ({reason:?})");
                return Ok(());
            }
            SyncPhase::Syncing => {}
        }
        if self.fully_synced() {
            self.finish().await
        } else if self.state.blockchain_work_remaining() {
            self.process_downloads().await;
            Ok(())
        } else if !self.state.state_sync_finished {
            if !self.state_download_started {
                // Reached after a restart that interrupted the sync between
                // finishing the blockchain download and starting the state
                // download.
                info!("Blockchain download complete, starting the state download");
                self.start_state_download().await;
            } else if self.pivot_block_is_stale().await {
                info!("Pivot block went stale against the network tip, rebasing");
                self.scheduler.restart().await;
                self.state_download_started = false;
                self.update_pivot_block(PivotUpdateReason::SyncRestart).await;
            } else {
                debug!("Waiting for the state download to finish");
            }
            Ok(())
        } else {
            debug!("Waiting for responses");
            Ok(())
        }
    }

    fn fully_synced(&self) -> bool {
        self.state.state_sync_finished
            && self.state.best_block_header_number == self.state.safe_download_target
            && self.state.last_full_block_number == self.state.safe_download_target
            && self.state.block_bodies_queue.is_empty()
            && self.state.receipts_queue.is_empty()
            && self.assignments.is_empty()
    }

    /// Hands out work to every idle, unthrottled peer, best advertised tip
    /// first, until the concurrency cap is reached.
    async fn process_downloads(&mut self) {
        let mut candidates = self.peers.peers_to_download_from().await;
        candidates.retain(|(peer_id, _, _)| {
            !self.assignments.contains_key(peer_id)
                && self
                    .last_assigned
                    .get(peer_id)
                    .is_none_or(|at| at.elapsed() >= self.config.fast_sync_throttle)
        });
        if candidates.is_empty() {
            debug!("No available peers to download from");
            return;
        }
        candidates.sort_by(|a, b| b.1.max_block_number.cmp(&a.1.max_block_number));
        for (peer_id, info, channels) in candidates {
            if self.assignments.len() >= self.config.max_concurrent_requests {
                break;
            }
            self.assign_blockchain_work(peer_id, info, channels);
        }
    }

    /// Receipts before bodies before headers; a single header request at a
    /// time keeps header acceptance strictly ordered.
    fn assign_blockchain_work(&mut self, peer: PeerId, info: PeerInfo, channels: PeerChannels) {
        let assignment = if !self.state.receipts_queue.is_empty() {
            let count = self.config.receipts_per_request.min(self.state.receipts_queue.len());
            let hashes: Vec<BlockHash> = self.state.receipts_queue.drain(..count).collect();
            Some((
                RequestKind::Receipts { hashes: hashes.clone() },
                Message::GetReceipts(GetReceipts { id: rand::random(), hashes }),
            ))
        } else if !self.state.block_bodies_queue.is_empty() {
            let count = self
                .config
                .block_bodies_per_request
                .min(self.state.block_bodies_queue.len());
            let hashes: Vec<BlockHash> = self.state.block_bodies_queue.drain(..count).collect();
            Some((
                RequestKind::Bodies { hashes: hashes.clone() },
                Message::GetBlockBodies(GetBlockBodies { id: rand::random(), hashes }),
            ))
        } else if !self.header_request_in_flight()
            && self.state.best_block_header_number < self.state.safe_download_target
            && info.max_block_number >= self.state.pivot_block.number
        {
            let start = self.state.best_block_header_number + 1;
            let limit = self
                .config
                .block_headers_per_request
                .min(self.state.safe_download_target - self.state.best_block_header_number);
            Some((
                RequestKind::Headers { start },
                Message::GetBlockHeaders(GetBlockHeaders {
                    id: rand::random(),
                    start: HashOrNumber::Number(start),
                    limit,
                    skip: 0,
                    reverse: false,
                }),
            ))
        } else {
            None
        };

        if let Some((kind, message)) = assignment {
            debug!("Assigning {kind:?} to peer {peer}");
            self.assignments.insert(peer, kind);
            self.last_assigned.insert(peer, Instant::now());
            request::spawn_request(
                peer,
                channels,
                message,
                self.config.peer_response_timeout,
                self.events_tx.clone(),
            );
        }
    }

    fn header_request_in_flight(&self) -> bool {
        self.assignments
            .values()
            .any(|kind| matches!(kind, RequestKind::Headers { .. }))
    }

    async fn handle_block_headers(
        &mut self,
        peer: PeerId,
        start: u64,
        headers: Vec<BlockHeader>,
    ) -> Result<(), SyncError> {
        if headers.is_empty() {
            self.peers
                .blacklist(peer, self.config.blacklist_duration, "empty block headers response")
                .await;
            return Ok(());
        }
        if headers[0].number != start || !BlockValidator::check_headers_chain(&headers) {
            self.peers
                .blacklist(peer, self.config.blacklist_duration, "error in block headers response")
                .await;
            return Ok(());
        }

        for header in headers {
            // Re-delivered headers are a no-op, holes end the batch.
            if header.number <= self.state.best_block_header_number {
                continue;
            }
            if header.number > self.state.best_block_header_number + 1 {
                break;
            }

            if header.number >= self.state.next_block_to_fully_validate {
                let Some(parent) = self.store.get_block_header(&header.parent_hash)? else {
                    self.handle_rewind(
                        &header,
                        peer,
                        self.config.blacklist_duration,
                        "block header with unknown parent",
                    )
                    .await?;
                    return Ok(());
                };
                if let Err(err) = self.validator.validate_header(&header, &parent) {
                    warn!("Block {} failed validation: {err}", header.number);
                    self.handle_rewind(
                        &header,
                        peer,
                        self.config.critical_blacklist_duration,
                        "block header validation failed",
                    )
                    .await?;
                    return Ok(());
                }
                self.state.next_block_to_fully_validate =
                    header.number + self.config.fast_sync_block_validation_k;
            }

            let Some(parent_weight) = self.store.get_parent_chain_weight(&header)? else {
                self.handle_rewind(
                    &header,
                    peer,
                    self.config.blacklist_duration,
                    "block header from a different fork",
                )
                .await?;
                return Ok(());
            };

            self.store.update_sync_state(&header, &parent_weight)?;
            let hash = header.hash();
            self.state.block_bodies_queue.push_back(hash);
            self.state.receipts_queue.push_back(hash);
            self.state.best_block_header_number = header.number;
            METRICS
                .downloaded_headers
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

            if header.number == self.state.safe_download_target {
                info!("Reached the safe download target at block {}", header.number);
                self.update_pivot_block(PivotUpdateReason::ImportedLastBlock).await;
                break;
            }
        }
        Ok(())
    }

    async fn handle_block_bodies(
        &mut self,
        peer: PeerId,
        hashes: Vec<BlockHash>,
        bodies: Vec<BlockBody>,
    ) -> Result<(), SyncError> {
        if bodies.is_empty() || bodies.len() > hashes.len() {
            self.peers
                .blacklist(
                    peer,
                    self.config.blacklist_duration,
                    "empty block bodies response for known hashes",
                )
                .await;
            self.requeue_bodies(hashes)?;
            return Ok(());
        }

        let answered_count = bodies.len();
        // Blocks rewound while the request was in flight are dropped.
        let mut answered_hashes = Vec::with_capacity(answered_count);
        let mut answered_bodies = Vec::with_capacity(answered_count);
        for (hash, body) in hashes.iter().zip(bodies.into_iter()) {
            if self.store.get_block_header(hash)?.is_some() {
                answered_hashes.push(*hash);
                answered_bodies.push(body);
            }
        }
        let leftover: Vec<BlockHash> = hashes[answered_count..].to_vec();

        match self.validator.validate_blocks(&answered_hashes, &answered_bodies) {
            BlockValidationResult::Valid => {
                let blocks: Vec<(BlockHash, BlockBody)> = answered_hashes
                    .iter()
                    .copied()
                    .zip(answered_bodies)
                    .collect();
                self.store.store_blocks(&blocks)?;
                METRICS
                    .downloaded_bodies
                    .fetch_add(blocks.len() as u64, std::sync::atomic::Ordering::Relaxed);
                self.requeue_bodies(leftover)?;
                self.advance_full_blocks(&answered_hashes)?;
            }
            BlockValidationResult::Invalid => {
                self.peers
                    .blacklist(peer, self.config.blacklist_duration, "invalid block bodies response")
                    .await;
                self.requeue_bodies(hashes)?;
            }
            BlockValidationResult::DbError => self.redownload_blockchain(),
        }
        Ok(())
    }

    async fn handle_receipts(
        &mut self,
        peer: PeerId,
        hashes: Vec<BlockHash>,
        receipts: Vec<Vec<Receipt>>,
    ) -> Result<(), SyncError> {
        if receipts.is_empty() || receipts.len() > hashes.len() {
            self.peers
                .blacklist(
                    peer,
                    self.config.blacklist_duration,
                    "empty receipts response for known hashes",
                )
                .await;
            self.requeue_receipts(hashes)?;
            return Ok(());
        }

        let answered_count = receipts.len();
        let mut answered_hashes = Vec::with_capacity(answered_count);
        let mut answered_receipts = Vec::with_capacity(answered_count);
        for (hash, list) in hashes.iter().zip(receipts.into_iter()) {
            if self.store.get_block_header(hash)?.is_some() {
                answered_hashes.push(*hash);
                answered_receipts.push(list);
            }
        }
        let leftover: Vec<BlockHash> = hashes[answered_count..].to_vec();

        match self.validator.validate_receipts(&answered_hashes, &answered_receipts) {
            BlockValidationResult::Valid => {
                let pairs: Vec<(BlockHash, Vec<Receipt>)> = answered_hashes
                    .iter()
                    .copied()
                    .zip(answered_receipts)
                    .collect();
                self.store.store_receipts(&pairs)?;
                METRICS
                    .downloaded_receipts
                    .fetch_add(pairs.len() as u64, std::sync::atomic::Ordering::Relaxed);
                self.requeue_receipts(leftover)?;
                self.advance_full_blocks(&answered_hashes)?;
            }
            BlockValidationResult::Invalid => {
                self.peers
                    .blacklist(peer, self.config.blacklist_duration, "invalid receipts response")
                    .await;
                self.requeue_receipts(hashes)?;
            }
            BlockValidationResult::DbError => self.redownload_blockchain(),
        }
        Ok(())
    }

    fn advance_full_blocks(&mut self, stored: &[BlockHash]) -> Result<(), SyncError> {
        if let Some(new_full) = self
            .store
            .update_best_block_if_needed(stored, self.state.last_full_block_number)?
        {
            self.state.last_full_block_number = new_full;
        }
        Ok(())
    }

    /// Invalid or wrong-fork data at `header`: punish the peer, drop the
    /// last N blocks below it and fall back to re-downloading them. A
    /// rewind crossing the pivot forces a pivot update.
    async fn handle_rewind(
        &mut self,
        header: &BlockHeader,
        peer: PeerId,
        ban: Duration,
        reason: &str,
    ) -> Result<(), SyncError> {
        METRICS.chain_rewinds.inc();
        self.peers.blacklist(peer, ban, reason).await;
        if header.number > self.state.safe_download_target {
            return Ok(());
        }

        let n = self.config.fast_sync_block_validation_n;
        warn!(
            "Rewinding {n} blocks below {} after: {reason}",
            header.number
        );
        self.store.discard_last_blocks(header.number, n)?;
        let new_best = self
            .state
            .best_block_header_number
            .min(header.number.saturating_sub(n + 1));
        self.state.best_block_header_number = new_best;
        self.state.next_block_to_fully_validate = new_best + 1;
        self.state.last_full_block_number = self.state.last_full_block_number.min(new_best);
        self.prune_queues(new_best)?;

        if new_best < self.state.pivot_block.number {
            self.update_pivot_block(PivotUpdateReason::LastBlockValidationFailed).await;
        }
        self.persist()
    }

    /// Drops queue entries above the rewound best block. Headers that are
    /// re-accepted later re-enqueue their hashes.
    fn prune_queues(&mut self, new_best: u64) -> Result<(), SyncError> {
        let bodies = std::mem::take(&mut self.state.block_bodies_queue);
        self.state.block_bodies_queue = self.retain_up_to(bodies, new_best)?;
        let receipts = std::mem::take(&mut self.state.receipts_queue);
        self.state.receipts_queue = self.retain_up_to(receipts, new_best)?;
        Ok(())
    }

    fn retain_up_to(
        &self,
        queue: VecDeque<BlockHash>,
        new_best: u64,
    ) -> Result<VecDeque<BlockHash>, SyncError> {
        let mut kept = VecDeque::with_capacity(queue.len());
        for hash in queue {
            match self.store.get_block_header(&hash)? {
                Some(header) if header.number <= new_best => kept.push_back(hash),
                _ => {}
            }
        }
        Ok(kept)
    }

    /// Storage refused to cooperate while judging downloaded data; the
    /// cheapest safe recovery is to clear the queues and re-fetch the last
    /// couple of header batches.
    fn redownload_blockchain(&mut self) {
        warn!("Storage error while handling downloads, re-fetching recent blocks");
        self.state.block_bodies_queue.clear();
        self.state.receipts_queue.clear();
        let new_best = self
            .state
            .best_block_header_number
            .saturating_sub(2 * self.config.block_headers_per_request);
        self.state.best_block_header_number = new_best;
        self.state.last_full_block_number = self.state.last_full_block_number.min(new_best);
        self.state.next_block_to_fully_validate =
            self.state.next_block_to_fully_validate.min(new_best + 1);
    }

    fn requeue_assignment(&mut self, kind: RequestKind) {
        let result = match kind {
            RequestKind::Headers { .. } => Ok(()),
            RequestKind::Bodies { hashes } => self.requeue_bodies(hashes),
            RequestKind::Receipts { hashes } => self.requeue_receipts(hashes),
        };
        if let Err(err) = result {
            warn!("Failed to requeue lost work: {err}");
        }
    }

    fn requeue_bodies(&mut self, hashes: Vec<BlockHash>) -> Result<(), SyncError> {
        let existing = self.existing_only(hashes)?;
        for hash in existing.into_iter().rev() {
            self.state.block_bodies_queue.push_front(hash);
        }
        Ok(())
    }

    fn requeue_receipts(&mut self, hashes: Vec<BlockHash>) -> Result<(), SyncError> {
        let existing = self.existing_only(hashes)?;
        for hash in existing.into_iter().rev() {
            self.state.receipts_queue.push_front(hash);
        }
        Ok(())
    }

    fn existing_only(&self, hashes: Vec<BlockHash>) -> Result<Vec<BlockHash>, SyncError> {
        let mut kept = Vec::with_capacity(hashes.len());
        for hash in hashes {
            if self.store.get_block_header(&hash)?.is_some() {
                kept.push(hash);
            }
        }
        Ok(kept)
    }

    /// At least a quorum of peers advertise tips far enough past the pivot
    /// that a fresher one could be elected.
    async fn pivot_block_is_stale(&self) -> bool {
        let pivot_number = self.state.pivot_block.number;
        let aged = self
            .peers
            .handshaked_peers()
            .await
            .into_iter()
            .filter(|(_, info)| {
                info.max_block_number
                    .saturating_sub(self.config.pivot_block_offset)
                    .saturating_sub(pivot_number)
                    >= self.config.max_pivot_block_age
            })
            .count();
        aged >= self.config.min_peers_to_choose_pivot_block
    }

    async fn update_pivot_block(&mut self, reason: PivotUpdateReason) {
        if self.state.updating_pivot_block {
            return;
        }
        info!("Updating the pivot block ({reason:?})");
        self.state.updating_pivot_block = true;
        self.phase = SyncPhase::WaitingForPivotUpdate(reason);
        self.spawn_election(Duration::ZERO);
    }

    async fn handle_pivot_result(&mut self, header: Option<BlockHeader>) -> Result<(), SyncError> {
        match self.phase {
            SyncPhase::Initialising => match header {
                Some(pivot) => {
                    info!(
                        "Starting fast sync with pivot block {} (state root {:?})",
                        pivot.number, pivot.state_root
                    );
                    self.state = SyncState::new(pivot, &self.config);
                    self.phase = SyncPhase::Syncing;
                    self.persist()?;
                    self.process_syncing().await
                }
                None => {
                    warn!("Initial pivot selection found no quorum, retrying");
                    self.spawn_election(self.config.pivot_block_reschedule_interval);
                    Ok(())
                }
            },
            SyncPhase::WaitingForPivotUpdate(reason) => {
                let good_enough = header.as_ref().is_some_and(|new| {
                    new.number >= self.state.pivot_block.number
                        && !(new.number == self.state.pivot_block.number
                            && reason == PivotUpdateReason::SyncRestart)
                });
                match header {
                    Some(new) if good_enough => self.apply_new_pivot(new, reason).await,
                    _ => {
                        self.state.pivot_block_update_failures += 1;
                        if self.state.pivot_block_update_failures
                            > self.config.maximum_target_update_failures
                        {
                            self.fatal_pivot_failure();
                        }
                        warn!(
                            "Pivot update attempt {} found no acceptable block, retrying",
                            self.state.pivot_block_update_failures
                        );
                        self.spawn_election(self.config.pivot_block_reschedule_interval);
                        Ok(())
                    }
                }
            }
            _ => {
                debug!("Ignoring a pivot election result outside a pivot update");
                Ok(())
            }
        }
    }

    async fn apply_new_pivot(
        &mut self,
        new: BlockHeader,
        reason: PivotUpdateReason,
    ) -> Result<(), SyncError> {
        METRICS.pivot_updates.inc();
        match reason {
            PivotUpdateReason::ImportedLastBlock => {
                if new.number - self.state.pivot_block.number <= self.config.max_target_difference {
                    info!(
                        "Pivot block {} is close enough to the tip, starting the state download",
                        self.state.pivot_block.number
                    );
                    self.start_state_download().await;
                } else {
                    info!(
                        "Tip moved {} blocks past the pivot, adopting block {} instead",
                        new.number - self.state.pivot_block.number,
                        new.number
                    );
                    self.state.adopt_pivot(new, &self.config);
                }
            }
            PivotUpdateReason::LastBlockValidationFailed => {
                self.state.pivot_block_update_failures += 1;
                if self.state.pivot_block_update_failures
                    > self.config.maximum_target_update_failures
                {
                    self.fatal_pivot_failure();
                }
                info!("Adopting pivot block {} after a validation rewind", new.number);
                self.state.adopt_pivot(new, &self.config);
            }
            PivotUpdateReason::SyncRestart => {
                info!("Adopting pivot block {} after a sync restart", new.number);
                self.state.adopt_pivot(new, &self.config);
            }
        }
        self.state.updating_pivot_block = false;
        self.phase = SyncPhase::Syncing;
        self.persist()?;
        self.process_syncing().await
    }

    async fn start_state_download(&mut self) {
        let root = self.state.pivot_block.state_root;
        self.state_download_started = true;
        if root == EMPTY_TRIE_ROOT {
            info!("Pivot state root is empty, nothing to download");
            self.state.state_sync_finished = true;
        } else {
            self.state.state_sync_finished = false;
            self.scheduler
                .start_syncing_to(root, self.state.pivot_block.number)
                .await;
        }
    }

    fn fatal_pivot_failure(&self) -> ! {
        error!(
            "Could not settle on a usable pivot block after {} attempts, giving up",
            self.state.pivot_block_update_failures
        );
        std::process::exit(1);
    }

    /// The chain beyond the pivot was only fetched to keep validation
    /// rolling through it; drop that tail, mark fast sync done and stop.
    async fn finish(&mut self) -> Result<(), SyncError> {
        let tail = self.config.fast_sync_block_validation_x.saturating_sub(1);
        if tail > 0 {
            self.store
                .discard_last_blocks(self.state.safe_download_target, tail)?;
        }
        self.store.persist_fast_sync_done()?;
        info!(
            "Block synchronization in fast mode finished, the chain is at block {}",
            self.state.pivot_block.number + 1
        );
        self.phase = SyncPhase::Terminated;
        Ok(())
    }

    fn persist(&self) -> Result<(), SyncError> {
        if matches!(self.phase, SyncPhase::Initialising | SyncPhase::Terminated) {
            return Ok(());
        }
        let mut in_flight_bodies = Vec::new();
        let mut in_flight_receipts = Vec::new();
        for kind in self.assignments.values() {
            match kind {
                RequestKind::Bodies { hashes } => in_flight_bodies.extend(hashes.iter().copied()),
                RequestKind::Receipts { hashes } => {
                    in_flight_receipts.extend(hashes.iter().copied())
                }
                RequestKind::Headers { .. } => {}
            }
        }
        let snapshot = self
            .state
            .snapshot_with_in_flight(in_flight_bodies, in_flight_receipts);
        self.store.persist_sync_state(snapshot.to_bytes())?;
        debug!("Persisted sync state snapshot");
        Ok(())
    }

    async fn print_status(&self) {
        if matches!(self.phase, SyncPhase::Initialising | SyncPhase::Terminated) {
            return;
        }
        info!(
            "Syncing: headers {}/{}, full blocks {}, state nodes {}/{}, peers {} ({} blacklisted), {} requests in flight",
            self.state.best_block_header_number,
            self.state.safe_download_target,
            self.state.last_full_block_number,
            self.state.downloaded_nodes_count,
            self.state.total_nodes_count,
            self.peers.peer_count().await,
            self.peers.blacklisted_count().await,
            self.assignments.len(),
        );
    }

    fn spawn_election(&self, delay: Duration) {
        let _ = pivot::spawn_election(
            self.peers.clone(),
            self.config.clone(),
            self.events_tx.clone(),
            delay,
        );
    }
}

//! The persisted control-plane record of a fast sync in progress. Written
//! as a single versioned RLP blob; its presence on startup means the sync
//! must resume from it.

use std::collections::VecDeque;

use ember_common::types::{BlockHash, BlockHeader};
use rlp::{DecoderError, Rlp, RlpStream};

use crate::config::SyncConfig;

/// Format version of the serialized blob.
const SYNC_STATE_FORMAT: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncState {
    /// The header whose world state is being materialised.
    pub pivot_block: BlockHeader,
    /// `pivot + X`: headers are fetched up to here.
    pub safe_download_target: u64,
    /// Highest contiguous header accepted so far.
    pub best_block_header_number: u64,
    /// Highest block with both body and receipts stored.
    pub last_full_block_number: u64,
    /// Hashes of accepted headers still awaiting their bodies.
    pub block_bodies_queue: VecDeque<BlockHash>,
    /// Hashes of accepted headers still awaiting their receipts.
    pub receipts_queue: VecDeque<BlockHash>,
    /// Headers from this number on get the full validation treatment.
    pub next_block_to_fully_validate: u64,
    pub downloaded_nodes_count: u64,
    pub total_nodes_count: u64,
    pub state_sync_finished: bool,
    /// Set while a pivot election is outstanding. Not meaningful across a
    /// restart: the election died with the process.
    pub updating_pivot_block: bool,
    pub pivot_block_update_failures: u32,
}

impl SyncState {
    pub fn new(pivot_block: BlockHeader, config: &SyncConfig) -> Self {
        let safe_download_target = config.safe_download_target(pivot_block.number);
        SyncState {
            pivot_block,
            safe_download_target,
            best_block_header_number: 0,
            last_full_block_number: 0,
            block_bodies_queue: VecDeque::new(),
            receipts_queue: VecDeque::new(),
            next_block_to_fully_validate: 1,
            downloaded_nodes_count: 0,
            total_nodes_count: 0,
            state_sync_finished: false,
            updating_pivot_block: false,
            pivot_block_update_failures: 0,
        }
    }

    /// Adopts a newly elected pivot and raises the download target with it.
    pub fn adopt_pivot(&mut self, pivot_block: BlockHeader, config: &SyncConfig) {
        self.safe_download_target = config.safe_download_target(pivot_block.number);
        self.pivot_block = pivot_block;
    }

    /// True while headers, bodies or receipts remain to be fetched.
    pub fn blockchain_work_remaining(&self) -> bool {
        self.best_block_header_number < self.safe_download_target
            || !self.block_bodies_queue.is_empty()
            || !self.receipts_queue.is_empty()
    }

    /// A snapshot safe to persist: work that is currently in flight is
    /// re-enqueued so a crash re-requests it instead of losing it.
    pub fn snapshot_with_in_flight(
        &self,
        in_flight_bodies: Vec<BlockHash>,
        in_flight_receipts: Vec<BlockHash>,
    ) -> SyncState {
        let mut snapshot = self.clone();
        for hash in in_flight_bodies.into_iter().rev() {
            snapshot.block_bodies_queue.push_front(hash);
        }
        for hash in in_flight_receipts.into_iter().rev() {
            snapshot.receipts_queue.push_front(hash);
        }
        snapshot.updating_pivot_block = false;
        snapshot
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut s = RlpStream::new_list(13);
        s.append(&SYNC_STATE_FORMAT);
        s.append(&self.pivot_block);
        s.append(&self.safe_download_target);
        s.append(&self.best_block_header_number);
        s.append(&self.last_full_block_number);
        s.append_list(&self.block_bodies_queue.iter().copied().collect::<Vec<_>>());
        s.append_list(&self.receipts_queue.iter().copied().collect::<Vec<_>>());
        s.append(&self.next_block_to_fully_validate);
        s.append(&self.downloaded_nodes_count);
        s.append(&self.total_nodes_count);
        s.append(&self.state_sync_finished);
        s.append(&self.updating_pivot_block);
        s.append(&self.pivot_block_update_failures);
        s.out().to_vec()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecoderError> {
        let rlp = Rlp::new(bytes);
        let version: u8 = rlp.val_at(0)?;
        if version != SYNC_STATE_FORMAT {
            return Err(DecoderError::Custom("unknown sync state format version"));
        }
        Ok(SyncState {
            pivot_block: rlp.val_at(1)?,
            safe_download_target: rlp.val_at(2)?,
            best_block_header_number: rlp.val_at(3)?,
            last_full_block_number: rlp.val_at(4)?,
            block_bodies_queue: rlp.list_at::<BlockHash>(5)?.into(),
            receipts_queue: rlp.list_at::<BlockHash>(6)?.into(),
            next_block_to_fully_validate: rlp.val_at(7)?,
            downloaded_nodes_count: rlp.val_at(8)?,
            total_nodes_count: rlp.val_at(9)?,
            state_sync_finished: rlp.val_at(10)?,
            updating_pivot_block: rlp.val_at(11)?,
            pivot_block_update_failures: rlp.val_at(12)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethereum_types::H256;

    fn sample_state() -> SyncState {
        let config = SyncConfig::default();
        let pivot = BlockHeader { number: 950, ..Default::default() };
        let mut state = SyncState::new(pivot, &config);
        state.best_block_header_number = 500;
        state.last_full_block_number = 300;
        state.block_bodies_queue = (301..=500).map(H256::from_low_u64_be).collect();
        state.receipts_queue = (301..=500).map(H256::from_low_u64_be).collect();
        state.next_block_to_fully_validate = 510;
        state.downloaded_nodes_count = 1234;
        state.total_nodes_count = 9999;
        state
    }

    #[test]
    fn round_trip_is_byte_equal() {
        let state = sample_state();
        let bytes = state.to_bytes();
        let reloaded = SyncState::from_bytes(&bytes).unwrap();
        assert_eq!(reloaded, state);
        assert_eq!(reloaded.to_bytes(), bytes);
    }

    #[test]
    fn unknown_version_is_rejected() {
        let mut s = rlp::RlpStream::new_list(1);
        s.append(&(SYNC_STATE_FORMAT + 1));
        assert!(SyncState::from_bytes(&s.out()).is_err());
    }

    #[test]
    fn snapshot_re_enqueues_in_flight_work_in_order() {
        let state = sample_state();
        let bodies = vec![H256::from_low_u64_be(299), H256::from_low_u64_be(300)];
        let receipts = vec![H256::from_low_u64_be(300)];
        let snapshot = state.snapshot_with_in_flight(bodies.clone(), receipts.clone());

        assert_eq!(snapshot.block_bodies_queue[0], bodies[0]);
        assert_eq!(snapshot.block_bodies_queue[1], bodies[1]);
        assert_eq!(snapshot.block_bodies_queue[2], state.block_bodies_queue[0]);
        assert_eq!(snapshot.receipts_queue[0], receipts[0]);
        assert!(!snapshot.updating_pivot_block);
    }

    #[test]
    fn safe_download_target_tracks_pivot() {
        let config = SyncConfig::default();
        let mut state = sample_state();
        let new_pivot = BlockHeader { number: 1950, ..Default::default() };
        state.adopt_pivot(new_pivot.clone(), &config);
        assert_eq!(state.pivot_block, new_pivot);
        assert_eq!(
            state.safe_download_target,
            1950 + config.fast_sync_block_validation_x
        );
    }
}

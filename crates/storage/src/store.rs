use std::sync::Arc;

use ember_common::types::{BlockBody, BlockHash, BlockHeader, BlockNumber, ChainWeight, Receipt};
use ethereum_types::H256;
use tracing::debug;

use crate::error::StoreError;
use crate::kv::{InMemoryEngine, KeyValueEngine, Namespace, Removal, Upsert};

const SYNC_STATE_KEY: &[u8] = b"fast-sync-state";
const SYNC_DONE_KEY: &[u8] = b"fast-sync-done";
const BEST_BLOCK_KEY: &[u8] = b"best-block-number";

/// Façade over the key-value engine. Cheap to clone, safe to share across
/// tasks; atomicity is provided per batch by the engine.
#[derive(Clone)]
pub struct Store {
    engine: Arc<dyn KeyValueEngine>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}

impl Store {
    pub fn new(engine: Arc<dyn KeyValueEngine>) -> Self {
        Self { engine }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryEngine::new()))
    }

    /// Seeds the chain with its genesis block: header, number index and the
    /// initial chain weight derived from the genesis difficulty.
    pub fn put_genesis(&self, header: &BlockHeader) -> Result<(), StoreError> {
        let hash = header.hash();
        let weight = ChainWeight::zero().increase(header);
        self.engine.write_batch(
            vec![],
            vec![
                (Namespace::Header, hash.as_bytes().to_vec(), rlp::encode(header).to_vec()),
                (
                    Namespace::HeaderNumber,
                    header.number.to_be_bytes().to_vec(),
                    hash.as_bytes().to_vec(),
                ),
                (Namespace::ChainWeight, hash.as_bytes().to_vec(), rlp::encode(&weight).to_vec()),
            ],
        )
    }

    pub fn get_block_header(&self, hash: &BlockHash) -> Result<Option<BlockHeader>, StoreError> {
        match self.engine.get(Namespace::Header, hash.as_bytes())? {
            Some(bytes) => Ok(Some(rlp::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn get_header_by_number(
        &self,
        number: BlockNumber,
    ) -> Result<Option<BlockHeader>, StoreError> {
        match self.engine.get(Namespace::HeaderNumber, &number.to_be_bytes())? {
            Some(hash) => self.get_block_header(&H256::from_slice(&hash)),
            None => Ok(None),
        }
    }

    pub fn get_block_body(&self, hash: &BlockHash) -> Result<Option<BlockBody>, StoreError> {
        match self.engine.get(Namespace::Body, hash.as_bytes())? {
            Some(bytes) => Ok(Some(rlp::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn get_receipts(&self, hash: &BlockHash) -> Result<Option<Vec<Receipt>>, StoreError> {
        match self.engine.get(Namespace::Receipts, hash.as_bytes())? {
            Some(bytes) => Ok(Some(rlp::Rlp::new(&bytes).as_list()?)),
            None => Ok(None),
        }
    }

    pub fn get_chain_weight(&self, hash: &BlockHash) -> Result<Option<ChainWeight>, StoreError> {
        match self.engine.get(Namespace::ChainWeight, hash.as_bytes())? {
            Some(bytes) => Ok(Some(rlp::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// The chain weight of the header's parent, or `None` when the parent is
    /// unknown, which during sync means the header extends a different fork.
    pub fn get_parent_chain_weight(
        &self,
        header: &BlockHeader,
    ) -> Result<Option<ChainWeight>, StoreError> {
        self.get_chain_weight(&header.parent_hash)
    }

    /// Persists an accepted header together with its number index entry and
    /// the chain weight derived from the parent's, in one atomic batch.
    pub fn update_sync_state(
        &self,
        header: &BlockHeader,
        parent_weight: &ChainWeight,
    ) -> Result<(), StoreError> {
        let hash = header.hash();
        let weight = parent_weight.increase(header);
        self.engine.write_batch(
            vec![],
            vec![
                (Namespace::Header, hash.as_bytes().to_vec(), rlp::encode(header).to_vec()),
                (
                    Namespace::HeaderNumber,
                    header.number.to_be_bytes().to_vec(),
                    hash.as_bytes().to_vec(),
                ),
                (Namespace::ChainWeight, hash.as_bytes().to_vec(), rlp::encode(&weight).to_vec()),
            ],
        )
    }

    pub fn store_blocks(&self, blocks: &[(BlockHash, BlockBody)]) -> Result<(), StoreError> {
        let upserts: Vec<Upsert> = blocks
            .iter()
            .map(|(hash, body)| {
                (Namespace::Body, hash.as_bytes().to_vec(), rlp::encode(body).to_vec())
            })
            .collect();
        self.engine.write_batch(vec![], upserts)
    }

    pub fn store_receipts(&self, receipts: &[(BlockHash, Vec<Receipt>)]) -> Result<(), StoreError> {
        let upserts: Vec<Upsert> = receipts
            .iter()
            .map(|(hash, receipts)| {
                (
                    Namespace::Receipts,
                    hash.as_bytes().to_vec(),
                    rlp::encode_list(receipts).to_vec(),
                )
            })
            .collect();
        self.engine.write_batch(vec![], upserts)
    }

    /// Advances the fully-downloaded cursor from `last_full` over the longest
    /// contiguous prefix of blocks whose body and receipts are both stored.
    /// Returns the new cursor when it moved.
    pub fn update_best_block_if_needed(
        &self,
        stored: &[BlockHash],
        last_full: BlockNumber,
    ) -> Result<Option<BlockNumber>, StoreError> {
        let mut best = last_full;
        loop {
            let Some(header) = self.get_header_by_number(best + 1)? else {
                break;
            };
            let hash = header.hash();
            let complete = self.engine.get(Namespace::Body, hash.as_bytes())?.is_some()
                && self.engine.get(Namespace::Receipts, hash.as_bytes())?.is_some();
            if !complete {
                break;
            }
            best += 1;
        }
        if best == last_full {
            return Ok(None);
        }
        debug!(
            "Advanced best block to {best} after storing {} block parts",
            stored.len()
        );
        self.engine.write_batch(
            vec![],
            vec![(Namespace::SyncMeta, BEST_BLOCK_KEY.to_vec(), best.to_be_bytes().to_vec())],
        )?;
        Ok(Some(best))
    }

    pub fn best_block_number(&self) -> Result<Option<BlockNumber>, StoreError> {
        match self.engine.get(Namespace::SyncMeta, BEST_BLOCK_KEY)? {
            Some(bytes) if bytes.len() == 8 => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&bytes);
                Ok(Some(u64::from_be_bytes(buf)))
            }
            Some(_) => Err(StoreError::Engine("malformed best block entry".into())),
            None => Ok(None),
        }
    }

    /// Atomically drops header, number index, body, receipts and chain
    /// weight for block numbers `from - n + 1 ..= from`. The genesis block
    /// is never discarded.
    pub fn discard_last_blocks(&self, from: BlockNumber, n: u64) -> Result<(), StoreError> {
        let start = from.saturating_sub(n.saturating_sub(1)).max(1);
        let mut removals: Vec<Removal> = Vec::new();
        for number in start..=from {
            let Some(header) = self.get_header_by_number(number)? else {
                continue;
            };
            let hash = header.hash();
            removals.push((Namespace::Header, hash.as_bytes().to_vec()));
            removals.push((Namespace::HeaderNumber, number.to_be_bytes().to_vec()));
            removals.push((Namespace::Body, hash.as_bytes().to_vec()));
            removals.push((Namespace::Receipts, hash.as_bytes().to_vec()));
            removals.push((Namespace::ChainWeight, hash.as_bytes().to_vec()));
        }
        let mut upserts: Vec<Upsert> = Vec::new();
        if let Some(best) = self.best_block_number()? {
            if best >= start {
                let lowered = start.saturating_sub(1);
                upserts.push((
                    Namespace::SyncMeta,
                    BEST_BLOCK_KEY.to_vec(),
                    lowered.to_be_bytes().to_vec(),
                ));
            }
        }
        debug!("Discarding blocks {start}..={from}");
        self.engine.write_batch(removals, upserts)
    }

    /// Stores the serialized sync control record. Its presence on startup
    /// means a sync is in progress and must be resumed.
    pub fn persist_sync_state(&self, blob: Vec<u8>) -> Result<(), StoreError> {
        self.engine
            .write_batch(vec![], vec![(Namespace::SyncMeta, SYNC_STATE_KEY.to_vec(), blob)])
    }

    pub fn load_sync_state(&self) -> Result<Option<Vec<u8>>, StoreError> {
        self.engine.get(Namespace::SyncMeta, SYNC_STATE_KEY)
    }

    /// Marks fast sync as complete and removes the in-progress record in the
    /// same batch, so a crash can never observe both or neither.
    pub fn persist_fast_sync_done(&self) -> Result<(), StoreError> {
        self.engine.write_batch(
            vec![(Namespace::SyncMeta, SYNC_STATE_KEY.to_vec())],
            vec![(Namespace::SyncMeta, SYNC_DONE_KEY.to_vec(), vec![1])],
        )
    }

    pub fn fast_sync_done(&self) -> Result<bool, StoreError> {
        Ok(self.engine.get(Namespace::SyncMeta, SYNC_DONE_KEY)?.is_some())
    }

    pub fn put_trie_node(&self, hash: &H256, node: Vec<u8>) -> Result<(), StoreError> {
        self.engine
            .write_batch(vec![], vec![(Namespace::TrieNode, hash.as_bytes().to_vec(), node)])
    }

    pub fn trie_node_exists(&self, hash: &H256) -> Result<bool, StoreError> {
        Ok(self.engine.get(Namespace::TrieNode, hash.as_bytes())?.is_some())
    }

    pub fn get_trie_node(&self, hash: &H256) -> Result<Option<Vec<u8>>, StoreError> {
        self.engine.get(Namespace::TrieNode, hash.as_bytes())
    }

    pub fn put_code(&self, hash: &H256, code: Vec<u8>) -> Result<(), StoreError> {
        self.engine
            .write_batch(vec![], vec![(Namespace::Code, hash.as_bytes().to_vec(), code)])
    }

    pub fn code_exists(&self, hash: &H256) -> Result<bool, StoreError> {
        Ok(self.engine.get(Namespace::Code, hash.as_bytes())?.is_some())
    }
}

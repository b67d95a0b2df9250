//! Stateless block validation: header chain linkage, structural header
//! rules behind a pluggable seal engine, and body/receipt cross-checks
//! against the roots committed to by their stored headers.

use std::sync::Arc;

use ember_common::roots::{ommers_hash, receipts_root, transactions_root};
use ember_common::types::{BlockBody, BlockHash, BlockHeader, Receipt};
use ember_storage::Store;
use ethereum_types::U256;
use thiserror::Error;
use tracing::warn;

const MAX_EXTRA_DATA_SIZE: usize = 32;
const MIN_GAS_LIMIT: u64 = 5000;
const GAS_LIMIT_BOUND_DIVISOR: u64 = 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HeaderValidationError {
    #[error("header number {got} does not follow parent {parent}")]
    NonConsecutiveNumber { parent: u64, got: u64 },
    #[error("timestamp {got} not after parent timestamp {parent}")]
    TimestampNotAfterParent { parent: u64, got: u64 },
    #[error("extra data exceeds {MAX_EXTRA_DATA_SIZE} bytes")]
    ExtraDataTooLong,
    #[error("gas used {used} exceeds gas limit {limit}")]
    GasUsedOverLimit { used: u64, limit: u64 },
    #[error("gas limit {got} outside bounds derived from parent {parent}")]
    GasLimitOutOfBounds { parent: u64, got: u64 },
    #[error("seal verification failed: {0}")]
    InvalidSeal(String),
}

/// Outcome of checking a batch of bodies or receipt lists. `DbError` means
/// the check itself could not be carried out and the data must not be
/// judged either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockValidationResult {
    Valid,
    Invalid,
    DbError,
}

/// Seam for the consensus seal. Fast sync only needs a yes/no per header;
/// the proof-of-work engine itself is a collaborator supplied by the node.
pub trait SealEngine: Send + Sync {
    fn verify_seal(&self, header: &BlockHeader) -> Result<(), HeaderValidationError>;
}

/// Difficulty floor check. Enough to reject obviously unsealed headers
/// while leaving the expensive proof verification to the configured engine.
#[derive(Debug, Clone)]
pub struct DifficultySeal {
    pub minimum_difficulty: U256,
}

impl Default for DifficultySeal {
    fn default() -> Self {
        Self { minimum_difficulty: U256::from(131_072u64) }
    }
}

impl SealEngine for DifficultySeal {
    fn verify_seal(&self, header: &BlockHeader) -> Result<(), HeaderValidationError> {
        if header.difficulty < self.minimum_difficulty {
            return Err(HeaderValidationError::InvalidSeal(format!(
                "difficulty {} below minimum {}",
                header.difficulty, self.minimum_difficulty
            )));
        }
        Ok(())
    }
}

/// Accepts any header. For networks without a seal and for tests with
/// synthetic chains.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSeal;

impl SealEngine for NoSeal {
    fn verify_seal(&self, _header: &BlockHeader) -> Result<(), HeaderValidationError> {
        Ok(())
    }
}

#[derive(Clone)]
pub struct BlockValidator {
    store: Store,
    seal: Arc<dyn SealEngine>,
}

impl BlockValidator {
    pub fn new(store: Store, seal: Arc<dyn SealEngine>) -> Self {
        Self { store, seal }
    }

    /// Checks that `headers` form a contiguous chain: each parent hash is
    /// the hash of its predecessor and numbers increase by exactly one.
    pub fn check_headers_chain(headers: &[BlockHeader]) -> bool {
        headers.windows(2).all(|pair| {
            pair[1].parent_hash == pair[0].hash() && pair[1].number == pair[0].number + 1
        })
    }

    /// Full header validation against its parent: structural rules plus the
    /// seal. Called only for headers selected by the validation stride.
    pub fn validate_header(
        &self,
        header: &BlockHeader,
        parent: &BlockHeader,
    ) -> Result<(), HeaderValidationError> {
        if header.number != parent.number + 1 {
            return Err(HeaderValidationError::NonConsecutiveNumber {
                parent: parent.number,
                got: header.number,
            });
        }
        if header.timestamp <= parent.timestamp {
            return Err(HeaderValidationError::TimestampNotAfterParent {
                parent: parent.timestamp,
                got: header.timestamp,
            });
        }
        if header.extra_data.len() > MAX_EXTRA_DATA_SIZE {
            return Err(HeaderValidationError::ExtraDataTooLong);
        }
        if header.gas_used > header.gas_limit {
            return Err(HeaderValidationError::GasUsedOverLimit {
                used: header.gas_used,
                limit: header.gas_limit,
            });
        }
        let max_delta = parent.gas_limit / GAS_LIMIT_BOUND_DIVISOR;
        let in_bounds = header.gas_limit >= MIN_GAS_LIMIT
            && header.gas_limit < parent.gas_limit + max_delta
            && header.gas_limit + max_delta > parent.gas_limit;
        if !in_bounds {
            return Err(HeaderValidationError::GasLimitOutOfBounds {
                parent: parent.gas_limit,
                got: header.gas_limit,
            });
        }
        self.seal.verify_seal(header)
    }

    /// Checks each body against the transactions root and ommers hash of
    /// its stored header.
    pub fn validate_blocks(&self, hashes: &[BlockHash], bodies: &[BlockBody]) -> BlockValidationResult {
        for (hash, body) in hashes.iter().zip(bodies) {
            let header = match self.store.get_block_header(hash) {
                Ok(Some(header)) => header,
                Ok(None) => {
                    warn!("No header stored for block {hash} while validating its body");
                    return BlockValidationResult::DbError;
                }
                Err(err) => {
                    warn!("Storage failure while validating bodies: {err}");
                    return BlockValidationResult::DbError;
                }
            };
            if transactions_root(&body.transactions) != header.transactions_root {
                return BlockValidationResult::Invalid;
            }
            if ommers_hash(&body.ommers) != header.ommers_hash {
                return BlockValidationResult::Invalid;
            }
        }
        BlockValidationResult::Valid
    }

    /// Checks each receipt list against the receipts root of its stored
    /// header.
    pub fn validate_receipts(
        &self,
        hashes: &[BlockHash],
        receipt_lists: &[Vec<Receipt>],
    ) -> BlockValidationResult {
        for (hash, receipts) in hashes.iter().zip(receipt_lists) {
            let header = match self.store.get_block_header(hash) {
                Ok(Some(header)) => header,
                Ok(None) => {
                    warn!("No header stored for block {hash} while validating its receipts");
                    return BlockValidationResult::DbError;
                }
                Err(err) => {
                    warn!("Storage failure while validating receipts: {err}");
                    return BlockValidationResult::DbError;
                }
            };
            if receipts_root(receipts) != header.receipts_root {
                return BlockValidationResult::Invalid;
            }
        }
        BlockValidationResult::Valid
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_common::constants::{EMPTY_OMMERS_HASH, EMPTY_TRIE_ROOT};
    use ember_common::types::{ChainWeight, Transaction};

    fn parent_and_child() -> (BlockHeader, BlockHeader) {
        let parent = BlockHeader {
            number: 10,
            timestamp: 1000,
            gas_limit: 8_000_000,
            ..Default::default()
        };
        let child = BlockHeader {
            parent_hash: parent.hash(),
            number: 11,
            timestamp: 1013,
            gas_limit: 8_000_000,
            ..Default::default()
        };
        (parent, child)
    }

    fn validator() -> BlockValidator {
        BlockValidator::new(Store::in_memory(), Arc::new(NoSeal))
    }

    #[test]
    fn chain_check_accepts_linked_headers_and_rejects_breaks() {
        let (parent, child) = parent_and_child();
        assert!(BlockValidator::check_headers_chain(&[parent.clone(), child.clone()]));

        let mut broken = child.clone();
        broken.parent_hash = BlockHash::from_low_u64_be(0xbad);
        assert!(!BlockValidator::check_headers_chain(&[parent.clone(), broken]));

        let mut skipped = child;
        skipped.number = 13;
        assert!(!BlockValidator::check_headers_chain(&[parent, skipped]));
    }

    #[test]
    fn structural_rules_are_enforced() {
        let validator = validator();
        let (parent, child) = parent_and_child();
        assert_eq!(validator.validate_header(&child, &parent), Ok(()));

        let mut bad = child.clone();
        bad.timestamp = parent.timestamp;
        assert!(matches!(
            validator.validate_header(&bad, &parent),
            Err(HeaderValidationError::TimestampNotAfterParent { .. })
        ));

        let mut bad = child.clone();
        bad.gas_used = bad.gas_limit + 1;
        assert!(matches!(
            validator.validate_header(&bad, &parent),
            Err(HeaderValidationError::GasUsedOverLimit { .. })
        ));

        let mut bad = child.clone();
        bad.gas_limit = parent.gas_limit * 2;
        assert!(matches!(
            validator.validate_header(&bad, &parent),
            Err(HeaderValidationError::GasLimitOutOfBounds { .. })
        ));

        let mut bad = child;
        bad.extra_data = vec![0; MAX_EXTRA_DATA_SIZE + 1];
        assert_eq!(
            validator.validate_header(&bad, &parent),
            Err(HeaderValidationError::ExtraDataTooLong)
        );
    }

    #[test]
    fn difficulty_seal_rejects_weak_headers() {
        let seal = DifficultySeal { minimum_difficulty: U256::from(1000u64) };
        let mut header = BlockHeader { difficulty: U256::from(999u64), ..Default::default() };
        assert!(seal.verify_seal(&header).is_err());
        header.difficulty = U256::from(1000u64);
        assert!(seal.verify_seal(&header).is_ok());
    }

    #[test]
    fn body_validation_checks_transactions_root() {
        let store = Store::in_memory();
        let body = BlockBody {
            transactions: vec![Transaction { nonce: 1, ..Default::default() }],
            ommers: vec![],
        };
        let header = BlockHeader {
            number: 1,
            transactions_root: transactions_root(&body.transactions),
            ommers_hash: EMPTY_OMMERS_HASH,
            receipts_root: EMPTY_TRIE_ROOT,
            ..Default::default()
        };
        store
            .update_sync_state(&header, &ChainWeight::zero())
            .unwrap();
        let validator = BlockValidator::new(store, Arc::new(NoSeal));

        let hash = header.hash();
        assert_eq!(
            validator.validate_blocks(&[hash], std::slice::from_ref(&body)),
            BlockValidationResult::Valid
        );

        let empty = BlockBody::default();
        assert_eq!(
            validator.validate_blocks(&[hash], std::slice::from_ref(&empty)),
            BlockValidationResult::Invalid
        );

        let unknown = BlockHash::from_low_u64_be(5);
        assert_eq!(
            validator.validate_blocks(&[unknown], &[body]),
            BlockValidationResult::DbError
        );
    }

    #[test]
    fn receipt_validation_checks_receipts_root() {
        let store = Store::in_memory();
        let receipts = vec![Receipt { cumulative_gas_used: 21_000, ..Default::default() }];
        let header = BlockHeader {
            number: 1,
            receipts_root: receipts_root(&receipts),
            ..Default::default()
        };
        store
            .update_sync_state(&header, &ChainWeight::zero())
            .unwrap();
        let validator = BlockValidator::new(store, Arc::new(NoSeal));

        let hash = header.hash();
        assert_eq!(
            validator.validate_receipts(&[hash], std::slice::from_ref(&receipts)),
            BlockValidationResult::Valid
        );
        assert_eq!(
            validator.validate_receipts(&[hash], &[vec![]]),
            BlockValidationResult::Invalid
        );
    }
}

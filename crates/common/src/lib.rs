//! Core chain types shared across the node: headers, bodies, receipts and
//! the fork-choice weight, together with their RLP codecs and the trie-root
//! helpers used to cross-check downloaded data against header commitments.

pub mod constants;
pub mod roots;
pub mod types;

pub use ethereum_types::{Bloom, H64, H160, H256, U256};
pub use types::{BlockBody, BlockHash, BlockHeader, BlockNumber, ChainWeight, Log, Receipt, ReceiptOutcome, Transaction};

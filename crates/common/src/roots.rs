//! Trie-root helpers used to check downloaded bodies and receipts against
//! the roots committed to by their block header.

use ethereum_types::H256;
use hash_db::Hasher;
use keccak_hash::keccak;
use plain_hasher::PlainHasher;

use crate::types::{BlockHeader, Receipt, Transaction};

/// Keccak-256 hasher for trie-root computation. Keys are already uniform
/// hash output, so the in-memory map side uses a plain hasher.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeccakHasher;

impl Hasher for KeccakHasher {
    type Out = H256;
    type StdHasher = PlainHasher;
    const LENGTH: usize = 32;

    fn hash(x: &[u8]) -> Self::Out {
        keccak(x)
    }
}

/// Root of a trie keyed by RLP-encoded item index, as used for the
/// transactions and receipts commitments.
pub fn ordered_trie_root<I>(items: I) -> H256
where
    I: IntoIterator,
    I::Item: AsRef<[u8]>,
{
    triehash::ordered_trie_root::<KeccakHasher, I>(items)
}

pub fn transactions_root(transactions: &[Transaction]) -> H256 {
    ordered_trie_root(transactions.iter().map(rlp::encode))
}

pub fn receipts_root(receipts: &[Receipt]) -> H256 {
    ordered_trie_root(receipts.iter().map(rlp::encode))
}

/// Keccak of the RLP list of uncle headers.
pub fn ommers_hash(ommers: &[BlockHeader]) -> H256 {
    keccak(rlp::encode_list(ommers))
}

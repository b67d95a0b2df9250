//! Well-known hashes of empty structures.

/// Keccak of the RLP of the empty byte string, the root of an empty
/// Merkle-Patricia trie.
pub use keccak_hash::KECCAK_NULL_RLP as EMPTY_TRIE_ROOT;

/// Keccak of the RLP of an empty list, the ommers hash of a block without
/// uncles.
pub use keccak_hash::KECCAK_EMPTY_LIST_RLP as EMPTY_OMMERS_HASH;

/// Keccak of the empty byte string, the code hash of an account without code.
pub use keccak_hash::KECCAK_EMPTY as EMPTY_CODE_HASH;

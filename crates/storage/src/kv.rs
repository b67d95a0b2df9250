//! The key-value contract the store is built on: point reads plus atomic
//! remove/upsert batches over namespaced opaque keys.

use std::collections::BTreeMap;
use std::sync::RwLock;

use crate::error::StoreError;

/// Key namespaces, one prefix byte per entity kind. Trie nodes and code
/// are written by the state downloader, everything else by the chain side;
/// the key spaces never overlap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
    Header,
    HeaderNumber,
    Body,
    Receipts,
    ChainWeight,
    TrieNode,
    Code,
    SyncMeta,
}

impl Namespace {
    fn prefix(self) -> u8 {
        match self {
            Namespace::Header => 0x01,
            Namespace::HeaderNumber => 0x02,
            Namespace::Body => 0x03,
            Namespace::Receipts => 0x04,
            Namespace::ChainWeight => 0x05,
            Namespace::TrieNode => 0x06,
            Namespace::Code => 0x07,
            Namespace::SyncMeta => 0x08,
        }
    }

    /// The full engine key for `key` within this namespace.
    pub fn key(self, key: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(key.len() + 1);
        out.push(self.prefix());
        out.extend_from_slice(key);
        out
    }
}

/// An upsert of `value` under `key` in `namespace`.
pub type Upsert = (Namespace, Vec<u8>, Vec<u8>);
/// A removal of `key` in `namespace`.
pub type Removal = (Namespace, Vec<u8>);

pub trait KeyValueEngine: Send + Sync {
    fn get(&self, namespace: Namespace, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;

    /// Applies all removals and upserts atomically: a concurrent reader or
    /// a crash observes either none or all of them.
    fn write_batch(&self, removals: Vec<Removal>, upserts: Vec<Upsert>) -> Result<(), StoreError>;
}

/// The engine used by tests and by nodes that have not configured a
/// durable backend.
#[derive(Debug, Default)]
pub struct InMemoryEngine {
    inner: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl InMemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueEngine for InMemoryEngine {
    fn get(&self, namespace: Namespace, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let inner = self
            .inner
            .read()
            .map_err(|_| StoreError::Engine("poisoned store lock".into()))?;
        Ok(inner.get(&namespace.key(key)).cloned())
    }

    fn write_batch(&self, removals: Vec<Removal>, upserts: Vec<Upsert>) -> Result<(), StoreError> {
        let mut inner = self
            .inner
            .write()
            .map_err(|_| StoreError::Engine("poisoned store lock".into()))?;
        for (namespace, key) in removals {
            inner.remove(&namespace.key(&key));
        }
        for (namespace, key, value) in upserts {
            inner.insert(namespace.key(&key), value);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespaces_do_not_collide() {
        let engine = InMemoryEngine::new();
        engine
            .write_batch(
                vec![],
                vec![
                    (Namespace::Header, vec![0xaa], vec![1]),
                    (Namespace::Body, vec![0xaa], vec![2]),
                ],
            )
            .unwrap();
        assert_eq!(engine.get(Namespace::Header, &[0xaa]).unwrap(), Some(vec![1]));
        assert_eq!(engine.get(Namespace::Body, &[0xaa]).unwrap(), Some(vec![2]));
        assert_eq!(engine.get(Namespace::Receipts, &[0xaa]).unwrap(), None);
    }

    #[test]
    fn batch_applies_removals_and_upserts() {
        let engine = InMemoryEngine::new();
        engine
            .write_batch(vec![], vec![(Namespace::SyncMeta, b"k".to_vec(), vec![1])])
            .unwrap();
        engine
            .write_batch(
                vec![(Namespace::SyncMeta, b"k".to_vec())],
                vec![(Namespace::SyncMeta, b"other".to_vec(), vec![2])],
            )
            .unwrap();
        assert_eq!(engine.get(Namespace::SyncMeta, b"k").unwrap(), None);
        assert_eq!(engine.get(Namespace::SyncMeta, b"other").unwrap(), Some(vec![2]));
    }
}

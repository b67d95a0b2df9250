//! Persistence for block data and sync progress: a namespaced key-value
//! engine behind the [`Store`] façade. Writes during sync are append-only;
//! the only deletion path is [`Store::discard_last_blocks`].

pub mod error;
pub mod kv;
mod store;

pub use error::StoreError;
pub use kv::{InMemoryEngine, KeyValueEngine, Namespace};
pub use store::Store;

//! Fast sync: brings a freshly started node to the network tip by
//! downloading headers, bodies and receipts for the whole chain in parallel
//! from many peers, while the world state trie is fetched separately at a
//! pivot block chosen a fixed offset behind the tip. Progress is persisted
//! so a restart resumes instead of re-downloading.
//!
//! The engine is built from a handful of cooperating tasks: the
//! [`coordinator::FastSync`] event loop owns all blockchain-side state,
//! the [`state::StateScheduler`] owns the trie frontier, and short-lived
//! request tasks talk to individual peers and report back over channels.

pub mod config;
pub mod coordinator;
pub mod message;
pub mod metrics;
pub mod peers;
pub mod pivot;
pub mod request;
pub mod state;
pub mod sync_state;
pub mod validator;

pub use config::SyncConfig;
pub use coordinator::{FastSync, SyncError, SyncEvent};
pub use peers::{PeerChannels, PeerId, PeerInfo, PeerTable};
pub use sync_state::SyncState;

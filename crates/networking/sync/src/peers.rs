//! The peer table: every handshaken peer with its advertised head, plus a
//! time-bounded blacklist with a reason attached to each ban. Downloads
//! only ever go to handshaken peers that are not currently banned.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ethereum_types::{H256, U256};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info};

use crate::message::Message;
use crate::metrics::METRICS;

pub type PeerId = H256;

/// What the peer told us about itself at handshake time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PeerInfo {
    pub max_block_number: u64,
    pub total_difficulty: U256,
}

/// The channel ends of a peer's transport: requests go out through
/// `sender`, responses arrive on the shared `receiver`. A request task
/// holds the receiver lock for the duration of its exchange, so a busy
/// peer is detected by a failed `try_lock`.
#[derive(Debug, Clone)]
pub struct PeerChannels {
    pub sender: mpsc::Sender<Message>,
    pub receiver: Arc<Mutex<mpsc::Receiver<Message>>>,
}

impl PeerChannels {
    /// Builds the engine-side channel ends together with the transport-side
    /// counterparts: the sender the transport uses to deliver responses and
    /// the receiver it reads outgoing requests from.
    pub fn create(buffer: usize) -> (Self, mpsc::Sender<Message>, mpsc::Receiver<Message>) {
        let (request_sender, request_receiver) = mpsc::channel(buffer);
        let (response_sender, response_receiver) = mpsc::channel(buffer);
        (
            Self {
                sender: request_sender,
                receiver: Arc::new(Mutex::new(response_receiver)),
            },
            response_sender,
            request_receiver,
        )
    }
}

#[derive(Debug, Clone)]
pub struct PeerEntry {
    pub info: PeerInfo,
    pub channels: PeerChannels,
}

#[derive(Debug, Clone)]
struct BanEntry {
    until: Instant,
    reason: String,
}

/// Shared view of connected peers. Cheap to clone; all interior state is
/// behind async locks.
#[derive(Debug, Clone, Default)]
pub struct PeerTable {
    peers: Arc<Mutex<BTreeMap<PeerId, PeerEntry>>>,
    blacklist: Arc<Mutex<HashMap<PeerId, BanEntry>>>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_peer(&self, peer_id: PeerId, info: PeerInfo, channels: PeerChannels) {
        debug!("Peer {peer_id} handshaked, advertised tip {}", info.max_block_number);
        self.peers
            .lock()
            .await
            .insert(peer_id, PeerEntry { info, channels });
    }

    pub async fn remove_peer(&self, peer_id: &PeerId) {
        debug!("Peer {peer_id} disconnected");
        self.peers.lock().await.remove(peer_id);
    }

    pub async fn handshaked_peers(&self) -> Vec<(PeerId, PeerInfo)> {
        self.peers
            .lock()
            .await
            .iter()
            .map(|(id, entry)| (*id, entry.info))
            .collect()
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.lock().await.len()
    }

    pub async fn peer_channels(&self, peer_id: &PeerId) -> Option<PeerChannels> {
        self.peers
            .lock()
            .await
            .get(peer_id)
            .map(|entry| entry.channels.clone())
    }

    /// Bans the peer for `duration`. The reason ends up in the status log
    /// and the ban counter.
    pub async fn blacklist(&self, peer_id: PeerId, duration: Duration, reason: &str) {
        info!("Blacklisting peer {peer_id} for {duration:?}: {reason}");
        METRICS.blacklisted_peers.inc();
        self.blacklist.lock().await.insert(
            peer_id,
            BanEntry {
                until: Instant::now() + duration,
                reason: reason.to_string(),
            },
        );
    }

    pub async fn is_blacklisted(&self, peer_id: &PeerId) -> bool {
        let mut blacklist = self.blacklist.lock().await;
        match blacklist.get(peer_id) {
            Some(entry) if entry.until > Instant::now() => true,
            Some(_) => {
                blacklist.remove(peer_id);
                false
            }
            None => false,
        }
    }

    pub async fn blacklisted_count(&self) -> usize {
        let now = Instant::now();
        let mut blacklist = self.blacklist.lock().await;
        blacklist.retain(|_, entry| entry.until > now);
        blacklist.len()
    }

    /// Handshaked peers minus expired-aware blacklist, with their channels.
    pub async fn peers_to_download_from(&self) -> Vec<(PeerId, PeerInfo, PeerChannels)> {
        let now = Instant::now();
        let mut blacklist = self.blacklist.lock().await;
        blacklist.retain(|_, entry| entry.until > now);
        self.peers
            .lock()
            .await
            .iter()
            .filter(|(id, _)| !blacklist.contains_key(*id))
            .map(|(id, entry)| (*id, entry.info, entry.channels.clone()))
            .collect()
    }

    /// The highest block number any usable peer advertises.
    pub async fn best_peer_tip(&self) -> Option<u64> {
        self.peers_to_download_from()
            .await
            .iter()
            .map(|(_, info, _)| info.max_block_number)
            .max()
    }

    pub async fn ban_reason(&self, peer_id: &PeerId) -> Option<String> {
        self.blacklist
            .lock()
            .await
            .get(peer_id)
            .map(|entry| entry.reason.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_channels() -> PeerChannels {
        PeerChannels::create(8).0
    }

    #[tokio::test]
    async fn blacklisted_peers_are_excluded_until_expiry() {
        let table = PeerTable::new();
        let good = PeerId::from_low_u64_be(1);
        let bad = PeerId::from_low_u64_be(2);
        table.insert_peer(good, PeerInfo::default(), dummy_channels()).await;
        table.insert_peer(bad, PeerInfo::default(), dummy_channels()).await;

        table
            .blacklist(bad, Duration::from_millis(30), "wrong hash in response")
            .await;
        assert!(table.is_blacklisted(&bad).await);
        assert_eq!(table.ban_reason(&bad).await.as_deref(), Some("wrong hash in response"));

        let usable = table.peers_to_download_from().await;
        assert_eq!(usable.len(), 1);
        assert_eq!(usable[0].0, good);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!table.is_blacklisted(&bad).await);
        assert_eq!(table.peers_to_download_from().await.len(), 2);
    }

    #[tokio::test]
    async fn disconnect_removes_peer() {
        let table = PeerTable::new();
        let peer = PeerId::from_low_u64_be(3);
        table
            .insert_peer(
                peer,
                PeerInfo { max_block_number: 42, ..Default::default() },
                dummy_channels(),
            )
            .await;
        assert_eq!(table.best_peer_tip().await, Some(42));

        table.remove_peer(&peer).await;
        assert_eq!(table.peer_count().await, 0);
        assert_eq!(table.best_peer_tip().await, None);
    }
}

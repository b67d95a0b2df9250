//! Pivot election: ask a quorum of peers for the header at
//! `best tip − offset` and accept the one enough of them agree on.
//! Disagreement or thin peer coverage backs off and retries before giving
//! up, leaving rescheduling to the coordinator.

use std::collections::HashMap;
use std::time::Duration;

use ember_common::types::BlockHeader;
use ethereum_types::H256;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::coordinator::SyncEvent;
use crate::message::{GetBlockHeaders, HashOrNumber, Message};
use crate::peers::PeerTable;
use crate::request;

/// Election rounds attempted before reporting failure.
const ELECTION_ROUNDS: u32 = 3;

/// Runs an election in the background; the outcome lands in the
/// coordinator's inbox as a `PivotResult`.
pub fn spawn_election(
    peers: PeerTable,
    config: SyncConfig,
    reply: mpsc::Sender<SyncEvent>,
    initial_delay: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if !initial_delay.is_zero() {
            sleep(initial_delay).await;
        }
        let header = elect(&peers, &config).await;
        let _ = reply.send(SyncEvent::PivotResult { header }).await;
    })
}

async fn elect(peers: &PeerTable, config: &SyncConfig) -> Option<BlockHeader> {
    for round in 0..ELECTION_ROUNDS {
        if round > 0 {
            sleep(config.pivot_block_reschedule_interval).await;
        }

        let candidates = peers.peers_to_download_from().await;
        if candidates.len() < config.min_peers_to_choose_pivot_block {
            warn!(
                "Cannot elect a pivot block: {} usable peers, need {}",
                candidates.len(),
                config.min_peers_to_choose_pivot_block
            );
            continue;
        }
        let best_tip = candidates
            .iter()
            .map(|(_, info, _)| info.max_block_number)
            .max()
            .unwrap_or_default();
        if best_tip < config.pivot_block_offset {
            warn!("Best advertised tip {best_tip} is below the pivot offset, retrying");
            continue;
        }
        let target = best_tip - config.pivot_block_offset;
        debug!("Electing pivot block at height {target} among {} peers", candidates.len());

        let (vote_sender, mut votes_rx) = mpsc::channel(candidates.len().max(1));
        for (peer_id, _, channels) in candidates {
            let vote_sender = vote_sender.clone();
            let timeout = config.peer_response_timeout;
            tokio::spawn(async move {
                let request = Message::GetBlockHeaders(GetBlockHeaders {
                    id: rand::random(),
                    start: HashOrNumber::Number(target),
                    limit: 1,
                    skip: 0,
                    reverse: false,
                });
                let header = match request::exchange(&channels, request, timeout).await {
                    Ok(Message::BlockHeaders(response)) => response
                        .headers
                        .into_iter()
                        .find(|header| header.number == target),
                    _ => None,
                };
                let _ = vote_sender.send((peer_id, header)).await;
            });
        }
        drop(vote_sender);

        let mut votes: HashMap<H256, (BlockHeader, usize)> = HashMap::new();
        while let Some((peer_id, header)) = votes_rx.recv().await {
            match header {
                Some(header) => {
                    votes.entry(header.hash()).or_insert((header, 0)).1 += 1;
                }
                None => debug!("Peer {peer_id} produced no pivot candidate"),
            }
        }

        if let Some((header, count)) = votes.into_values().max_by_key(|(_, count)| *count) {
            if count >= config.min_peers_to_choose_pivot_block {
                info!("Elected pivot block {} with {count} agreeing peers", header.number);
                return Some(header);
            }
            warn!(
                "Pivot election round {round} without quorum: best candidate {} had {count} votes",
                header.number
            );
        }
    }
    warn!("Pivot election failed after {ELECTION_ROUNDS} rounds");
    None
}

//! One outstanding request to one peer: send the typed request, wait for
//! the response that mirrors its id, or time out. Every outcome is
//! reported; a request task cannot disappear without the coordinator
//! hearing about it.

use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::trace;

use crate::coordinator::SyncEvent;
use crate::message::Message;
use crate::peers::{PeerChannels, PeerId};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("peer is busy serving another request")]
    PeerBusy,
    #[error("failed to send request to peer")]
    SendFailed,
    #[error("timed out waiting for response")]
    Timeout,
    #[error("peer connection closed")]
    Disconnected,
}

/// Sends `request` and waits for the matching response. Replies that do not
/// mirror the request id (late answers to earlier requests) are discarded.
pub async fn exchange(
    channels: &PeerChannels,
    request: Message,
    timeout: Duration,
) -> Result<Message, RequestError> {
    let request_id = request.request_id();
    let expected_code = request.expected_response_code();

    // Taking the receiver before sending rules out racing another request
    // task for the same peer's responses.
    let mut receiver = channels
        .receiver
        .try_lock()
        .map_err(|_| RequestError::PeerBusy)?;

    channels
        .sender
        .send(request)
        .await
        .map_err(|_| RequestError::SendFailed)?;

    tokio::time::timeout(timeout, async {
        loop {
            match receiver.recv().await {
                Some(message)
                    if message.request_id() == request_id
                        && Some(message.code()) == expected_code =>
                {
                    return Ok(message);
                }
                Some(other) => {
                    trace!("Discarding unexpected message with code {:#x}", other.code());
                    continue;
                }
                None => return Err(RequestError::Disconnected),
            }
        }
    })
    .await
    .map_err(|_| RequestError::Timeout)?
}

/// Spawns a request task for the coordinator. The outcome always arrives in
/// its inbox as either `ResponseReceived` or `RequestFailed`.
pub fn spawn_request(
    peer: PeerId,
    channels: PeerChannels,
    request: Message,
    timeout: Duration,
    reply: mpsc::Sender<SyncEvent>,
) {
    tokio::spawn(async move {
        let started = Instant::now();
        let event = match exchange(&channels, request, timeout).await {
            Ok(message) => SyncEvent::ResponseReceived {
                peer,
                message,
                elapsed: started.elapsed(),
            },
            Err(reason) => SyncEvent::RequestFailed { peer, reason },
        };
        // The coordinator owning the receiving end has shut down; nothing
        // left to report to.
        let _ = reply.send(event).await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{BlockHeaders, GetBlockHeaders, HashOrNumber};

    fn header_request(id: u64) -> Message {
        Message::GetBlockHeaders(GetBlockHeaders {
            id,
            start: HashOrNumber::Number(1),
            limit: 1,
            skip: 0,
            reverse: false,
        })
    }

    #[tokio::test]
    async fn matching_response_is_returned_and_late_replies_skipped() {
        let (channels, responses, mut requests) = PeerChannels::create(8);

        tokio::spawn(async move {
            let request = requests.recv().await.unwrap();
            let id = request.request_id();
            // a late reply to some earlier request first
            responses
                .send(Message::BlockHeaders(BlockHeaders { id: id ^ 1, headers: vec![] }))
                .await
                .unwrap();
            responses
                .send(Message::BlockHeaders(BlockHeaders { id, headers: vec![] }))
                .await
                .unwrap();
        });

        let response = exchange(&channels, header_request(77), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(response.request_id(), 77);
    }

    #[tokio::test]
    async fn silence_times_out() {
        let (channels, _responses, _requests) = PeerChannels::create(8);
        let err = exchange(&channels, header_request(1), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert_eq!(err, RequestError::Timeout);
    }

    #[tokio::test]
    async fn closed_connection_reports_disconnected() {
        let (channels, responses, requests) = PeerChannels::create(8);
        drop(responses);
        // keep the request receiver alive so the send itself succeeds
        let _requests = requests;
        let err = exchange(&channels, header_request(1), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err, RequestError::Disconnected);
    }

    #[tokio::test]
    async fn concurrent_request_sees_busy_peer() {
        let (channels, _responses, _requests) = PeerChannels::create(8);
        let held = channels.receiver.clone().try_lock_owned().unwrap();
        let err = exchange(&channels, header_request(1), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert_eq!(err, RequestError::PeerBusy);
        drop(held);
    }
}

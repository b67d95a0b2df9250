//! End-to-end fast sync scenarios against deterministic in-process peers,
//! each serving the same synthetic chain with configurable misbehaviour.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ember_common::constants::{EMPTY_OMMERS_HASH, EMPTY_TRIE_ROOT};
use ember_common::types::{BlockBody, BlockHeader, Transaction};
use ember_storage::Store;
use ember_sync::config::SyncConfig;
use ember_sync::coordinator::FastSync;
use ember_sync::message::{
    BlockBodies, BlockHeaders, HashOrNumber, Message, NodeData, Receipts,
};
use ember_sync::peers::{PeerChannels, PeerId, PeerInfo, PeerTable};
use ember_sync::sync_state::SyncState;
use ember_sync::validator::{BlockValidator, NoSeal};
use ethereum_types::{H256, U256};
use tokio_util::sync::CancellationToken;

struct TestChain {
    headers: Vec<BlockHeader>,
    by_hash: HashMap<H256, u64>,
}

impl TestChain {
    /// A chain of empty blocks: every root commitment is the empty one, so
    /// the default body and an empty receipt list validate against every
    /// header.
    fn generate(len: u64) -> Arc<Self> {
        let mut headers = vec![BlockHeader {
            difficulty: U256::from(1u64),
            gas_limit: 8_000_000,
            ommers_hash: EMPTY_OMMERS_HASH,
            state_root: EMPTY_TRIE_ROOT,
            transactions_root: EMPTY_TRIE_ROOT,
            receipts_root: EMPTY_TRIE_ROOT,
            ..Default::default()
        }];
        for number in 1..=len {
            let parent = &headers[number as usize - 1];
            headers.push(BlockHeader {
                parent_hash: parent.hash(),
                number,
                difficulty: U256::from(100u64),
                gas_limit: 8_000_000,
                timestamp: parent.timestamp + 13,
                ommers_hash: EMPTY_OMMERS_HASH,
                state_root: EMPTY_TRIE_ROOT,
                transactions_root: EMPTY_TRIE_ROOT,
                receipts_root: EMPTY_TRIE_ROOT,
                ..Default::default()
            });
        }
        let by_hash = headers
            .iter()
            .map(|header| (header.hash(), header.number))
            .collect();
        Arc::new(Self { headers, by_hash })
    }

    fn genesis(&self) -> &BlockHeader {
        &self.headers[0]
    }

    fn slice(&self, start: u64, limit: u64, tip: u64) -> Vec<BlockHeader> {
        let last = (start + limit - 1).min(tip).min(self.headers.len() as u64 - 1);
        if start > last {
            return vec![];
        }
        self.headers[start as usize..=last as usize].to_vec()
    }

    fn knows(&self, hash: &H256) -> bool {
        self.by_hash.contains_key(hash)
    }
}

#[derive(Clone, Default)]
struct PeerScript {
    /// Break the chain linkage of every multi-header response.
    corrupt_headers: bool,
    /// Smuggle a transaction into the first body of every bodies response.
    corrupt_bodies: bool,
}

type RequestLog = Arc<Mutex<Vec<(u64, u64)>>>;

/// Spawns a peer serving `chain` up to `tip` and registers it in the table.
async fn spawn_peer(
    table: &PeerTable,
    id: u64,
    chain: Arc<TestChain>,
    tip: u64,
    script: PeerScript,
    header_requests: RequestLog,
) -> PeerId {
    let peer_id = PeerId::from_low_u64_be(id);
    let (channels, responses, mut requests) = PeerChannels::create(64);
    table
        .insert_peer(
            peer_id,
            PeerInfo { max_block_number: tip, total_difficulty: U256::from(tip) },
            channels,
        )
        .await;

    tokio::spawn(async move {
        while let Some(request) = requests.recv().await {
            let reply = match request {
                Message::GetBlockHeaders(get) => {
                    let HashOrNumber::Number(start) = get.start else { continue };
                    header_requests.lock().unwrap().push((start, get.limit));
                    let mut headers = chain.slice(start, get.limit, tip);
                    if script.corrupt_headers && headers.len() >= 2 {
                        let last = headers.len() - 1;
                        headers[last].parent_hash = H256::repeat_byte(0xde);
                    }
                    Message::BlockHeaders(BlockHeaders { id: get.id, headers })
                }
                Message::GetBlockBodies(get) => {
                    let mut bodies: Vec<BlockBody> = get
                        .hashes
                        .iter()
                        .filter(|hash| chain.knows(hash))
                        .map(|_| BlockBody::default())
                        .collect();
                    if script.corrupt_bodies && !bodies.is_empty() {
                        bodies[0]
                            .transactions
                            .push(Transaction { nonce: 99, ..Default::default() });
                    }
                    Message::BlockBodies(BlockBodies { id: get.id, bodies })
                }
                Message::GetReceipts(get) => {
                    let receipts = get
                        .hashes
                        .iter()
                        .filter(|hash| chain.knows(hash))
                        .map(|_| Vec::new())
                        .collect();
                    Message::Receipts(Receipts { id: get.id, receipts })
                }
                Message::GetNodeData(get) => {
                    Message::NodeData(NodeData { id: get.id, nodes: vec![] })
                }
                _ => continue,
            };
            if responses.send(reply).await.is_err() {
                break;
            }
        }
    });
    peer_id
}

fn test_config() -> SyncConfig {
    SyncConfig {
        block_headers_per_request: 30,
        block_bodies_per_request: 25,
        receipts_per_request: 25,
        nodes_per_request: 16,
        max_concurrent_requests: 8,
        fast_sync_throttle: Duration::from_millis(5),
        peer_response_timeout: Duration::from_secs(1),
        sync_retry_interval: Duration::from_millis(20),
        blacklist_duration: Duration::from_secs(30),
        critical_blacklist_duration: Duration::from_secs(60),
        pivot_block_offset: 20,
        // synthetic tips never move, so the pivot must not age out
        max_pivot_block_age: 1_000_000,
        max_target_difference: 5,
        min_peers_to_choose_pivot_block: 2,
        pivot_block_reschedule_interval: Duration::from_millis(50),
        maximum_target_update_failures: 1000,
        fast_sync_block_validation_n: 4,
        fast_sync_block_validation_k: 5,
        fast_sync_block_validation_x: 3,
        persist_state_snapshot_interval: Duration::from_millis(100),
        print_status_interval: Duration::from_millis(500),
        state_sync_bloom_filter_size: 1 << 16,
    }
}

fn build_sync(
    config: SyncConfig,
    store: &Store,
    peers: &PeerTable,
) -> (FastSync, CancellationToken) {
    let cancel = CancellationToken::new();
    let validator = BlockValidator::new(store.clone(), Arc::new(NoSeal));
    let (sync, _events) = FastSync::new(
        config,
        store.clone(),
        peers.clone(),
        validator,
        cancel.clone(),
    );
    (sync, cancel)
}

fn assert_block_complete(store: &Store, chain: &TestChain, number: u64) {
    let header = store
        .get_header_by_number(number)
        .unwrap()
        .unwrap_or_else(|| panic!("header {number} missing"));
    assert_eq!(header, chain.headers[number as usize]);
    let hash = header.hash();
    assert!(store.get_block_body(&hash).unwrap().is_some(), "body {number} missing");
    assert!(store.get_receipts(&hash).unwrap().is_some(), "receipts {number} missing");
}

#[tokio::test(flavor = "multi_thread")]
async fn happy_path_downloads_everything_and_finishes() {
    let config = test_config();
    let chain = TestChain::generate(130);
    let store = Store::in_memory();
    store.put_genesis(chain.genesis()).unwrap();

    let peers = PeerTable::new();
    let log: RequestLog = Default::default();
    for id in 1..=4 {
        spawn_peer(&peers, id, chain.clone(), 120, PeerScript::default(), log.clone()).await;
    }

    let (sync, _cancel) = build_sync(config.clone(), &store, &peers);
    tokio::time::timeout(Duration::from_secs(60), sync.run())
        .await
        .expect("sync timed out")
        .expect("sync failed");

    assert!(store.fast_sync_done().unwrap());
    assert!(store.load_sync_state().unwrap().is_none());

    // pivot at 120 - 20 = 100, target 103, tail above 101 discarded
    for number in 1..=101 {
        assert_block_complete(&store, &chain, number);
    }
    assert!(store.get_header_by_number(102).unwrap().is_none());
    assert!(store.get_header_by_number(103).unwrap().is_none());
    assert!(store.get_header_by_number(104).unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn corrupted_header_batch_blacklists_the_peer_and_sync_recovers() {
    let config = test_config();
    let chain = TestChain::generate(130);
    let store = Store::in_memory();
    store.put_genesis(chain.genesis()).unwrap();

    let peers = PeerTable::new();
    let log: RequestLog = Default::default();
    // the misbehaving peer advertises the best tip, so it is preferred for
    // the first header request
    let bad = spawn_peer(
        &peers,
        1,
        chain.clone(),
        121,
        PeerScript { corrupt_headers: true, ..Default::default() },
        log.clone(),
    )
    .await;
    for id in 2..=4 {
        spawn_peer(&peers, id, chain.clone(), 121, PeerScript::default(), log.clone()).await;
    }

    let (sync, _cancel) = build_sync(config.clone(), &store, &peers);
    tokio::time::timeout(Duration::from_secs(60), sync.run())
        .await
        .expect("sync timed out")
        .expect("sync failed");

    assert!(store.fast_sync_done().unwrap());
    assert_eq!(
        peers.ban_reason(&bad).await.as_deref(),
        Some("error in block headers response")
    );
    // pivot at 121 - 20 = 101; everything up to the pivot + 1 is complete
    for number in 1..=102 {
        assert_block_complete(&store, &chain, number);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn invalid_body_is_refetched_from_another_peer() {
    let mut config = test_config();
    // With whole-queue batches and no throttle, the first round after a
    // header batch deterministically hands receipts to the first peer and
    // bodies to the second.
    config.block_bodies_per_request = 200;
    config.receipts_per_request = 200;
    config.fast_sync_throttle = Duration::ZERO;
    config.min_peers_to_choose_pivot_block = 1;

    let chain = TestChain::generate(130);
    let store = Store::in_memory();
    store.put_genesis(chain.genesis()).unwrap();

    let peers = PeerTable::new();
    let log: RequestLog = Default::default();
    let good = spawn_peer(&peers, 1, chain.clone(), 125, PeerScript::default(), log.clone()).await;
    let bad = spawn_peer(
        &peers,
        2,
        chain.clone(),
        125,
        PeerScript { corrupt_bodies: true, ..Default::default() },
        log.clone(),
    )
    .await;

    let (sync, _cancel) = build_sync(config.clone(), &store, &peers);
    tokio::time::timeout(Duration::from_secs(60), sync.run())
        .await
        .expect("sync timed out")
        .expect("sync failed");

    assert!(store.fast_sync_done().unwrap());
    assert_eq!(
        peers.ban_reason(&bad).await.as_deref(),
        Some("invalid block bodies response")
    );
    assert!(!peers.is_blacklisted(&good).await);
    // pivot at 125 - 20 = 105; the re-fetched bodies are the honest ones
    for number in 1..=106 {
        assert_block_complete(&store, &chain, number);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn crash_and_restart_resumes_without_re_downloading_headers() {
    let config = test_config();
    let chain = TestChain::generate(400);
    let store = Store::in_memory();
    store.put_genesis(chain.genesis()).unwrap();

    // first run: interrupt once some progress is persisted
    {
        let peers = PeerTable::new();
        let log: RequestLog = Default::default();
        for id in 1..=3 {
            spawn_peer(&peers, id, chain.clone(), 390, PeerScript::default(), log.clone()).await;
        }
        let (sync, cancel) = build_sync(config.clone(), &store, &peers);
        let run = tokio::spawn(sync.run());

        let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
        loop {
            assert!(tokio::time::Instant::now() < deadline, "no persisted progress");
            if let Some(blob) = store.load_sync_state().unwrap() {
                let state = SyncState::from_bytes(&blob).unwrap();
                if state.best_block_header_number >= 50 {
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cancel.cancel();
        run.await.unwrap().unwrap();
    }

    assert!(!store.fast_sync_done().unwrap(), "sync finished before the crash point");
    let blob = store.load_sync_state().unwrap().expect("no snapshot persisted");
    let persisted = SyncState::from_bytes(&blob).unwrap();
    assert!(persisted.best_block_header_number >= 50);
    assert!(persisted.best_block_header_number <= persisted.safe_download_target);
    // every queued hash names a header that survived the crash
    for hash in persisted
        .block_bodies_queue
        .iter()
        .chain(persisted.receipts_queue.iter())
    {
        assert!(
            store.get_block_header(hash).unwrap().is_some(),
            "queued hash without a persisted header"
        );
    }

    // second run: fresh peers, same store
    let peers = PeerTable::new();
    let log: RequestLog = Default::default();
    for id in 11..=13 {
        spawn_peer(&peers, id, chain.clone(), 390, PeerScript::default(), log.clone()).await;
    }
    let (sync, _cancel) = build_sync(config.clone(), &store, &peers);
    tokio::time::timeout(Duration::from_secs(60), sync.run())
        .await
        .expect("resumed sync timed out")
        .expect("resumed sync failed");

    assert!(store.fast_sync_done().unwrap());
    // pivot at 390 - 20 = 370; chain complete to the pivot + 1
    for number in 1..=371 {
        assert_block_complete(&store, &chain, number);
    }
    assert!(store.get_header_by_number(372).unwrap().is_none());

    // no header batch was requested below the resumed cursor
    let resumed_floor = persisted.best_block_header_number + 1;
    let requests = log.lock().unwrap();
    let batch_starts: Vec<u64> = requests
        .iter()
        .filter(|(_, limit)| *limit > 1)
        .map(|(start, _)| *start)
        .collect();
    assert!(!batch_starts.is_empty());
    assert!(
        batch_starts.iter().all(|start| *start >= resumed_floor),
        "a header batch started below the persisted best ({batch_starts:?} < {resumed_floor})"
    );
}

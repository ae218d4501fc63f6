use super::*;
use crate::peer::{Direction, PieceId};
use crate::storage::TorrentDescriptor;
use crate::tracker::TrackerPeer;
use bytes::Bytes;
use std::time::Duration;
use tempfile::TempDir;

const FILE: &str = "payload.bin";
const PIECE_LEN: u64 = 256;
const PIECES: u32 = 4;

fn payload() -> Vec<u8> {
    (0..PIECE_LEN as usize * PIECES as usize)
        .map(|i| (i * 31 % 253) as u8)
        .collect()
}

fn config(peer_id: &str, temp: &TempDir) -> NodeConfig {
    NodeConfig::new(peer_id, temp.path())
        .with_listen_addr("127.0.0.1:0".parse().unwrap())
        .with_idle_backoff(Duration::from_millis(1))
}

/// Binds and starts a node holding `held` pieces of the shared file.
async fn start_node(peer_id: &str, temp: &TempDir, held: &[u32]) -> Arc<ConnectionManager> {
    let config = config(peer_id, temp);
    let data = payload();
    let store = Arc::new(PieceStore::from_config(&config));
    let descriptor = TorrentDescriptor::from_data(FILE, PIECE_LEN, &data).unwrap();
    store.add_tracked_file(descriptor, false).await.unwrap();
    for &index in held {
        let start = index as usize * PIECE_LEN as usize;
        let chunk = Bytes::copy_from_slice(&data[start..start + PIECE_LEN as usize]);
        assert!(store.write_piece(&PieceId::new(FILE, index), chunk).await.unwrap());
    }

    let manager = ConnectionManager::bind(config, store).await.unwrap();
    manager.start();
    manager
}

fn peer_entry(manager: &ConnectionManager) -> TrackerPeer {
    TrackerPeer::new(manager.config().peer_id.as_str(), manager.local_addr())
}

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(15), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {}", what);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_nodes_exchange_missing_pieces() {
    let (temp_a, temp_b) = (TempDir::new().unwrap(), TempDir::new().unwrap());
    let node_a = start_node("a", &temp_a, &[0, 1]).await;
    let node_b = start_node("b", &temp_b, &[2, 3]).await;

    let response = AnnounceResponse::ok(vec![peer_entry(&node_a), peer_entry(&node_b)]);
    assert_eq!(node_a.join(&response).await.unwrap(), 1);

    wait_until("both nodes complete", || {
        node_a.store().is_complete(FILE) && node_b.store().is_complete(FILE)
    })
    .await;

    let registry = node_a.registry();
    assert_eq!(registry.len(), 1);
    assert_eq!(registry[0].peer_id, "b");
    assert_eq!(registry[0].direction, Direction::Outbound);
    assert!(node_a.is_connected("b"));

    wait_until("inbound registration", || node_b.is_connected("a")).await;
    assert_eq!(node_b.registry()[0].direction, Direction::Inbound);

    node_a.shutdown().await;
    node_b.shutdown().await;
    assert_eq!(node_a.connection_count(), 0);
    assert_eq!(node_b.connection_count(), 0);

    let expected = payload();
    assert_eq!(std::fs::read(temp_a.path().join(FILE)).unwrap(), expected);
    assert_eq!(std::fs::read(temp_b.path().join(FILE)).unwrap(), expected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_seeder_and_two_leechers() {
    let temps: Vec<TempDir> = (0..3).map(|_| TempDir::new().unwrap()).collect();
    let seed = start_node("seed", &temps[0], &[0, 1, 2, 3]).await;
    let first = start_node("first", &temps[1], &[]).await;
    let second = start_node("second", &temps[2], &[]).await;

    first
        .join(&AnnounceResponse::ok(vec![peer_entry(&seed)]))
        .await
        .unwrap();
    second
        .join(&AnnounceResponse::ok(vec![
            peer_entry(&seed),
            peer_entry(&first),
            peer_entry(&second),
        ]))
        .await
        .unwrap();

    wait_until("leechers complete", || {
        first.store().is_complete(FILE) && second.store().is_complete(FILE)
    })
    .await;

    for node in [&seed, &first, &second] {
        node.shutdown().await;
    }
    for temp in &temps[1..] {
        assert_eq!(std::fs::read(temp.path().join(FILE)).unwrap(), payload());
    }
}

#[tokio::test]
async fn test_join_rejects_tracker_error() {
    let temp = TempDir::new().unwrap();
    let node = start_node("a", &temp, &[]).await;

    let response = AnnounceResponse::error(1, "You're already in the network!");
    match node.join(&response).await {
        Err(ManagerError::Tracker { code, message }) => {
            assert_eq!(code, 1);
            assert_eq!(message, "You're already in the network!");
        }
        other => panic!("expected tracker error, got {:?}", other),
    }
    assert_eq!(node.connection_count(), 0);
    node.shutdown().await;
}

#[tokio::test]
async fn test_join_skips_unreachable_and_self() {
    let temp = TempDir::new().unwrap();
    let node = start_node("a", &temp, &[]).await;

    // Grab a free port, then close it again.
    let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let closed_addr = closed.local_addr().unwrap();
    drop(closed);

    let response = AnnounceResponse::ok(vec![
        peer_entry(&node),
        TrackerPeer::new("gone", closed_addr),
    ]);
    assert_eq!(node.join(&response).await.unwrap(), 0);
    assert!(node.connect(closed_addr).await.is_err());
    node.shutdown().await;
}

#[tokio::test]
async fn test_no_connections_after_shutdown() {
    let temp = TempDir::new().unwrap();
    let node = start_node("a", &temp, &[]).await;
    let addr = node.local_addr();
    node.shutdown().await;

    assert!(node.is_shutting_down());
    assert!(matches!(node.connect(addr).await, Err(ManagerError::ShuttingDown)));
    assert!(matches!(
        node.join(&AnnounceResponse::ok(Vec::new())).await,
        Err(ManagerError::ShuttingDown)
    ));
}

#[tokio::test]
async fn test_shutdown_closes_idle_connection() {
    let (temp_a, temp_b) = (TempDir::new().unwrap(), TempDir::new().unwrap());
    let node_a = start_node("a", &temp_a, &[0, 1, 2, 3]).await;
    let node_b = start_node("b", &temp_b, &[0, 1, 2, 3]).await;

    node_a.connect(node_b.local_addr()).await.unwrap();
    wait_until("inbound registration", || node_b.connection_count() == 1).await;

    node_b.shutdown().await;
    assert_eq!(node_b.connection_count(), 0);
    wait_until("peer notices close", || node_a.connection_count() == 0).await;
    node_a.shutdown().await;
}

#[tokio::test]
async fn test_bind_rejects_peer_id_too_long_for_the_wire() {
    let temp = TempDir::new().unwrap();
    let long = "n".repeat(crate::constants::MAX_ID_LEN + 1);
    let store = Arc::new(PieceStore::new(temp.path(), 0));

    let result = ConnectionManager::bind(config(&long, &temp), store).await;
    assert!(matches!(
        result,
        Err(ManagerError::Peer(PeerError::InvalidMessage(_)))
    ));
}

#[tokio::test]
async fn test_announce_request() {
    let temp = TempDir::new().unwrap();
    let node = start_node("a", &temp, &[]).await;

    let request = node.announce_request(TrackerEvent::Started);
    assert_eq!(request.peer_id, "a");
    assert_eq!(request.port, node.local_addr().port());
    assert_eq!(request.event, TrackerEvent::Started);
    node.shutdown().await;
}

use super::*;
use crate::constants::MAX_TRACKED_FILES;
use crate::peer::{Bitfield, BitfieldMap, PieceId};
use bytes::Bytes;
use std::sync::Arc;
use tempfile::TempDir;

const PIECE_LEN: u64 = 1024;

fn sample_data(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 256) as u8).collect()
}

fn piece_bytes(data: &[u8], index: u32) -> Bytes {
    let start = index as usize * PIECE_LEN as usize;
    let end = (start + PIECE_LEN as usize).min(data.len());
    Bytes::copy_from_slice(&data[start..end])
}

async fn create_test_store(temp: &TempDir, data: &[u8]) -> (PieceStore, TorrentDescriptor) {
    let descriptor = TorrentDescriptor::from_data("test.dat", PIECE_LEN, data).unwrap();
    let store = PieceStore::new(temp.path(), 64 * 1024);
    store
        .add_tracked_file(descriptor.clone(), false)
        .await
        .unwrap();
    (store, descriptor)
}

fn full_peer(piece_count: usize) -> BitfieldMap {
    let mut map = BitfieldMap::new();
    map.insert("test.dat".to_string(), Bitfield::full(piece_count));
    map
}

#[tokio::test]
async fn test_write_and_read_piece() {
    let temp = TempDir::new().unwrap();
    let data = sample_data(4 * PIECE_LEN as usize);
    let (store, _) = create_test_store(&temp, &data).await;
    let piece = PieceId::new("test.dat", 1);

    assert!(store.read_piece(&piece).await.unwrap().is_none());
    assert!(store.write_piece(&piece, piece_bytes(&data, 1)).await.unwrap());

    let read = store.read_piece(&piece).await.unwrap().unwrap();
    assert_eq!(read, piece_bytes(&data, 1));
    assert!(store.current_bitfield("test.dat").unwrap().has(1));
    assert!(!store.is_wanted(&piece));
    assert!(temp.path().join(".pieces").join("test.dat.1").exists());
}

#[tokio::test]
async fn test_read_falls_back_to_disk() {
    let temp = TempDir::new().unwrap();
    let data = sample_data(2 * PIECE_LEN as usize);
    let descriptor = TorrentDescriptor::from_data("test.dat", PIECE_LEN, &data).unwrap();
    // Room for a single piece.
    let store = PieceStore::new(temp.path(), PIECE_LEN as usize);
    store.add_tracked_file(descriptor, false).await.unwrap();
    let (first, second) = (PieceId::new("test.dat", 0), PieceId::new("test.dat", 1));

    store.write_piece(&first, piece_bytes(&data, 0)).await.unwrap();
    store.write_piece(&second, piece_bytes(&data, 1)).await.unwrap();
    assert!(!store.cache().contains(&first));

    let read = store.read_piece(&first).await.unwrap().unwrap();
    assert_eq!(read, piece_bytes(&data, 0));
    assert!(store.cache().contains(&first));
}

#[tokio::test]
async fn test_hash_mismatch_leaves_state_untouched() {
    let temp = TempDir::new().unwrap();
    let data = sample_data(4 * PIECE_LEN as usize);
    let (store, _) = create_test_store(&temp, &data).await;
    let piece = PieceId::new("test.dat", 2);

    let wanted_before = store.is_wanted(&piece);
    let ok = store
        .write_piece(&piece, Bytes::from(vec![0xAB; PIECE_LEN as usize]))
        .await
        .unwrap();

    assert!(!ok);
    assert!(!store.current_bitfield("test.dat").unwrap().has(2));
    assert_eq!(store.is_wanted(&piece), wanted_before);
    assert!(!temp.path().join(".pieces").join("test.dat.2").exists());
}

#[tokio::test]
async fn test_completion_reassembles_file() {
    let temp = TempDir::new().unwrap();
    let data = sample_data(3 * PIECE_LEN as usize + 100);
    let (store, descriptor) = create_test_store(&temp, &data).await;

    for index in (0..descriptor.piece_count() as u32).rev() {
        let piece = PieceId::new("test.dat", index);
        assert!(store.write_piece(&piece, piece_bytes(&data, index)).await.unwrap());
    }

    assert!(store.is_complete("test.dat"));
    assert_eq!(store.wanted_len(), 0);
    let assembled = std::fs::read(temp.path().join("test.dat")).unwrap();
    assert_eq!(assembled, data);

    // Reassembly is idempotent.
    store.reassemble("test.dat").await.unwrap();
    let assembled = std::fs::read(temp.path().join("test.dat")).unwrap();
    assert_eq!(assembled, data);
}

#[tokio::test]
async fn test_add_tracked_file_already_have() {
    let temp = TempDir::new().unwrap();
    let data = sample_data(3 * PIECE_LEN as usize);
    std::fs::write(temp.path().join("seed.bin"), &data).unwrap();

    let descriptor = TorrentDescriptor::from_data("seed.bin", PIECE_LEN, &data).unwrap();
    let store = PieceStore::new(temp.path(), 64 * 1024);
    store.add_tracked_file(descriptor, true).await.unwrap();

    assert!(store.is_complete("seed.bin"));
    assert_eq!(store.wanted_len(), 0);
    let piece = store
        .read_piece(&PieceId::new("seed.bin", 2))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(piece.as_ref(), &data[2048..]);
}

#[tokio::test]
async fn test_add_tracked_file_with_corrupt_local_piece() {
    let temp = TempDir::new().unwrap();
    let data = sample_data(3 * PIECE_LEN as usize);
    let descriptor = TorrentDescriptor::from_data("seed.bin", PIECE_LEN, &data).unwrap();

    let mut corrupted = data.clone();
    corrupted[PIECE_LEN as usize + 3] ^= 0xFF;
    std::fs::write(temp.path().join("seed.bin"), &corrupted).unwrap();

    let store = PieceStore::new(temp.path(), 64 * 1024);
    store.add_tracked_file(descriptor, true).await.unwrap();

    let bitfield = store.current_bitfield("seed.bin").unwrap();
    assert_eq!(bitfield.available(), vec![0, 2]);
    assert!(store.is_wanted(&PieceId::new("seed.bin", 1)));
    assert_eq!(store.wanted_len(), 1);
}

#[tokio::test]
async fn test_write_unknown_file_or_index() {
    let temp = TempDir::new().unwrap();
    let data = sample_data(PIECE_LEN as usize);
    let (store, _) = create_test_store(&temp, &data).await;

    let result = store
        .write_piece(&PieceId::new("nope", 0), Bytes::from_static(b"x"))
        .await;
    assert!(matches!(result, Err(StorageError::UnknownFile(_))));

    let result = store
        .write_piece(&PieceId::new("test.dat", 5), Bytes::from_static(b"x"))
        .await;
    assert!(matches!(result, Err(StorageError::InvalidPieceIndex { .. })));
}

#[tokio::test]
async fn test_select_only_wanted_and_peer_held() {
    let temp = TempDir::new().unwrap();
    let data = sample_data(6 * PIECE_LEN as usize);
    let (store, _) = create_test_store(&temp, &data).await;

    store
        .write_piece(&PieceId::new("test.dat", 0), piece_bytes(&data, 0))
        .await
        .unwrap();
    store.mark_not_wanted(&PieceId::new("test.dat", 1));

    let mut peer_bits = Bitfield::new(6);
    for i in [0, 1, 3, 5] {
        peer_bits.set(i);
    }
    let mut peer = BitfieldMap::new();
    peer.insert("test.dat".to_string(), peer_bits);

    let mut picked = Vec::new();
    while let Some(piece) = store.select_request(&peer) {
        picked.push(piece.index);
    }
    picked.sort();
    assert_eq!(picked, vec![3, 5]);
    assert!(store.is_wanted(&PieceId::new("test.dat", 2)));
    assert!(store.is_wanted(&PieceId::new("test.dat", 4)));
}

#[tokio::test]
async fn test_released_request_is_selectable_again() {
    let temp = TempDir::new().unwrap();
    let data = sample_data(PIECE_LEN as usize);
    let (store, _) = create_test_store(&temp, &data).await;
    let peer = full_peer(1);

    let piece = store.select_request(&peer).unwrap();
    assert!(store.select_request(&peer).is_none());

    assert!(store.mark_wanted(&piece));
    assert_eq!(store.select_request(&peer), Some(piece));
}

#[tokio::test]
async fn test_mark_wanted_refuses_held_piece() {
    let temp = TempDir::new().unwrap();
    let data = sample_data(2 * PIECE_LEN as usize);
    let (store, _) = create_test_store(&temp, &data).await;
    let piece = PieceId::new("test.dat", 0);

    store.write_piece(&piece, piece_bytes(&data, 0)).await.unwrap();
    assert!(!store.mark_wanted(&piece));
    assert!(!store.mark_wanted(&PieceId::new("test.dat", 1)));
    assert!(!store.mark_wanted(&PieceId::new("test.dat", 9)));
}

#[tokio::test]
async fn test_rarer_piece_preferred() {
    let temp = TempDir::new().unwrap();
    let data = sample_data(6 * PIECE_LEN as usize);
    let (store, _) = create_test_store(&temp, &data).await;
    let store = store.with_selection_mode(SelectionMode::RarityWeighted);

    let common = PieceId::new("test.dat", 5);
    let rare = PieceId::new("test.dat", 2);
    for index in 0..6 {
        let piece = PieceId::new("test.dat", index);
        if piece != common && piece != rare {
            store.mark_not_wanted(&piece);
        }
    }
    // Piece 5 is held by three peers, piece 2 only by one.
    for _ in 0..3 {
        store.update_rarity(&common, 1);
    }
    store.update_rarity(&rare, 1);

    let peer = full_peer(6);
    let mut rare_hits = 0;
    let trials = 2000;
    for _ in 0..trials {
        let piece = store.select_request(&peer).unwrap();
        if piece == rare {
            rare_hits += 1;
        }
        store.mark_wanted(&piece);
    }

    assert!(
        rare_hits > trials * 55 / 100,
        "rare piece chosen {} of {} times",
        rare_hits,
        trials
    );
}

#[tokio::test]
async fn test_rarity_from_bitfield_and_forget() {
    let temp = TempDir::new().unwrap();
    let data = sample_data(4 * PIECE_LEN as usize);
    let (store, _) = create_test_store(&temp, &data).await;

    let mut bits = Bitfield::new(4);
    bits.set(1);
    bits.set(3);
    let first = store.update_rarity_from_bitfield("test.dat", &bits).unwrap();
    let second = store.update_rarity_from_bitfield("test.dat", &bits).unwrap();
    assert_eq!(first, bits);

    assert_eq!(store.rarity(&PieceId::new("test.dat", 1)), Some(2));
    assert_eq!(store.rarity(&PieceId::new("test.dat", 0)), Some(0));

    store.forget_peer_bitfield("test.dat", &first);
    assert_eq!(store.rarity(&PieceId::new("test.dat", 3)), Some(1));
    store.forget_peer_bitfield("test.dat", &second);
    assert_eq!(store.rarity(&PieceId::new("test.dat", 3)), Some(0));
}

#[tokio::test]
async fn test_bitfield_before_tracking_is_not_counted() {
    let temp = TempDir::new().unwrap();
    let data = sample_data(4 * PIECE_LEN as usize);
    let store = PieceStore::new(temp.path(), 64 * 1024);
    let full = Bitfield::full(4);

    assert!(store.update_rarity_from_bitfield("test.dat", &full).is_none());

    let descriptor = TorrentDescriptor::from_data("test.dat", PIECE_LEN, &data).unwrap();
    store.add_tracked_file(descriptor, false).await.unwrap();
    let counted = store.update_rarity_from_bitfield("test.dat", &full).unwrap();
    assert_eq!(store.rarity(&PieceId::new("test.dat", 0)), Some(1));

    store.forget_peer_bitfield("test.dat", &counted);
    assert_eq!(store.rarity(&PieceId::new("test.dat", 0)), Some(0));
}

#[tokio::test]
async fn test_failed_import_leaves_file_untracked() {
    let temp = TempDir::new().unwrap();
    let data = sample_data(4 * PIECE_LEN as usize);
    let descriptor = TorrentDescriptor::from_data("test.dat", PIECE_LEN, &data).unwrap();
    let store = PieceStore::new(temp.path(), 64 * 1024);

    // Nothing on disk to import.
    assert!(store.add_tracked_file(descriptor.clone(), true).await.is_err());
    assert!(store.tracked_files().is_empty());
    assert!(store.current_bitfield("test.dat").is_none());

    store.add_tracked_file(descriptor, false).await.unwrap();
    assert_eq!(store.wanted_len(), 4);
}

#[tokio::test]
async fn test_uniform_selection_stays_in_the_rarest_pool() {
    let temp = TempDir::new().unwrap();
    let data = sample_data(6 * PIECE_LEN as usize);
    let (store, _) = create_test_store(&temp, &data).await;
    let store = store.with_candidate_pool(2);
    for index in 0..4 {
        store.update_rarity(&PieceId::new("test.dat", index), 2);
    }

    let peer = full_peer(6);
    let mut seen = [0u32; 6];
    for _ in 0..400 {
        let piece = store.select_request(&peer).unwrap();
        seen[piece.index as usize] += 1;
        store.mark_wanted(&piece);
    }

    assert_eq!(&seen[..4], &[0, 0, 0, 0]);
    assert!(seen[4] > 0 && seen[5] > 0, "picks: {:?}", seen);
}

#[tokio::test]
async fn test_tracked_file_limit() {
    let temp = TempDir::new().unwrap();
    let store = PieceStore::new(temp.path(), 0);
    for i in 0..MAX_TRACKED_FILES {
        let descriptor = TorrentDescriptor::new(format!("f{}", i), 1, Vec::new()).unwrap();
        store.add_tracked_file(descriptor, false).await.unwrap();
    }

    let extra = TorrentDescriptor::new("extra", 1, Vec::new()).unwrap();
    assert!(matches!(
        store.add_tracked_file(extra, false).await,
        Err(StorageError::InvalidDescriptor(_))
    ));
    // Re-adding a known file still works at the limit.
    let known = TorrentDescriptor::new("f0", 1, Vec::new()).unwrap();
    store.add_tracked_file(known, false).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_rarity_updates() {
    let temp = TempDir::new().unwrap();
    let data = sample_data(8 * PIECE_LEN as usize);
    let (store, _) = create_test_store(&temp, &data).await;
    let store = Arc::new(store);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            for i in 0..8 {
                store.update_rarity(&PieceId::new("test.dat", i), 1);
            }
            for i in 0..8 {
                store.update_rarity(&PieceId::new("test.dat", i), -1);
            }
            store.update_rarity(&PieceId::new("test.dat", 4), 1);
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(store.rarity(&PieceId::new("test.dat", 4)), Some(8));
    assert_eq!(store.rarity(&PieceId::new("test.dat", 0)), Some(0));
    assert_eq!(store.wanted_len(), 8);
}

#[tokio::test]
async fn test_have_announcements() {
    let temp = TempDir::new().unwrap();
    let data = sample_data(2 * PIECE_LEN as usize);
    let (store, _) = create_test_store(&temp, &data).await;
    let mut haves = store.subscribe_haves();

    let piece = PieceId::new("test.dat", 1);
    store.write_piece(&piece, piece_bytes(&data, 1)).await.unwrap();

    assert_eq!(haves.try_recv().unwrap(), piece);
    assert!(haves.try_recv().is_err());
}

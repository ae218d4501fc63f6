use super::descriptor::TorrentDescriptor;
use super::disk::PieceDisk;
use super::error::StorageError;
use super::rarity::{RarityIndex, SelectionMode};
use crate::cache::PieceCache;
use crate::config::NodeConfig;
use crate::constants::{DEFAULT_CANDIDATE_POOL, HAVE_CHANNEL_CAPACITY, MAX_TRACKED_FILES};
use crate::peer::{Bitfield, BitfieldMap, PieceId};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;

struct TrackedFile {
    descriptor: TorrentDescriptor,
    bitfield: Bitfield,
}

#[derive(Default)]
struct StoreState {
    files: HashMap<String, TrackedFile>,
    rarity: RarityIndex,
}

/// Owner of all piece data and piece bookkeeping for one node.
///
/// Bitfields, rarity counts and the wanted set sit behind a single mutex
/// that is only held for in-memory updates. Disk I/O happens outside it, and
/// a bitfield bit is set only after the piece has been durably persisted.
///
/// Every connection task shares one store through an `Arc`.
pub struct PieceStore {
    state: Mutex<StoreState>,
    cache: Arc<PieceCache>,
    disk: PieceDisk,
    candidate_pool: usize,
    selection_mode: SelectionMode,
    have_tx: broadcast::Sender<PieceId>,
    assembly: tokio::sync::Mutex<()>,
}

impl PieceStore {
    /// Creates a store rooted at `base_dir` with a piece cache of
    /// `cache_bytes` bytes.
    pub fn new(base_dir: impl Into<PathBuf>, cache_bytes: usize) -> Self {
        let (have_tx, _) = broadcast::channel(HAVE_CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(StoreState::default()),
            cache: PieceCache::new(cache_bytes),
            disk: PieceDisk::new(base_dir),
            candidate_pool: DEFAULT_CANDIDATE_POOL,
            selection_mode: SelectionMode::default(),
            have_tx,
            assembly: tokio::sync::Mutex::new(()),
        }
    }

    /// Creates a store using the base directory, cache budget and selection
    /// settings of `config`.
    pub fn from_config(config: &NodeConfig) -> Self {
        Self::new(config.base_dir.clone(), config.cache_bytes)
            .with_candidate_pool(config.candidate_pool)
            .with_selection_mode(config.selection_mode)
    }

    pub fn with_candidate_pool(mut self, candidate_pool: usize) -> Self {
        self.candidate_pool = candidate_pool.max(1);
        self
    }

    pub fn with_selection_mode(mut self, selection_mode: SelectionMode) -> Self {
        self.selection_mode = selection_mode;
        self
    }

    pub fn base_dir(&self) -> &Path {
        self.disk.base_dir()
    }

    pub fn cache(&self) -> &Arc<PieceCache> {
        &self.cache
    }

    /// Receives every piece this store verifies from now on.
    pub fn subscribe_haves(&self) -> broadcast::Receiver<PieceId> {
        self.have_tx.subscribe()
    }

    /// Starts tracking a file.
    ///
    /// With `already_have`, `<base_dir>/<file_id>` is split into pieces, each
    /// verified and persisted; pieces that fail verification are wanted like
    /// any other missing piece. Otherwise every piece is wanted.
    ///
    /// Re-adding a tracked file keeps its state and adopts the new hashes.
    /// If the local import fails the file is not tracked afterwards.
    pub async fn add_tracked_file(
        &self,
        descriptor: TorrentDescriptor,
        already_have: bool,
    ) -> Result<(), StorageError> {
        let file_id = descriptor.file_id().to_string();
        let piece_count = descriptor.piece_count();

        {
            let mut state = self.state.lock();
            if let Some(tracked) = state.files.get_mut(&file_id) {
                if tracked.descriptor.piece_count() != piece_count {
                    return Err(StorageError::InvalidDescriptor(format!(
                        "{} already tracked with {} pieces",
                        file_id,
                        tracked.descriptor.piece_count()
                    )));
                }
                tracked.descriptor = descriptor;
                return Ok(());
            }
            if state.files.len() >= MAX_TRACKED_FILES {
                return Err(StorageError::InvalidDescriptor(format!(
                    "cannot track more than {} files",
                    MAX_TRACKED_FILES
                )));
            }

            state.rarity.track_file(&file_id, piece_count);
            state.files.insert(
                file_id.clone(),
                TrackedFile {
                    descriptor: descriptor.clone(),
                    bitfield: Bitfield::new(piece_count),
                },
            );
        }

        if already_have {
            if let Err(e) = self.import_local_file(&descriptor).await {
                // Rarity counts stay: peers already counted against them.
                self.state.lock().files.remove(&file_id);
                return Err(e);
            }
        }

        let mut state = self.state.lock();
        let StoreState { files, rarity } = &mut *state;
        if let Some(tracked) = files.get(&file_id) {
            for index in tracked.bitfield.missing() {
                rarity.insert_wanted(PieceId::new(file_id.as_str(), index as u32));
            }
            tracing::info!(
                "tracking {}: {}/{} pieces held",
                file_id,
                tracked.bitfield.count_ones(),
                piece_count
            );
        }
        Ok(())
    }

    async fn import_local_file(&self, descriptor: &TorrentDescriptor) -> Result<(), StorageError> {
        let file_id = descriptor.file_id();
        let data = self.disk.read_file(file_id).await?;

        for (index, chunk) in data.chunks(descriptor.piece_length() as usize).enumerate() {
            let index = index as u32;
            if !descriptor.verify(index, chunk) {
                tracing::warn!("local piece {}#{} failed verification", file_id, index);
                continue;
            }
            let piece = PieceId::new(file_id, index);
            self.disk.write_piece(&piece, chunk).await?;

            let mut state = self.state.lock();
            if let Some(tracked) = state.files.get_mut(file_id) {
                tracked.bitfield.set(index as usize);
            }
        }
        Ok(())
    }

    /// Returns the bytes of a held piece, or `None` if we do not hold it.
    pub async fn read_piece(&self, piece: &PieceId) -> Result<Option<Bytes>, StorageError> {
        if !self.holds(piece) {
            return Ok(None);
        }

        if let Some(data) = self.cache.get(piece) {
            return Ok(Some(data));
        }

        let data = self.disk.read_piece(piece).await?;
        self.cache.insert(piece.clone(), data.clone());
        Ok(Some(data))
    }

    /// Verifies and stores a piece.
    ///
    /// Returns `Ok(false)` without touching any state when the bytes do not
    /// match the descriptor. On success the piece is persisted, its bit set,
    /// it leaves the wanted set and is announced to subscribers; completing a
    /// file triggers reassembly.
    pub async fn write_piece(&self, piece: &PieceId, data: Bytes) -> Result<bool, StorageError> {
        let descriptor = {
            let state = self.state.lock();
            let tracked = state
                .files
                .get(&piece.file_id)
                .ok_or_else(|| StorageError::UnknownFile(piece.file_id.clone()))?;
            if piece.index as usize >= tracked.descriptor.piece_count() {
                return Err(StorageError::InvalidPieceIndex {
                    file_id: piece.file_id.clone(),
                    index: piece.index,
                });
            }
            if tracked.bitfield.has(piece.index as usize) {
                return Ok(true);
            }
            tracked.descriptor.clone()
        };

        if !descriptor.verify(piece.index, &data) {
            tracing::warn!("piece {} failed hash verification", piece);
            return Ok(false);
        }

        self.disk.write_piece(piece, &data).await?;

        let completed = {
            let mut state = self.state.lock();
            let StoreState { files, rarity } = &mut *state;
            let Some(tracked) = files.get_mut(&piece.file_id) else {
                return Err(StorageError::UnknownFile(piece.file_id.clone()));
            };
            let had = tracked.bitfield.assign(piece.index as usize, true);
            rarity.remove_wanted(piece);
            !had && tracked.bitfield.is_complete()
        };

        self.cache.insert(piece.clone(), data);
        let _ = self.have_tx.send(piece.clone());
        tracing::debug!("stored piece {}", piece);

        if completed {
            tracing::info!("all pieces of {} held", piece.file_id);
            if let Err(e) = self.reassemble(&piece.file_id).await {
                tracing::warn!("reassembly of {} failed: {}", piece.file_id, e);
            }
        }
        Ok(true)
    }

    /// Rebuilds `<base_dir>/<file_id>` from its pieces.
    pub async fn reassemble(&self, file_id: &str) -> Result<(), StorageError> {
        let piece_count = {
            let state = self.state.lock();
            state
                .files
                .get(file_id)
                .ok_or_else(|| StorageError::UnknownFile(file_id.to_string()))?
                .descriptor
                .piece_count()
        };

        let _guard = self.assembly.lock().await;
        self.disk.assemble(file_id, piece_count).await
    }

    /// Adjusts the number of peers known to hold `piece`.
    pub fn update_rarity(&self, piece: &PieceId, delta: i32) -> Option<u32> {
        self.state.lock().rarity.adjust(piece, delta)
    }

    /// Counts a newly announced peer bitfield.
    ///
    /// Returns what was counted, or `None` for a file we do not track. Only
    /// that value may later be passed to
    /// [`forget_peer_bitfield`](Self::forget_peer_bitfield).
    pub fn update_rarity_from_bitfield(&self, file_id: &str, bitfield: &Bitfield) -> Option<Bitfield> {
        let mut state = self.state.lock();
        if !state.files.contains_key(file_id) {
            return None;
        }
        state.rarity.add_bitfield(file_id, bitfield)
    }

    /// Removes a departed peer's counted bitfield from the counts.
    pub fn forget_peer_bitfield(&self, file_id: &str, counted: &Bitfield) {
        self.state.lock().rarity.remove_bitfield(file_id, counted);
    }

    /// Adds a missing piece to the wanted set. Held pieces are refused.
    pub fn mark_wanted(&self, piece: &PieceId) -> bool {
        let mut state = self.state.lock();
        let missing = state
            .files
            .get(&piece.file_id)
            .is_some_and(|f| {
                (piece.index as usize) < f.bitfield.len() && !f.bitfield.has(piece.index as usize)
            });
        missing && state.rarity.insert_wanted(piece.clone())
    }

    pub fn mark_not_wanted(&self, piece: &PieceId) -> bool {
        self.state.lock().rarity.remove_wanted(piece)
    }

    /// Picks the next piece to request from a peer holding `peer_bitfields`
    /// and takes it out of the wanted set.
    pub fn select_request(&self, peer_bitfields: &BitfieldMap) -> Option<PieceId> {
        let mut state = self.state.lock();
        state.rarity.select(
            |piece| {
                peer_bitfields
                    .get(&piece.file_id)
                    .is_some_and(|bf| bf.has(piece.index as usize))
            },
            self.candidate_pool,
            self.selection_mode,
            &mut rand::rng(),
        )
    }

    pub fn current_bitfield(&self, file_id: &str) -> Option<Bitfield> {
        self.state
            .lock()
            .files
            .get(file_id)
            .map(|f| f.bitfield.clone())
    }

    /// Snapshot of every tracked file's bitfield.
    pub fn bitfields(&self) -> BitfieldMap {
        self.state
            .lock()
            .files
            .iter()
            .map(|(id, f)| (id.clone(), f.bitfield.clone()))
            .collect()
    }

    pub fn holds(&self, piece: &PieceId) -> bool {
        self.state
            .lock()
            .files
            .get(&piece.file_id)
            .is_some_and(|f| f.bitfield.has(piece.index as usize))
    }

    pub fn is_complete(&self, file_id: &str) -> bool {
        self.state
            .lock()
            .files
            .get(file_id)
            .is_some_and(|f| f.bitfield.is_complete())
    }

    pub fn tracked_files(&self) -> Vec<String> {
        let mut files: Vec<String> = self.state.lock().files.keys().cloned().collect();
        files.sort();
        files
    }

    pub fn rarity(&self, piece: &PieceId) -> Option<u32> {
        self.state.lock().rarity.count(piece)
    }

    pub fn is_wanted(&self, piece: &PieceId) -> bool {
        self.state.lock().rarity.is_wanted(piece)
    }

    pub fn wanted_len(&self) -> usize {
        self.state.lock().rarity.wanted_len()
    }
}

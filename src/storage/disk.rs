use super::error::StorageError;
use crate::constants::PIECES_DIR;
use crate::peer::PieceId;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;

/// Durable storage: one file per verified piece plus reassembled outputs.
///
/// Layout under `base_dir`:
/// - `<file_id>`: the complete file, written once every piece is held
/// - `.pieces/<file_id>.<index>`: one verified piece
///
/// Writes go to a temporary name first and are renamed into place, so a
/// piece file either holds the full verified bytes or does not exist.
#[derive(Debug, Clone)]
pub struct PieceDisk {
    base_dir: PathBuf,
    pieces_dir: PathBuf,
}

impl PieceDisk {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        let pieces_dir = base_dir.join(PIECES_DIR);
        Self {
            base_dir,
            pieces_dir,
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn piece_path(&self, piece: &PieceId) -> PathBuf {
        self.pieces_dir
            .join(format!("{}.{}", piece.file_id, piece.index))
    }

    pub fn file_path(&self, file_id: &str) -> PathBuf {
        self.base_dir.join(file_id)
    }

    pub async fn write_piece(&self, piece: &PieceId, data: &[u8]) -> Result<(), StorageError> {
        fs::create_dir_all(&self.pieces_dir).await?;

        let path = self.piece_path(piece);
        let tmp = self.pieces_dir.join(format!(
            "{}.{}.{:08x}.part",
            piece.file_id,
            piece.index,
            rand::random::<u32>()
        ));
        write_synced(&tmp, &[data]).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    pub async fn read_piece(&self, piece: &PieceId) -> Result<Bytes, StorageError> {
        let data = fs::read(self.piece_path(piece)).await?;
        Ok(Bytes::from(data))
    }

    /// Reads a whole file from the base directory.
    pub async fn read_file(&self, file_id: &str) -> Result<Bytes, StorageError> {
        let data = fs::read(self.file_path(file_id)).await?;
        Ok(Bytes::from(data))
    }

    /// Concatenates pieces `0..piece_count` into `<base_dir>/<file_id>`.
    ///
    /// Safe to repeat: the output is rebuilt and atomically replaced.
    pub async fn assemble(&self, file_id: &str, piece_count: usize) -> Result<(), StorageError> {
        fs::create_dir_all(&self.pieces_dir).await?;

        let mut pieces = Vec::with_capacity(piece_count);
        for index in 0..piece_count {
            pieces.push(self.read_piece(&PieceId::new(file_id, index as u32)).await?);
        }

        let tmp = self
            .pieces_dir
            .join(format!("{}.{:08x}.assembling", file_id, rand::random::<u32>()));
        let chunks: Vec<&[u8]> = pieces.iter().map(|p| p.as_ref()).collect();
        write_synced(&tmp, &chunks).await?;
        fs::rename(&tmp, self.file_path(file_id)).await?;

        tracing::debug!("reassembled {} from {} pieces", file_id, piece_count);
        Ok(())
    }
}

async fn write_synced(path: &Path, chunks: &[&[u8]]) -> Result<(), StorageError> {
    let mut file = File::create(path).await?;
    for chunk in chunks {
        file.write_all(chunk).await?;
    }
    file.sync_data().await?;
    Ok(())
}

use super::error::StorageError;
use crate::constants::{MAX_ID_LEN, PIECE_HASH_LEN};
use sha1::{Digest, Sha1};
use std::path::{Component, Path};

/// Immutable description of one tracked file.
///
/// Holds the piece geometry and the SHA-1 of every piece; the store uses it
/// only to verify incoming bytes. Loading it from disk is the caller's job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentDescriptor {
    file_id: String,
    piece_length: u64,
    hashes: Vec<[u8; PIECE_HASH_LEN]>,
}

impl TorrentDescriptor {
    pub fn new(
        file_id: impl Into<String>,
        piece_length: u64,
        hashes: Vec<[u8; PIECE_HASH_LEN]>,
    ) -> Result<Self, StorageError> {
        let file_id = file_id.into();
        validate_file_id(&file_id)?;

        if piece_length == 0 {
            return Err(StorageError::InvalidDescriptor(
                "piece length must be positive".into(),
            ));
        }
        if u32::try_from(hashes.len()).is_err() {
            return Err(StorageError::InvalidDescriptor(format!(
                "too many pieces: {}",
                hashes.len()
            )));
        }

        Ok(Self {
            file_id,
            piece_length,
            hashes,
        })
    }

    /// Builds a descriptor by splitting `data` into pieces and hashing each.
    pub fn from_data(
        file_id: impl Into<String>,
        piece_length: u64,
        data: &[u8],
    ) -> Result<Self, StorageError> {
        if piece_length == 0 {
            return Err(StorageError::InvalidDescriptor(
                "piece length must be positive".into(),
            ));
        }

        let hashes = data
            .chunks(piece_length as usize)
            .map(hash_piece)
            .collect();
        Self::new(file_id, piece_length, hashes)
    }

    pub fn file_id(&self) -> &str {
        &self.file_id
    }

    pub fn piece_length(&self) -> u64 {
        self.piece_length
    }

    pub fn piece_count(&self) -> usize {
        self.hashes.len()
    }

    pub fn piece_hash(&self, index: u32) -> Option<&[u8; PIECE_HASH_LEN]> {
        self.hashes.get(index as usize)
    }

    /// Returns true if `data` hashes to the recorded value for `index`.
    pub fn verify(&self, index: u32, data: &[u8]) -> bool {
        match self.piece_hash(index) {
            Some(expected) => data.len() as u64 <= self.piece_length && hash_piece(data) == *expected,
            None => false,
        }
    }
}

pub fn hash_piece(data: &[u8]) -> [u8; PIECE_HASH_LEN] {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// A file id names a file directly inside the base directory.
pub(crate) fn validate_file_id(file_id: &str) -> Result<(), StorageError> {
    if file_id.len() > MAX_ID_LEN {
        return Err(StorageError::InvalidDescriptor(format!(
            "file id is {} bytes, at most {} allowed",
            file_id.len(),
            MAX_ID_LEN
        )));
    }
    let mut components = Path::new(file_id).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) if !file_id.starts_with('.') => Ok(()),
        _ => Err(StorageError::PathTraversal(file_id.to_string())),
    }
}

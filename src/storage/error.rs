use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("file not tracked: {0}")]
    UnknownFile(String),

    #[error("invalid piece index {index} for file {file_id}")]
    InvalidPieceIndex { file_id: String, index: u32 },

    #[error("invalid descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("path traversal detected in file id: {0}")]
    PathTraversal(String),
}

use crate::peer::PeerError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("peer error: {0}")]
    Peer(#[from] PeerError),

    #[error("tracker returned error {code}: {message}")]
    Tracker { code: u32, message: String },

    #[error("node is shutting down")]
    ShuttingDown,
}

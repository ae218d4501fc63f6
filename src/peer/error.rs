use thiserror::Error;

/// Errors that can occur during peer communication.
///
/// `Io`, `ConnectionClosed`, `FrameTooLarge` and `Timeout` are transport
/// failures; the rest mean the peer broke the protocol. Either way only the
/// connection that produced the error is torn down.
#[derive(Debug, Error)]
pub enum PeerError {
    /// Network I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection was closed by the peer.
    #[error("connection closed")]
    ConnectionClosed,

    /// A frame advertised a length above the configured maximum.
    #[error("frame too large: {len} bytes (max {max})")]
    FrameTooLarge { len: u64, max: usize },

    /// Operation timed out.
    #[error("timeout")]
    Timeout,

    /// Received a malformed protocol message.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Received an unknown message tag.
    #[error("invalid message id: {0}")]
    InvalidMessageId(u8),

    /// Protocol violation by the peer.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl PeerError {
    /// Returns true for failures of the underlying byte stream.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            PeerError::Io(_)
                | PeerError::ConnectionClosed
                | PeerError::FrameTooLarge { .. }
                | PeerError::Timeout
        )
    }
}

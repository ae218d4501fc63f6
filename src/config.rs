//! Node configuration.

use crate::constants::{
    DEFAULT_CANDIDATE_POOL, DEFAULT_IDLE_BACKOFF, DEFAULT_PIECE_CACHE_BYTES, DEFAULT_PIECE_LENGTH,
    DEFAULT_PORT, MAX_FRAME_LEN,
};
use crate::storage::SelectionMode;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Settings for one node: where it listens, who it is, and where its pieces
/// live.
///
/// # Examples
///
/// ```
/// use swarmwire::config::NodeConfig;
/// use std::time::Duration;
///
/// let config = NodeConfig::new("node-a", "./data")
///     .with_listen_addr("127.0.0.1:0".parse().unwrap())
///     .with_cache_bytes(4 * 1024 * 1024)
///     .with_read_timeout(Some(Duration::from_secs(30)));
///
/// assert_eq!(config.peer_id, "node-a");
/// ```
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub listen_addr: SocketAddr,
    /// Identifies this node in Bitfield messages and tracker peer lists.
    pub peer_id: String,
    /// Directory holding the tracked files; pieces go under `.pieces/`.
    pub base_dir: PathBuf,
    /// Piece length for descriptors this node creates.
    pub piece_length: u64,
    pub cache_bytes: usize,
    pub max_frame_len: usize,
    /// Number of rarest candidates a piece is randomly picked from.
    pub candidate_pool: usize,
    pub selection_mode: SelectionMode,
    /// `None` waits for the peer indefinitely.
    pub read_timeout: Option<Duration>,
    pub idle_backoff: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_PORT),
            peer_id: String::new(),
            base_dir: PathBuf::from("."),
            piece_length: DEFAULT_PIECE_LENGTH,
            cache_bytes: DEFAULT_PIECE_CACHE_BYTES,
            max_frame_len: MAX_FRAME_LEN,
            candidate_pool: DEFAULT_CANDIDATE_POOL,
            selection_mode: SelectionMode::Uniform,
            read_timeout: None,
            idle_backoff: DEFAULT_IDLE_BACKOFF,
        }
    }
}

impl NodeConfig {
    pub fn new(peer_id: impl Into<String>, base_dir: impl Into<PathBuf>) -> Self {
        Self {
            peer_id: peer_id.into(),
            base_dir: base_dir.into(),
            ..Self::default()
        }
    }

    pub fn with_listen_addr(mut self, listen_addr: SocketAddr) -> Self {
        self.listen_addr = listen_addr;
        self
    }

    pub fn with_piece_length(mut self, piece_length: u64) -> Self {
        self.piece_length = piece_length;
        self
    }

    pub fn with_cache_bytes(mut self, cache_bytes: usize) -> Self {
        self.cache_bytes = cache_bytes;
        self
    }

    pub fn with_max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }

    pub fn with_candidate_pool(mut self, candidate_pool: usize) -> Self {
        self.candidate_pool = candidate_pool;
        self
    }

    pub fn with_selection_mode(mut self, selection_mode: SelectionMode) -> Self {
        self.selection_mode = selection_mode;
        self
    }

    pub fn with_read_timeout(mut self, read_timeout: Option<Duration>) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    pub fn with_idle_backoff(mut self, idle_backoff: Duration) -> Self {
        self.idle_backoff = idle_backoff;
        self
    }
}

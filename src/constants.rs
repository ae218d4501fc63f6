//! Protocol constants and tuning parameters.
//!
//! Defaults for the framing layer, the piece store and the connection
//! manager. Everything here can be overridden through
//! [`NodeConfig`](crate::config::NodeConfig) or the store's builder methods.

use std::time::Duration;

// ============================================================================
// Ports
// ============================================================================

/// Default peer listen port
pub const DEFAULT_PORT: u16 = 7889;

// ============================================================================
// Framing
// ============================================================================

/// Size of the big-endian length prefix in front of every frame
pub const FRAME_HEADER_LEN: usize = 8;

/// Largest frame payload we accept (64 MiB)
/// Anything above this is treated as a malformed length prefix.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Longest peer or file id a u16 length prefix can carry
pub const MAX_ID_LEN: usize = u16::MAX as usize;

/// Most files a Bitfield message can list
pub const MAX_TRACKED_FILES: usize = u16::MAX as usize;

/// Initial capacity of the per-connection read buffer
pub const READ_BUFFER_CAPACITY: usize = 32 * 1024;

// ============================================================================
// Pieces
// ============================================================================

/// Default piece length in bytes
pub const DEFAULT_PIECE_LENGTH: u64 = 4096;

/// Length of a SHA-1 piece hash
pub const PIECE_HASH_LEN: usize = 20;

/// Directory (relative to the base dir) holding one file per verified piece
pub const PIECES_DIR: &str = ".pieces";

/// Default byte budget of the in-memory piece cache (1 MiB)
pub const DEFAULT_PIECE_CACHE_BYTES: usize = 1024 * 1024;

// ============================================================================
// Selection
// ============================================================================

/// Number of lowest-rarity candidates the random pick is drawn from
pub const DEFAULT_CANDIDATE_POOL: usize = 10;

/// Capacity of the channel announcing freshly verified pieces to connections
pub const HAVE_CHANNEL_CAPACITY: usize = 256;

// ============================================================================
// Connections
// ============================================================================

/// Delay before answering a KeepAlive with another KeepAlive
/// Keeps idle request/response alternation from spinning.
pub const DEFAULT_IDLE_BACKOFF: Duration = Duration::from_millis(50);

/// Timeout for establishing an outbound TCP connection
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on how long `shutdown` waits for connection tasks to finish
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

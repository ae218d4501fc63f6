//! swarmwire - peer-to-peer file distribution
//!
//! Nodes split tracked files into fixed-size, SHA-1 verified pieces and trade
//! them over a framed TCP protocol, always fetching the rarest pieces first.
//!
//! # Modules
//!
//! - [`peer`] - Framing, wire messages and the per-connection state machine
//! - [`storage`] - Piece verification, persistence, rarity and selection
//! - [`cache`] - In-memory piece cache
//! - [`manager`] - Listener, outbound connections and shutdown
//! - [`tracker`] - Values exchanged with the peer directory
//! - [`config`] - Node settings

pub mod cache;
pub mod config;
pub mod constants;
pub mod manager;
pub mod peer;
pub mod storage;
pub mod tracker;

pub use cache::PieceCache;
pub use config::NodeConfig;
pub use manager::{ConnectionInfo, ConnectionManager, ManagerError};
pub use peer::{
    Bitfield, BitfieldMap, ChokingState, Direction, FrameTransport, Message, PeerConnection,
    PeerError, PeerSession, PieceId,
};
pub use storage::{PieceStore, SelectionMode, StorageError, TorrentDescriptor};
pub use tracker::{AnnounceRequest, AnnounceResponse, TrackerEvent, TrackerPeer};

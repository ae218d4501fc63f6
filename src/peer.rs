//! Peer wire protocol.
//!
//! Peers exchange length-prefixed frames (an 8-byte big-endian length and
//! the payload) over TCP. Each payload is one [`Message`]. A connection opens
//! with a Bitfield exchange and then strictly alternates: every message
//! received is answered with exactly one message.
//!
//! # Components
//!
//! - [`FrameTransport`] - Framing over any async byte stream
//! - [`Message`] - Message encoding and decoding
//! - [`PeerSession`] - Choke/interest state and reply selection
//! - [`PeerConnection`] - Drives a session over a socket

mod bitfield;
mod choking;
mod connection;
mod error;
mod message;
mod piece;
mod session;
mod transport;

pub use bitfield::Bitfield;
pub use choking::ChokingState;
pub(crate) use connection::closed;
pub(crate) use message::check_id_len;
pub use connection::{Direction, PeerConnection};
pub use error::PeerError;
pub use message::{BitfieldMap, Message, MessageId};
pub use piece::PieceId;
pub use session::{PeerSession, Reply};
pub use transport::FrameTransport;

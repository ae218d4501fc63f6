//! Tracker boundary types.
//!
//! The tracker is an external directory of active peers. A node announces
//! itself with an [`AnnounceRequest`] and receives an [`AnnounceResponse`]
//! listing the peers to connect to; transporting those values is left to the
//! embedding application. [`ConnectionManager::join`](crate::manager::ConnectionManager::join)
//! consumes the response.

use std::net::{IpAddr, SocketAddr};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerEvent {
    /// The node joins the network.
    Started,
    /// The node finished its downloads.
    Completed,
    /// The node leaves the network.
    Stopped,
}

impl TrackerEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackerEvent::Started => "started",
            TrackerEvent::Completed => "completed",
            TrackerEvent::Stopped => "stopped",
        }
    }
}

/// What a node tells the tracker about itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnounceRequest {
    pub peer_id: String,
    pub ip: IpAddr,
    pub port: u16,
    pub event: TrackerEvent,
}

impl AnnounceRequest {
    pub fn new(peer_id: impl Into<String>, addr: SocketAddr, event: TrackerEvent) -> Self {
        Self {
            peer_id: peer_id.into(),
            ip: addr.ip(),
            port: addr.port(),
            event,
        }
    }
}

/// A peer returned by the tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerPeer {
    pub peer_id: String,
    pub ip: IpAddr,
    pub port: u16,
}

impl TrackerPeer {
    pub fn new(peer_id: impl Into<String>, addr: SocketAddr) -> Self {
        Self {
            peer_id: peer_id.into(),
            ip: addr.ip(),
            port: addr.port(),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

/// The tracker's answer to an announce.
///
/// A non-zero `error_code` means the request was refused; `message` then
/// says why and `peers` is empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnounceResponse {
    pub error_code: u32,
    pub message: Option<String>,
    pub peers: Vec<TrackerPeer>,
}

impl AnnounceResponse {
    pub fn ok(peers: Vec<TrackerPeer>) -> Self {
        Self {
            error_code: 0,
            message: None,
            peers,
        }
    }

    pub fn error(error_code: u32, message: impl Into<String>) -> Self {
        Self {
            error_code,
            message: Some(message.into()),
            peers: Vec::new(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error_code == 0
    }
}

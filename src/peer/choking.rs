/// The four choke/interest flags of one connection.
///
/// `am_*` describe what we signal to the peer, `peer_*` what the peer
/// signalled to us. A new connection starts mutually choked and
/// uninterested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChokingState {
    /// We refuse to serve the peer's requests.
    pub am_choking: bool,
    /// We want to download from the peer.
    pub am_interested: bool,
    /// The peer refuses to serve our requests.
    pub peer_choking: bool,
    /// The peer wants to download from us.
    pub peer_interested: bool,
}

impl Default for ChokingState {
    fn default() -> Self {
        Self {
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
        }
    }
}

impl ChokingState {
    /// We may send data to the peer.
    pub fn can_upload(&self) -> bool {
        !self.am_choking && self.peer_interested
    }

    /// The peer will answer our requests.
    pub fn can_download(&self) -> bool {
        !self.peer_choking && self.am_interested
    }
}

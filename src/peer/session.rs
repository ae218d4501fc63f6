//! Per-connection protocol state machine.
//!
//! A [`PeerSession`] consumes one decoded message at a time, updates its
//! choke/interest flags and the shared [`PieceStore`], and decides the single
//! message to send back. It does no I/O of its own beyond the store calls;
//! [`PeerConnection`](super::PeerConnection) drives it over a socket.
//!
//! When several replies would apply, the first match wins:
//!
//! 1. our Bitfield, when the peer's Bitfield opened the exchange
//! 2. ServerClose, when the peer closed or we are shutting down
//! 3. Choke/Unchoke answering NotInterested/Interested
//! 4. the requested Piece, if we are not choking an interested peer
//! 5. our outstanding Request (or NotInterested if nothing is left to fetch),
//!    when the peer unchoked us and we are interested
//! 6. Interested, when choked and uninterested but a wanted piece is available
//! 7. a pending Have announcement, otherwise KeepAlive

use super::choking::ChokingState;
use super::error::PeerError;
use super::message::{BitfieldMap, Message};
use super::piece::PieceId;
use super::Bitfield;
use crate::storage::PieceStore;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::TryRecvError};
use tokio::sync::watch;
use tracing::{debug, trace, warn};

/// The message to send after handling an inbound one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub message: Message,
    /// The connection ends once `message` is sent.
    pub terminate: bool,
}

impl Reply {
    fn send(message: Message) -> Self {
        Self {
            message,
            terminate: false,
        }
    }

    fn close() -> Self {
        Self {
            message: Message::ServerClose,
            terminate: true,
        }
    }
}

pub struct PeerSession {
    store: Arc<PieceStore>,
    local_peer_id: String,
    remote_peer_id: Option<String>,
    choking: ChokingState,
    peer_bitfields: Option<BitfieldMap>,
    /// The part of the peer's pieces currently added to the store's rarity
    /// counts. Files we did not track when the peer announced them are
    /// missing here until a Have arrives for them.
    counted: BitfieldMap,
    outstanding: Option<PieceId>,
    haves: broadcast::Receiver<PieceId>,
    pending_haves: VecDeque<PieceId>,
    shutdown: watch::Receiver<bool>,
}

impl PeerSession {
    pub fn new(
        store: Arc<PieceStore>,
        local_peer_id: impl Into<String>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let haves = store.subscribe_haves();
        Self {
            store,
            local_peer_id: local_peer_id.into(),
            remote_peer_id: None,
            choking: ChokingState::default(),
            peer_bitfields: None,
            counted: BitfieldMap::new(),
            outstanding: None,
            haves,
            pending_haves: VecDeque::new(),
            shutdown,
        }
    }

    /// Our Bitfield message, tagged with our peer id.
    pub fn bitfield_message(&self) -> Message {
        Message::Bitfield {
            peer_id: Some(self.local_peer_id.clone()),
            bitfields: self.store.bitfields(),
        }
    }

    pub fn choking(&self) -> &ChokingState {
        &self.choking
    }

    pub fn outstanding(&self) -> Option<&PieceId> {
        self.outstanding.as_ref()
    }

    pub fn peer_bitfields(&self) -> Option<&BitfieldMap> {
        self.peer_bitfields.as_ref()
    }

    /// The id the peer announced in its Bitfield, if any.
    pub fn remote_peer_id(&self) -> Option<&str> {
        self.remote_peer_id.as_deref()
    }

    /// Handles one inbound message and returns the reply.
    ///
    /// `first_exchange` is set on the passive side for the peer's opening
    /// Bitfield, which we answer with our own.
    pub async fn handle(&mut self, message: Message, first_exchange: bool) -> Result<Reply, PeerError> {
        trace!("received {}", message.kind());

        let mut reply_bitfield = false;
        let mut closing = false;
        let mut interest_reply = None;
        let mut requested = None;

        match message {
            Message::KeepAlive => {}
            Message::Choke => self.choking.peer_choking = true,
            Message::Unchoke => self.choking.peer_choking = false,
            Message::Interested => {
                self.choking.peer_interested = true;
                self.choking.am_choking = false;
                interest_reply = Some(Message::Unchoke);
            }
            Message::NotInterested => {
                self.choking.peer_interested = false;
                self.choking.am_choking = true;
                interest_reply = Some(Message::Choke);
            }
            Message::Have { file, index, have } => self.on_have(file, index, have)?,
            Message::Bitfield { peer_id, bitfields } => {
                self.on_bitfield(peer_id, bitfields)?;
                reply_bitfield = first_exchange;
            }
            Message::Request { file, index } => requested = Some(PieceId::new(file, index)),
            Message::Piece { file, index, data } => {
                self.on_piece(PieceId::new(file, index), data).await
            }
            Message::ServerClose => closing = true,
        }

        if *self.shutdown.borrow() {
            closing = true;
        }

        if reply_bitfield {
            return Ok(Reply::send(self.bitfield_message()));
        }
        if closing {
            return Ok(Reply::close());
        }
        if let Some(message) = interest_reply {
            return Ok(Reply::send(message));
        }
        if let Some(piece) = requested {
            if let Some(message) = self.serve(&piece).await {
                return Ok(Reply::send(message));
            }
        }

        if self.choking.can_download() {
            if self.outstanding.is_none() {
                self.outstanding = self.select();
            }
            return Ok(Reply::send(match &self.outstanding {
                Some(piece) => Message::request(piece),
                None => {
                    self.choking.am_interested = false;
                    Message::NotInterested
                }
            }));
        }

        if self.choking.peer_choking && !self.choking.am_interested {
            if let Some(piece) = self.outstanding.take() {
                self.store.mark_wanted(&piece);
            }
            if let Some(piece) = self.select() {
                debug!("interested in {}", piece);
                self.outstanding = Some(piece);
                self.choking.am_interested = true;
                return Ok(Reply::send(Message::Interested));
            }
        }

        Ok(Reply::send(self.next_have().unwrap_or(Message::KeepAlive)))
    }

    /// Gives back everything this connection holds in the shared store: the
    /// outstanding request returns to the wanted set and the peer's pieces
    /// stop counting towards rarity. Safe to call more than once.
    pub fn release(&mut self) {
        if let Some(piece) = self.outstanding.take() {
            debug!("releasing request for {}", piece);
            self.store.mark_wanted(&piece);
        }
        for (file_id, counted) in std::mem::take(&mut self.counted) {
            self.store.forget_peer_bitfield(&file_id, &counted);
        }
        self.peer_bitfields = None;
    }

    fn on_bitfield(
        &mut self,
        peer_id: Option<String>,
        bitfields: BitfieldMap,
    ) -> Result<(), PeerError> {
        if self.peer_bitfields.is_some() {
            return Err(PeerError::Protocol("bitfield sent twice".into()));
        }
        for (file_id, bitfield) in &bitfields {
            match self.store.update_rarity_from_bitfield(file_id, bitfield) {
                Some(counted) => {
                    self.counted.insert(file_id.clone(), counted);
                }
                None => trace!("not counting bitfield for untracked file {}", file_id),
            }
        }
        if peer_id.is_some() {
            self.remote_peer_id = peer_id;
        }
        self.peer_bitfields = Some(bitfields);
        Ok(())
    }

    fn on_have(&mut self, file: String, index: u32, have: bool) -> Result<(), PeerError> {
        let Some(peer) = self.peer_bitfields.as_mut() else {
            return Err(PeerError::Protocol("have before bitfield".into()));
        };

        if !peer.contains_key(&file) {
            // Only files we track have a known piece count.
            let Some(ours) = self.store.current_bitfield(&file) else {
                trace!("ignoring have for untracked file {}", file);
                return Ok(());
            };
            peer.insert(file.clone(), Bitfield::new(ours.len()));
        }
        let Some(bitfield) = peer.get_mut(&file) else {
            return Ok(());
        };
        if index as usize >= bitfield.len() {
            debug!("ignoring have for {}#{}: out of range", file, index);
            return Ok(());
        }

        if !self.counted.contains_key(&file) {
            // Tracked since the peer's Bitfield: start counting what we know.
            if let Some(counted) = self.store.update_rarity_from_bitfield(&file, bitfield) {
                self.counted.insert(file.clone(), counted);
            }
        }
        bitfield.assign(index as usize, have);

        let Some(counted) = self.counted.get_mut(&file) else {
            return Ok(());
        };
        if index as usize >= counted.len() {
            return Ok(());
        }
        let previous = counted.assign(index as usize, have);
        if previous != have {
            let delta = if have { 1 } else { -1 };
            self.store.update_rarity(&PieceId::new(file, index), delta);
        }
        Ok(())
    }

    async fn on_piece(&mut self, piece: PieceId, data: Bytes) {
        if self.outstanding.as_ref() != Some(&piece) {
            debug!("discarding unsolicited piece {}", piece);
            return;
        }
        self.outstanding = None;

        match self.store.write_piece(&piece, data).await {
            Ok(true) => {}
            Ok(false) => {
                self.store.mark_wanted(&piece);
            }
            Err(e) => {
                warn!("failed to store piece {}: {}", piece, e);
                self.store.mark_wanted(&piece);
            }
        }
    }

    async fn serve(&self, piece: &PieceId) -> Option<Message> {
        if !self.choking.can_upload() {
            debug!("not serving {} to a choked peer", piece);
            return None;
        }

        match self.store.read_piece(piece).await {
            Ok(Some(data)) => Some(Message::Piece {
                file: piece.file_id.clone(),
                index: piece.index,
                data,
            }),
            Ok(None) => {
                debug!("peer requested {} which we do not hold", piece);
                None
            }
            Err(e) => {
                warn!("failed to read piece {}: {}", piece, e);
                None
            }
        }
    }

    fn select(&self) -> Option<PieceId> {
        let peer = self.peer_bitfields.as_ref()?;
        self.store.select_request(peer)
    }

    fn next_have(&mut self) -> Option<Message> {
        loop {
            match self.haves.try_recv() {
                Ok(piece) => self.pending_haves.push_back(piece),
                Err(TryRecvError::Lagged(skipped)) => {
                    debug!("missed {} have announcements", skipped)
                }
                Err(_) => break,
            }
        }

        while let Some(piece) = self.pending_haves.pop_front() {
            let peer_has = self
                .peer_bitfields
                .as_ref()
                .and_then(|p| p.get(&piece.file_id))
                .is_some_and(|bf| bf.has(piece.index as usize));
            if !peer_has {
                return Some(Message::have(&piece));
            }
        }
        None
    }
}

impl Drop for PeerSession {
    fn drop(&mut self) {
        self.release();
    }
}

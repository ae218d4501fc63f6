use super::error::PeerError;
use super::message::{check_id_len, Message};
use super::session::{PeerSession, Reply};
use super::transport::FrameTransport;
use crate::constants::DEFAULT_IDLE_BACKOFF;
use crate::storage::PieceStore;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, trace};

/// Which side opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// We dialed the peer and sent the first Bitfield.
    Outbound,
    /// The peer dialed us; its Bitfield opens the exchange.
    Inbound,
}

/// A connection to one peer: a framed stream driven by a [`PeerSession`].
///
/// Construction performs the bitfield exchange. [`run`](Self::run) then
/// alternates reply and receive until either side closes, an error occurs or
/// the shutdown flag is raised. Whatever the outcome, the session's
/// outstanding request and rarity contributions are released.
///
/// # Examples
///
/// ```no_run
/// use swarmwire::peer::{FrameTransport, PeerConnection};
/// use swarmwire::storage::PieceStore;
/// use std::sync::Arc;
/// use tokio::net::TcpStream;
/// use tokio::sync::watch;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = Arc::new(PieceStore::new("./data", 1024 * 1024));
/// let (_shutdown_tx, shutdown_rx) = watch::channel(false);
///
/// let stream = TcpStream::connect("127.0.0.1:7889").await?;
/// let transport = FrameTransport::new(stream);
/// let conn = PeerConnection::outbound(transport, store, "node-a", shutdown_rx).await?;
/// conn.run().await?;
/// # Ok(())
/// # }
/// ```
pub struct PeerConnection<S = TcpStream> {
    transport: FrameTransport<S>,
    session: PeerSession,
    direction: Direction,
    shutdown: watch::Receiver<bool>,
    idle_backoff: Duration,
    pending: Option<Reply>,
    connected_at: Instant,
}

impl<S> PeerConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Sends our Bitfield and waits for the peer's.
    pub async fn outbound(
        transport: FrameTransport<S>,
        store: Arc<PieceStore>,
        local_peer_id: impl Into<String>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self, PeerError> {
        let local_peer_id = local_peer_id.into();
        check_id_len(&local_peer_id, "peer id")?;
        let session = PeerSession::new(store, local_peer_id, shutdown.clone());
        let mut conn = Self::with_session(transport, session, Direction::Outbound, shutdown);

        let bitfield = conn.session.bitfield_message();
        conn.send(&bitfield).await?;
        conn.handshake(false).await?;
        Ok(conn)
    }

    /// Waits for the peer's opening Bitfield; ours goes out as the first
    /// reply of [`run`](Self::run).
    pub async fn inbound(
        transport: FrameTransport<S>,
        store: Arc<PieceStore>,
        local_peer_id: impl Into<String>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self, PeerError> {
        let local_peer_id = local_peer_id.into();
        check_id_len(&local_peer_id, "peer id")?;
        let session = PeerSession::new(store, local_peer_id, shutdown.clone());
        let mut conn = Self::with_session(transport, session, Direction::Inbound, shutdown);
        conn.handshake(true).await?;
        Ok(conn)
    }

    fn with_session(
        transport: FrameTransport<S>,
        session: PeerSession,
        direction: Direction,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            transport,
            session,
            direction,
            shutdown,
            idle_backoff: DEFAULT_IDLE_BACKOFF,
            pending: None,
            connected_at: Instant::now(),
        }
    }

    pub fn with_idle_backoff(mut self, idle_backoff: Duration) -> Self {
        self.idle_backoff = idle_backoff;
        self
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// The peer id announced in the peer's Bitfield.
    pub fn remote_peer_id(&self) -> Option<&str> {
        self.session.remote_peer_id()
    }

    pub fn session(&self) -> &PeerSession {
        &self.session
    }

    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    /// Exchanges messages until the connection ends.
    ///
    /// Returns `Ok(())` when the exchange ended with a ServerClose in either
    /// direction, or because shutdown was requested.
    pub async fn run(mut self) -> Result<(), PeerError> {
        let result = self.drive().await;
        self.session.release();
        if let Err(e) = self.transport.close().await {
            trace!("close failed: {}", e);
        }
        result
    }

    async fn drive(&mut self) -> Result<(), PeerError> {
        loop {
            if let Some(reply) = self.pending.take() {
                if reply.terminate {
                    // The peer may already be gone.
                    if let Err(e) = self.send(&reply.message).await {
                        trace!("final {} not delivered: {}", reply.message.kind(), e);
                    }
                    return Ok(());
                }
                self.send(&reply.message).await?;
            }

            let Some(message) = self.recv().await? else {
                debug!("shutdown requested, closing connection");
                if let Err(e) = self.send(&Message::ServerClose).await {
                    trace!("server close not delivered: {}", e);
                }
                return Ok(());
            };

            let idle = message == Message::KeepAlive;
            let mut reply = self.session.handle(message, false).await?;
            if idle && reply.message == Message::KeepAlive && self.backoff().await {
                reply = Reply {
                    message: Message::ServerClose,
                    terminate: true,
                };
            }
            self.pending = Some(reply);
        }
    }

    async fn handshake(&mut self, first_exchange: bool) -> Result<(), PeerError> {
        let message = match self.recv().await? {
            Some(message) => message,
            None => return Err(PeerError::ConnectionClosed),
        };
        if !matches!(message, Message::Bitfield { .. }) {
            return Err(PeerError::Protocol(format!(
                "expected bitfield, got {}",
                message.kind()
            )));
        }

        self.pending = Some(self.session.handle(message, first_exchange).await?);
        debug!(
            "bitfield exchange complete with {}",
            self.session.remote_peer_id().unwrap_or("unnamed peer")
        );
        Ok(())
    }

    async fn send(&mut self, message: &Message) -> Result<(), PeerError> {
        trace!("sending {}", message.kind());
        self.transport.send_frame(&message.encode()).await
    }

    /// Returns `None` if shutdown was requested while waiting.
    async fn recv(&mut self) -> Result<Option<Message>, PeerError> {
        let frame = tokio::select! {
            frame = self.transport.recv_frame() => frame?,
            _ = closed(&mut self.shutdown) => return Ok(None),
        };
        Message::decode(frame).map(Some)
    }

    /// Sleeps for the idle backoff. Returns true if shutdown cut it short.
    async fn backoff(&mut self) -> bool {
        if self.idle_backoff.is_zero() {
            return false;
        }
        tokio::select! {
            _ = sleep(self.idle_backoff) => false,
            _ = closed(&mut self.shutdown) => true,
        }
    }
}

/// Resolves once the flag is raised or its sender is gone.
pub(crate) async fn closed(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|closing| *closing).await;
}

//! Connection management for one node.
//!
//! The [`ConnectionManager`] owns the listening socket, dials the peers a
//! tracker hands out, and runs every connection as its own task against the
//! node's shared [`PieceStore`]. Live connections are kept in a registry
//! with its own locking, separate from the store's.
//!
//! # Examples
//!
//! ```no_run
//! use swarmwire::config::NodeConfig;
//! use swarmwire::manager::ConnectionManager;
//! use swarmwire::storage::{PieceStore, TorrentDescriptor};
//! use swarmwire::tracker::{AnnounceResponse, TrackerPeer};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = NodeConfig::new("node-a", "./node-a");
//! let store = Arc::new(PieceStore::from_config(&config));
//! let data = std::fs::read("./node-a/report.pdf")?;
//! let descriptor = TorrentDescriptor::from_data("report.pdf", config.piece_length, &data)?;
//! store.add_tracked_file(descriptor, true).await?;
//!
//! let manager = ConnectionManager::bind(config, store).await?;
//! manager.start();
//!
//! let response = AnnounceResponse::ok(vec![TrackerPeer::new(
//!     "node-b",
//!     "10.0.0.2:7889".parse()?,
//! )]);
//! manager.join(&response).await?;
//!
//! // ...
//! manager.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod error;
mod registry;

pub use error::ManagerError;
pub use registry::ConnectionInfo;

use crate::config::NodeConfig;
use crate::constants::{CONNECT_TIMEOUT, SHUTDOWN_GRACE};
use crate::peer::{self, FrameTransport, PeerConnection, PeerError};
use crate::storage::PieceStore;
use crate::tracker::{AnnounceRequest, AnnounceResponse, TrackerEvent};
use futures::future::join_all;
use parking_lot::Mutex;
use registry::Registry;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

pub struct ConnectionManager {
    config: NodeConfig,
    store: Arc<PieceStore>,
    local_addr: SocketAddr,
    listener: Mutex<Option<TcpListener>>,
    registry: Registry,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ConnectionManager {
    /// Binds the listening socket. Connections are only accepted once
    /// [`start`](Self::start) is called.
    pub async fn bind(
        config: NodeConfig,
        store: Arc<PieceStore>,
    ) -> Result<Arc<Self>, ManagerError> {
        peer::check_id_len(&config.peer_id, "peer id")?;
        let listener = TcpListener::bind(config.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown_tx, _) = watch::channel(false);

        info!("node {} listening on {}", config.peer_id, local_addr);

        Ok(Arc::new(Self {
            config,
            store,
            local_addr,
            listener: Mutex::new(Some(listener)),
            registry: Registry::default(),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        }))
    }

    /// Starts accepting inbound connections. Calling it again has no effect.
    pub fn start(self: &Arc<Self>) {
        let Some(listener) = self.listener.lock().take() else {
            return;
        };
        let manager = self.clone();
        let handle = tokio::spawn(async move {
            manager.accept_loop(listener).await;
        });
        self.track(handle);
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<PieceStore> {
        &self.store
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Live connections, oldest first.
    pub fn registry(&self) -> Vec<ConnectionInfo> {
        self.registry.snapshot()
    }

    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    pub fn is_connected(&self, peer_id: &str) -> bool {
        self.registry.contains_peer(peer_id)
    }

    /// The announce to send the tracker for `event`.
    pub fn announce_request(&self, event: TrackerEvent) -> AnnounceRequest {
        AnnounceRequest::new(self.config.peer_id.as_str(), self.local_addr, event)
    }

    /// Connects to every peer in a tracker response, skipping ourselves and
    /// peers we are already connected to.
    ///
    /// A response carrying an error code is rejected before anything is
    /// dialed. Peers that cannot be reached are logged and skipped. Returns
    /// the number of connections opened.
    pub async fn join(self: &Arc<Self>, response: &AnnounceResponse) -> Result<usize, ManagerError> {
        if !response.is_ok() {
            return Err(ManagerError::Tracker {
                code: response.error_code,
                message: response.message.clone().unwrap_or_default(),
            });
        }
        if self.is_shutting_down() {
            return Err(ManagerError::ShuttingDown);
        }

        let mut connected = 0;
        for peer in &response.peers {
            if peer.peer_id == self.config.peer_id {
                continue;
            }
            if self.is_connected(&peer.peer_id) {
                debug!("already connected to {}", peer.peer_id);
                continue;
            }
            match self.connect(peer.addr()).await {
                Ok(()) => connected += 1,
                Err(e) => warn!("could not connect to {} at {}: {}", peer.peer_id, peer.addr(), e),
            }
        }

        info!(
            "node {} joined: {} of {} peers connected",
            self.config.peer_id,
            connected,
            response.peers.len()
        );
        Ok(connected)
    }

    /// Dials `addr`, performs the bitfield exchange as the active side and
    /// hands the connection to its own task.
    pub async fn connect(self: &Arc<Self>, addr: SocketAddr) -> Result<(), ManagerError> {
        if self.is_shutting_down() {
            return Err(ManagerError::ShuttingDown);
        }

        let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| PeerError::Timeout)??;
        stream.set_nodelay(true)?;

        let conn = PeerConnection::outbound(
            self.transport(stream),
            self.store.clone(),
            self.config.peer_id.as_str(),
            self.shutdown_tx.subscribe(),
        )
        .await?;

        let manager = self.clone();
        let handle = tokio::spawn(async move {
            manager.run_connection(conn, addr).await;
        });
        self.track(handle);
        Ok(())
    }

    /// Raises the shutdown flag and waits for the accept loop and every
    /// connection to finish.
    ///
    /// Connections answer their next message with ServerClose, or send one
    /// right away if they are waiting on the peer.
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);

        let handles = std::mem::take(&mut *self.tasks.lock());
        let count = handles.len();
        if timeout(SHUTDOWN_GRACE, join_all(handles)).await.is_err() {
            warn!(
                "{} tasks still running {:?} after shutdown",
                count, SHUTDOWN_GRACE
            );
        }
        info!("node {} stopped", self.config.peer_id);
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let mut shutdown = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                result = listener.accept() => match result {
                    Ok((stream, addr)) => {
                        let manager = self.clone();
                        let handle = tokio::spawn(async move {
                            manager.handle_inbound(stream, addr).await;
                        });
                        self.track(handle);
                    }
                    Err(e) => warn!("accept failed: {}", e),
                },
                _ = peer::closed(&mut shutdown) => break,
            }
        }
        debug!("node {} stopped accepting", self.config.peer_id);
    }

    async fn handle_inbound(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        if self.is_shutting_down() {
            return;
        }
        if let Err(e) = stream.set_nodelay(true) {
            debug!("set_nodelay failed for {}: {}", addr, e);
        }

        let result = PeerConnection::inbound(
            self.transport(stream),
            self.store.clone(),
            self.config.peer_id.as_str(),
            self.shutdown_tx.subscribe(),
        )
        .await;

        match result {
            Ok(conn) => self.run_connection(conn, addr).await,
            Err(e) => debug!("handshake with {} failed: {}", addr, e),
        }
    }

    async fn run_connection(&self, conn: PeerConnection, addr: SocketAddr) {
        let peer_id = conn
            .remote_peer_id()
            .map(str::to_string)
            .unwrap_or_else(|| addr.to_string());
        let id = self.registry.insert(ConnectionInfo {
            peer_id: peer_id.clone(),
            addr,
            direction: conn.direction(),
            connected_at: conn.connected_at(),
        });
        info!("connected to {} at {} ({:?})", peer_id, addr, conn.direction());

        match conn.with_idle_backoff(self.config.idle_backoff).run().await {
            Ok(()) => info!("connection to {} closed", peer_id),
            Err(e) if e.is_transport() => debug!("connection to {} lost: {}", peer_id, e),
            Err(e) => warn!("dropping {} after protocol violation: {}", peer_id, e),
        }

        self.registry.remove(id);
    }

    fn transport(&self, stream: TcpStream) -> FrameTransport<TcpStream> {
        FrameTransport::new(stream)
            .with_max_frame_len(self.config.max_frame_len)
            .with_read_timeout(self.config.read_timeout)
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock();
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }
}

#[cfg(test)]
mod tests;

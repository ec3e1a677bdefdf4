//! Bus Daemon Server
//!
//! This module provides the core server loop of the bus daemon:
//! - Accepts connections on a Unix socket
//! - Greets each peer with a unique name (`:1.N`)
//! - Arbitrates well-known names through the [`NameTable`]
//! - Routes frames to their destination, or to everyone when there is none
//! - Supports graceful shutdown
//!
//! # Routing
//!
//! ```text
//!                        BusDaemon
//!                            │
//!            ┌───────────────┼───────────────┐
//!            │               │               │
//!         :1.1            :1.2            :1.3
//!   org.example.Echo                  (anonymous)
//!            ▲                               │
//!            └──── destination lookup ───────┘
//! ```
//!
//! Every peer has a bounded outbound channel. Envelopes are queued with
//! `try_send`; a peer that stops reading loses frames rather than stalling
//! the bus.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn, Instrument};

use busway_core::protocol::{
    BUS_DAEMON_INTERFACE, BUS_DAEMON_NAME, BUS_DAEMON_PATH, NAME_ACQUIRED_SIGNAL,
};
use busway_core::transport::{encode, FrameDecoder};
use busway_core::{error_names, validate_bus_name, BusKind, Envelope, Frame, MessageKind};

use crate::names::{ConnectionId, NameTable, Promotion};

/// How long a new peer has to send its hello
const HELLO_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection state tracking (task handle, peer info)
struct ConnectionState {
    /// When the connection was established
    connected_at: Instant,
    /// Remote peer UID (from SO_PEERCRED)
    peer_uid: Option<u32>,
    /// Handle to abort the connection task
    abort_handle: tokio::task::AbortHandle,
}

/// Configuration for the daemon server
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Maximum number of concurrent connections
    pub max_connections: usize,
    /// Per-connection outbound channel capacity
    pub connection_channel_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_connections: 100,
            connection_channel_capacity: 256,
        }
    }
}

/// State shared by the accept loop and all connection handlers
struct BusState {
    bus_id: String,
    names: Mutex<NameTable>,
    peers: DashMap<ConnectionId, mpsc::Sender<Envelope>>,
    connection_states: DashMap<ConnectionId, ConnectionState>,
    next_id: AtomicU64,
    next_serial: AtomicU32,
}

/// The bus daemon
pub struct BusDaemon {
    /// Path to the Unix socket
    socket_path: PathBuf,
    /// Which bus this daemon serves
    bus: BusKind,
    /// Server configuration
    server_config: ServerConfig,
    state: Arc<BusState>,
}

impl BusDaemon {
    /// Create a daemon for `bus` listening at `socket_path`
    #[must_use]
    pub fn new(socket_path: PathBuf, bus: BusKind) -> Self {
        Self {
            socket_path,
            bus,
            server_config: ServerConfig::default(),
            state: Arc::new(BusState {
                bus_id: uuid::Uuid::new_v4().simple().to_string(),
                names: Mutex::new(NameTable::new()),
                peers: DashMap::new(),
                connection_states: DashMap::new(),
                next_id: AtomicU64::new(1),
                next_serial: AtomicU32::new(1),
            }),
        }
    }

    /// Replace the server configuration
    #[must_use]
    pub fn with_config(mut self, server_config: ServerConfig) -> Self {
        self.server_config = server_config;
        self
    }

    /// Identity of this daemon instance, sent to every peer
    #[must_use]
    pub fn bus_id(&self) -> &str {
        &self.state.bus_id
    }

    /// Path of the listening socket
    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Current primary owner of a well-known name
    #[must_use]
    pub fn name_owner(&self, name: &str) -> Option<ConnectionId> {
        self.state.names.lock().owner(name)
    }

    /// Get peer credentials from Unix socket
    fn get_peer_uid(stream: &UnixStream) -> Option<u32> {
        use std::os::unix::io::AsRawFd;

        let fd = stream.as_raw_fd();
        let mut cred: libc::ucred = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;

        let result = unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_PEERCRED,
                (&mut cred as *mut libc::ucred).cast::<libc::c_void>(),
                &mut len,
            )
        };

        if result == 0 {
            Some(cred.uid)
        } else {
            None
        }
    }

    /// Prepare the socket path (create directory, remove stale socket)
    fn prepare_socket(&self) -> Result<()> {
        if let Some(parent) = self.socket_path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create socket directory: {parent:?}"))?;
                info!(path = ?parent, "Created socket directory");
            }
        }

        if self.socket_path.exists() {
            warn!(path = ?self.socket_path, "Removing stale socket file");
            fs::remove_file(&self.socket_path).with_context(|| {
                format!("Failed to remove stale socket: {:?}", self.socket_path)
            })?;
        }

        Ok(())
    }

    /// Whether a peer with `peer_uid` may use this bus
    ///
    /// The system bus is open to every user; a session bus only to its owner
    /// and root.
    fn admits(&self, peer_uid: Option<u32>) -> bool {
        match (self.bus, peer_uid) {
            (BusKind::System, _) | (BusKind::Session, None) => true,
            (BusKind::Session, Some(uid)) => {
                let our_uid = unsafe { libc::getuid() };
                uid == our_uid || uid == 0
            }
        }
    }

    /// Run the daemon until `shutdown` is set
    pub async fn run(&self, shutdown: Arc<AtomicBool>) -> Result<()> {
        self.prepare_socket()?;

        let listener = UnixListener::bind(&self.socket_path)
            .with_context(|| format!("Failed to bind to {:?}", self.socket_path))?;

        {
            use std::os::unix::fs::PermissionsExt;
            let mode = match self.bus {
                BusKind::System => 0o666,
                BusKind::Session => 0o600,
            };
            fs::set_permissions(&self.socket_path, fs::Permissions::from_mode(mode))?;
        }

        info!(
            path = ?self.socket_path,
            bus = %self.bus,
            bus_id = %self.state.bus_id,
            "Listening for connections"
        );

        loop {
            if shutdown.load(Ordering::SeqCst) {
                info!("Shutdown requested, stopping accept loop");
                break;
            }

            // Accept with timeout to allow checking shutdown flag
            let accept_result =
                tokio::time::timeout(Duration::from_millis(100), listener.accept()).await;

            let stream = match accept_result {
                Ok(Ok((stream, _addr))) => stream,
                Ok(Err(e)) => {
                    error!(error = %e, "Accept failed");
                    continue;
                }
                Err(_) => continue,
            };

            if self.state.connection_states.len() >= self.server_config.max_connections {
                warn!("Connection limit reached, rejecting new connection");
                drop(stream);
                continue;
            }

            let peer_uid = Self::get_peer_uid(&stream);
            if !self.admits(peer_uid) {
                warn!(peer_uid = ?peer_uid, "Rejecting connection from different user");
                drop(stream);
                continue;
            }

            let conn_id = ConnectionId::from_raw(self.state.next_id.fetch_add(1, Ordering::SeqCst));
            let (peer_tx, peer_rx) =
                mpsc::channel::<Envelope>(self.server_config.connection_channel_capacity);
            let (registered_tx, registered_rx) = oneshot::channel();

            info!(
                conn_id = %conn_id,
                peer_uid = ?peer_uid,
                active_connections = self.state.connection_states.len() + 1,
                "New connection accepted"
            );

            let task_handle = tokio::spawn(
                handle_connection(
                    conn_id,
                    stream,
                    peer_tx,
                    peer_rx,
                    registered_rx,
                    Arc::clone(&self.state),
                )
                .instrument(tracing::info_span!("connection", %conn_id)),
            );

            self.state.connection_states.insert(
                conn_id,
                ConnectionState {
                    connected_at: Instant::now(),
                    peer_uid,
                    abort_handle: task_handle.abort_handle(),
                },
            );
            // The handler cleans up its entry, so it may only start once the entry exists
            let _ = registered_tx.send(());
        }

        self.shutdown().await
    }

    /// Graceful shutdown
    async fn shutdown(&self) -> Result<()> {
        info!("Initiating graceful shutdown");

        let conn_ids: Vec<ConnectionId> = self
            .state
            .connection_states
            .iter()
            .map(|r| *r.key())
            .collect();
        for conn_id in conn_ids {
            if let Some((_, conn_state)) = self.state.connection_states.remove(&conn_id) {
                info!(conn_id = %conn_id, "Aborting connection");
                conn_state.abort_handle.abort();
            }
            self.state.peers.remove(&conn_id);
        }

        // Wait a bit for handlers to finish
        tokio::time::sleep(Duration::from_millis(100)).await;

        if self.socket_path.exists() {
            fs::remove_file(&self.socket_path)
                .with_context(|| format!("Failed to remove socket: {:?}", self.socket_path))?;
            info!(path = ?self.socket_path, "Socket file removed");
        }

        info!("Shutdown complete");
        Ok(())
    }

    /// Get number of active connections
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.state.connection_states.len()
    }

    /// Get connection statistics
    #[must_use]
    pub fn connection_stats(&self) -> HashMap<ConnectionId, ConnectionStats> {
        let names = self.state.names.lock();
        self.state
            .connection_states
            .iter()
            .map(|r| {
                let conn_id = *r.key();
                let conn_state = r.value();
                (
                    conn_id,
                    ConnectionStats {
                        connected_at: conn_state.connected_at,
                        peer_uid: conn_state.peer_uid,
                        uptime_secs: conn_state.connected_at.elapsed().as_secs(),
                        owned_names: names.owned_by(conn_id),
                    },
                )
            })
            .collect()
    }
}

/// Statistics for a single connection
#[derive(Debug, Clone)]
pub struct ConnectionStats {
    /// When the connection was established
    pub connected_at: Instant,
    /// Peer UID
    pub peer_uid: Option<u32>,
    /// Connection uptime in seconds
    pub uptime_secs: u64,
    /// Well-known names the peer owns
    pub owned_names: Vec<String>,
}

/// Handle a single peer connection
///
/// Waits for the hello, then interleaves reading envelopes from the peer
/// with writing envelopes queued for it.
async fn handle_connection(
    conn_id: ConnectionId,
    stream: UnixStream,
    peer_tx: mpsc::Sender<Envelope>,
    mut peer_rx: mpsc::Receiver<Envelope>,
    registered: oneshot::Receiver<()>,
    state: Arc<BusState>,
) {
    if registered.await.is_err() {
        return;
    }
    debug!("Connection handler started");

    let (mut read_half, mut write_half) = stream.into_split();
    let mut decoder = FrameDecoder::new();
    let mut read_buf = vec![0u8; 8192];

    let greeted = tokio::time::timeout(
        HELLO_TIMEOUT,
        read_hello(&mut read_half, &mut decoder, &mut read_buf),
    )
    .await;
    let serial = match greeted {
        Ok(Ok(serial)) => serial,
        Ok(Err(e)) => {
            warn!(error = %e, "Handshake failed");
            state.disconnect(conn_id);
            return;
        }
        Err(_) => {
            warn!("Peer did not say hello in time");
            state.disconnect(conn_id);
            return;
        }
    };

    let reply = Envelope::HelloReply {
        reply_serial: serial,
        unique_name: conn_id.to_string(),
        bus_id: state.bus_id.clone(),
    };
    if let Err(e) = write_envelope(&mut write_half, &reply).await {
        error!(error = %e, "Failed to send hello reply");
        state.disconnect(conn_id);
        return;
    }
    state.peers.insert(conn_id, peer_tx);
    info!(unique_name = %conn_id, "Peer greeted");

    'connection: loop {
        // Handle everything already buffered before waiting again
        loop {
            match decoder.decode::<Envelope>() {
                Ok(Some(envelope)) => state.handle_envelope(conn_id, envelope),
                Ok(None) => break,
                Err(e) if e.is_fatal() => {
                    warn!(error = %e, "Unrecoverable framing error, dropping peer");
                    break 'connection;
                }
                Err(e) => warn!(error = %e, "Dropping malformed frame"),
            }
        }

        tokio::select! {
            read_result = read_half.read(&mut read_buf) => match read_result {
                Ok(0) => {
                    info!("Client disconnected (EOF)");
                    break;
                }
                Ok(n) => decoder.push(&read_buf[..n]),
                Err(e) => {
                    error!(error = %e, "Read error");
                    break;
                }
            },

            outbound = peer_rx.recv() => match outbound {
                Some(envelope) => {
                    if let Err(e) = write_envelope(&mut write_half, &envelope).await {
                        error!(error = %e, "Write error");
                        break;
                    }
                }
                None => {
                    info!("Peer channel closed");
                    break;
                }
            },
        }
    }

    state.disconnect(conn_id);
    info!(
        active_connections = state.connection_states.len(),
        "Connection handler finished"
    );
}

async fn read_hello(
    read_half: &mut OwnedReadHalf,
    decoder: &mut FrameDecoder,
    buf: &mut [u8],
) -> Result<u32> {
    loop {
        match decoder.decode::<Envelope>()? {
            Some(Envelope::Hello { serial }) => return Ok(serial),
            Some(other) => bail!("Expected hello, got {other:?}"),
            None => {}
        }

        let n = read_half.read(buf).await?;
        if n == 0 {
            bail!("Peer closed the connection before saying hello");
        }
        decoder.push(&buf[..n]);
    }
}

async fn write_envelope(write_half: &mut OwnedWriteHalf, envelope: &Envelope) -> Result<()> {
    let frame = encode(envelope)?;
    write_half.write_all(&frame).await?;
    Ok(())
}

impl BusState {
    fn next_serial(&self) -> u32 {
        self.next_serial.fetch_add(1, Ordering::SeqCst)
    }

    /// Queue an envelope for `to`; returns whether it was queued
    fn deliver(&self, to: ConnectionId, envelope: Envelope) -> bool {
        let Some(tx) = self.peers.get(&to).map(|r| r.value().clone()) else {
            debug!(to = %to, "Dropping envelope for departed peer");
            return false;
        };
        match tx.try_send(envelope) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(to = %to, "Peer is not keeping up, dropping envelope");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    fn handle_envelope(&self, from: ConnectionId, envelope: Envelope) {
        match envelope {
            Envelope::RequestName {
                serial,
                name,
                flags,
            } => {
                if let Err(e) = validate_bus_name(&name) {
                    self.reject(from, serial, error_names::INVALID_ARGS, e.to_string());
                    return;
                }
                let reply = self.names.lock().request(&name, from, flags);
                info!(name, peer = %from, reply = ?reply, "Name requested");
                self.deliver(
                    from,
                    Envelope::RequestNameReply {
                        reply_serial: serial,
                        reply,
                    },
                );
            }
            Envelope::ReleaseName { serial, name } => {
                if let Err(e) = validate_bus_name(&name) {
                    self.reject(from, serial, error_names::INVALID_ARGS, e.to_string());
                    return;
                }
                let (reply, promotion) = self.names.lock().release(&name, from);
                info!(name, peer = %from, reply = ?reply, "Name released");
                self.deliver(
                    from,
                    Envelope::ReleaseNameReply {
                        reply_serial: serial,
                        reply,
                    },
                );
                if let Some(promotion) = promotion {
                    self.announce(&promotion);
                }
            }
            Envelope::Message(mut frame) => {
                frame.sender = Some(from.to_string());
                self.route(from, frame);
            }
            Envelope::Hello { serial } => {
                self.reject(from, serial, error_names::FAILED, "Already greeted".to_string());
            }
            other => warn!(peer = %from, envelope = ?other, "Ignoring reply sent by a peer"),
        }
    }

    fn reject(&self, to: ConnectionId, serial: u32, name: &str, message: String) {
        self.deliver(
            to,
            Envelope::ControlError {
                reply_serial: serial,
                name: name.to_string(),
                message,
            },
        );
    }

    fn route(&self, from: ConnectionId, frame: Frame) {
        let Some(destination) = frame.destination.clone() else {
            self.broadcast(from, &frame);
            return;
        };

        let target = match destination.parse::<ConnectionId>() {
            Ok(id) => self.peers.contains_key(&id).then_some(id),
            Err(()) => self.names.lock().owner(&destination),
        };

        match target {
            Some(to) => {
                debug!(from = %from, to = %to, serial = frame.serial, "Routing frame");
                self.deliver(to, Envelope::Message(frame));
            }
            None if frame.kind == MessageKind::MethodCall => {
                debug!(from = %from, destination, "Destination unknown");
                let mut error = Frame::error(
                    &frame,
                    error_names::SERVICE_UNKNOWN,
                    &format!("The name {destination} was not provided by any service"),
                );
                error.serial = self.next_serial();
                error.sender = Some(BUS_DAEMON_NAME.to_string());
                self.deliver(from, Envelope::Message(error));
            }
            None => debug!(from = %from, destination, "Dropping frame for unknown destination"),
        }
    }

    fn broadcast(&self, from: ConnectionId, frame: &Frame) {
        let recipients: Vec<ConnectionId> = self
            .peers
            .iter()
            .map(|r| *r.key())
            .filter(|id| *id != from)
            .collect();
        debug!(from = %from, recipients = recipients.len(), "Broadcasting frame");
        for to in recipients {
            self.deliver(to, Envelope::Message(frame.clone()));
        }
    }

    /// Tell a promoted peer it now owns the name
    fn announce(&self, promotion: &Promotion) {
        let mut signal = Frame::signal(BUS_DAEMON_PATH, BUS_DAEMON_INTERFACE, NAME_ACQUIRED_SIGNAL)
            .with_body(promotion.name.as_bytes().to_vec())
            .with_destination(&promotion.owner.to_string());
        signal.serial = self.next_serial();
        signal.sender = Some(BUS_DAEMON_NAME.to_string());

        info!(name = %promotion.name, owner = %promotion.owner, "Name passed to next in queue");
        self.deliver(promotion.owner, Envelope::Message(signal));
    }

    /// Forget a peer and hand its names to whoever waits for them
    fn disconnect(&self, conn_id: ConnectionId) {
        self.peers.remove(&conn_id);
        self.connection_states.remove(&conn_id);
        let promotions = self.names.lock().remove_peer(conn_id);
        for promotion in &promotions {
            self.announce(promotion);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.max_connections, 100);
        assert_eq!(config.connection_channel_capacity, 256);
    }

    #[test]
    fn test_bus_id_is_stable_per_daemon() {
        let a = BusDaemon::new(PathBuf::from("/tmp/a.sock"), BusKind::Session);
        let b = BusDaemon::new(PathBuf::from("/tmp/b.sock"), BusKind::Session);

        assert_eq!(a.bus_id(), a.bus_id());
        assert_ne!(a.bus_id(), b.bus_id());
        assert_eq!(a.bus_id().len(), 32);
    }

    #[test]
    fn test_admission() {
        let our_uid = unsafe { libc::getuid() };
        let session = BusDaemon::new(PathBuf::from("/tmp/s.sock"), BusKind::Session);
        let system = BusDaemon::new(PathBuf::from("/tmp/y.sock"), BusKind::System);

        assert!(session.admits(Some(our_uid)));
        assert!(session.admits(Some(0)));
        let stranger = our_uid.wrapping_add(1);
        assert!(system.admits(Some(stranger)));
        if stranger != 0 {
            assert!(!session.admits(Some(stranger)));
        }
    }

    #[tokio::test]
    async fn test_unknown_destination_gets_error_reply() {
        let daemon = BusDaemon::new(PathBuf::from("/tmp/unused.sock"), BusKind::Session);
        let caller = ConnectionId::from_raw(1);
        let (tx, mut rx) = mpsc::channel(4);
        daemon.state.peers.insert(caller, tx);

        let mut call = Frame::method_call("org.example.Nobody", "/", "org.example.X", "Y");
        call.serial = 12;
        daemon
            .state
            .handle_envelope(caller, Envelope::Message(call));

        match rx.recv().await {
            Some(Envelope::Message(reply)) => {
                assert_eq!(reply.kind, MessageKind::Error);
                assert_eq!(reply.reply_serial, Some(12));
                assert_eq!(reply.destination.as_deref(), Some(":1.1"));
                assert_eq!(reply.error_name.as_deref(), Some(error_names::SERVICE_UNKNOWN));
            }
            other => panic!("Expected error frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_invalid_name_request_rejected() {
        let daemon = BusDaemon::new(PathBuf::from("/tmp/unused.sock"), BusKind::Session);
        let peer = ConnectionId::from_raw(3);
        let (tx, mut rx) = mpsc::channel(4);
        daemon.state.peers.insert(peer, tx);

        daemon.state.handle_envelope(
            peer,
            Envelope::RequestName {
                serial: 5,
                name: "nodots".to_string(),
                flags: busway_core::NameFlags::default(),
            },
        );

        match rx.recv().await {
            Some(Envelope::ControlError {
                reply_serial, name, ..
            }) => {
                assert_eq!(reply_serial, 5);
                assert_eq!(name, error_names::INVALID_ARGS);
            }
            other => panic!("Expected control error, got {other:?}"),
        }
        assert_eq!(daemon.name_owner("nodots"), None);
    }
}

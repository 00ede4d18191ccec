//! TCP accept loop for a hosted meeting.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};

use crate::handshake::{self, HandshakeError};
use crate::messages::VersionHandshake;
use crate::peer::{NetEvent, Peer, PeerId, PeerOptions};
use crate::platform::{self, SocketConfig};

/// Atomic generator for monotonically increasing [`PeerId`]s.
#[derive(Debug)]
pub struct IdGenerator {
    next: AtomicU64,
}

impl IdGenerator {
    /// Create a new generator starting at 1.
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Return the next unique [`PeerId`].
    pub fn next_id(&self) -> PeerId {
        PeerId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Error returned when every participant slot is taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("meeting is full ({limit} remote participants)")]
pub struct ConnectionLimitReached {
    pub limit: usize,
}

/// Counts remote participants against the meeting's capacity.
///
/// A slot is reserved before the handshake starts and released when the
/// returned [`SlotGuard`] drops, so racing accepts can never overshoot.
#[derive(Debug, Clone)]
pub struct ParticipantSlots {
    in_use: Arc<AtomicUsize>,
    limit: usize,
}

impl ParticipantSlots {
    /// `limit` is the number of *remote* participants allowed.
    pub fn new(limit: usize) -> Self {
        Self {
            in_use: Arc::new(AtomicUsize::new(0)),
            limit,
        }
    }

    pub fn try_reserve(&self) -> Result<SlotGuard, ConnectionLimitReached> {
        let mut current = self.in_use.load(Ordering::Acquire);
        loop {
            if current >= self.limit {
                return Err(ConnectionLimitReached { limit: self.limit });
            }
            match self.in_use.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Ok(SlotGuard {
                        in_use: Arc::clone(&self.in_use),
                    });
                }
                Err(actual) => current = actual,
            }
        }
    }

    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}

/// A reserved participant slot. Dropping it frees the slot.
#[derive(Debug)]
pub struct SlotGuard {
    in_use: Arc<AtomicUsize>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.in_use.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Configuration for [`MeetingServer`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Total participants including the host. Default: 100.
    pub max_participants: usize,
    /// Time allowed for a new connection to finish the handshake. Default: 10s.
    pub handshake_timeout: Duration,
    /// Our protocol versions.
    pub version: VersionHandshake,
    pub socket: SocketConfig,
    pub peer: PeerOptions,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_participants: 100,
            handshake_timeout: Duration::from_secs(10),
            version: VersionHandshake::CURRENT,
            socket: SocketConfig::default(),
            peer: PeerOptions::default(),
        }
    }
}

/// Accepts participants for a hosted meeting.
///
/// Every accepted connection is handled on its own task, so a slow
/// handshake never blocks the next accept. Handshaken peers are delivered
/// to the owning session as [`NetEvent::Connected`], followed by that
/// peer's messages.
pub struct MeetingServer {
    config: Arc<ServerConfig>,
    slots: ParticipantSlots,
    id_gen: Arc<IdGenerator>,
    shutdown_tx: watch::Sender<bool>,
}

impl MeetingServer {
    /// Create a new server. Peer ids are drawn from `id_gen` so they never
    /// collide with ids the session hands out for outbound connections.
    pub fn new(config: ServerConfig, id_gen: Arc<IdGenerator>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let slots = ParticipantSlots::new(config.max_participants.saturating_sub(1));
        Self {
            config: Arc::new(config),
            slots,
            id_gen,
            shutdown_tx,
        }
    }

    /// Slot counter, shared with accepted peers.
    pub fn slots(&self) -> &ParticipantSlots {
        &self.slots
    }

    /// Spawn the accept loop on `listener`.
    pub fn spawn(
        &self,
        listener: TcpListener,
        events: mpsc::Sender<NetEvent>,
    ) -> tokio::task::JoinHandle<()> {
        let config = Arc::clone(&self.config);
        let slots = self.slots.clone();
        let id_gen = Arc::clone(&self.id_gen);
        let shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(accept_loop(
            listener,
            config,
            slots,
            id_gen,
            events,
            shutdown_rx,
        ))
    }

    /// Stop accepting. Peers already handed to the session are unaffected.
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }
}

impl Drop for MeetingServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn accept_loop(
    listener: TcpListener,
    config: Arc<ServerConfig>,
    slots: ParticipantSlots,
    id_gen: Arc<IdGenerator>,
    events: mpsc::Sender<NetEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    if *shutdown_rx.borrow() {
        return;
    }
    if let Ok(addr) = listener.local_addr() {
        tracing::info!("Meeting listening on {addr}");
    }

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (stream, peer_addr) = match result {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!("Accept failed: {e}");
                        continue;
                    }
                };
                if let Err(e) = platform::configure_stream(&stream, &config.socket) {
                    tracing::warn!("Could not configure socket for {peer_addr}: {e}");
                }

                let id = id_gen.next_id();
                let config = Arc::clone(&config);
                let slots = slots.clone();
                let events = events.clone();
                let shutdown = shutdown_rx.clone();
                tokio::spawn(async move {
                    if let Err(e) =
                        handle_connection(id, stream, peer_addr, &config, &slots, events, shutdown).await
                    {
                        tracing::warn!("Connection {id} from {peer_addr} rejected: {e}");
                    }
                });
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    tracing::info!("Meeting listener shutting down");
                    break;
                }
            }
        }
    }
}

/// Reserve a slot, handshake, then hand the peer to the session.
async fn handle_connection(
    id: PeerId,
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    config: &ServerConfig,
    slots: &ParticipantSlots,
    events: mpsc::Sender<NetEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<(), HandshakeError> {
    let slot = match slots.try_reserve() {
        Ok(slot) => slot,
        Err(full) => {
            tracing::warn!("{full}, refusing {peer_addr}");
            let text = handshake::meeting_full_text(config.max_participants);
            handshake::reject(&mut stream, &text, &config.peer.frame).await?;
            return Err(HandshakeError::Rejected(text));
        }
    };

    let exchange = handshake::handshake(&mut stream, &config.version, &config.peer.frame);
    let remote = tokio::select! {
        result = tokio::time::timeout(config.handshake_timeout, exchange) => match result {
            Ok(remote) => remote?,
            Err(_) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "handshake timed out",
                )
                .into());
            }
        },
        _ = shutdown_rx.wait_for(|stop| *stop) => {
            return Ok(());
        }
    };
    tracing::info!(
        "Participant connected as {id} from {peer_addr} (protocol {})",
        remote.version
    );

    let (reader, writer) = stream.into_split();
    let (peer, reader) = Peer::new(id, peer_addr, reader, writer, Some(slot), &config.peer);
    if events.send(NetEvent::Connected(peer)).await.is_err() {
        return Ok(());
    }
    reader.spawn(events);
    Ok(())
}

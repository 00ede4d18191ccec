//! One live connection to another participant.
//!
//! A [`Peer`] owns the write half of a connection and an outbound FIFO of
//! already-encoded frames. At most one sender task drains the queue at a
//! time; each run takes *every* queued frame and writes them as one buffer,
//! so frames from competing callers never interleave on the socket.
//!
//! The read half is driven by a [`PeerReader`], which decodes frames and
//! forwards them to the session over an `mpsc` channel as [`NetEvent`]s.

use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};

use crate::framing::{self, FrameConfig, FrameError};
use crate::messages::{self, Delivery, Message, ParticipantId};
use crate::tcp_server::SlotGuard;

/// Queue depth at which lossy messages start being dropped.
pub const DEFAULT_LOSSY_THRESHOLD: usize = 10;

/// Unique identifier for a connection within one process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

/// An encoded frame shared between every queue it is sent to.
pub type Frame = Arc<[u8]>;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Per-peer tuning.
#[derive(Debug, Clone)]
pub struct PeerOptions {
    /// Queue depth at or above which [`Delivery::Lossy`] frames are dropped.
    pub lossy_threshold: usize,
    /// Framing limits for the read side.
    pub frame: FrameConfig,
}

impl Default for PeerOptions {
    fn default() -> Self {
        Self {
            lossy_threshold: DEFAULT_LOSSY_THRESHOLD,
            frame: FrameConfig::default(),
        }
    }
}

/// Why a peer's read loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disconnect {
    /// The remote side closed the connection.
    EndOfStream,
    /// We closed it (leave, stop hosting, or write failure).
    Local,
    /// A frame or message could not be decoded.
    Protocol(String),
    /// The transport failed.
    Io(String),
}

impl fmt::Display for Disconnect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Disconnect::EndOfStream => write!(f, "connection closed by remote"),
            Disconnect::Local => write!(f, "connection closed locally"),
            Disconnect::Protocol(e) => write!(f, "protocol error: {e}"),
            Disconnect::Io(e) => write!(f, "transport error: {e}"),
        }
    }
}

/// Events delivered from connection tasks to the owning session.
pub enum NetEvent {
    /// A participant finished the handshake with our listener.
    Connected(Peer),
    /// A decoded message plus its original frame for verbatim relay.
    Message {
        peer: PeerId,
        message: Message,
        frame: Frame,
    },
    /// A peer's read loop ended.
    Closed { peer: PeerId, reason: Disconnect },
}

impl fmt::Debug for NetEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetEvent::Connected(peer) => f.debug_tuple("Connected").field(&peer.id).finish(),
            NetEvent::Message { peer, message, .. } => f
                .debug_struct("Message")
                .field("peer", peer)
                .field("kind", &message.kind())
                .finish(),
            NetEvent::Closed { peer, reason } => f
                .debug_struct("Closed")
                .field("peer", peer)
                .field("reason", reason)
                .finish(),
        }
    }
}

#[derive(Default)]
struct SendState {
    queue: VecDeque<Frame>,
    /// Single-sender guard: true while a drain task owns the writer.
    sending: bool,
    closed: bool,
}

struct PeerShared {
    id: PeerId,
    state: Mutex<SendState>,
    writer: tokio::sync::Mutex<Option<BoxedWriter>>,
    shutdown_tx: watch::Sender<bool>,
}

impl PeerShared {
    fn state(&self) -> MutexGuard<'_, SendState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn close(&self) {
        {
            let mut state = self.state();
            if state.closed {
                return;
            }
            state.closed = true;
            state.queue.clear();
        }
        self.shutdown_tx.send_replace(true);
        // A drain task holding the writer drops it when it sees the shutdown.
        if let Ok(mut writer) = self.writer.try_lock() {
            writer.take();
        }
    }
}

/// The write side of one connection plus its participant bookkeeping.
pub struct Peer {
    id: PeerId,
    addr: SocketAddr,
    participant: Option<ParticipantId>,
    lossy_threshold: usize,
    shared: Arc<PeerShared>,
    _slot: Option<SlotGuard>,
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("participant", &self.participant)
            .field("queue_depth", &self.queue_depth())
            .finish()
    }
}

impl Peer {
    /// Wrap the write half of a connection. Returns the peer and the reader
    /// for the other half; spawn the reader only after the peer has been
    /// handed to its owner so no message can overtake the peer itself.
    ///
    /// `slot` is held for the peer's lifetime and released when it drops.
    pub fn new<R, W>(
        id: PeerId,
        addr: SocketAddr,
        reader: R,
        writer: W,
        slot: Option<SlotGuard>,
        options: &PeerOptions,
    ) -> (Peer, PeerReader<R>)
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shared = Arc::new(PeerShared {
            id,
            state: Mutex::new(SendState::default()),
            writer: tokio::sync::Mutex::new(Some(Box::new(writer))),
            shutdown_tx,
        });
        let peer = Peer {
            id,
            addr,
            participant: None,
            lossy_threshold: options.lossy_threshold,
            shared,
            _slot: slot,
        };
        let reader = PeerReader {
            id,
            reader,
            frame: options.frame.clone(),
            shutdown_rx,
        };
        (peer, reader)
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Participant identifier, learned from the first avatar message.
    pub fn participant(&self) -> Option<ParticipantId> {
        self.participant
    }

    pub fn set_participant(&mut self, participant: ParticipantId) {
        self.participant = Some(participant);
    }

    /// Frames waiting for the sender (excludes a write already in flight).
    pub fn queue_depth(&self) -> usize {
        self.shared.state().queue.len()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state().closed
    }

    /// Queue `frame` for sending, starting a sender if none is running.
    ///
    /// Returns false if the frame was not queued: the peer is closed, or the
    /// frame is [`Delivery::Lossy`] and the queue is at the lossy threshold.
    /// Must be called from within a Tokio runtime.
    pub fn enqueue(&self, frame: Frame, delivery: Delivery) -> bool {
        let mut state = self.shared.state();
        if state.closed {
            return false;
        }
        if delivery == Delivery::Lossy && state.queue.len() >= self.lossy_threshold {
            tracing::trace!(peer = %self.id, depth = state.queue.len(), "dropping lossy frame");
            return false;
        }
        state.queue.push_back(frame);
        if !state.sending {
            state.sending = true;
            drop(state);
            tokio::spawn(drain_queue(Arc::clone(&self.shared)));
        }
        true
    }

    /// Encode and queue a single message.
    pub fn send(&self, message: &Message) -> Result<bool, messages::CodecError> {
        let frame: Frame = messages::encode(message)?.into();
        Ok(self.enqueue(frame, message.delivery()))
    }

    /// Close the connection. Idempotent. Queued frames are discarded and the
    /// reader ends with [`Disconnect::Local`].
    pub fn close(&self) {
        self.shared.close();
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        self.shared.close();
    }
}

/// Sender task: drain the whole queue per write until it is empty.
///
/// A write to a peer that stopped reading can block forever, so every write
/// races the shutdown signal and gives up the writer when the peer closes.
async fn drain_queue(shared: Arc<PeerShared>) {
    let mut shutdown_rx = shared.shutdown_tx.subscribe();
    loop {
        let batch = {
            let mut state = shared.state();
            if state.closed || state.queue.is_empty() {
                state.sending = false;
                break;
            }
            let total = state.queue.iter().map(|f| f.len()).sum();
            let mut batch = Vec::with_capacity(total);
            for frame in state.queue.drain(..) {
                batch.extend_from_slice(&frame);
            }
            batch
        };

        let mut writer = shared.writer.lock().await;
        let Some(stream) = writer.as_mut() else {
            shared.state().sending = false;
            break;
        };
        let outcome = tokio::select! {
            result = write_batch(stream, &batch) => Some(result),
            _ = shutdown_rx.changed() => None,
        };

        match outcome {
            Some(Ok(())) => {
                if shared.state().closed {
                    writer.take();
                }
            }
            Some(Err(e)) => {
                tracing::warn!(peer = %shared.id, error = %e, "write failed, closing peer");
                writer.take();
                drop(writer);
                shared.state().sending = false;
                shared.close();
                break;
            }
            None => {
                tracing::debug!(peer = %shared.id, "closed during write");
                writer.take();
                shared.state().sending = false;
                break;
            }
        }
    }
}

async fn write_batch(stream: &mut BoxedWriter, batch: &[u8]) -> std::io::Result<()> {
    stream.write_all(batch).await?;
    stream.flush().await
}

/// The read half of a connection.
pub struct PeerReader<R> {
    id: PeerId,
    reader: R,
    frame: FrameConfig,
    shutdown_rx: watch::Receiver<bool>,
}

impl<R> PeerReader<R>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    /// Spawn the read loop onto the runtime.
    pub fn spawn(self, events: mpsc::Sender<NetEvent>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run(events))
    }

    /// Decode frames until the connection ends, forwarding each message.
    /// Always finishes by sending [`NetEvent::Closed`].
    pub async fn run(mut self, events: mpsc::Sender<NetEvent>) {
        let id = self.id;
        let reason = loop {
            if *self.shutdown_rx.borrow() {
                break Disconnect::Local;
            }
            tokio::select! {
                result = framing::read_frame(&mut self.reader, &self.frame) => {
                    let body = match result {
                        Ok(body) => body,
                        Err(FrameError::ConnectionClosed) => break Disconnect::EndOfStream,
                        Err(FrameError::Io(e)) => break Disconnect::Io(e.to_string()),
                        Err(e) => break Disconnect::Protocol(e.to_string()),
                    };
                    let message = match messages::decode_body(&body) {
                        Ok(message) => message,
                        Err(e) => break Disconnect::Protocol(e.to_string()),
                    };
                    tracing::trace!(peer = %id, kind = ?message.kind(), bytes = body.len(), "received");
                    let frame: Frame = framing::frame_body(&body).into();
                    if events.send(NetEvent::Message { peer: id, message, frame }).await.is_err() {
                        break Disconnect::Local;
                    }
                }
                _ = self.shutdown_rx.changed() => break Disconnect::Local,
            }
        };

        tracing::debug!(peer = %id, %reason, "read loop ended");
        let _ = events.send(NetEvent::Closed { peer: id, reason }).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{ObjectClosed, ObjectId};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, duplex, split};

    fn test_addr() -> SocketAddr {
        "127.0.0.1:9".parse().unwrap()
    }

    fn frame(bytes: &[u8]) -> Frame {
        framing::frame_body(bytes).into()
    }

    /// A peer whose writes go into a duplex pipe of `capacity` bytes. The
    /// returned half reads what the peer sent.
    fn pipe_peer(
        capacity: usize,
    ) -> (
        Peer,
        PeerReader<tokio::io::ReadHalf<tokio::io::DuplexStream>>,
        tokio::io::DuplexStream,
    ) {
        let (local, remote) = duplex(capacity);
        let (r, w) = split(local);
        let (peer, reader) = Peer::new(PeerId(1), test_addr(), r, w, None, &PeerOptions::default());
        (peer, reader, remote)
    }

    /// Hand the queue to the sender and wait until it is blocked writing.
    async fn stall_sender(peer: &Peer) {
        peer.enqueue(frame(&[0u8; 64]), Delivery::Reliable);
        for _ in 0..100 {
            if peer.queue_depth() == 0 {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("sender never picked up the queue");
    }

    #[tokio::test]
    async fn test_frames_arrive_in_enqueue_order() {
        let (peer, _reader, mut remote) = pipe_peer(4096);
        for i in 0..20u8 {
            assert!(peer.enqueue(frame(&[i]), Delivery::Reliable));
        }
        for i in 0..20u8 {
            let body = framing::read_frame(&mut remote, &FrameConfig::default())
                .await
                .unwrap();
            assert_eq!(body, vec![i]);
        }
    }

    #[tokio::test]
    async fn test_lossy_frames_dropped_at_threshold() {
        let (peer, _reader, _remote) = pipe_peer(1);
        stall_sender(&peer).await;

        for _ in 0..DEFAULT_LOSSY_THRESHOLD {
            assert!(peer.enqueue(frame(b"state"), Delivery::Reliable));
        }
        assert_eq!(peer.queue_depth(), 10);

        let accepted = (0..5)
            .filter(|_| peer.enqueue(frame(b"avatar"), Delivery::Lossy))
            .count();
        assert_eq!(accepted, 0);
        assert_eq!(peer.queue_depth(), 10);

        assert!(peer.enqueue(frame(b"pose"), Delivery::Reliable));
        assert_eq!(peer.queue_depth(), 11);
    }

    #[tokio::test]
    async fn test_lossy_frames_queued_below_threshold() {
        let (peer, _reader, _remote) = pipe_peer(1);
        stall_sender(&peer).await;
        for _ in 0..9 {
            peer.enqueue(frame(b"state"), Delivery::Reliable);
        }
        assert!(peer.enqueue(frame(b"avatar"), Delivery::Lossy));
        assert_eq!(peer.queue_depth(), 10);
    }

    #[tokio::test]
    async fn test_single_sender_keeps_frames_whole() {
        // A tiny pipe forces many partial writes; frames must still parse.
        let (peer, _reader, mut remote) = pipe_peer(3);
        let payloads: Vec<Vec<u8>> = (0..50u8).map(|i| vec![i; (i as usize % 7) + 1]).collect();
        for p in &payloads {
            peer.enqueue(frame(p), Delivery::Reliable);
            if p[0] % 5 == 0 {
                tokio::task::yield_now().await;
            }
        }
        for expected in &payloads {
            let body = framing::read_frame(&mut remote, &FrameConfig::default())
                .await
                .unwrap();
            assert_eq!(&body, expected);
        }
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_rejects_sends() {
        let (peer, _reader, _remote) = pipe_peer(1024);
        peer.close();
        peer.close();
        assert!(peer.is_closed());
        assert!(!peer.enqueue(frame(b"late"), Delivery::Reliable));
        assert_eq!(peer.queue_depth(), 0);
    }

    #[tokio::test]
    async fn test_close_ends_remote_stream() {
        // Both split halves must go for the pipe to report EOF.
        let (peer, reader, mut remote) = pipe_peer(1024);
        drop(reader);
        peer.close();
        let mut buf = [0u8; 8];
        let n = remote.read(&mut buf).await.unwrap();
        assert_eq!(n, 0, "remote should see EOF once the writer is dropped");
    }

    #[tokio::test]
    async fn test_close_releases_writer_blocked_on_full_pipe() {
        let (peer, _reader, _remote) = pipe_peer(16);
        peer.enqueue(frame(&[0u8; 4096]), Delivery::Reliable);
        for _ in 0..100 {
            if peer.queue_depth() == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(peer.queue_depth(), 0, "sender never picked up the frame");
        assert_eq!(Arc::strong_count(&peer.shared), 2);

        peer.close();
        tokio::time::timeout(Duration::from_secs(1), async {
            while Arc::strong_count(&peer.shared) > 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("sender task still holds the peer");
        assert!(peer.shared.writer.try_lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reader_forwards_messages_then_closed() {
        let (peer, reader, mut remote) = pipe_peer(4096);
        let (tx, mut rx) = mpsc::channel(8);
        let task = reader.spawn(tx);

        let msg = Message::ObjectClosed(ObjectClosed { id: ObjectId(77) });
        let encoded = messages::encode(&msg).unwrap();
        remote.write_all(&encoded).await.unwrap();

        match rx.recv().await.unwrap() {
            NetEvent::Message {
                peer: id,
                message,
                frame,
            } => {
                assert_eq!(id, peer.id());
                assert_eq!(message, msg);
                assert_eq!(&frame[..], &encoded[..]);
            }
            other => panic!("unexpected event {other:?}"),
        }

        drop(remote);
        match rx.recv().await.unwrap() {
            NetEvent::Closed { reason, .. } => assert_eq!(reason, Disconnect::EndOfStream),
            other => panic!("unexpected event {other:?}"),
        }
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_reader_reports_protocol_error() {
        let (_peer, reader, mut remote) = pipe_peer(4096);
        let (tx, mut rx) = mpsc::channel(8);
        reader.spawn(tx);

        remote.write_all(&framing::frame_body(&[0xEE])).await.unwrap();
        match rx.recv().await.unwrap() {
            NetEvent::Closed { reason, .. } => {
                assert!(matches!(reason, Disconnect::Protocol(_)), "{reason:?}")
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_local_close_stops_reader() {
        let (peer, reader, _remote) = pipe_peer(4096);
        let (tx, mut rx) = mpsc::channel(8);
        reader.spawn(tx);
        peer.close();
        match rx.recv().await.unwrap() {
            NetEvent::Closed { reason, .. } => assert_eq!(reason, Disconnect::Local),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_send_encodes_message() {
        let (peer, _reader, mut remote) = pipe_peer(4096);
        let msg = Message::error("bye");
        assert!(peer.send(&msg).unwrap());
        let body = framing::read_frame(&mut remote, &FrameConfig::default())
            .await
            .unwrap();
        assert_eq!(messages::decode_body(&body).unwrap(), msg);
    }
}

//! TCP networking for meetings: framing, the message codec, handshake,
//! per-peer send queues, and the host accept loop.

pub mod framing;
pub mod handshake;
pub mod messages;
pub mod peer;
pub mod platform;
pub mod tcp_client;
pub mod tcp_server;

pub use framing::{FrameConfig, FrameError, read_frame, write_frame};
pub use handshake::{
    HandshakeError, MIN_COMPATIBLE_VERSION, PROTOCOL_PREFIX, PROTOCOL_VERSION, handshake,
};
pub use messages::{
    AvatarPose, CodecError, Delivery, ErrorNotice, Message, MessageKind, ObjectClosed, ObjectId,
    ObjectOpened, ObjectPose, ObjectVisibility, ParticipantId, ParticipantLeft, VersionHandshake,
    decode, decode_body, encode, encode_body,
};
pub use peer::{
    DEFAULT_LOSSY_THRESHOLD, Disconnect, Frame, NetEvent, Peer, PeerId, PeerOptions, PeerReader,
};
pub use platform::{DEFAULT_PORT, SocketConfig, configure_stream, create_listener};
pub use tcp_client::{ConnectOptions, JoinError, JoinFailureKind, connect};
pub use tcp_server::{
    ConnectionLimitReached, IdGenerator, MeetingServer, ParticipantSlots, ServerConfig, SlotGuard,
};

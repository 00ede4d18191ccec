//! Connection handshake: protocol prefix, then version exchange.
//!
//! Both sides write [`PROTOCOL_PREFIX`] followed by a framed
//! [`VersionHandshake`] as soon as the TCP connection is up, then read the
//! other side's pair. A host that cannot take another participant writes the
//! prefix followed by an [`Message::Error`] instead and closes.
//!
//! ```text
//! host                                   joiner
//!  |-- "TandemMeeting" + VersionHandshake -->|
//!  |<-- "TandemMeeting" + VersionHandshake --|
//!  |            (version checks)             |
//!  |<=========== meeting messages ==========>|
//! ```

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::framing::{self, FrameConfig, FrameError};
use crate::messages::{self, CodecError, Message, MessageKind, VersionHandshake};

/// ASCII bytes sent before any framed message.
pub const PROTOCOL_PREFIX: &[u8] = b"TandemMeeting";

/// Protocol version this build speaks.
pub const PROTOCOL_VERSION: u32 = 10;

/// Oldest peer version this build can interoperate with.
pub const MIN_COMPATIBLE_VERSION: u32 = 10;

impl VersionHandshake {
    /// The version pair of this build.
    pub const CURRENT: VersionHandshake = VersionHandshake {
        version: PROTOCOL_VERSION,
        minimum_compatible: MIN_COMPATIBLE_VERSION,
    };
}

/// Errors that can occur during the handshake.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    /// The other side did not open with our protocol prefix.
    #[error("peer did not send the meeting protocol prefix")]
    PrefixMismatch,

    /// A message other than a version handshake arrived first.
    #[error("expected a version handshake, received {0:?}")]
    UnexpectedMessage(MessageKind),

    /// The other side refused the connection with an error notice.
    #[error("{0}")]
    Rejected(String),

    /// The other side runs a protocol version older than we accept.
    #[error("peer protocol version {peer} is older than the required {required}")]
    PeerTooOld {
        /// The peer's version.
        peer: u32,
        /// Our minimum compatible version.
        required: u32,
    },

    /// We run a protocol version older than the other side accepts.
    #[error("local protocol version {local} is older than the peer's required {required}")]
    LocalTooOld {
        /// Our version.
        local: u32,
        /// The peer's minimum compatible version.
        required: u32,
    },

    /// Framing failed or the connection closed mid-handshake.
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// The handshake message could not be decoded.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Writing the handshake failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Text sent to a participant whose version is below our floor.
pub fn version_rejection_text(peer: u32, required: u32) -> String {
    format!(
        "Your meeting protocol version ({peer}) is too old; this meeting requires version {required} or newer."
    )
}

/// Text sent to a participant that arrives when the meeting is full.
pub fn meeting_full_text(max_participants: usize) -> String {
    format!("Meetings currently only allow {max_participants} participants.")
}

/// Check a remote version pair against ours.
pub fn check_versions(
    local: &VersionHandshake,
    remote: &VersionHandshake,
) -> Result<(), HandshakeError> {
    if remote.version < local.minimum_compatible {
        return Err(HandshakeError::PeerTooOld {
            peer: remote.version,
            required: local.minimum_compatible,
        });
    }
    if local.version < remote.minimum_compatible {
        return Err(HandshakeError::LocalTooOld {
            local: local.version,
            required: remote.minimum_compatible,
        });
    }
    Ok(())
}

/// Run the handshake on a fresh connection. Identical for host and joiner.
///
/// When the peer is too old, an error notice is written to it before
/// returning so it learns why it was dropped. Returns the peer's versions.
pub async fn handshake<S>(
    stream: &mut S,
    local: &VersionHandshake,
    frame: &FrameConfig,
) -> Result<VersionHandshake, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let hello = messages::encode_body(&Message::VersionHandshake(*local))?;
    stream.write_all(PROTOCOL_PREFIX).await?;
    framing::write_frame(stream, &hello, frame).await?;

    read_prefix(stream).await?;
    let body = framing::read_frame(stream, frame).await?;
    let remote = match messages::decode_body(&body)? {
        Message::VersionHandshake(remote) => remote,
        Message::Error(notice) => return Err(HandshakeError::Rejected(notice.text)),
        other => return Err(HandshakeError::UnexpectedMessage(other.kind())),
    };

    if let Err(e) = check_versions(local, &remote) {
        if let HandshakeError::PeerTooOld { peer, required } = e {
            let notice = Message::error(version_rejection_text(peer, required));
            if let Ok(body) = messages::encode_body(&notice) {
                let _ = framing::write_frame(stream, &body, frame).await;
            }
        }
        return Err(e);
    }

    tracing::debug!(
        local = local.version,
        remote = remote.version,
        "handshake complete"
    );
    Ok(remote)
}

/// How long a refused connection is kept open to consume the joiner's hello.
const REJECT_LINGER: Duration = Duration::from_secs(2);

/// Refuse a connection: prefix, then an error notice in place of a version.
///
/// The joiner's own prefix and version are read and discarded afterwards so
/// the socket is not closed with unread data, which would reset it before
/// the notice is delivered.
pub async fn reject<S>(stream: &mut S, text: &str, frame: &FrameConfig) -> Result<(), HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let body = messages::encode_body(&Message::error(text))?;
    stream.write_all(PROTOCOL_PREFIX).await?;
    framing::write_frame(stream, &body, frame).await?;

    let _ = tokio::time::timeout(REJECT_LINGER, async {
        read_prefix(stream).await?;
        framing::read_frame(stream, frame).await?;
        Ok::<_, HandshakeError>(())
    })
    .await;
    stream.shutdown().await?;
    Ok(())
}

async fn read_prefix<R: AsyncRead + Unpin>(stream: &mut R) -> Result<(), HandshakeError> {
    let mut prefix = [0u8; PROTOCOL_PREFIX.len()];
    match stream.read_exact(&mut prefix).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(FrameError::ConnectionClosed.into());
        }
        Err(e) => return Err(e.into()),
    }
    if prefix != PROTOCOL_PREFIX {
        return Err(HandshakeError::PrefixMismatch);
    }
    Ok(())
}

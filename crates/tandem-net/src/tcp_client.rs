//! Outbound connection to a meeting host.
//!
//! [`connect`] covers everything up to a handshaken stream: TCP connect,
//! socket options, prefix and version exchange. Every failure comes back as
//! a [`JoinError`] whose [`JoinError::kind`] tells the UI which of the
//! user-facing explanations applies.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpStream;

use crate::framing::FrameConfig;
use crate::handshake::{self, HandshakeError};
use crate::messages::VersionHandshake;
use crate::platform::{self, SocketConfig};

/// Coarse reason a join failed, for choosing a user-facing message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinFailureKind {
    /// Nothing answered at the address (refused, unreachable, reset).
    Unreachable,
    /// The host did not complete the handshake in time.
    TimedOut,
    /// One side's protocol version is too old for the other.
    IncompatibleVersion,
    /// The host refused us, e.g. because the meeting is full.
    Rejected,
    /// The host spoke something other than the meeting protocol.
    Protocol,
}

/// Errors returned by [`connect`].
#[derive(Debug, thiserror::Error)]
pub enum JoinError {
    #[error("could not reach {addr}: {source}")]
    Unreachable {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("timed out connecting to {addr}")]
    TimedOut { addr: SocketAddr },

    /// The host is older than we can talk to.
    #[error("the host's protocol version {host} is older than the required {required}")]
    HostTooOld { host: u32, required: u32 },

    /// We are older than the host accepts.
    #[error("this client's protocol version {local} is too old; the host requires {required}")]
    ClientTooOld { local: u32, required: u32 },

    /// The host sent an error notice instead of its version.
    #[error("{0}")]
    Rejected(String),

    #[error("handshake failed: {0}")]
    Handshake(HandshakeError),
}

impl JoinError {
    pub fn kind(&self) -> JoinFailureKind {
        match self {
            JoinError::Unreachable { .. } => JoinFailureKind::Unreachable,
            JoinError::TimedOut { .. } => JoinFailureKind::TimedOut,
            JoinError::HostTooOld { .. } | JoinError::ClientTooOld { .. } => {
                JoinFailureKind::IncompatibleVersion
            }
            JoinError::Rejected(_) => JoinFailureKind::Rejected,
            JoinError::Handshake(_) => JoinFailureKind::Protocol,
        }
    }
}

impl From<HandshakeError> for JoinError {
    fn from(e: HandshakeError) -> Self {
        match e {
            HandshakeError::PeerTooOld { peer, required } => JoinError::HostTooOld {
                host: peer,
                required,
            },
            HandshakeError::LocalTooOld { local, required } => {
                JoinError::ClientTooOld { local, required }
            }
            HandshakeError::Rejected(text) => JoinError::Rejected(text),
            other => JoinError::Handshake(other),
        }
    }
}

/// Options for an outbound join.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Bound on connect plus handshake. Default: 10s.
    pub timeout: Duration,
    pub version: VersionHandshake,
    pub socket: SocketConfig,
    pub frame: FrameConfig,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            version: VersionHandshake::CURRENT,
            socket: SocketConfig::default(),
            frame: FrameConfig::default(),
        }
    }
}

/// Connect to the host at `addr` and run the handshake.
pub async fn connect(addr: SocketAddr, options: &ConnectOptions) -> Result<TcpStream, JoinError> {
    let attempt = async {
        let mut stream = TcpStream::connect(addr)
            .await
            .map_err(|source| JoinError::Unreachable { addr, source })?;
        platform::configure_stream(&stream, &options.socket)
            .map_err(|source| JoinError::Unreachable { addr, source })?;

        let host = handshake::handshake(&mut stream, &options.version, &options.frame).await?;
        tracing::info!("Joined meeting at {addr} (host protocol {})", host.version);
        Ok(stream)
    };

    match tokio::time::timeout(options.timeout, attempt).await {
        Ok(result) => result,
        Err(_) => Err(JoinError::TimedOut { addr }),
    }
}

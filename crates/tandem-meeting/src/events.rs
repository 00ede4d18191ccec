//! Notifications from the session to the UI.

use std::net::SocketAddr;

use tandem_net::{JoinFailureKind, ParticipantId};

/// Something the user should hear about.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Listening for participants on this address.
    HostingStarted(SocketAddr),
    JoinSucceeded(SocketAddr),
    JoinFailed {
        address: SocketAddr,
        kind: JoinFailureKind,
        message: String,
    },
    /// A remote participant left; remove its depiction.
    ParticipantLeft(ParticipantId),
    /// A remote avatar became stale (hidden) or fresh again (shown).
    AvatarVisibility {
        participant: ParticipantId,
        visible: bool,
    },
    /// Text the other side sent us, usually a rejection reason.
    Error(String),
    /// The meeting ended locally, or the host went away.
    LeftMeeting,
}

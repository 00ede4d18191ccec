//! Meeting message types and the wire codec.
//!
//! A frame body starts with a one-byte [`MessageKind`] tag. The remaining
//! bytes are the [`postcard`]-encoded fields of that kind. [`ObjectOpened`]
//! additionally carries the raw asset bytes after its fields:
//!
//! ```text
//! ObjectOpened body:
//! +-----+---------------------+------------------+-------------------+
//! | tag | fields length (u32) | postcard fields  | raw asset bytes   |
//! +-----+---------------------+------------------+-------------------+
//! ```
//!
//! Use [`encode`] to produce a complete length-prefixed frame and
//! [`decode`] / [`decode_body`] to parse one.

use std::fmt;

use serde::{Deserialize, Serialize};
use tandem_coords::Pose;

use crate::framing::{self, FrameError};

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Session-scoped identifier of a synchronized object.
///
/// Drawn at random by whichever participant first introduces the object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(pub u64);

impl ObjectId {
    /// A fresh random identifier (64 bits of entropy).
    pub fn random() -> Self {
        Self(rand::random())
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obj-{:016x}", self.0)
    }
}

/// Session-scoped identifier of a meeting participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ParticipantId(pub u64);

impl ParticipantId {
    pub fn random() -> Self {
        Self(rand::random())
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "participant-{:08x}", self.0 >> 32)
    }
}

// ---------------------------------------------------------------------------
// Message kinds
// ---------------------------------------------------------------------------

/// One-byte type tag at the start of every frame body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    ObjectPose = 1,
    AvatarPose = 2,
    ObjectOpened = 3,
    ObjectClosed = 4,
    VersionHandshake = 5,
    Error = 6,
    ObjectVisibility = 7,
    ParticipantLeft = 8,
}

impl MessageKind {
    pub fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            1 => Self::ObjectPose,
            2 => Self::AvatarPose,
            3 => Self::ObjectOpened,
            4 => Self::ObjectClosed,
            5 => Self::VersionHandshake,
            6 => Self::Error,
            7 => Self::ObjectVisibility,
            8 => Self::ParticipantLeft,
            _ => return None,
        })
    }

    pub fn tag(self) -> u8 {
        self as u8
    }
}

/// How a message may be treated when a peer's outbound queue backs up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Always queued.
    Reliable,
    /// Dropped when the queue is at or above the lossy threshold. A newer
    /// message of the same kind supersedes it.
    Lossy,
}

// ---------------------------------------------------------------------------
// Top-level enum
// ---------------------------------------------------------------------------

/// A meeting message. One variant per wire kind.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// An object moved, rotated or was rescaled (room frame).
    ObjectPose(ObjectPose),
    /// An object was shown or hidden.
    ObjectVisibility(ObjectVisibility),
    /// A participant's pointers and head (room frame).
    AvatarPose(AvatarPose),
    /// An object was opened; carries the asset bytes.
    ObjectOpened(ObjectOpened),
    /// An object was closed.
    ObjectClosed(ObjectClosed),
    /// A participant left the meeting.
    ParticipantLeft(ParticipantLeft),
    /// Protocol version exchange right after the prefix.
    VersionHandshake(VersionHandshake),
    /// Human-readable rejection or failure notice.
    Error(ErrorNotice),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectPose {
    pub id: ObjectId,
    pub pose: Pose,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectVisibility {
    pub id: ObjectId,
    pub shown: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvatarPose {
    pub participant: ParticipantId,
    pub left: Pose,
    pub right: Pose,
    pub head: Pose,
}

/// Object announcement. `asset` is sent as a raw attachment, not postcard.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectOpened {
    pub id: ObjectId,
    pub name: String,
    pub pose: Pose,
    pub asset: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct ObjectOpenedFields<'a> {
    id: ObjectId,
    name: &'a str,
    pose: Pose,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectClosed {
    pub id: ObjectId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantLeft {
    pub participant: ParticipantId,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VersionHandshake {
    /// Protocol version of the sender.
    pub version: u32,
    /// Oldest protocol version the sender will talk to.
    pub minimum_compatible: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorNotice {
    pub text: String,
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::ObjectPose(_) => MessageKind::ObjectPose,
            Message::ObjectVisibility(_) => MessageKind::ObjectVisibility,
            Message::AvatarPose(_) => MessageKind::AvatarPose,
            Message::ObjectOpened(_) => MessageKind::ObjectOpened,
            Message::ObjectClosed(_) => MessageKind::ObjectClosed,
            Message::ParticipantLeft(_) => MessageKind::ParticipantLeft,
            Message::VersionHandshake(_) => MessageKind::VersionHandshake,
            Message::Error(_) => MessageKind::Error,
        }
    }

    pub fn delivery(&self) -> Delivery {
        match self {
            Message::AvatarPose(_) => Delivery::Lossy,
            _ => Delivery::Reliable,
        }
    }

    /// Whether a hub forwards this message to the other participants.
    /// Handshakes and errors are point-to-point.
    pub fn is_relayed(&self) -> bool {
        !matches!(self, Message::VersionHandshake(_) | Message::Error(_))
    }

    pub fn error(text: impl Into<String>) -> Self {
        Message::Error(ErrorNotice { text: text.into() })
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur while encoding or decoding a message.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The frame body was empty (no tag byte).
    #[error("empty frame body, no message tag")]
    EmptyBody,

    /// The tag byte names no known message kind.
    #[error("unknown message tag {0}")]
    UnknownTag(u8),

    /// The attachment header of an `ObjectOpened` runs past the body.
    #[error("object fields length {declared} exceeds the {available} bytes available")]
    AttachmentOutOfRange {
        /// Declared fields length.
        declared: u32,
        /// Bytes remaining after the fields length.
        available: usize,
    },

    /// Bytes were left over after the fields of a fixed-size message.
    #[error("{0} trailing bytes after {1:?} fields")]
    TrailingBytes(usize, MessageKind),

    /// The outer frame was malformed.
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// Postcard (de)serialization failed.
    #[error("field encoding error: {0}")]
    Postcard(#[from] postcard::Error),
}

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

/// Serialize `msg` into its frame body: `[tag] [payload]`.
pub fn encode_body(msg: &Message) -> Result<Vec<u8>, CodecError> {
    let mut body = vec![msg.kind().tag()];
    match msg {
        Message::ObjectPose(m) => append_fields(&mut body, m)?,
        Message::ObjectVisibility(m) => append_fields(&mut body, m)?,
        Message::AvatarPose(m) => append_fields(&mut body, m)?,
        Message::ObjectClosed(m) => append_fields(&mut body, m)?,
        Message::ParticipantLeft(m) => append_fields(&mut body, m)?,
        Message::VersionHandshake(m) => append_fields(&mut body, m)?,
        Message::Error(m) => append_fields(&mut body, m)?,
        Message::ObjectOpened(m) => {
            let fields = postcard::to_allocvec(&ObjectOpenedFields {
                id: m.id,
                name: &m.name,
                pose: m.pose,
            })?;
            body.reserve(4 + fields.len() + m.asset.len());
            body.extend_from_slice(&(fields.len() as u32).to_le_bytes());
            body.extend_from_slice(&fields);
            body.extend_from_slice(&m.asset);
        }
    }
    Ok(body)
}

fn append_fields<T: Serialize>(body: &mut Vec<u8>, fields: &T) -> Result<(), CodecError> {
    body.extend_from_slice(&postcard::to_allocvec(fields)?);
    Ok(())
}

/// Serialize `msg` into a complete length-prefixed frame, ready to queue.
pub fn encode(msg: &Message) -> Result<Vec<u8>, CodecError> {
    Ok(framing::frame_body(&encode_body(msg)?))
}

/// Parse a complete length-prefixed frame.
pub fn decode(frame: &[u8]) -> Result<Message, CodecError> {
    decode_body(framing::split_frame(frame)?)
}

/// Parse a frame body (everything after the length prefix).
pub fn decode_body(body: &[u8]) -> Result<Message, CodecError> {
    let (&tag, payload) = body.split_first().ok_or(CodecError::EmptyBody)?;
    let kind = MessageKind::from_tag(tag).ok_or(CodecError::UnknownTag(tag))?;

    let msg = match kind {
        MessageKind::ObjectPose => Message::ObjectPose(exact_fields(payload, kind)?),
        MessageKind::ObjectVisibility => Message::ObjectVisibility(exact_fields(payload, kind)?),
        MessageKind::AvatarPose => Message::AvatarPose(exact_fields(payload, kind)?),
        MessageKind::ObjectClosed => Message::ObjectClosed(exact_fields(payload, kind)?),
        MessageKind::ParticipantLeft => Message::ParticipantLeft(exact_fields(payload, kind)?),
        MessageKind::VersionHandshake => Message::VersionHandshake(exact_fields(payload, kind)?),
        MessageKind::Error => Message::Error(exact_fields(payload, kind)?),
        MessageKind::ObjectOpened => Message::ObjectOpened(decode_opened(payload)?),
    };
    Ok(msg)
}

fn exact_fields<T: serde::de::DeserializeOwned>(
    payload: &[u8],
    kind: MessageKind,
) -> Result<T, CodecError> {
    let (fields, rest) = postcard::take_from_bytes(payload)?;
    if !rest.is_empty() {
        return Err(CodecError::TrailingBytes(rest.len(), kind));
    }
    Ok(fields)
}

fn decode_opened(payload: &[u8]) -> Result<ObjectOpened, CodecError> {
    if payload.len() < 4 {
        return Err(CodecError::AttachmentOutOfRange {
            declared: 0,
            available: payload.len(),
        });
    }
    let (len_bytes, rest) = payload.split_at(4);
    let declared = u32::from_le_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]]);
    if declared as usize > rest.len() {
        return Err(CodecError::AttachmentOutOfRange {
            declared,
            available: rest.len(),
        });
    }
    let (fields, asset) = rest.split_at(declared as usize);
    let fields: ObjectOpenedFields<'_> = exact_fields_borrowed(fields)?;
    Ok(ObjectOpened {
        id: fields.id,
        name: fields.name.to_string(),
        pose: fields.pose,
        asset: asset.to_vec(),
    })
}

fn exact_fields_borrowed<'a>(fields: &'a [u8]) -> Result<ObjectOpenedFields<'a>, CodecError> {
    let (value, rest) = postcard::take_from_bytes(fields)?;
    if !rest.is_empty() {
        return Err(CodecError::TrailingBytes(
            rest.len(),
            MessageKind::ObjectOpened,
        ));
    }
    Ok(value)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use glam::{Quat, Vec3};

    fn pose(x: f32) -> Pose {
        Pose::new(Vec3::new(x, -x, 2.0 * x), Quat::from_rotation_y(x), 0.5 + x)
    }

    fn roundtrip(msg: Message) {
        let frame = encode(&msg).unwrap();
        let decoded = decode(&frame).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn test_every_kind_roundtrips() {
        let id = ObjectId(0xDEAD_BEEF_0042);
        let participant = ParticipantId(u64::MAX);
        let messages = vec![
            Message::ObjectPose(ObjectPose { id, pose: pose(1.5) }),
            Message::ObjectVisibility(ObjectVisibility { id, shown: false }),
            Message::AvatarPose(AvatarPose {
                participant,
                left: pose(0.1),
                right: pose(-0.2),
                head: pose(1.7),
            }),
            Message::ObjectClosed(ObjectClosed { id }),
            Message::ParticipantLeft(ParticipantLeft { participant }),
            Message::VersionHandshake(VersionHandshake {
                version: 10,
                minimum_compatible: 9,
            }),
            Message::error("Meeting is full"),
            Message::ObjectOpened(ObjectOpened {
                id,
                name: "cube.glb".to_string(),
                pose: pose(3.0),
                asset: vec![0x67, 0x6C, 0x54, 0x46, 0, 1, 2, 255],
            }),
        ];
        for msg in messages {
            roundtrip(msg);
        }
    }

    #[test]
    fn test_opened_asset_is_byte_identical() {
        let asset: Vec<u8> = (0..=255u8).cycle().take(70_000).collect();
        let msg = Message::ObjectOpened(ObjectOpened {
            id: ObjectId(7),
            name: String::new(),
            pose: Pose::IDENTITY,
            asset: asset.clone(),
        });
        let Message::ObjectOpened(decoded) = decode(&encode(&msg).unwrap()).unwrap() else {
            panic!("wrong kind");
        };
        assert_eq!(decoded.asset, asset);
    }

    #[test]
    fn test_opened_with_empty_asset() {
        roundtrip(Message::ObjectOpened(ObjectOpened {
            id: ObjectId(1),
            name: "empty".to_string(),
            pose: Pose::IDENTITY,
            asset: Vec::new(),
        }));
    }

    #[test]
    fn test_tag_is_first_body_byte() {
        let frame = encode(&Message::ObjectClosed(ObjectClosed { id: ObjectId(3) })).unwrap();
        assert_eq!(frame[4], MessageKind::ObjectClosed.tag());
        let declared = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]);
        assert_eq!(declared as usize, frame.len() - 4);
    }

    #[test]
    fn test_length_mismatch_rejected() {
        let mut frame = encode(&Message::error("x")).unwrap();
        frame.push(0);
        assert!(matches!(
            decode(&frame),
            Err(CodecError::Frame(FrameError::LengthMismatch { .. }))
        ));
        frame.truncate(frame.len() - 2);
        assert!(matches!(
            decode(&frame),
            Err(CodecError::Frame(FrameError::LengthMismatch { .. }))
        ));
    }

    #[test]
    fn test_empty_body_rejected() {
        assert!(matches!(decode_body(&[]), Err(CodecError::EmptyBody)));
    }

    #[test]
    fn test_unknown_tag_rejected() {
        assert!(matches!(
            decode_body(&[0xEE, 1, 2]),
            Err(CodecError::UnknownTag(0xEE))
        ));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut body = encode_body(&Message::ObjectClosed(ObjectClosed { id: ObjectId(9) })).unwrap();
        body.push(0);
        assert!(matches!(
            decode_body(&body),
            Err(CodecError::TrailingBytes(1, MessageKind::ObjectClosed))
        ));
    }

    #[test]
    fn test_opened_fields_length_past_end_rejected() {
        let mut body = vec![MessageKind::ObjectOpened.tag()];
        body.extend_from_slice(&1000u32.to_le_bytes());
        body.extend_from_slice(&[1, 2, 3]);
        assert!(matches!(
            decode_body(&body),
            Err(CodecError::AttachmentOutOfRange {
                declared: 1000,
                available: 3
            })
        ));
    }

    #[test]
    fn test_truncated_fields_rejected() {
        let body = encode_body(&Message::ObjectPose(ObjectPose {
            id: ObjectId(1),
            pose: pose(1.0),
        }))
        .unwrap();
        assert!(matches!(
            decode_body(&body[..body.len() - 3]),
            Err(CodecError::Postcard(_))
        ));
    }

    #[test]
    fn test_delivery_and_relay_policy() {
        let avatar = Message::AvatarPose(AvatarPose {
            participant: ParticipantId(1),
            left: Pose::IDENTITY,
            right: Pose::IDENTITY,
            head: Pose::IDENTITY,
        });
        assert_eq!(avatar.delivery(), Delivery::Lossy);
        assert!(avatar.is_relayed());

        let pose_msg = Message::ObjectPose(ObjectPose {
            id: ObjectId(1),
            pose: Pose::IDENTITY,
        });
        assert_eq!(pose_msg.delivery(), Delivery::Reliable);

        assert!(!Message::error("no").is_relayed());
        assert!(
            !Message::VersionHandshake(VersionHandshake {
                version: 1,
                minimum_compatible: 1
            })
            .is_relayed()
        );
    }

    #[test]
    fn test_tags_roundtrip() {
        for tag in 1..=8u8 {
            assert_eq!(MessageKind::from_tag(tag).unwrap().tag(), tag);
        }
        assert!(MessageKind::from_tag(0).is_none());
        assert!(MessageKind::from_tag(9).is_none());
    }
}

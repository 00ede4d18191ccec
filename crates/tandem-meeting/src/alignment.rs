//! Two-marker room alignment and its persistence.
//!
//! While aligning, each hand's trigger drops that hand's marker at the
//! pointer: the right hand places `x1`, the left hand `x2`. Once both
//! markers are placed, every drop re-captures the room frame.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use glam::Vec3;
use tandem_config::{ConfigError, RoomAlignments};
use tandem_coords::FrameCaptureError;

/// Which hand triggered a marker drop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hand {
    Left,
    Right,
}

/// Errors from the alignment workflow.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AlignmentError {
    /// Only the host may align the room.
    #[error("only the meeting host can align the room")]
    NotHost,

    /// A marker was dropped outside an alignment pass.
    #[error("room alignment is not active")]
    NotActive,

    #[error(transparent)]
    Capture(#[from] FrameCaptureError),
}

/// Markers placed during one alignment pass.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MarkerCapture {
    x1: Option<Vec3>,
    x2: Option<Vec3>,
}

impl MarkerCapture {
    /// Start from the markers of the current frame, if any, so a single
    /// drop can adjust an existing alignment.
    pub fn starting_from(markers: Option<(Vec3, Vec3)>) -> Self {
        match markers {
            Some((x1, x2)) => Self {
                x1: Some(x1),
                x2: Some(x2),
            },
            None => Self::default(),
        }
    }

    pub fn drop_marker(&mut self, hand: Hand, position: Vec3) {
        match hand {
            Hand::Right => self.x1 = Some(position),
            Hand::Left => self.x2 = Some(position),
        }
    }

    /// `(x1, x2)` once both are placed.
    pub fn markers(&self) -> Option<(Vec3, Vec3)> {
        Some((self.x1?, self.x2?))
    }
}

/// Where room alignments are remembered between sessions.
pub trait AlignmentStore {
    fn save_room_alignment(&mut self, room_id: &str, x1: Vec3, x2: Vec3)
    -> Result<(), ConfigError>;

    fn load_room_alignment(&self, room_id: &str) -> Result<Option<(Vec3, Vec3)>, ConfigError>;
}

/// Alignments kept in `room_alignments.ron` in the config directory.
#[derive(Debug, Clone)]
pub struct FileAlignmentStore {
    config_dir: PathBuf,
}

impl FileAlignmentStore {
    pub fn new(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
        }
    }
}

impl AlignmentStore for FileAlignmentStore {
    fn save_room_alignment(
        &mut self,
        room_id: &str,
        x1: Vec3,
        x2: Vec3,
    ) -> Result<(), ConfigError> {
        let mut alignments = RoomAlignments::load(&self.config_dir)?;
        alignments.set(room_id, x1.to_array(), x2.to_array());
        alignments.save(&self.config_dir)
    }

    fn load_room_alignment(&self, room_id: &str) -> Result<Option<(Vec3, Vec3)>, ConfigError> {
        let alignments = RoomAlignments::load(&self.config_dir)?;
        Ok(alignments
            .get(room_id)
            .map(|a| (Vec3::from_array(a.x1), Vec3::from_array(a.x2))))
    }
}

/// Alignments held in memory. Clones share the same rooms.
#[derive(Debug, Clone, Default)]
pub struct MemoryAlignmentStore {
    rooms: Arc<Mutex<HashMap<String, (Vec3, Vec3)>>>,
}

impl MemoryAlignmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, room_id: &str) -> Option<(Vec3, Vec3)> {
        self.rooms
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(room_id)
            .copied()
    }
}

impl AlignmentStore for MemoryAlignmentStore {
    fn save_room_alignment(
        &mut self,
        room_id: &str,
        x1: Vec3,
        x2: Vec3,
    ) -> Result<(), ConfigError> {
        self.rooms
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(room_id.to_string(), (x1, x2));
        Ok(())
    }

    fn load_room_alignment(&self, room_id: &str) -> Result<Option<(Vec3, Vec3)>, ConfigError> {
        Ok(self.get(room_id))
    }
}

use glam::Vec3;

use crate::{Pose, RigidTransform};

/// Markers closer than this in the horizontal plane do not define a direction.
const MIN_MARKER_SEPARATION: f32 = 1e-4;

/// Errors that can occur while capturing a room frame.
#[derive(Debug, Clone, Copy, PartialEq, thiserror::Error)]
pub enum FrameCaptureError {
    /// The markers coincide when projected onto the horizontal plane.
    #[error("room markers {x1} and {x2} are not horizontally separated")]
    DegenerateMarkers {
        /// First marker.
        x1: Vec3,
        /// Second marker.
        x2: Vec3,
    },
}

/// Local <-> room transform derived from two user-placed markers.
///
/// Before any markers are captured the frame is the identity, so local and
/// room space coincide.
#[derive(Clone, Debug, PartialEq)]
pub struct RoomFrame {
    markers: Option<(Vec3, Vec3)>,
    room_to_local: RigidTransform,
    local_to_room: RigidTransform,
}

impl Default for RoomFrame {
    fn default() -> Self {
        Self::identity()
    }
}

impl RoomFrame {
    pub fn identity() -> Self {
        Self {
            markers: None,
            room_to_local: RigidTransform::IDENTITY,
            local_to_room: RigidTransform::IDENTITY,
        }
    }

    /// Build a frame directly from two markers (e.g. restored from disk).
    pub fn from_markers(x1: Vec3, x2: Vec3) -> Result<Self, FrameCaptureError> {
        let mut frame = Self::identity();
        frame.capture(x1, x2)?;
        Ok(frame)
    }

    /// The markers the frame was captured from, if any.
    pub fn markers(&self) -> Option<(Vec3, Vec3)> {
        self.markers
    }

    /// Room origin expressed in local space.
    pub fn origin(&self) -> Vec3 {
        self.room_to_local.translation
    }

    pub fn local_to_room(&self) -> RigidTransform {
        self.local_to_room
    }

    pub fn room_to_local(&self) -> RigidTransform {
        self.room_to_local
    }

    pub fn to_room(&self, pose: &Pose) -> Pose {
        self.local_to_room.apply(pose)
    }

    pub fn from_room(&self, pose: &Pose) -> Pose {
        self.room_to_local.apply(pose)
    }

    /// Recompute the frame from markers `x1` and `x2` (local space).
    ///
    /// Returns the local-space motion that carries anything placed under the
    /// old frame to the spot that has the same room coordinates under the new
    /// frame. On error the frame is left unchanged.
    pub fn capture(&mut self, x1: Vec3, x2: Vec3) -> Result<RigidTransform, FrameCaptureError> {
        let mut axis = x2 - x1;
        axis.y = 0.0;
        if axis.length() < MIN_MARKER_SEPARATION {
            return Err(FrameCaptureError::DegenerateMarkers { x1, x2 });
        }

        // Rotation about +Y taking +X onto the marker axis: X -> (cos, 0, -sin).
        let yaw = (-axis.z).atan2(axis.x);
        let origin = 0.5 * (x1 + x2);
        let new_room_to_local = RigidTransform::from_yaw_translation(yaw, origin);

        let motion = new_room_to_local * self.local_to_room;
        self.room_to_local = new_room_to_local;
        self.local_to_room = new_room_to_local.inverse();
        self.markers = Some((x1, x2));
        Ok(motion)
    }
}

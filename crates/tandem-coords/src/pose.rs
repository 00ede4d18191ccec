use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};

/// Position, orientation and uniform scale of a scene object or pointer.
///
/// Equality is exact (component-wise `f32` comparison); change detection
/// relies on that.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub position: Vec3,
    pub rotation: Quat,
    pub scale: f32,
}

impl Pose {
    /// The identity pose: origin, no rotation, unit scale.
    pub const IDENTITY: Pose = Pose {
        position: Vec3::ZERO,
        rotation: Quat::IDENTITY,
        scale: 1.0,
    };

    pub fn new(position: Vec3, rotation: Quat, scale: f32) -> Self {
        Self {
            position,
            rotation,
            scale,
        }
    }

    /// A pose at `position` with identity rotation and unit scale.
    pub fn from_position(position: Vec3) -> Self {
        Self {
            position,
            ..Self::IDENTITY
        }
    }

    /// Returns true if position and scale are within `epsilon` of `other` and
    /// the rotations describe the same orientation within `epsilon`.
    ///
    /// `q` and `-q` are the same orientation, so rotations are compared by
    /// the absolute value of their dot product.
    pub fn approx_eq(&self, other: &Pose, epsilon: f32) -> bool {
        self.position.abs_diff_eq(other.position, epsilon)
            && (self.scale - other.scale).abs() < epsilon
            && (1.0 - self.rotation.dot(other.rotation).abs()) < epsilon
    }
}

impl Default for Pose {
    fn default() -> Self {
        Self::IDENTITY
    }
}

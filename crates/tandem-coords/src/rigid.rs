use std::ops::Mul;

use glam::{Quat, Vec3};

use crate::Pose;

/// A rotation followed by a translation. Never scales.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RigidTransform {
    pub rotation: Quat,
    pub translation: Vec3,
}

impl RigidTransform {
    pub const IDENTITY: RigidTransform = RigidTransform {
        rotation: Quat::IDENTITY,
        translation: Vec3::ZERO,
    };

    pub fn new(rotation: Quat, translation: Vec3) -> Self {
        Self {
            rotation,
            translation,
        }
    }

    /// Rotation by `yaw` radians about the vertical (+Y) axis, then translation.
    pub fn from_yaw_translation(yaw: f32, translation: Vec3) -> Self {
        Self::new(Quat::from_rotation_y(yaw), translation)
    }

    pub fn inverse(&self) -> Self {
        let rotation = self.rotation.inverse();
        Self {
            rotation,
            translation: -(rotation * self.translation),
        }
    }

    pub fn transform_point(&self, point: Vec3) -> Vec3 {
        self.rotation * point + self.translation
    }

    /// Moves a pose rigidly. Scale is carried through untouched.
    ///
    /// The rotation is renormalized only once drift makes it non-unit, so the
    /// identity transform returns the pose bit for bit.
    pub fn apply(&self, pose: &Pose) -> Pose {
        let rotation = self.rotation * pose.rotation;
        Pose {
            position: self.transform_point(pose.position),
            rotation: if rotation.is_normalized() {
                rotation
            } else {
                rotation.normalize()
            },
            scale: pose.scale,
        }
    }

    pub fn approx_eq(&self, other: &RigidTransform, epsilon: f32) -> bool {
        self.translation.abs_diff_eq(other.translation, epsilon)
            && (1.0 - self.rotation.dot(other.rotation).abs()) < epsilon
    }
}

impl Default for RigidTransform {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// `a * b` applies `b` first, then `a`.
impl Mul for RigidTransform {
    type Output = RigidTransform;

    fn mul(self, rhs: RigidTransform) -> RigidTransform {
        RigidTransform {
            rotation: (self.rotation * rhs.rotation).normalize(),
            translation: self.rotation * rhs.translation + self.translation,
        }
    }
}

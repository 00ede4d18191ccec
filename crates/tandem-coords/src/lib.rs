//! Poses, rigid transforms, and the shared room coordinate frame.
//!
//! Every participant tracks objects in its own local space. Before a pose is
//! put on the wire it is converted into the *room frame*, which is defined by
//! two markers the user places on the floor of the physical room:
//!
//! ```text
//!            x2
//!           /
//!   origin *        origin = (x1 + x2) / 2
//!         /         +X     = horizontal direction x1 -> x2
//!       x1          +Y     = local vertical (never tilted)
//! ```
//!
//! Because every participant derives the frame from the same physical points,
//! a pose expressed in room space means the same spot in the room for everyone.

mod pose;
mod rigid;
mod room_frame;

pub use pose::Pose;
pub use rigid::RigidTransform;
pub use room_frame::{FrameCaptureError, RoomFrame};

pub use glam::{Quat, Vec3};

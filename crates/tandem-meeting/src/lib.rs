//! Meeting sessions over a shared 3D scene.
//!
//! One participant hosts; the others join it over TCP and the host relays
//! everything between them (a star topology). Every tick a [`Session`]
//! diffs the local [`Scene`] against what it last broadcast and sends
//! opens, closes, poses and visibility changes, plus the local avatar.
//! Poses travel in the shared room frame, so two headsets standing in the
//! same physical room see objects at the same spot once both have aligned.
//!
//! The rendering side plugs in through the [`Scene`] trait;
//! [`MemoryScene`] is a headless implementation used by the CLI and tests.

mod alignment;
mod avatar;
mod events;
mod registry;
mod scene;
mod session;

pub use alignment::{
    AlignmentError, AlignmentStore, FileAlignmentStore, Hand, MarkerCapture, MemoryAlignmentStore,
};
pub use avatar::{AvatarState, AvatarTracker, DEFAULT_STALE_AFTER, VisibilityChange};
pub use events::SessionEvent;
pub use registry::{ObjectRegistry, Snapshot, SyncedObject};
pub use scene::{MemoryHandle, MemoryScene, Scene, SceneError};
pub use session::{LocalInput, NET_EVENT_CAPACITY, Session, SessionConfig, SessionError};

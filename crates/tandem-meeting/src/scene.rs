//! The scene collaborator: whatever holds the loaded objects locally.
//!
//! The session never parses assets or renders anything. It only needs to
//! list what is open, move things around, and hand asset bytes to the wire.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::path::Path;

use tandem_coords::Pose;

/// Errors reported by a [`Scene`].
#[derive(Debug, thiserror::Error)]
pub enum SceneError {
    /// The handle does not name a live object.
    #[error("no object with handle {0}")]
    UnknownHandle(String),

    /// The scene could not build an object from the received asset.
    #[error("could not instantiate {name}: {reason}")]
    Instantiate { name: String, reason: String },

    /// The asset bytes of a local object could not be read.
    #[error("could not read asset for {name}: {source}")]
    Asset {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

/// Local scene operations the meeting session consumes.
pub trait Scene {
    /// Opaque local reference to one object.
    type Handle: Copy + Eq + Hash + Debug;

    /// Every object currently open, local or remote in origin.
    fn list_open_objects(&self) -> Vec<Self::Handle>;

    /// Build an object from a received asset. The object starts at the
    /// identity pose and visible.
    fn instantiate(&mut self, name: &str, asset: &[u8]) -> Result<Self::Handle, SceneError>;

    fn destroy(&mut self, handle: Self::Handle);

    /// Current pose, or `None` if the handle is gone.
    fn pose(&self, handle: Self::Handle) -> Option<Pose>;

    fn set_pose(&mut self, handle: Self::Handle, pose: Pose);

    fn is_visible(&self, handle: Self::Handle) -> bool;

    fn set_visible(&mut self, handle: Self::Handle, visible: bool);

    /// Display name sent with the object, usually the file name.
    fn object_name(&self, handle: Self::Handle) -> String;

    /// The raw bytes the object was loaded from.
    fn read_asset_bytes(&self, handle: Self::Handle) -> Result<Vec<u8>, SceneError>;
}

/// Handle into a [`MemoryScene`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemoryHandle(pub u64);

#[derive(Debug, Clone)]
struct MemoryObject {
    name: String,
    asset: Vec<u8>,
    pose: Pose,
    visible: bool,
}

/// A scene that keeps objects in memory. Used by the headless binary and
/// by tests.
#[derive(Debug, Default)]
pub struct MemoryScene {
    objects: BTreeMap<MemoryHandle, MemoryObject>,
    next: u64,
}

impl MemoryScene {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open an object locally, as a user loading a file would.
    pub fn open(&mut self, name: impl Into<String>, asset: Vec<u8>) -> MemoryHandle {
        self.next += 1;
        let handle = MemoryHandle(self.next);
        self.objects.insert(
            handle,
            MemoryObject {
                name: name.into(),
                asset,
                pose: Pose::IDENTITY,
                visible: true,
            },
        );
        handle
    }

    /// Open a file from disk, named after its file name.
    pub fn open_file(&mut self, path: &Path) -> Result<MemoryHandle, SceneError> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let asset = std::fs::read(path).map_err(|source| SceneError::Asset {
            name: name.clone(),
            source,
        })?;
        Ok(self.open(name, asset))
    }

    /// Close a locally open object. Returns false if it was not open.
    pub fn close(&mut self, handle: MemoryHandle) -> bool {
        self.objects.remove(&handle).is_some()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// First object with the given name.
    pub fn find(&self, name: &str) -> Option<MemoryHandle> {
        self.objects
            .iter()
            .find(|(_, object)| object.name == name)
            .map(|(handle, _)| *handle)
    }

    pub fn asset(&self, handle: MemoryHandle) -> Option<&[u8]> {
        self.objects.get(&handle).map(|o| o.asset.as_slice())
    }
}

impl Scene for MemoryScene {
    type Handle = MemoryHandle;

    fn list_open_objects(&self) -> Vec<MemoryHandle> {
        self.objects.keys().copied().collect()
    }

    fn instantiate(&mut self, name: &str, asset: &[u8]) -> Result<MemoryHandle, SceneError> {
        Ok(self.open(name, asset.to_vec()))
    }

    fn destroy(&mut self, handle: MemoryHandle) {
        self.objects.remove(&handle);
    }

    fn pose(&self, handle: MemoryHandle) -> Option<Pose> {
        self.objects.get(&handle).map(|o| o.pose)
    }

    fn set_pose(&mut self, handle: MemoryHandle, pose: Pose) {
        if let Some(object) = self.objects.get_mut(&handle) {
            object.pose = pose;
        }
    }

    fn is_visible(&self, handle: MemoryHandle) -> bool {
        self.objects.get(&handle).is_some_and(|o| o.visible)
    }

    fn set_visible(&mut self, handle: MemoryHandle, visible: bool) {
        if let Some(object) = self.objects.get_mut(&handle) {
            object.visible = visible;
        }
    }

    fn object_name(&self, handle: MemoryHandle) -> String {
        self.objects
            .get(&handle)
            .map(|o| o.name.clone())
            .unwrap_or_default()
    }

    fn read_asset_bytes(&self, handle: MemoryHandle) -> Result<Vec<u8>, SceneError> {
        self.objects
            .get(&handle)
            .map(|o| o.asset.clone())
            .ok_or_else(|| SceneError::UnknownHandle(format!("{handle:?}")))
    }
}

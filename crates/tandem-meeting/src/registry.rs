//! Object registry: the shared identity of every synchronized object.
//!
//! Maps meeting-wide [`ObjectId`]s to local scene handles in both
//! directions and remembers, per object, the pose and visibility last put
//! on the wire. Each tick the session diffs the scene against that
//! snapshot to decide what to broadcast.
//!
//! Identifiers are random and never reused within a registry's lifetime,
//! even after the object closes.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;

use tandem_coords::{Pose, RigidTransform};
use tandem_net::{ObjectId, ObjectOpened};

use crate::scene::{Scene, SceneError};

/// What was last broadcast (or applied from the network) for one object.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Snapshot {
    pub pose: Pose,
    pub visible: bool,
}

/// One object that is part of the meeting.
#[derive(Debug, Clone)]
pub struct SyncedObject<H> {
    pub id: ObjectId,
    pub handle: H,
    pub snapshot: Snapshot,
}

/// Bijection between [`ObjectId`]s and scene handles, plus change baselines.
#[derive(Debug)]
pub struct ObjectRegistry<H> {
    by_id: HashMap<ObjectId, SyncedObject<H>>,
    by_handle: HashMap<H, ObjectId>,
    /// Every id ever seen, open or closed. Locally generated ids avoid them.
    issued: HashSet<ObjectId>,
}

impl<H> Default for ObjectRegistry<H> {
    fn default() -> Self {
        Self {
            by_id: HashMap::new(),
            by_handle: HashMap::new(),
            issued: HashSet::new(),
        }
    }
}

impl<H: Copy + Eq + Hash> ObjectRegistry<H> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn get(&self, id: ObjectId) -> Option<&SyncedObject<H>> {
        self.by_id.get(&id)
    }

    pub fn id_of(&self, handle: H) -> Option<ObjectId> {
        self.by_handle.get(&handle).copied()
    }

    pub fn handle_of(&self, id: ObjectId) -> Option<H> {
        self.by_id.get(&id).map(|o| o.handle)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SyncedObject<H>> {
        self.by_id.values()
    }

    /// Whether `id` was ever registered, including objects since closed.
    pub fn was_issued(&self, id: ObjectId) -> bool {
        self.issued.contains(&id)
    }

    /// Forget every object. Issued ids stay reserved.
    pub fn clear(&mut self) {
        self.by_id.clear();
        self.by_handle.clear();
    }

    fn fresh_id(&mut self) -> ObjectId {
        loop {
            let id = ObjectId::random();
            if self.issued.insert(id) {
                return id;
            }
        }
    }

    fn insert(&mut self, id: ObjectId, handle: H, snapshot: Snapshot) {
        self.issued.insert(id);
        self.by_handle.insert(handle, id);
        self.by_id.insert(
            id,
            SyncedObject {
                id,
                handle,
                snapshot,
            },
        );
    }

    fn remove(&mut self, id: ObjectId) -> Option<SyncedObject<H>> {
        let object = self.by_id.remove(&id)?;
        self.by_handle.remove(&object.handle);
        Some(object)
    }

    /// Register objects that appeared in the scene since the last call,
    /// assigning each a fresh id.
    ///
    /// The baseline is the current pose and *visible*: a remote side shows
    /// a newly opened object, so a locally hidden one must still produce a
    /// visibility change.
    pub fn opened_since_last_check<S>(&mut self, scene: &S) -> Vec<(H, ObjectId)>
    where
        S: Scene<Handle = H>,
    {
        let mut opened = Vec::new();
        for handle in scene.list_open_objects() {
            if self.by_handle.contains_key(&handle) {
                continue;
            }
            let id = self.fresh_id();
            let snapshot = Snapshot {
                pose: scene.pose(handle).unwrap_or(Pose::IDENTITY),
                visible: true,
            };
            self.insert(id, handle, snapshot);
            opened.push((handle, id));
        }
        opened
    }

    /// Drop objects whose handle left the scene; returns their ids.
    pub fn closed_since_last_check<S>(&mut self, scene: &S) -> Vec<ObjectId>
    where
        S: Scene<Handle = H>,
    {
        let open: HashSet<H> = scene.list_open_objects().into_iter().collect();
        let closed: Vec<ObjectId> = self
            .by_id
            .values()
            .filter(|o| !open.contains(&o.handle))
            .map(|o| o.id)
            .collect();
        for id in &closed {
            self.remove(*id);
        }
        closed
    }

    /// Objects whose pose differs exactly from the snapshot. The snapshot
    /// is updated to the returned pose.
    pub fn changed_objects<S>(&mut self, scene: &S) -> Vec<(ObjectId, Pose)>
    where
        S: Scene<Handle = H>,
    {
        let mut changed = Vec::new();
        for object in self.by_id.values_mut() {
            let Some(pose) = scene.pose(object.handle) else {
                continue;
            };
            if pose != object.snapshot.pose {
                object.snapshot.pose = pose;
                changed.push((object.id, pose));
            }
        }
        changed
    }

    /// Objects whose visibility differs from the snapshot. The snapshot is
    /// updated to the returned value.
    pub fn visibility_changes<S>(&mut self, scene: &S) -> Vec<(ObjectId, bool)>
    where
        S: Scene<Handle = H>,
    {
        let mut changed = Vec::new();
        for object in self.by_id.values_mut() {
            if scene.pose(object.handle).is_none() {
                continue;
            }
            let visible = scene.is_visible(object.handle);
            if visible != object.snapshot.visible {
                object.snapshot.visible = visible;
                changed.push((object.id, visible));
            }
        }
        changed
    }

    /// Move every registered object by `motion` and rebaseline its pose, so
    /// the move is not reported as a change. Pending visibility changes are
    /// kept.
    pub fn relocate_all<S>(&mut self, scene: &mut S, motion: &RigidTransform)
    where
        S: Scene<Handle = H>,
    {
        for object in self.by_id.values_mut() {
            if let Some(pose) = scene.pose(object.handle) {
                let moved = motion.apply(&pose);
                scene.set_pose(object.handle, moved);
                object.snapshot.pose = scene.pose(object.handle).unwrap_or(moved);
            }
        }
    }

    /// Instantiate an object announced by another participant. `opened.pose`
    /// must already be in local space.
    ///
    /// Returns `Ok(None)` when the id is currently open, which happens when
    /// a full state overlaps a broadcast. An id closed earlier can be opened
    /// again: a participant that rejoins gets the host's objects anew.
    pub fn apply_remote_open<S>(
        &mut self,
        scene: &mut S,
        opened: &ObjectOpened,
    ) -> Result<Option<H>, SceneError>
    where
        S: Scene<Handle = H>,
    {
        if self.by_id.contains_key(&opened.id) {
            return Ok(None);
        }
        let handle = scene.instantiate(&opened.name, &opened.asset)?;
        scene.set_pose(handle, opened.pose);
        scene.set_visible(handle, true);
        let snapshot = Snapshot {
            pose: scene.pose(handle).unwrap_or(opened.pose),
            visible: scene.is_visible(handle),
        };
        self.insert(opened.id, handle, snapshot);
        Ok(Some(handle))
    }

    /// Destroy a remotely closed object. Returns false for unknown ids.
    pub fn apply_remote_close<S>(&mut self, scene: &mut S, id: ObjectId) -> bool
    where
        S: Scene<Handle = H>,
    {
        match self.remove(id) {
            Some(object) => {
                scene.destroy(object.handle);
                true
            }
            None => false,
        }
    }

    /// Apply a remote pose (local space). Returns false for unknown ids.
    pub fn apply_remote_pose<S>(&mut self, scene: &mut S, id: ObjectId, pose: Pose) -> bool
    where
        S: Scene<Handle = H>,
    {
        let Some(object) = self.by_id.get_mut(&id) else {
            return false;
        };
        scene.set_pose(object.handle, pose);
        object.snapshot.pose = scene.pose(object.handle).unwrap_or(pose);
        true
    }

    /// Apply a remote visibility change. Returns false for unknown ids.
    pub fn apply_remote_visibility<S>(&mut self, scene: &mut S, id: ObjectId, shown: bool) -> bool
    where
        S: Scene<Handle = H>,
    {
        let Some(object) = self.by_id.get_mut(&id) else {
            return false;
        };
        scene.set_visible(object.handle, shown);
        object.snapshot.visible = scene.is_visible(object.handle);
        true
    }
}

//! Remote participants' pointers and heads.
//!
//! Each participant broadcasts its avatar every tick. An avatar that stops
//! updating is hidden after a staleness window and shown again by the next
//! update; it is only removed when the participant leaves.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tandem_coords::{Pose, RigidTransform};
use tandem_net::ParticipantId;

/// How long an avatar stays visible without an update.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(3);

/// Last known avatar of one remote participant, in local space.
#[derive(Debug, Clone, PartialEq)]
pub struct AvatarState {
    pub left: Pose,
    pub right: Pose,
    pub head: Pose,
    pub last_update: Instant,
    pub visible: bool,
}

/// A participant's avatar was shown or hidden.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VisibilityChange {
    pub participant: ParticipantId,
    pub visible: bool,
}

#[derive(Debug)]
pub struct AvatarTracker {
    avatars: HashMap<ParticipantId, AvatarState>,
    stale_after: Duration,
}

impl Default for AvatarTracker {
    fn default() -> Self {
        Self::new(DEFAULT_STALE_AFTER)
    }
}

impl AvatarTracker {
    pub fn new(stale_after: Duration) -> Self {
        Self {
            avatars: HashMap::new(),
            stale_after,
        }
    }

    pub fn get(&self, participant: ParticipantId) -> Option<&AvatarState> {
        self.avatars.get(&participant)
    }

    pub fn len(&self) -> usize {
        self.avatars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.avatars.is_empty()
    }

    /// Record a fresh avatar. Returns a change if the avatar was previously
    /// unknown or hidden.
    pub fn update(
        &mut self,
        participant: ParticipantId,
        left: Pose,
        right: Pose,
        head: Pose,
        now: Instant,
    ) -> Option<VisibilityChange> {
        let fresh = AvatarState {
            left,
            right,
            head,
            last_update: now,
            visible: true,
        };
        let was_visible = self
            .avatars
            .insert(participant, fresh)
            .is_some_and(|previous| previous.visible);
        (!was_visible).then_some(VisibilityChange {
            participant,
            visible: true,
        })
    }

    /// Hide avatars that have not been updated within the window.
    pub fn refresh_visibility(&mut self, now: Instant) -> Vec<VisibilityChange> {
        let mut changes = Vec::new();
        for (participant, avatar) in &mut self.avatars {
            let stale = now.saturating_duration_since(avatar.last_update) > self.stale_after;
            if avatar.visible && stale {
                avatar.visible = false;
                changes.push(VisibilityChange {
                    participant: *participant,
                    visible: false,
                });
            }
        }
        changes
    }

    /// Forget a participant. Returns false if it was unknown.
    pub fn remove(&mut self, participant: ParticipantId) -> bool {
        self.avatars.remove(&participant).is_some()
    }

    /// Move every avatar by `motion` (after a room frame re-capture).
    pub fn apply_motion(&mut self, motion: &RigidTransform) {
        for avatar in self.avatars.values_mut() {
            avatar.left = motion.apply(&avatar.left);
            avatar.right = motion.apply(&avatar.right);
            avatar.head = motion.apply(&avatar.head);
        }
    }

    /// Forget everyone; returns who was known.
    pub fn clear(&mut self) -> Vec<ParticipantId> {
        self.avatars.drain().map(|(participant, _)| participant).collect()
    }
}

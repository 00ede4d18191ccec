//! Per-room alignment markers, persisted as `room_alignments.ron`.
//!
//! Each physical room is keyed by an opaque id. Markers are stored in the
//! local space of the machine that captured them, so the file is only
//! meaningful on that machine.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::{read_ron, write_ron};
use crate::error::ConfigError;

/// File name of the alignment store inside the config directory.
pub const ROOM_ALIGNMENTS_FILE: &str = "room_alignments.ron";

/// The two markers captured for one room.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct RoomAlignment {
    pub x1: [f32; 3],
    pub x2: [f32; 3],
}

/// All saved room alignments.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RoomAlignments {
    pub rooms: BTreeMap<String, RoomAlignment>,
}

impl RoomAlignments {
    /// Load from `config_dir`. A missing file yields an empty set.
    pub fn load(config_dir: &Path) -> Result<Self, ConfigError> {
        let path = config_dir.join(ROOM_ALIGNMENTS_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let alignments: RoomAlignments = read_ron(&path)?;
        log::debug!(
            "Loaded {} room alignment(s) from {}",
            alignments.rooms.len(),
            path.display()
        );
        Ok(alignments)
    }

    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        write_ron(&config_dir.join(ROOM_ALIGNMENTS_FILE), self)
    }

    pub fn get(&self, room_id: &str) -> Option<RoomAlignment> {
        self.rooms.get(room_id).copied()
    }

    /// Insert or replace the markers for `room_id`.
    pub fn set(&mut self, room_id: &str, x1: [f32; 3], x2: [f32; 3]) {
        self.rooms.insert(room_id.to_string(), RoomAlignment { x1, x2 });
    }
}

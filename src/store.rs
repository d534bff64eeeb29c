//! Durable cursor state.
//!
//! A single small JSON record holding the highest fully-processed message
//! uid and the display orientation. Writes replace the whole file
//! atomically, so a crash at any point leaves either the old record or the
//! new one on disk, never a torn one.

use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::warn;

use crate::display::Orientation;
use crate::error::StoreError;

/// Persisted record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameState {
    /// Highest uid whose side effects completed (including attempted
    /// display and deletion). Uids at or below this are never reprocessed.
    pub last_processed_uid: u32,
    /// Survives reboots so a toggled frame stays toggled.
    pub orientation: Orientation,
}

/// Store for [`FrameState`], backed by one JSON file.
pub struct CursorStore {
    path: PathBuf,
    state: FrameState,
}

impl CursorStore {
    /// Load the record at `path`.
    ///
    /// A missing or corrupt file is not an error: it yields uid 0 and the
    /// configured orientation. Reprocessing old mail is acceptable; losing
    /// mail is not.
    pub fn load(path: impl Into<PathBuf>, default_orientation: Orientation) -> Self {
        let path = path.into();
        let fallback = FrameState {
            last_processed_uid: 0,
            orientation: default_orientation,
        };
        let state = match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(state) => state,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "state file corrupt, starting over");
                    fallback
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => fallback,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "state file unreadable, starting over");
                fallback
            }
        };
        Self { path, state }
    }

    pub fn last_processed_uid(&self) -> u32 {
        self.state.last_processed_uid
    }

    pub fn orientation(&self) -> Orientation {
        self.state.orientation
    }

    /// Persist `uid` as the new cursor.
    ///
    /// The in-memory value advances even when the write fails, so the
    /// current run never reprocesses; only a restart after a failed write
    /// would. Callers must check the result and log loudly.
    pub fn set_last_processed_uid(&mut self, uid: u32) -> Result<(), StoreError> {
        self.state.last_processed_uid = uid;
        self.save()
    }

    /// Persist a new orientation alongside the cursor.
    pub fn set_orientation(&mut self, orientation: Orientation) -> Result<(), StoreError> {
        self.state.orientation = orientation;
        self.save()
    }

    /// Serialize to a sibling temp file, fsync, then rename over the
    /// target. The temp file lives in the same directory so the rename
    /// stays on one filesystem and is atomic.
    fn save(&self) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(&self.state)?;
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(&json)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path)
            .map_err(|e| StoreError::Replace(e.to_string()))?;
        Ok(())
    }
}

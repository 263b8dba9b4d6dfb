//! `.dropmark_progress.json` in the output directory.
//!
//! External tools (menu-bar widgets, dashboards) poll this file to show
//! what is being processed. It describes the most recently started active
//! item and disappears when nothing is in flight.

use std::path::{Path, PathBuf};

use jiff::Timestamp;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub const PROGRESS_FILE: &str = ".dropmark_progress.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub filename: String,
    pub logical_key: String,
    pub attempt: u32,
    pub started_at: Timestamp,
    pub is_processing: bool,
}

#[derive(Debug)]
pub struct ProgressMarker {
    path: PathBuf,
    /// Active items in start order
    active: Mutex<Vec<ProgressRecord>>,
}

impl ProgressMarker {
    pub fn new(output_dir: &Path) -> Self {
        Self {
            path: output_dir.join(PROGRESS_FILE),
            active: Mutex::new(Vec::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record that attempt `attempt` on `logical_key` has started.
    pub fn begin(&self, filename: &str, logical_key: &str, attempt: u32) -> Result<()> {
        let mut active = self.active.lock();
        active.retain(|record| record.logical_key != logical_key);
        active.push(ProgressRecord {
            filename: filename.to_string(),
            logical_key: logical_key.to_string(),
            attempt,
            started_at: Timestamp::now(),
            is_processing: true,
        });
        self.write(&active)
    }

    /// Record that `logical_key` is no longer being processed.
    pub fn finish(&self, logical_key: &str) -> Result<()> {
        let mut active = self.active.lock();
        active.retain(|record| record.logical_key != logical_key);
        self.write(&active)
    }

    pub fn read(&self) -> Option<ProgressRecord> {
        let bytes = std::fs::read(&self.path).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    fn write(&self, active: &[ProgressRecord]) -> Result<()> {
        match active.last() {
            Some(current) => {
                let json = serde_json::to_vec_pretty(current)?;
                crate::fs::write_file_atomic(&self.path, &json)
            }
            None => crate::fs::remove_file_if_exists(&self.path),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_marker_tracks_latest_active_item() {
        let temp = TempDir::new().unwrap();
        let marker = ProgressMarker::new(temp.path());

        marker.begin("20251104_1209_a.mp4", "20251104_1209", 1).unwrap();
        marker.begin("20251104_1300_b.mp4", "20251104_1300", 1).unwrap();
        assert_eq!(marker.read().unwrap().logical_key, "20251104_1300");

        marker.finish("20251104_1300").unwrap();
        let current = marker.read().unwrap();
        assert_eq!(current.logical_key, "20251104_1209");
        assert!(current.is_processing);

        marker.finish("20251104_1209").unwrap();
        assert!(!marker.path().exists());
    }

    #[test]
    fn test_retry_updates_attempt() {
        let temp = TempDir::new().unwrap();
        let marker = ProgressMarker::new(temp.path());

        marker.begin("20251104_1209_a.mp4", "20251104_1209", 1).unwrap();
        marker.begin("20251104_1209_a.mp4", "20251104_1209", 2).unwrap();
        assert_eq!(marker.read().unwrap().attempt, 2);

        marker.finish("20251104_1209").unwrap();
        assert!(marker.read().is_none());
    }

    #[test]
    fn test_finish_unknown_key_is_harmless() {
        let temp = TempDir::new().unwrap();
        let marker = ProgressMarker::new(temp.path());
        marker.finish("nothing").unwrap();
        assert!(!marker.path().exists());
    }
}

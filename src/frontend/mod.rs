//! Sources of candidate paths: the long-running watcher and the one-shot
//! batch scanner. Both only enumerate and feed the engine.

pub mod scanner;
pub mod watcher;

pub use scanner::{BatchScanner, BatchSummary, Candidate, CandidateState};
pub use watcher::DropWatcher;

use std::path::{Path, PathBuf};

use tracing::warn;
use walkdir::WalkDir;

use crate::error::{DropmarkError, Result};

/// List regular files under `dir`, descending into subdirectories when
/// `recursive` is set. Results are sorted for stable ordering.
///
/// Unreadable subdirectories are skipped with a warning; an unreadable or
/// missing `dir` itself is an error.
pub fn enumerate_files(dir: &Path, recursive: bool) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Err(DropmarkError::DropDirMissing(dir.to_path_buf()));
    }

    let walker = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(if recursive { usize::MAX } else { 1 });

    let mut files = Vec::new();
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) if e.depth() == 0 => {
                return Err(DropmarkError::storage("list", dir)(e.into()));
            }
            Err(e) => {
                warn!("skipping unreadable entry under {}: {}", dir.display(), e);
                continue;
            }
        };
        let file_type = entry.file_type();
        if file_type.is_file() || (file_type.is_symlink() && entry.path().is_file()) {
            files.push(entry.into_path());
        }
    }
    files.sort();
    Ok(files)
}

//! File I/O helpers with path-carrying errors

use std::io::Write;
use std::path::{Path, PathBuf};

use tokio::fs as tokio_fs;

use crate::error::{DropmarkError, Result};

/// Read file content with error handling
pub fn read_file(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(DropmarkError::storage("read", path))
}

/// Write file atomically using temp file and rename.
///
/// The original file is never in a partially written state: either the new
/// content is fully written and synced, or the original remains unchanged.
pub fn write_file_atomic(path: &Path, content: &[u8]) -> Result<()> {
    ensure_parent_dir(path)?;

    let temp_path = temp_path_for(path);
    let mut file =
        std::fs::File::create(&temp_path).map_err(DropmarkError::storage("create", &temp_path))?;
    file.write_all(content)
        .map_err(DropmarkError::storage("write", &temp_path))?;
    file.sync_all()
        .map_err(DropmarkError::storage("sync", &temp_path))?;
    drop(file);

    std::fs::rename(&temp_path, path).map_err(DropmarkError::storage("rename", path))
}

/// `name.ext` → `name.ext.tmp`, so distinct targets never share a temp file.
fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Ensure parent directory exists
pub fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
        && !parent.exists()
    {
        std::fs::create_dir_all(parent).map_err(DropmarkError::storage("create", parent))?;
    }
    Ok(())
}

/// Ensure a directory exists
pub fn ensure_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path).map_err(DropmarkError::storage("create", path))
}

/// Delete a file, treating an already-missing file as success
pub fn remove_file_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(DropmarkError::storage("delete", path)(e)),
    }
}

/// Move a staged artifact to its final location.
///
/// Rename is tried first; when staging and output live on different
/// filesystems the artifact is copied next to the destination under a
/// temporary name and renamed into place, so readers of the output directory
/// never see a partial file.
pub async fn place_artifact(staged: &Path, destination: &Path) -> Result<()> {
    ensure_parent_dir_async(destination).await?;

    match tokio_fs::rename(staged, destination).await {
        Ok(()) => return Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(DropmarkError::storage("move", staged)(e));
        }
        Err(e) => {
            tracing::debug!(
                "rename {} -> {} failed ({}), copying instead",
                staged.display(),
                destination.display(),
                e
            );
        }
    }

    copy_into_place(staged, destination).await
}

/// Copy `staged` next to `destination` under a temporary name, sync it and
/// rename it into place, then drop the staged file.
async fn copy_into_place(staged: &Path, destination: &Path) -> Result<()> {
    let temp_path = temp_path_for(destination);
    tokio_fs::copy(staged, &temp_path)
        .await
        .map_err(DropmarkError::storage("copy", &temp_path))?;
    let file = tokio_fs::File::open(&temp_path)
        .await
        .map_err(DropmarkError::storage("open", &temp_path))?;
    file.sync_all()
        .await
        .map_err(DropmarkError::storage("sync", &temp_path))?;
    drop(file);

    tokio_fs::rename(&temp_path, destination)
        .await
        .map_err(DropmarkError::storage("rename", destination))?;
    if let Err(e) = tokio_fs::remove_file(staged).await {
        tracing::warn!("could not remove staged file {}: {}", staged.display(), e);
    }
    Ok(())
}

/// Ensure parent directory exists (async version)
pub async fn ensure_parent_dir_async(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
        && !parent.exists()
    {
        tokio_fs::create_dir_all(parent)
            .await
            .map_err(DropmarkError::storage("create", parent))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_file_atomic_replaces_content() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("state.json");

        write_file_atomic(&path, b"first").unwrap();
        write_file_atomic(&path, b"second").unwrap();

        assert_eq!(read_file(&path).unwrap(), "second");
        assert!(!temp.path().join("nested").join("state.json.tmp").exists());
    }

    #[test]
    fn test_remove_file_if_exists() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("marker");
        std::fs::write(&path, "x").unwrap();

        remove_file_if_exists(&path).unwrap();
        remove_file_if_exists(&path).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_read_missing_file_names_path() {
        let err = read_file(Path::new("/nonexistent/dropmark/config.yaml")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/dropmark/config.yaml"));
    }

    #[tokio::test]
    async fn test_place_artifact_moves_file() {
        let temp = TempDir::new().unwrap();
        let staged = temp.path().join("staging").join("wr_20251104_1209.mp4");
        std::fs::create_dir_all(staged.parent().unwrap()).unwrap();
        std::fs::write(&staged, b"video").unwrap();
        let destination = temp.path().join("output").join("wr_20251104_1209.mp4");

        place_artifact(&staged, &destination).await.unwrap();

        assert!(!staged.exists());
        assert_eq!(std::fs::read(&destination).unwrap(), b"video");
    }

    #[tokio::test]
    async fn test_place_artifact_missing_source_fails() {
        let temp = TempDir::new().unwrap();
        let result = place_artifact(
            &temp.path().join("staging").join("gone.mp4"),
            &temp.path().join("output").join("gone.mp4"),
        )
        .await;
        assert!(matches!(result, Err(DropmarkError::Storage { .. })));
    }

    #[tokio::test]
    async fn test_copy_fallback_places_file_without_leftovers() {
        let temp = TempDir::new().unwrap();
        let staged = temp.path().join("staging").join("wr_20251104_1209.mp4");
        std::fs::create_dir_all(staged.parent().unwrap()).unwrap();
        std::fs::write(&staged, b"video").unwrap();
        let output = temp.path().join("output");
        std::fs::create_dir_all(&output).unwrap();
        let destination = output.join("wr_20251104_1209.mp4");

        copy_into_place(&staged, &destination).await.unwrap();

        assert!(!staged.exists());
        assert_eq!(std::fs::read(&destination).unwrap(), b"video");
        let names: Vec<_> = std::fs::read_dir(&output)
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("wr_20251104_1209.mp4")]);
    }

    #[tokio::test]
    async fn test_copy_fallback_reports_unwritable_destination() {
        let temp = TempDir::new().unwrap();
        let staged = temp.path().join("wr_20251104_1209.mp4");
        std::fs::write(&staged, b"video").unwrap();
        // A regular file where the output directory should be
        let blocker = temp.path().join("output");
        std::fs::write(&blocker, b"").unwrap();

        let result = copy_into_place(&staged, &blocker.join("wr_20251104_1209.mp4")).await;

        assert!(matches!(result, Err(DropmarkError::Storage { operation: "copy", .. })));
        assert!(staged.exists());
    }
}

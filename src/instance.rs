//! Single-instance enforcement for the watcher.
//!
//! A running watcher owns `.dropmark/instance.json` and renews its
//! `heartbeat_at` on an interval. A new watcher finding a record whose
//! heartbeat is fresh and whose pid is alive stops that process before
//! taking over; a stale record is simply replaced.

use std::path::{Path, PathBuf};
use std::time::Duration;

use jiff::Timestamp;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{DropmarkError, Result};
use crate::ledger::{FileLock, Owner, lock_path_for};
use crate::process;

/// Contents of `instance.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub pid: u32,
    pub instance_id: String,
    pub started_at: Timestamp,
    pub heartbeat_at: Timestamp,
}

impl InstanceRecord {
    pub fn owner(&self) -> Owner {
        Owner::new(self.pid, self.instance_id.clone())
    }

    pub fn heartbeat_is_fresh(&self, grace: Duration, now: Timestamp) -> bool {
        let age_ms = now
            .as_millisecond()
            .saturating_sub(self.heartbeat_at.as_millisecond());
        age_ms <= i64::try_from(grace.as_millis()).unwrap_or(i64::MAX)
    }

    /// Fresh heartbeat and a live pid.
    pub fn is_live(&self, grace: Duration, now: Timestamp) -> bool {
        self.heartbeat_is_fresh(grace, now) && process::is_alive(self.pid)
    }
}

/// Read the current record, if any.
pub fn read_record(path: &Path) -> Result<Option<InstanceRecord>> {
    match std::fs::read(path) {
        Ok(bytes) => match serde_json::from_slice(&bytes) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                warn!("ignoring unreadable instance record {}: {}", path.display(), e);
                Ok(None)
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(DropmarkError::storage("read", path)(e)),
    }
}

/// Ownership of the instance record for the lifetime of a watcher.
#[derive(Debug)]
pub struct InstanceGuard {
    path: PathBuf,
    lock_path: PathBuf,
    record: Mutex<InstanceRecord>,
}

impl InstanceGuard {
    /// Claim the instance record, displacing a live predecessor.
    ///
    /// `grace` is the heartbeat age after which a record counts as stale;
    /// `stop_timeout` bounds how long a live predecessor gets to exit after
    /// SIGTERM.
    pub async fn acquire(path: &Path, grace: Duration, stop_timeout: Duration) -> Result<Self> {
        crate::fs::ensure_parent_dir(path)?;
        let lock_path = lock_path_for(path);
        let own_pid = std::process::id();

        if let Some(previous) = read_record(path)?
            && previous.pid != own_pid
        {
            if previous.is_live(grace, Timestamp::now()) {
                warn!(
                    pid = previous.pid,
                    instance_id = %previous.instance_id,
                    "another watcher is running, stopping it"
                );
                if !process::terminate(previous.pid, stop_timeout).await {
                    return Err(DropmarkError::InstanceConflict { pid: previous.pid });
                }
            } else {
                info!(
                    pid = previous.pid,
                    instance_id = %previous.instance_id,
                    "taking over stale instance record"
                );
            }
        }

        let now = Timestamp::now();
        let record = InstanceRecord {
            pid: own_pid,
            instance_id: uuid::Uuid::new_v4().to_string(),
            started_at: now,
            heartbeat_at: now,
        };
        {
            let _lock = FileLock::acquire(&lock_path)?;
            // A competitor may have claimed the record while we were stopping
            // the previous holder.
            if let Some(current) = read_record(path)?
                && current.pid != own_pid
                && current.is_live(grace, Timestamp::now())
            {
                return Err(DropmarkError::InstanceConflict { pid: current.pid });
            }
            write_record(path, &record)?;
        }

        Ok(Self {
            path: path.to_path_buf(),
            lock_path,
            record: Mutex::new(record),
        })
    }

    pub fn owner(&self) -> Owner {
        self.record.lock().owner()
    }

    pub fn record(&self) -> InstanceRecord {
        self.record.lock().clone()
    }

    /// Renew the heartbeat. Fails with `InstanceConflict` when another
    /// instance has taken the record over.
    pub fn heartbeat(&self) -> Result<()> {
        let _lock = FileLock::acquire(&self.lock_path)?;
        let mut record = self.record.lock();

        if let Some(current) = read_record(&self.path)?
            && current.instance_id != record.instance_id
        {
            return Err(DropmarkError::InstanceConflict { pid: current.pid });
        }

        record.heartbeat_at = Timestamp::now();
        write_record(&self.path, &record)
    }

    /// Remove the record if it is still ours.
    pub fn release(self) -> Result<()> {
        let _lock = FileLock::acquire(&self.lock_path)?;
        let record = self.record.lock();
        match read_record(&self.path)? {
            Some(current) if current.instance_id == record.instance_id => {
                crate::fs::remove_file_if_exists(&self.path)
            }
            _ => Ok(()),
        }
    }
}

fn write_record(path: &Path, record: &InstanceRecord) -> Result<()> {
    let json = serde_json::to_vec_pretty(record)?;
    crate::fs::write_file_atomic(path, &json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const GRACE: Duration = Duration::from_secs(60);

    fn record_for(pid: u32, heartbeat_age_secs: i64) -> InstanceRecord {
        let now = Timestamp::now();
        InstanceRecord {
            pid,
            instance_id: "previous".to_string(),
            started_at: now,
            heartbeat_at: Timestamp::from_second(now.as_second() - heartbeat_age_secs).unwrap(),
        }
    }

    #[test]
    fn test_liveness_requires_fresh_heartbeat_and_pid() {
        let now = Timestamp::now();
        assert!(record_for(std::process::id(), 5).is_live(GRACE, now));
        assert!(!record_for(std::process::id(), 600).is_live(GRACE, now));
        assert!(!record_for(3_000_000_000, 5).is_live(GRACE, now));
    }

    #[tokio::test]
    async fn test_acquire_writes_and_release_removes() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("instance.json");

        let guard = InstanceGuard::acquire(&path, GRACE, Duration::from_secs(1))
            .await
            .unwrap();
        let on_disk = read_record(&path).unwrap().unwrap();
        assert_eq!(on_disk.pid, std::process::id());
        assert_eq!(on_disk, guard.record());

        guard.release().unwrap();
        assert!(read_record(&path).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stale_record_is_taken_over() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("instance.json");
        write_record(&path, &record_for(3_000_000_000, 5)).unwrap();

        let guard = InstanceGuard::acquire(&path, GRACE, Duration::from_secs(1))
            .await
            .unwrap();
        assert_ne!(guard.record().instance_id, "previous");
    }

    #[tokio::test]
    async fn test_heartbeat_advances_and_detects_displacement() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("instance.json");
        let guard = InstanceGuard::acquire(&path, GRACE, Duration::from_secs(1))
            .await
            .unwrap();

        let first = guard.record().heartbeat_at;
        tokio::time::sleep(Duration::from_millis(5)).await;
        guard.heartbeat().unwrap();
        assert!(guard.record().heartbeat_at > first);

        write_record(&path, &record_for(3_000_000_000, 0)).unwrap();
        assert!(matches!(
            guard.heartbeat(),
            Err(DropmarkError::InstanceConflict { .. })
        ));
        // Not ours any more, so release leaves it alone
        guard.release().unwrap();
        assert!(read_record(&path).unwrap().is_some());
    }

    #[test]
    fn test_unreadable_record_is_ignored() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("instance.json");
        std::fs::write(&path, "{ half").unwrap();
        assert!(read_record(&path).unwrap().is_none());
    }
}

//! Durable per-key processing record.
//!
//! The ledger is an append-only NDJSON log at `.dropmark/ledger.ndjson`. Each
//! line is a full [`LedgerEntry`] snapshot and the last line for a key wins.
//! Every operation is a transaction that:
//!
//! 1. takes the exclusive lock on `ledger.ndjson.lock`
//! 2. catches up on records appended by other processes
//! 3. decides against the current state
//! 4. appends the new snapshots, then flushes and syncs them
//!
//! Because decision and append happen under one lock, two processes sharing a
//! ledger can never both reserve the same key.
//!
//! A line torn by a killed writer is skipped with a warning. Once superseded
//! records dominate the file it is rewritten with one line per key.

pub mod lock;
pub mod types;

pub use lock::{FileLock, lock_path_for};
pub use types::{Admission, LedgerEntry, LedgerStatus, Owner};

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use jiff::Timestamp;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{DropmarkError, Result};
use crate::process;

/// Rewrite the log once it holds this many records...
const COMPACT_MIN_RECORDS: usize = 512;
/// ...and at least this many records per live key.
const COMPACT_RATIO: usize = 4;

#[derive(Debug, Default)]
struct LedgerState {
    entries: BTreeMap<String, LedgerEntry>,
    /// Bytes of the log already applied to `entries`
    offset: u64,
    /// Identity of the file `offset` refers to
    file_id: Option<u64>,
    /// Records in the log, superseded ones included
    records: usize,
    /// The log ends in a partial line
    torn_tail: bool,
}

impl LedgerState {
    fn clear(&mut self) {
        *self = LedgerState::default();
    }
}

#[derive(Debug)]
pub struct ProcessedLedger {
    path: PathBuf,
    lock_path: PathBuf,
    heartbeat_grace: Duration,
    state: Mutex<LedgerState>,
}

impl ProcessedLedger {
    /// Open (creating if needed) the ledger at `path` and replay it.
    ///
    /// Fails when the file cannot be read or holds no valid records at all.
    pub fn open(path: impl Into<PathBuf>, heartbeat_grace: Duration) -> Result<Self> {
        let path = path.into();
        crate::fs::ensure_parent_dir(&path)?;
        let ledger = Self {
            lock_path: lock_path_for(&path),
            path,
            heartbeat_grace,
            state: Mutex::new(LedgerState::default()),
        };
        ledger.read(|_| ())?;
        Ok(ledger)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn heartbeat_grace(&self) -> Duration {
        self.heartbeat_grace
    }

    /// Atomically reserve `key` for `owner`.
    ///
    /// This is the only place a new attempt on a key can begin.
    pub fn try_begin_unique(&self, key: &str, source: &Path, owner: &Owner) -> Result<Admission> {
        self.transact(|state, now| {
            let Some(existing) = state.entries.get(key) else {
                let entry = LedgerEntry::reserved(key, source.to_path_buf(), owner.clone(), now);
                return Ok((
                    Admission::Admitted {
                        entry: entry.clone(),
                        reclaimed: false,
                    },
                    vec![entry],
                ));
            };

            let admission = match existing.status {
                LedgerStatus::Done => Admission::AlreadyDone(existing.clone()),
                LedgerStatus::Failed => Admission::PreviouslyFailed(existing.clone()),
                // Our own unresolved reservation is only settled by a restart's
                // recovery, never by rediscovering the source
                LedgerStatus::InProgress if existing.owner.as_ref() == Some(owner) => {
                    Admission::AlreadyInProgress(existing.clone())
                }
                LedgerStatus::InProgress if !self.is_stale(existing, now) => {
                    Admission::AlreadyInProgress(existing.clone())
                }
                LedgerStatus::InProgress | LedgerStatus::Pending => {
                    let reclaimed = existing.status == LedgerStatus::InProgress;
                    if reclaimed {
                        warn!(
                            key,
                            previous_owner = ?existing.owner,
                            "reclaiming stale reservation"
                        );
                    }
                    let entry = LedgerEntry {
                        status: LedgerStatus::InProgress,
                        source_path: source.to_path_buf(),
                        output_path: None,
                        attempts: existing.attempts.saturating_add(1),
                        last_error: None,
                        owner: Some(owner.clone()),
                        heartbeat_at: Some(now),
                        updated_at: now,
                        ..existing.clone()
                    };
                    return Ok((
                        Admission::Admitted {
                            entry: entry.clone(),
                            reclaimed,
                        },
                        vec![entry],
                    ));
                }
            };
            Ok((admission, Vec::new()))
        })
    }

    /// InProgress → Done. Completing an entry that is already Done with the
    /// same output is a no-op.
    pub fn mark_done(&self, key: &str, output_path: &Path) -> Result<LedgerEntry> {
        self.transact(|state, now| {
            let existing = state
                .entries
                .get(key)
                .ok_or_else(|| DropmarkError::EntryNotFound(key.to_string()))?;

            match existing.status {
                LedgerStatus::InProgress => {}
                LedgerStatus::Done if existing.output_path.as_deref() == Some(output_path) => {
                    return Ok((existing.clone(), Vec::new()));
                }
                other => return Err(invalid_transition(key, other, LedgerStatus::Done)),
            }

            let entry = LedgerEntry {
                status: LedgerStatus::Done,
                output_path: Some(output_path.to_path_buf()),
                last_error: None,
                owner: None,
                heartbeat_at: None,
                updated_at: now,
                ..existing.clone()
            };
            Ok((entry.clone(), vec![entry]))
        })
    }

    /// InProgress → Failed. Only the current holder may fail an entry.
    pub fn mark_failed(&self, key: &str, owner: &Owner, error_detail: &str) -> Result<LedgerEntry> {
        self.transact(|state, now| {
            let existing = state
                .entries
                .get(key)
                .ok_or_else(|| DropmarkError::EntryNotFound(key.to_string()))?;

            if existing.status != LedgerStatus::InProgress {
                return Err(invalid_transition(key, existing.status, LedgerStatus::Failed));
            }
            ensure_holder(existing, owner)?;

            let entry = LedgerEntry {
                status: LedgerStatus::Failed,
                output_path: None,
                last_error: Some(error_detail.to_string()),
                owner: None,
                heartbeat_at: None,
                updated_at: now,
                ..existing.clone()
            };
            Ok((entry.clone(), vec![entry]))
        })
    }

    /// Refresh the heartbeat of a reservation held by `owner`.
    pub fn renew(&self, key: &str, owner: &Owner) -> Result<()> {
        self.transact(|state, now| {
            let existing = state
                .entries
                .get(key)
                .ok_or_else(|| DropmarkError::EntryNotFound(key.to_string()))?;

            if existing.status != LedgerStatus::InProgress {
                return Err(invalid_transition(
                    key,
                    existing.status,
                    LedgerStatus::InProgress,
                ));
            }
            ensure_holder(existing, owner)?;

            let entry = LedgerEntry {
                heartbeat_at: Some(now),
                updated_at: now,
                ..existing.clone()
            };
            Ok(((), vec![entry]))
        })
    }

    /// Failed → Pending so the next discovery admits the key again.
    pub fn reset(&self, key: &str) -> Result<LedgerEntry> {
        self.transact(|state, now| {
            let existing = state
                .entries
                .get(key)
                .ok_or_else(|| DropmarkError::EntryNotFound(key.to_string()))?;

            if existing.status != LedgerStatus::Failed {
                return Err(invalid_transition(key, existing.status, LedgerStatus::Pending));
            }

            let entry = LedgerEntry {
                status: LedgerStatus::Pending,
                last_error: None,
                owner: None,
                heartbeat_at: None,
                updated_at: now,
                ..existing.clone()
            };
            Ok((entry.clone(), vec![entry]))
        })
    }

    /// Remove Done and Failed entries last updated more than `older_than` ago.
    /// Returns the number of entries removed.
    pub fn prune(&self, older_than: Duration) -> Result<usize> {
        let mut state = self.state.lock();
        let _lock = FileLock::acquire(&self.lock_path)?;
        self.refresh(&mut state)?;

        let horizon = i64::try_from(older_than.as_millis()).unwrap_or(i64::MAX);
        let cutoff = Timestamp::now().as_millisecond().saturating_sub(horizon);
        let before = state.entries.len();
        state.entries.retain(|_, entry| {
            !entry.status.is_terminal() || entry.updated_at.as_millisecond() >= cutoff
        });
        let removed = before - state.entries.len();

        if removed > 0 {
            self.rewrite(&mut state)?;
        }
        Ok(removed)
    }

    pub fn get(&self, key: &str) -> Result<Option<LedgerEntry>> {
        self.read(|state| state.entries.get(key).cloned())
    }

    /// All entries ordered by logical key.
    pub fn entries(&self) -> Result<Vec<LedgerEntry>> {
        self.read(|state| state.entries.values().cloned().collect())
    }

    pub fn list_by_status(&self, status: LedgerStatus) -> Result<Vec<LedgerEntry>> {
        self.read(|state| {
            state
                .entries
                .values()
                .filter(|entry| entry.status == status)
                .cloned()
                .collect()
        })
    }

    /// Entries reset for retry and awaiting rediscovery.
    pub fn list_pending(&self) -> Result<Vec<LedgerEntry>> {
        self.list_by_status(LedgerStatus::Pending)
    }

    /// InProgress entries whose holder is gone.
    pub fn list_stale(&self) -> Result<Vec<LedgerEntry>> {
        let now = Timestamp::now();
        self.read(|state| {
            state
                .entries
                .values()
                .filter(|entry| {
                    entry.status == LedgerStatus::InProgress && self.is_stale(entry, now)
                })
                .cloned()
                .collect()
        })
    }

    /// Whether an InProgress entry's holder has stopped renewing or exited.
    pub fn is_stale(&self, entry: &LedgerEntry, now: Timestamp) -> bool {
        if entry.status != LedgerStatus::InProgress {
            return false;
        }
        let heartbeat_expired = match entry.heartbeat_at {
            Some(at) => {
                let age_ms = now.as_millisecond().saturating_sub(at.as_millisecond());
                age_ms > i64::try_from(self.heartbeat_grace.as_millis()).unwrap_or(i64::MAX)
            }
            None => true,
        };
        heartbeat_expired || entry.owner_pid().is_none_or(|pid| !process::is_alive(pid))
    }

    fn read<T>(&self, f: impl FnOnce(&LedgerState) -> T) -> Result<T> {
        let mut state = self.state.lock();
        let _lock = FileLock::acquire(&self.lock_path)?;
        self.refresh(&mut state)?;
        Ok(f(&state))
    }

    fn transact<T>(
        &self,
        f: impl FnOnce(&LedgerState, Timestamp) -> Result<(T, Vec<LedgerEntry>)>,
    ) -> Result<T> {
        let mut state = self.state.lock();
        let _lock = FileLock::acquire(&self.lock_path)?;
        self.refresh(&mut state)?;

        let (result, records) = f(&state, Timestamp::now())?;
        if !records.is_empty() {
            self.append(&mut state, &records)?;
            if state.records >= COMPACT_MIN_RECORDS
                && state.records >= state.entries.len().max(1) * COMPACT_RATIO
            {
                self.rewrite(&mut state)?;
            }
        }
        Ok(result)
    }

    /// Apply whatever was appended since the last read. A replaced or
    /// truncated file is replayed from the start.
    fn refresh(&self, state: &mut LedgerState) -> Result<()> {
        let metadata = match fs::metadata(&self.path) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                state.clear();
                return Ok(());
            }
            Err(e) => return Err(DropmarkError::storage("stat", &self.path)(e)),
        };

        let file_id = file_identity(&metadata);
        let len = metadata.len();
        if state.file_id != file_id || len < state.offset {
            if state.offset > 0 {
                debug!("ledger was replaced, replaying from the start");
            }
            state.clear();
            state.file_id = file_id;
        }
        if len == state.offset {
            return Ok(());
        }

        let mut file =
            fs::File::open(&self.path).map_err(DropmarkError::storage("open", &self.path))?;
        file.seek(SeekFrom::Start(state.offset))
            .map_err(DropmarkError::storage("seek", &self.path))?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)
            .map_err(DropmarkError::storage("read", &self.path))?;

        let replaying_from_start = state.offset == 0;
        let complete = buf.iter().rposition(|b| *b == b'\n').map_or(0, |i| i + 1);
        let mut applied = 0usize;
        let mut skipped = 0usize;

        for line in buf[..complete].split(|b| *b == b'\n') {
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match serde_json::from_slice::<LedgerEntry>(line) {
                Ok(entry) => {
                    state.entries.insert(entry.logical_key.clone(), entry);
                    applied += 1;
                }
                Err(e) => {
                    warn!("skipping unreadable ledger record in {}: {}", self.path.display(), e);
                    skipped += 1;
                }
            }
        }

        if replaying_from_start && applied == 0 && skipped > 0 {
            return Err(DropmarkError::LedgerCorrupted {
                path: self.path.clone(),
                reason: format!("none of {skipped} records could be parsed"),
            });
        }

        let torn = complete < buf.len();
        if torn && !state.torn_tail {
            warn!(
                "ledger {} ends in a partial record ({} bytes), ignoring it",
                self.path.display(),
                buf.len() - complete
            );
        }
        state.torn_tail = torn;
        state.offset += complete as u64;
        state.records += applied + skipped;
        Ok(())
    }

    fn append(&self, state: &mut LedgerState, records: &[LedgerEntry]) -> Result<()> {
        let mut buf = Vec::new();
        if state.torn_tail {
            // Terminate the partial line so it cannot swallow the next record
            buf.push(b'\n');
        }
        for record in records {
            serde_json::to_writer(&mut buf, record)?;
            buf.push(b'\n');
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(DropmarkError::storage("open", &self.path))?;
        file.write_all(&buf)
            .map_err(DropmarkError::storage("append to", &self.path))?;
        file.sync_data()
            .map_err(DropmarkError::storage("sync", &self.path))?;

        let metadata = file
            .metadata()
            .map_err(DropmarkError::storage("stat", &self.path))?;
        state.file_id = file_identity(&metadata);
        state.offset = metadata.len();
        state.torn_tail = false;
        state.records += records.len();
        for record in records {
            state.entries.insert(record.logical_key.clone(), record.clone());
        }
        Ok(())
    }

    /// Replace the log with one record per live key.
    fn rewrite(&self, state: &mut LedgerState) -> Result<()> {
        let mut buf = Vec::new();
        for entry in state.entries.values() {
            serde_json::to_writer(&mut buf, entry)?;
            buf.push(b'\n');
        }
        crate::fs::write_file_atomic(&self.path, &buf)?;

        let metadata =
            fs::metadata(&self.path).map_err(DropmarkError::storage("stat", &self.path))?;
        debug!(
            "compacted ledger from {} to {} records",
            state.records,
            state.entries.len()
        );
        state.file_id = file_identity(&metadata);
        state.offset = metadata.len();
        state.records = state.entries.len();
        state.torn_tail = false;
        Ok(())
    }
}

fn invalid_transition(key: &str, from: LedgerStatus, to: LedgerStatus) -> DropmarkError {
    DropmarkError::InvalidTransition {
        key: key.to_string(),
        from: from.to_string(),
        to: to.to_string(),
    }
}

fn ensure_holder(entry: &LedgerEntry, owner: &Owner) -> Result<()> {
    match &entry.owner {
        Some(holder) if holder == owner => Ok(()),
        Some(holder) => Err(DropmarkError::LedgerConflict {
            key: entry.logical_key.clone(),
            holder: holder.to_string(),
        }),
        None => Err(DropmarkError::LedgerConflict {
            key: entry.logical_key.clone(),
            holder: "nobody".to_string(),
        }),
    }
}

#[cfg(unix)]
fn file_identity(metadata: &fs::Metadata) -> Option<u64> {
    use std::os::unix::fs::MetadataExt;
    Some(metadata.ino())
}

#[cfg(not(unix))]
fn file_identity(_metadata: &fs::Metadata) -> Option<u64> {
    None
}

//! One-shot enumeration of an input directory for batch runs.
//!
//! The scanner classifies every matching file against the ledger so the
//! operator can see what a batch would do before confirming. Dispatch then
//! feeds the candidates through the engine one at a time.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use jiff::Timestamp;
use serde::Serialize;
use tracing::{info, warn};

use super::enumerate_files;
use crate::engine::{INTERRUPTED_ERROR, IngestEngine, ItemOutcome};
use crate::error::Result;
use crate::ledger::{LedgerEntry, LedgerStatus, ProcessedLedger};
use crate::naming::NamePattern;
use crate::shutdown::ShutdownSignal;

/// Where a candidate stands before the batch runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateState {
    /// No ledger entry yet
    New,
    Pending,
    /// Reserved by an owner that stopped renewing or has exited
    Stale,
    /// Reserved by a live owner
    InProgressElsewhere,
    Failed,
    Done,
}

crate::enum_display_fromstr!(CandidateState, crate::error::DropmarkError::invalid_status, {
    New => "new",
    Pending => "pending",
    Stale => "stale",
    InProgressElsewhere => "in_progress_elsewhere",
    Failed => "failed",
    Done => "done",
});

impl CandidateState {
    /// Whether a batch run will try to process it.
    pub fn is_actionable(self) -> bool {
        matches!(
            self,
            CandidateState::New | CandidateState::Pending | CandidateState::Stale
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Candidate {
    pub path: PathBuf,
    pub logical_key: String,
    pub output_name: String,
    pub state: CandidateState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

pub struct BatchScanner {
    input_dir: PathBuf,
    recursive: bool,
    pattern: NamePattern,
    ledger: Arc<ProcessedLedger>,
}

impl BatchScanner {
    pub fn new(
        input_dir: &Path,
        recursive: bool,
        pattern: NamePattern,
        ledger: Arc<ProcessedLedger>,
    ) -> Self {
        Self {
            input_dir: input_dir.to_path_buf(),
            recursive,
            pattern,
            ledger,
        }
    }

    pub fn input_dir(&self) -> &Path {
        &self.input_dir
    }

    /// Every matching file under the input directory, classified.
    pub fn scan(&self) -> Result<Vec<Candidate>> {
        let now = Timestamp::now();
        let mut candidates = Vec::new();
        for path in enumerate_files(&self.input_dir, self.recursive)? {
            let Some(parsed) = self.pattern.parse_path(&path) else {
                continue;
            };
            let entry = self.ledger.get(&parsed.logical_key)?;
            let state = match &entry {
                None => CandidateState::New,
                Some(entry) => self.classify(entry, now),
            };
            candidates.push(Candidate {
                output_name: self.pattern.derive_output_name(&parsed),
                logical_key: parsed.logical_key,
                last_error: entry.and_then(|e| e.last_error),
                state,
                path,
            });
        }
        Ok(candidates)
    }

    fn classify(&self, entry: &LedgerEntry, now: Timestamp) -> CandidateState {
        match entry.status {
            LedgerStatus::Pending => CandidateState::Pending,
            LedgerStatus::Done => CandidateState::Done,
            LedgerStatus::Failed => CandidateState::Failed,
            LedgerStatus::InProgress if self.ledger.is_stale(entry, now) => CandidateState::Stale,
            LedgerStatus::InProgress => CandidateState::InProgressElsewhere,
        }
    }
}

/// Tally of a batch run.
#[derive(Debug, Default, Clone, Serialize)]
pub struct BatchSummary {
    pub processed: Vec<PathBuf>,
    /// Output already present, recorded without transforming
    pub recovered: Vec<PathBuf>,
    pub skipped: Vec<PathBuf>,
    pub failed: Vec<(PathBuf, String)>,
    pub interrupted: bool,
}

impl BatchSummary {
    pub fn has_failures(&self) -> bool {
        !self.failed.is_empty()
    }

    fn record(&mut self, path: PathBuf, outcome: ItemOutcome) {
        match outcome {
            ItemOutcome::Done { .. } => self.processed.push(path),
            ItemOutcome::Recovered { .. } => self.recovered.push(path),
            ItemOutcome::Failed { error } => self.failed.push((path, error)),
            ItemOutcome::Vanished => {
                self.failed
                    .push((path, "vanished before it settled".to_string()));
            }
            ItemOutcome::Interrupted => self.interrupted = true,
            _ => self.skipped.push(path),
        }
    }
}

/// Feed candidates through the engine sequentially.
///
/// When `shutdown` fires the current item gets `grace` to finish. After
/// that its transform is dropped (which kills the child), any reservation
/// it held is recorded as interrupted and the item counts as failed.
/// Remaining candidates are not started.
pub async fn dispatch(
    engine: &IngestEngine,
    candidates: Vec<Candidate>,
    mut shutdown: ShutdownSignal,
    grace: Duration,
) -> BatchSummary {
    let mut summary = BatchSummary::default();
    let total = candidates.len();

    for (index, candidate) in candidates.into_iter().enumerate() {
        if shutdown.is_triggered() {
            summary.interrupted = true;
            break;
        }
        info!(
            "[{}/{}] {}",
            index + 1,
            total,
            candidate.path.display()
        );

        let outcome = {
            let work = engine.process(candidate.path.clone());
            tokio::pin!(work);
            tokio::select! {
                outcome = &mut work => outcome,
                _ = shutdown.triggered() => {
                    match tokio::time::timeout(grace, &mut work).await {
                        Ok(outcome) => outcome,
                        Err(_) => {
                            warn!("grace expired, abandoning {}", candidate.path.display());
                            summary.interrupted = true;
                            ItemOutcome::Failed {
                                error: INTERRUPTED_ERROR.to_string(),
                            }
                        }
                    }
                }
            }
        };
        summary.record(candidate.path, outcome);
    }

    if summary.interrupted {
        engine.abandon_held().await;
    }
    summary
}

//! Per-item processing pipeline.
//!
//! Every path handed to the engine moves through
//! `Discovered → AwaitingStability → Reserved → Transforming → Done | Failed`:
//!
//! 1. The filename is matched. A key the ledger already holds as Done or
//!    Failed ends here without probing.
//! 2. The file is polled until stable, bounded by the stall timeout.
//! 3. A worker permit is taken and the key reserved in the ledger. Only an
//!    admitted reservation proceeds.
//! 4. If the derived output already exists the entry is completed without
//!    running the transform. Otherwise the transform writes into staging.
//!    A heartbeat task renews the reservation until it is resolved.
//! 5. The staged artifact is placed in the output directory, then the entry
//!    is marked Done, in that order.
//!
//! Front-ends only feed paths in; they never touch the ledger or transform.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{DropmarkError, Result};
use crate::hooks::{HookContext, HookEvent, HookRunner};
use crate::ledger::{Admission, LedgerStatus, Owner, ProcessedLedger};
use crate::naming::{NamePattern, ParsedName};
use crate::probe::{CompletionProbe, ProbeSettings, WaitOutcome};
use crate::progress::ProgressMarker;
use crate::shutdown::ShutdownSignal;
use crate::transform::{TransformClient, TransformOutcome};

pub const STALL_ERROR: &str = "never stabilized";
pub const INTERRUPTED_ERROR: &str = "interrupted";

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub probe: ProbeSettings,
    pub stall_timeout: Duration,
    pub workers: usize,
    pub heartbeat_interval: Duration,
    pub shutdown_grace: Duration,
    pub output_dir: PathBuf,
    pub staging_dir: PathBuf,
}

impl EngineSettings {
    pub fn from_config(config: &Config, staging_dir: PathBuf) -> Self {
        Self {
            probe: ProbeSettings::from(&config.stability),
            stall_timeout: config.stability.stall_timeout(),
            workers: config.engine.workers.max(1),
            heartbeat_interval: config.engine.heartbeat_interval(),
            shutdown_grace: config.engine.shutdown_grace(),
            output_dir: config.output_dir.clone(),
            staging_dir,
        }
    }
}

/// What happened to one submitted path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    /// Filename does not match the input pattern
    Ignored,
    /// The same path is already being handled
    Duplicate,
    /// The file disappeared before it settled
    Vanished,
    AlreadyDone,
    AlreadyInProgress,
    PreviouslyFailed,
    Done { output: PathBuf },
    /// The output already existed, so the transform was skipped
    Recovered { output: PathBuf },
    Failed { error: String },
    /// Shutdown began before the item was reserved
    Interrupted,
}

impl ItemOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, ItemOutcome::Failed { .. })
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ItemOutcome::Done { .. } | ItemOutcome::Recovered { .. })
    }
}

/// Result of startup recovery.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Stale reservations whose output was already placed
    pub completed: Vec<String>,
    /// Stale reservations left for re-admission on rediscovery
    pub reclaimable: Vec<String>,
}

/// Result of a graceful stop.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    pub finished: usize,
    /// Keys whose transform was abandoned and recorded as interrupted
    pub abandoned: Vec<String>,
}

struct EngineInner {
    settings: EngineSettings,
    pattern: NamePattern,
    probe: CompletionProbe,
    ledger: Arc<ProcessedLedger>,
    client: TransformClient,
    hooks: HookRunner,
    progress: ProgressMarker,
    owner: Owner,
    workers: Arc<Semaphore>,
    /// Paths currently moving through the pipeline
    active_paths: DashMap<PathBuf, ()>,
    /// Keys this engine has reserved and not yet resolved
    held: DashMap<String, PathBuf>,
    shutdown: ShutdownSignal,
}

pub struct IngestEngine {
    inner: Arc<EngineInner>,
    tasks: Mutex<JoinSet<ItemOutcome>>,
}

impl std::fmt::Debug for IngestEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestEngine")
            .field("owner", &self.inner.owner)
            .field("settings", &self.inner.settings)
            .finish_non_exhaustive()
    }
}

impl IngestEngine {
    pub fn new(
        settings: EngineSettings,
        pattern: NamePattern,
        ledger: Arc<ProcessedLedger>,
        client: TransformClient,
        owner: Owner,
        shutdown: ShutdownSignal,
    ) -> Self {
        let inner = EngineInner {
            probe: CompletionProbe::new(settings.probe),
            progress: ProgressMarker::new(&settings.output_dir),
            workers: Arc::new(Semaphore::new(settings.workers.max(1))),
            settings,
            pattern,
            ledger,
            client,
            hooks: HookRunner::disabled(),
            owner,
            active_paths: DashMap::new(),
            held: DashMap::new(),
            shutdown,
        };
        Self {
            inner: Arc::new(inner),
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    /// Attach operator hooks. Must be called before any work is submitted.
    pub fn with_hooks(mut self, hooks: HookRunner) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.hooks = hooks;
        }
        self
    }

    pub fn owner(&self) -> &Owner {
        &self.inner.owner
    }

    pub fn ledger(&self) -> &Arc<ProcessedLedger> {
        &self.inner.ledger
    }

    pub fn hooks(&self) -> &HookRunner {
        &self.inner.hooks
    }

    /// Run the whole pipeline for `path` and wait for the result.
    pub async fn process(&self, path: PathBuf) -> ItemOutcome {
        Arc::clone(&self.inner).process(path).await
    }

    /// Run the pipeline for `path` in the background.
    pub fn submit(&self, path: PathBuf) {
        let inner = Arc::clone(&self.inner);
        let mut tasks = self.tasks.lock();
        // Reap what already finished so the set does not grow unbounded
        while let Some(result) = tasks.try_join_next() {
            if let Err(e) = result
                && e.is_panic()
            {
                error!("item task panicked: {}", e);
            }
        }
        tasks.spawn(async move { inner.process(path).await });
    }

    /// Number of background items not yet collected.
    pub fn in_flight(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Wait for every item submitted so far and return their outcomes.
    pub async fn wait_idle(&self) -> Vec<ItemOutcome> {
        let mut tasks = std::mem::take(&mut *self.tasks.lock());
        let mut outcomes = Vec::new();
        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => error!("item task failed: {}", e),
            }
        }
        outcomes
    }

    /// Complete stale reservations whose output is already in place.
    ///
    /// Reservations without output stay reclaimable; they are re-admitted
    /// when their source is rediscovered.
    pub fn recover(&self) -> Result<RecoveryReport> {
        let inner = &self.inner;
        let mut report = RecoveryReport::default();

        for entry in inner.ledger.list_stale()? {
            let Some(parsed) = inner.pattern.parse_path(&entry.source_path) else {
                warn!(
                    key = %entry.logical_key,
                    "stale reservation has an unrecognised source path {}",
                    entry.source_path.display()
                );
                report.reclaimable.push(entry.logical_key);
                continue;
            };
            let destination = inner.output_path_for(&parsed);
            if destination.is_file() {
                inner.ledger.mark_done(&entry.logical_key, &destination)?;
                info!(
                    key = %entry.logical_key,
                    "recovered interrupted item, output already at {}",
                    destination.display()
                );
                report.completed.push(entry.logical_key);
            } else {
                info!(
                    key = %entry.logical_key,
                    "interrupted item will be retried when rediscovered"
                );
                report.reclaimable.push(entry.logical_key);
            }
        }
        Ok(report)
    }

    /// Wait for background items, up to the shutdown grace, then abandon
    /// the rest and record their reservations as interrupted.
    ///
    /// The shutdown signal must already have been triggered so that items
    /// still waiting for stability or a worker return promptly.
    pub async fn shutdown(&self) -> ShutdownReport {
        let mut tasks = std::mem::take(&mut *self.tasks.lock());
        let mut report = ShutdownReport::default();
        let deadline = tokio::time::Instant::now() + self.inner.settings.shutdown_grace;

        loop {
            match tokio::time::timeout_at(deadline, tasks.join_next()).await {
                Ok(Some(_)) => report.finished += 1,
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        remaining = tasks.len(),
                        "shutdown grace expired, abandoning in-flight items"
                    );
                    tasks.abort_all();
                    while tasks.join_next().await.is_some() {}
                    break;
                }
            }
        }

        report.abandoned = self.abandon_held().await;
        report
    }

    /// Record every reservation still held as interrupted. Used after an
    /// in-flight item was cancelled.
    pub async fn abandon_held(&self) -> Vec<String> {
        let inner = &self.inner;
        let keys: Vec<String> = inner.held.iter().map(|e| e.key().clone()).collect();
        for key in &keys {
            inner.held.remove(key);
            if let Err(e) = inner.progress.finish(key) {
                debug!("could not clear progress marker: {}", e);
            }
            let owner = inner.owner.clone();
            let k = key.clone();
            match inner
                .with_ledger(move |ledger| ledger.mark_failed(&k, &owner, INTERRUPTED_ERROR))
                .await
            {
                Ok(_) => warn!(
                    key = %key,
                    "transform abandoned at shutdown, recorded as interrupted"
                ),
                Err(e) => error!(key = %key, "could not record interruption: {}", e),
            }
        }
        keys
    }
}

impl EngineInner {
    fn output_path_for(&self, parsed: &ParsedName) -> PathBuf {
        self.settings
            .output_dir
            .join(self.pattern.derive_output_name(parsed))
    }

    async fn with_ledger<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&ProcessedLedger) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let ledger = Arc::clone(&self.ledger);
        tokio::task::spawn_blocking(move || f(&ledger))
            .await
            .map_err(|e| DropmarkError::Other(format!("ledger task failed: {e}")))?
    }

    async fn process(self: Arc<Self>, path: PathBuf) -> ItemOutcome {
        let Some(parsed) = self.pattern.parse_path(&path) else {
            debug!("ignoring {}", path.display());
            return ItemOutcome::Ignored;
        };
        let key = parsed.logical_key.clone();

        let lookup_key = key.clone();
        match self.with_ledger(move |ledger| ledger.get(&lookup_key)).await {
            Ok(Some(entry)) if entry.status == LedgerStatus::Done => {
                debug!(key = %key, "already done, skipping {}", path.display());
                return ItemOutcome::AlreadyDone;
            }
            Ok(Some(entry)) if entry.status == LedgerStatus::Failed => {
                debug!(key = %key, "previously failed, skipping {}", path.display());
                return ItemOutcome::PreviouslyFailed;
            }
            Ok(_) => {}
            Err(e) => {
                error!(key = %key, "ledger lookup failed for {}: {}", path.display(), e);
                return ItemOutcome::Failed {
                    error: e.to_string(),
                };
            }
        }

        let Some(_claim) = PathClaim::new(&self.active_paths, &path) else {
            debug!("{} is already being handled", path.display());
            return ItemOutcome::Duplicate;
        };

        info!(key = %key, "detected {}", path.display());
        self.hooks.fire(
            HookEvent::ItemDetected,
            HookContext::new().with_key(&key).with_source(&path),
        );

        let mut shutdown = self.shutdown.clone();
        let waited = tokio::time::timeout(
            self.settings.stall_timeout,
            self.probe.wait_until_stable(&path, &mut shutdown),
        )
        .await;
        match waited {
            Ok(WaitOutcome::Stable { size, samples }) => {
                info!(key = %key, size, samples, "{} is stable", path.display());
            }
            Ok(WaitOutcome::VanishedOrUnreadable) => {
                info!(key = %key, "{} vanished before it settled", path.display());
                return ItemOutcome::Vanished;
            }
            Ok(WaitOutcome::Interrupted) => return ItemOutcome::Interrupted,
            Err(_) => return self.record_stall(&key, &path).await,
        }

        let permit = tokio::select! {
            permit = Arc::clone(&self.workers).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return ItemOutcome::Interrupted,
            },
            _ = shutdown.triggered() => return ItemOutcome::Interrupted,
        };

        let admission = {
            let key = key.clone();
            let source = path.clone();
            let owner = self.owner.clone();
            self.with_ledger(move |ledger| ledger.try_begin_unique(&key, &source, &owner))
                .await
        };
        let entry = match admission {
            Ok(Admission::Admitted { entry, reclaimed }) => {
                if reclaimed {
                    info!(
                        key = %key,
                        attempt = entry.attempts,
                        "re-admitted after an interrupted attempt"
                    );
                }
                entry
            }
            Ok(Admission::AlreadyDone(_)) => {
                debug!(key = %key, "completed elsewhere, discarding {}", path.display());
                return ItemOutcome::AlreadyDone;
            }
            Ok(Admission::AlreadyInProgress(existing))
                if existing.owner.as_ref() == Some(&self.owner) =>
            {
                debug!(
                    key = %key,
                    "placement of {} is unresolved, awaiting recovery on restart",
                    path.display()
                );
                return ItemOutcome::AlreadyInProgress;
            }
            Ok(Admission::AlreadyInProgress(existing)) => {
                info!(
                    key = %key,
                    holder = ?existing.owner,
                    "already in progress, discarding {}",
                    path.display()
                );
                return ItemOutcome::AlreadyInProgress;
            }
            Ok(Admission::PreviouslyFailed(_)) => return ItemOutcome::PreviouslyFailed,
            Err(e) => {
                error!(key = %key, "could not reserve {}: {}", path.display(), e);
                return ItemOutcome::Failed {
                    error: e.to_string(),
                };
            }
        };

        self.held.insert(key.clone(), path.clone());
        let outcome = self.run_reserved(&parsed, &path, entry.attempts).await;
        self.held.remove(&key);
        drop(permit);
        outcome
    }

    async fn run_reserved(
        &self,
        parsed: &ParsedName,
        source: &Path,
        ledger_attempt: u32,
    ) -> ItemOutcome {
        let key = parsed.logical_key.as_str();
        let destination = self.output_path_for(parsed);

        if destination.is_file() {
            return match self.complete(key, source, &destination).await {
                Ok(()) => {
                    info!(
                        key,
                        "output {} already present, recorded without transforming",
                        destination.display()
                    );
                    ItemOutcome::Recovered {
                        output: destination,
                    }
                }
                Err(e) => self.report_failure(key, source, e.to_string()),
            };
        }

        let staged = self
            .settings
            .staging_dir
            .join(self.pattern.derive_output_name(parsed));
        if let Err(e) = crate::fs::ensure_dir(&self.settings.staging_dir)
            .and_then(|()| crate::fs::remove_file_if_exists(&staged))
        {
            return self.fail(key, source, e.to_string()).await;
        }

        info!(key, attempt = ledger_attempt, "transforming {}", source.display());
        let filename = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let heartbeat = Heartbeat::spawn(
            Arc::clone(&self.ledger),
            key.to_string(),
            self.owner.clone(),
            self.settings.heartbeat_interval,
        );
        let outcome = self
            .client
            .invoke_observed(source, &staged, &self.shutdown, |attempt| {
                if let Err(e) = self.progress.begin(&filename, key, attempt) {
                    debug!("could not write progress marker: {}", e);
                }
            })
            .await;
        if let Err(e) = self.progress.finish(key) {
            debug!("could not clear progress marker: {}", e);
        }

        // The heartbeat keeps the reservation live through placement, which
        // may be a full copy across filesystems
        match outcome {
            TransformOutcome::Success { output_path, attempts } => {
                if let Err(e) = crate::fs::place_artifact(&output_path, &destination).await {
                    drop(heartbeat);
                    // Left InProgress under our owner: only recovery after a
                    // restart re-checks the output and re-admits the item
                    error!(
                        key,
                        "could not place artifact for {}: {} (entry left for recovery)",
                        source.display(),
                        e
                    );
                    self.fire_failed(key, source, &e.to_string());
                    return ItemOutcome::Failed {
                        error: e.to_string(),
                    };
                }
                let completed = self.complete(key, source, &destination).await;
                drop(heartbeat);
                match completed {
                    Ok(()) => {
                        info!(
                            key,
                            attempts,
                            "done: {} -> {}",
                            source.display(),
                            destination.display()
                        );
                        ItemOutcome::Done {
                            output: destination,
                        }
                    }
                    Err(e) => self.report_failure(key, source, e.to_string()),
                }
            }
            TransformOutcome::Interrupted { attempts } => {
                drop(heartbeat);
                warn!(key, attempts, "transform of {} stopped by shutdown", source.display());
                self.fail(key, source, INTERRUPTED_ERROR.to_string()).await
            }
            TransformOutcome::Failure {
                error_detail,
                transient,
                attempts,
            } => {
                drop(heartbeat);
                let detail = if transient {
                    format!("{error_detail} (gave up after {attempts} attempts)")
                } else {
                    error_detail
                };
                self.fail(key, source, detail).await
            }
        }
    }

    /// Mark Done and announce it.
    async fn complete(&self, key: &str, source: &Path, destination: &Path) -> Result<()> {
        let k = key.to_string();
        let output = destination.to_path_buf();
        self.with_ledger(move |ledger| ledger.mark_done(&k, &output))
            .await?;
        self.hooks.fire(
            HookEvent::ItemDone,
            HookContext::new()
                .with_key(key)
                .with_source(source)
                .with_output(destination),
        );
        Ok(())
    }

    /// Record a Failed entry for a reservation we hold and report it.
    async fn fail(&self, key: &str, source: &Path, detail: String) -> ItemOutcome {
        let k = key.to_string();
        let owner = self.owner.clone();
        let error = detail.clone();
        if let Err(e) = self
            .with_ledger(move |ledger| ledger.mark_failed(&k, &owner, &error))
            .await
        {
            warn!(key, "could not record failure: {}", e);
        }
        self.report_failure(key, source, detail)
    }

    fn report_failure(&self, key: &str, source: &Path, detail: String) -> ItemOutcome {
        error!(key, "failed to process {}: {}", source.display(), detail);
        self.fire_failed(key, source, &detail);
        ItemOutcome::Failed { error: detail }
    }

    fn fire_failed(&self, key: &str, source: &Path, detail: &str) {
        self.hooks.fire(
            HookEvent::ItemFailed,
            HookContext::new()
                .with_key(key)
                .with_source(source)
                .with_error(detail),
        );
    }

    /// The file never settled: reserve the key only to record the failure.
    async fn record_stall(&self, key: &str, path: &Path) -> ItemOutcome {
        let admission = {
            let k = key.to_string();
            let source = path.to_path_buf();
            let owner = self.owner.clone();
            self.with_ledger(move |ledger| ledger.try_begin_unique(&k, &source, &owner))
                .await
        };
        match admission {
            Ok(Admission::Admitted { .. }) => self.fail(key, path, STALL_ERROR.to_string()).await,
            Ok(Admission::AlreadyDone(_)) => ItemOutcome::AlreadyDone,
            Ok(Admission::AlreadyInProgress(_)) => ItemOutcome::AlreadyInProgress,
            Ok(Admission::PreviouslyFailed(_)) => ItemOutcome::PreviouslyFailed,
            Err(e) => self.report_failure(key, path, format!("{STALL_ERROR} ({e})")),
        }
    }
}

/// Exclusive claim on a path for the duration of its pipeline run.
struct PathClaim<'a> {
    map: &'a DashMap<PathBuf, ()>,
    path: PathBuf,
}

impl<'a> PathClaim<'a> {
    fn new(map: &'a DashMap<PathBuf, ()>, path: &Path) -> Option<Self> {
        match map.entry(path.to_path_buf()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(());
                Some(Self {
                    map,
                    path: path.to_path_buf(),
                })
            }
        }
    }
}

impl Drop for PathClaim<'_> {
    fn drop(&mut self) {
        self.map.remove(&self.path);
    }
}

/// Renews a reservation until dropped.
struct Heartbeat {
    handle: JoinHandle<()>,
}

impl Heartbeat {
    fn spawn(ledger: Arc<ProcessedLedger>, key: String, owner: Owner, interval: Duration) -> Self {
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let ledger = Arc::clone(&ledger);
                let k = key.clone();
                let o = owner.clone();
                let renewed = tokio::task::spawn_blocking(move || ledger.renew(&k, &o)).await;
                match renewed {
                    Ok(Ok(())) => {}
                    Ok(Err(e @ DropmarkError::LedgerConflict { .. }))
                    | Ok(Err(e @ DropmarkError::InvalidTransition { .. })) => {
                        warn!(key = %key, "reservation lost, no longer renewing: {}", e);
                        return;
                    }
                    Ok(Err(e)) => warn!(key = %key, "heartbeat renewal failed: {}", e),
                    Err(e) => warn!(key = %key, "heartbeat task failed: {}", e),
                }
            }
        });
        Self { handle }
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NamingConfig;
    use crate::shutdown::shutdown_channel;
    use crate::transform::{RetryPolicy, Transform, TransformError};
    use async_trait::async_trait;
    use tempfile::TempDir;

    struct CopyTransform;

    #[async_trait]
    impl Transform for CopyTransform {
        async fn run(
            &self,
            source: &Path,
            destination: &Path,
        ) -> std::result::Result<(), TransformError> {
            std::fs::copy(source, destination)
                .map(|_| ())
                .map_err(|e| TransformError::Permanent(e.to_string()))
        }
    }

    fn engine(temp: &TempDir) -> (IngestEngine, crate::shutdown::ShutdownTrigger) {
        let settings = EngineSettings {
            probe: ProbeSettings {
                poll_interval: Duration::from_millis(10),
                stable_samples: 2,
                quiet_period: Duration::ZERO,
            },
            stall_timeout: Duration::from_secs(5),
            workers: 1,
            heartbeat_interval: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(1),
            output_dir: temp.path().join("output"),
            staging_dir: temp.path().join("state").join("staging"),
        };
        let ledger = Arc::new(
            ProcessedLedger::open(
                temp.path().join("state").join("ledger.ndjson"),
                Duration::from_secs(60),
            )
            .unwrap(),
        );
        let client = TransformClient::new(
            Arc::new(CopyTransform),
            RetryPolicy {
                max_retries: 0,
                delay: Duration::ZERO,
            },
        );
        let (trigger, signal) = shutdown_channel();
        let engine = IngestEngine::new(
            settings,
            NamePattern::new(&NamingConfig::default()).unwrap(),
            ledger,
            client,
            Owner::new(std::process::id(), "engine-test"),
            signal,
        );
        (engine, trigger)
    }

    #[tokio::test]
    async fn test_unmatched_name_is_ignored() {
        let temp = TempDir::new().unwrap();
        let (engine, _trigger) = engine(&temp);
        let path = temp.path().join("holiday.mp4");
        std::fs::write(&path, b"x").unwrap();

        assert_eq!(engine.process(path).await, ItemOutcome::Ignored);
        assert!(engine.ledger().entries().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_path_is_coalesced() {
        let temp = TempDir::new().unwrap();
        let (engine, _trigger) = engine(&temp);
        let path = temp.path().join("20251104_1209_abc.mp4");

        let _claim = PathClaim::new(&engine.inner.active_paths, &path).unwrap();
        assert_eq!(engine.process(path).await, ItemOutcome::Duplicate);
    }

    #[tokio::test]
    async fn test_interrupted_before_stable_leaves_no_entry() {
        let temp = TempDir::new().unwrap();
        let (engine, trigger) = engine(&temp);
        let path = temp.path().join("20251104_1209_abc.mp4");
        // Empty files never settle
        std::fs::write(&path, b"").unwrap();

        trigger.trigger();
        assert_eq!(engine.process(path).await, ItemOutcome::Interrupted);
        assert!(engine.ledger().entries().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_abandon_held_records_interruption() {
        let temp = TempDir::new().unwrap();
        let (engine, _trigger) = engine(&temp);
        let source = temp.path().join("20251104_1209_abc.mp4");
        engine
            .ledger()
            .try_begin_unique("20251104_1209", &source, engine.owner())
            .unwrap();
        engine.inner.held.insert("20251104_1209".to_string(), source);

        let abandoned = engine.abandon_held().await;
        assert_eq!(abandoned, vec!["20251104_1209".to_string()]);
        let entry = engine.ledger().get("20251104_1209").unwrap().unwrap();
        assert_eq!(entry.status, LedgerStatus::Failed);
        assert_eq!(entry.last_error.as_deref(), Some(INTERRUPTED_ERROR));
    }

    #[test]
    fn test_settings_from_config() {
        let mut config = Config::default();
        config.engine.workers = 3;
        config.output_dir = PathBuf::from("/out");
        let settings = EngineSettings::from_config(&config, PathBuf::from("/state/staging"));
        assert_eq!(settings.workers, 3);
        assert_eq!(settings.stall_timeout, Duration::from_secs(1800));
        assert_eq!(settings.probe.stable_samples, 3);
        assert_eq!(settings.output_dir, PathBuf::from("/out"));
    }
}

//! Long-running drop-directory watcher.
//!
//! Uses `notify::RecommendedWatcher` bridged into a tokio channel. Events
//! are debounced into a set of paths and handed to the engine. A full
//! enumeration runs at startup, whenever the bridge overflowed, and on a
//! fixed interval to catch anything the event source missed.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use notify::{EventKind, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::enumerate_files;
use crate::engine::IngestEngine;
use crate::error::{DropmarkError, Result};
use crate::shutdown::ShutdownSignal;

/// Duration to wait for additional events before dispatching a batch.
const DEBOUNCE_DURATION: Duration = Duration::from_millis(200);

/// Capacity of the bounded channel bridging `notify` events to the tokio
/// loop. When it is full the callback flags a rescan instead.
const CHANNEL_CAPACITY: usize = 1024;

pub struct DropWatcher {
    drop_dir: PathBuf,
    recursive: bool,
    rescan_interval: Option<Duration>,
    events: mpsc::Receiver<notify::Event>,
    rescan_needed: Arc<AtomicBool>,
    /// Must be kept alive: dropping it deregisters the OS watch
    _watcher: notify::RecommendedWatcher,
}

impl DropWatcher {
    /// Register the OS watch on `drop_dir`.
    pub fn start(
        drop_dir: &Path,
        recursive: bool,
        rescan_interval: Option<Duration>,
    ) -> Result<Self> {
        if !drop_dir.is_dir() {
            return Err(DropmarkError::DropDirMissing(drop_dir.to_path_buf()));
        }

        let (tx, rx) = mpsc::channel::<notify::Event>(CHANNEL_CAPACITY);
        let rescan_needed = Arc::new(AtomicBool::new(false));

        let mut watcher = {
            let rescan = Arc::clone(&rescan_needed);
            notify::RecommendedWatcher::new(
                move |res: std::result::Result<notify::Event, notify::Error>| match res {
                    Ok(event) => {
                        if tx.try_send(event).is_err() && !rescan.swap(true, Ordering::Relaxed) {
                            warn!("watcher channel full, coalescing into a full rescan");
                        }
                    }
                    Err(e) => warn!("filesystem watcher error: {}", e),
                },
                notify::Config::default(),
            )
            .map_err(|e| DropmarkError::Watcher(format!("failed to create watcher: {e}")))?
        };

        let mode = if recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        watcher.watch(drop_dir, mode).map_err(|e| {
            DropmarkError::Watcher(format!("failed to watch {}: {e}", drop_dir.display()))
        })?;

        Ok(Self {
            drop_dir: drop_dir.to_path_buf(),
            recursive,
            rescan_interval,
            events: rx,
            rescan_needed,
            _watcher: watcher,
        })
    }

    pub fn drop_dir(&self) -> &Path {
        &self.drop_dir
    }

    /// Feed the engine until `shutdown` fires.
    pub async fn run(mut self, engine: &IngestEngine, mut shutdown: ShutdownSignal) -> Result<()> {
        info!(
            recursive = self.recursive,
            "watching {}",
            self.drop_dir.display()
        );
        self.rescan(engine)?;

        let mut rescan_timer = self.rescan_interval.map(|period| {
            let mut timer = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            timer
        });

        loop {
            tokio::select! {
                _ = shutdown.triggered() => break,
                event = self.events.recv() => {
                    let Some(event) = event else {
                        return Err(DropmarkError::Watcher("event source closed".to_string()));
                    };
                    let mut paths = HashSet::new();
                    collect_paths(&mut paths, &event);
                    self.drain_debounced(&mut paths).await;

                    if self.rescan_needed.swap(false, Ordering::Relaxed) {
                        if let Err(e) = self.rescan(engine) {
                            warn!("rescan after overflow failed: {}", e);
                        }
                    } else {
                        for path in paths {
                            engine.submit(path);
                        }
                    }
                }
                _ = tick(&mut rescan_timer) => {
                    debug!("periodic rescan of {}", self.drop_dir.display());
                    if let Err(e) = self.rescan(engine) {
                        warn!("periodic rescan failed: {}", e);
                    }
                }
            }
        }
        Ok(())
    }

    async fn drain_debounced(&mut self, paths: &mut HashSet<PathBuf>) {
        while let Ok(Some(event)) =
            tokio::time::timeout(DEBOUNCE_DURATION, self.events.recv()).await
        {
            collect_paths(paths, &event);
        }
    }

    fn rescan(&self, engine: &IngestEngine) -> Result<()> {
        for path in enumerate_files(&self.drop_dir, self.recursive)? {
            engine.submit(path);
        }
        Ok(())
    }
}

/// Files an event may have produced or grown.
fn collect_paths(paths: &mut HashSet<PathBuf>, event: &notify::Event) {
    if !matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Any | EventKind::Other
    ) {
        return;
    }
    for path in &event.paths {
        if path.is_file() {
            paths.insert(path.clone());
        }
    }
}

async fn tick(timer: &mut Option<tokio::time::Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending().await,
    }
}

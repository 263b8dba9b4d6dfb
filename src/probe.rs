//! Write-completion detection.
//!
//! Producers give no "closed" signal (captures often arrive through slow
//! syncs), so a file is judged finished by polling: it must report the same
//! non-zero size for `stable_samples` consecutive samples AND its last
//! modification must be older than the quiet period. The second condition
//! catches a writer that paused on a sampling boundary.

use std::path::Path;
use std::time::{Duration, SystemTime};

use crate::config::StabilityConfig;
use crate::shutdown::ShutdownSignal;

/// Keep at most this many samples per candidate; older ones carry no signal.
const MAX_RETAINED_SAMPLES: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeSettings {
    pub poll_interval: Duration,
    pub stable_samples: u32,
    pub quiet_period: Duration,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self::from(&StabilityConfig::default())
    }
}

impl From<&StabilityConfig> for ProbeSettings {
    fn from(cfg: &StabilityConfig) -> Self {
        Self {
            poll_interval: cfg.poll_interval(),
            stable_samples: cfg.stable_samples.max(1),
            quiet_period: cfg.quiet_period(),
        }
    }
}

/// One observation of a candidate file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeSample {
    pub taken_at: SystemTime,
    pub size: u64,
    pub modified: SystemTime,
}

/// Verdict for a single sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stability {
    Stable { size: u64 },
    StillWriting,
    VanishedOrUnreadable,
}

/// Result of waiting for a file to settle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    Stable { size: u64, samples: usize },
    VanishedOrUnreadable,
    Interrupted,
}

/// Pure sampling state for one candidate.
#[derive(Debug, Clone)]
pub struct StabilityTracker {
    settings: ProbeSettings,
    samples: Vec<SizeSample>,
    run_length: u32,
}

impl StabilityTracker {
    pub fn new(settings: ProbeSettings) -> Self {
        Self {
            settings,
            samples: Vec::new(),
            run_length: 0,
        }
    }

    pub fn observe(&mut self, sample: SizeSample) -> Stability {
        let continues_run = self
            .samples
            .last()
            .is_some_and(|prev| prev.size == sample.size);

        self.run_length = match (sample.size, continues_run) {
            (0, _) => 0,
            (_, true) => self.run_length.saturating_add(1),
            (_, false) => 1,
        };

        if self.samples.len() == MAX_RETAINED_SAMPLES {
            self.samples.remove(0);
        }
        self.samples.push(sample);

        let quiet = sample
            .taken_at
            .duration_since(sample.modified)
            .map(|age| age >= self.settings.quiet_period)
            // mtime in the future: the writer's clock is ahead, treat as active
            .unwrap_or(false);

        if self.run_length >= self.settings.stable_samples && quiet {
            Stability::Stable { size: sample.size }
        } else {
            Stability::StillWriting
        }
    }

    pub fn samples(&self) -> &[SizeSample] {
        &self.samples
    }
}

/// Take one sample of `path`. `None` when the path is gone, unreadable or
/// not a regular file.
pub fn sample(path: &Path) -> Option<SizeSample> {
    to_sample(std::fs::metadata(path).ok()?)
}

/// [`sample`] without blocking the runtime on slow mounts.
pub async fn sample_async(path: &Path) -> Option<SizeSample> {
    to_sample(tokio::fs::metadata(path).await.ok()?)
}

fn to_sample(metadata: std::fs::Metadata) -> Option<SizeSample> {
    if !metadata.is_file() {
        return None;
    }
    Some(SizeSample {
        taken_at: SystemTime::now(),
        size: metadata.len(),
        modified: metadata.modified().ok()?,
    })
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CompletionProbe {
    settings: ProbeSettings,
}

impl CompletionProbe {
    pub fn new(settings: ProbeSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> ProbeSettings {
        self.settings
    }

    /// Sample once and fold the observation into `tracker`.
    pub fn check(&self, path: &Path, tracker: &mut StabilityTracker) -> Stability {
        fold(sample(path), tracker)
    }

    /// Poll until the file settles or disappears. There is no timeout here;
    /// callers bound the wait.
    pub async fn wait_until_stable(
        &self,
        path: &Path,
        shutdown: &mut ShutdownSignal,
    ) -> WaitOutcome {
        let mut tracker = StabilityTracker::new(self.settings);
        loop {
            match fold(sample_async(path).await, &mut tracker) {
                Stability::Stable { size } => {
                    return WaitOutcome::Stable {
                        size,
                        samples: tracker.samples().len(),
                    };
                }
                Stability::VanishedOrUnreadable => return WaitOutcome::VanishedOrUnreadable,
                Stability::StillWriting => {}
            }

            tokio::select! {
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
                _ = shutdown.triggered() => return WaitOutcome::Interrupted,
            }
        }
    }
}

fn fold(observation: Option<SizeSample>, tracker: &mut StabilityTracker) -> Stability {
    match observation {
        Some(observation) => tracker.observe(observation),
        None => Stability::VanishedOrUnreadable,
    }
}

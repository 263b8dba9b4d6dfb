//! The external watermark-removal operation.
//!
//! [`Transform`] is the seam to whatever actually rewrites the video.
//! [`TransformClient`] wraps exactly one logical invocation of it and owns the
//! retry policy: transient failures are retried with a fixed delay up to a
//! bound, permanent failures end the invocation immediately. Once shutdown
//! has been requested no further attempt is started.

mod command;

pub use command::{CommandTransform, find_program};

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::TransformConfig;
use crate::shutdown::{ShutdownSignal, shutdown_channel};

/// Failure of a single transform attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransformError {
    /// Worth retrying (resource exhaustion, temporary unavailability)
    #[error("{0}")]
    Transient(String),
    /// Retrying cannot help (bad input, missing program)
    #[error("{0}")]
    Permanent(String),
}

impl TransformError {
    pub fn is_transient(&self) -> bool {
        matches!(self, TransformError::Transient(_))
    }
}

#[async_trait]
pub trait Transform: Send + Sync {
    /// Read `source` and write the cleaned artifact to `destination`.
    async fn run(&self, source: &Path, destination: &Path) -> Result<(), TransformError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&TransformConfig::default())
    }
}

impl From<&TransformConfig> for RetryPolicy {
    fn from(config: &TransformConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            delay: Duration::from_millis(config.retry_delay_ms),
        }
    }
}

/// Result of one logical invocation, retries included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransformOutcome {
    Success {
        output_path: PathBuf,
        attempts: u32,
    },
    Failure {
        error_detail: String,
        transient: bool,
        attempts: u32,
    },
    /// An attempt failed after shutdown was requested, or shutdown arrived
    /// while waiting to retry
    Interrupted { attempts: u32 },
}

impl TransformOutcome {
    pub fn attempts(&self) -> u32 {
        match self {
            TransformOutcome::Success { attempts, .. }
            | TransformOutcome::Failure { attempts, .. }
            | TransformOutcome::Interrupted { attempts } => *attempts,
        }
    }
}

#[derive(Clone)]
pub struct TransformClient {
    transform: Arc<dyn Transform>,
    policy: RetryPolicy,
}

impl std::fmt::Debug for TransformClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransformClient")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl TransformClient {
    pub fn new(transform: Arc<dyn Transform>, policy: RetryPolicy) -> Self {
        Self { transform, policy }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// One invocation that never observes shutdown.
    pub async fn invoke(&self, source: &Path, destination: &Path) -> TransformOutcome {
        let (_trigger, shutdown) = shutdown_channel();
        self.invoke_observed(source, destination, &shutdown, |_| {}).await
    }

    /// Like [`invoke`](Self::invoke), calling `on_attempt` with the 1-based
    /// attempt number before each attempt starts.
    ///
    /// A failure seen after `shutdown` fired is reported as
    /// [`TransformOutcome::Interrupted`] whatever its class: a child killed
    /// along with the terminal's process group must not be retried.
    pub async fn invoke_observed<F>(
        &self,
        source: &Path,
        destination: &Path,
        shutdown: &ShutdownSignal,
        mut on_attempt: F,
    ) -> TransformOutcome
    where
        F: FnMut(u32) + Send,
    {
        let max_attempts = self.policy.max_retries.saturating_add(1);
        let mut shutdown = shutdown.clone();
        let mut attempt = 0;

        loop {
            attempt += 1;
            on_attempt(attempt);
            debug!(
                source = %source.display(),
                attempt,
                max_attempts,
                "invoking transform"
            );

            let error = match self.transform.run(source, destination).await {
                Ok(()) => {
                    return TransformOutcome::Success {
                        output_path: destination.to_path_buf(),
                        attempts: attempt,
                    };
                }
                Err(error) => error,
            };

            // A failed attempt must not leave a half-written artifact behind
            if let Err(e) = crate::fs::remove_file_if_exists(destination) {
                warn!("could not clear partial output: {}", e);
            }

            if shutdown.is_triggered() {
                debug!(attempt, "transform failed during shutdown, not retrying: {}", error);
                return TransformOutcome::Interrupted { attempts: attempt };
            }

            if !error.is_transient() || attempt >= max_attempts {
                return TransformOutcome::Failure {
                    error_detail: error.to_string(),
                    transient: error.is_transient(),
                    attempts: attempt,
                };
            }

            warn!(
                source = %source.display(),
                attempt,
                max_attempts,
                "transient transform failure, retrying in {:?}: {}",
                self.policy.delay,
                error
            );
            tokio::select! {
                _ = tokio::time::sleep(self.policy.delay) => {}
                _ = shutdown.triggered() => {
                    return TransformOutcome::Interrupted { attempts: attempt };
                }
            }
        }
    }
}

mod batch;
mod config;
mod doctor;
pub mod interactive;
mod prune;
mod reset;
mod run;
mod status;

pub use batch::{BatchOptions, cmd_batch};
pub use config::cmd_config_show;
pub use doctor::cmd_doctor;
pub use prune::cmd_prune;
pub use reset::cmd_reset;
pub use run::{RunOptions, cmd_run};
pub use status::cmd_status;

use std::path::PathBuf;
use std::sync::Arc;

use owo_colors::OwoColorize;

use crate::config::Config;
use crate::engine::{EngineSettings, IngestEngine};
use crate::error::Result;
use crate::hooks::HookRunner;
use crate::ledger::{LedgerStatus, Owner, ProcessedLedger};
use crate::naming::NamePattern;
use crate::paths;
use crate::shutdown::ShutdownSignal;
use crate::transform::{CommandTransform, RetryPolicy, TransformClient};

/// Output of a command that can render as text or JSON.
pub struct CommandOutput {
    json: serde_json::Value,
    text: Option<String>,
}

impl CommandOutput {
    pub fn new(json: serde_json::Value) -> Self {
        Self { json, text: None }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    /// Print as pretty JSON when `output_json` is set, otherwise the text
    /// form (falling back to JSON when none was given).
    pub fn print(self, output_json: bool) -> Result<()> {
        match (output_json, self.text) {
            (false, Some(text)) => println!("{text}"),
            _ => println!("{}", serde_json::to_string_pretty(&self.json)?),
        }
        Ok(())
    }
}

/// Directory overrides given on the command line.
#[derive(Debug, Default, Clone)]
pub struct DirOverrides {
    pub drop_dir: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
}

impl DirOverrides {
    fn apply(&self, config: &mut Config) {
        if let Some(dir) = &self.drop_dir {
            config.drop_dir = dir.clone();
        }
        if let Some(dir) = &self.output_dir {
            config.output_dir = dir.clone();
        }
    }
}

/// Load configuration with command-line overrides applied last.
pub(crate) fn load_config(overrides: &DirOverrides) -> Result<Config> {
    let mut config = Config::load()?;
    overrides.apply(&mut config);
    Ok(config)
}

pub(crate) fn open_ledger(config: &Config) -> Result<Arc<ProcessedLedger>> {
    let ledger = ProcessedLedger::open(paths::ledger_path(), config.engine.heartbeat_grace())?;
    Ok(Arc::new(ledger))
}

/// Wire the engine to the external transform and the configured hooks.
pub(crate) fn build_engine(
    config: &Config,
    ledger: Arc<ProcessedLedger>,
    owner: Owner,
    shutdown: ShutdownSignal,
) -> Result<IngestEngine> {
    let pattern = NamePattern::new(&config.naming)?;
    let client = TransformClient::new(
        Arc::new(CommandTransform::from_config(&config.transform)),
        RetryPolicy::from(&config.transform),
    );
    let settings = EngineSettings::from_config(config, paths::staging_dir());
    let engine = IngestEngine::new(settings, pattern, ledger, client, owner, shutdown)
        .with_hooks(HookRunner::new(config.hooks.clone(), paths::state_root()));
    Ok(engine)
}

/// Resolve on Ctrl-C, or SIGTERM on unix.
pub(crate) async fn wait_for_termination() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
                return;
            }
            Err(e) => tracing::warn!("could not install SIGTERM handler: {}", e),
        }
    }
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("could not listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}

pub(crate) fn colored_status(status: LedgerStatus, stale: bool) -> String {
    match status {
        LedgerStatus::Pending => status.to_string().yellow().to_string(),
        LedgerStatus::InProgress if stale => format!("{status} (stale)").magenta().to_string(),
        LedgerStatus::InProgress => status.to_string().cyan().to_string(),
        LedgerStatus::Done => status.to_string().green().to_string(),
        LedgerStatus::Failed => status.to_string().red().to_string(),
    }
}

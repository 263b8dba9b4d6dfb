//! Operator hook scripts.
//!
//! Hooks are configured in `.dropmark/config.yaml` and scripts live in
//! `.dropmark/hooks/`. They run after an event has happened and can never
//! influence processing: failures and timeouts are appended to
//! `.dropmark/hooks.log` and logged as warnings.
//!
//! # Environment Variables
//!
//! Hook scripts receive context via environment variables:
//! - `DROPMARK_EVENT`: the event name (e.g. "item_done")
//! - `DROPMARK_KEY`: the logical key (e.g. "20251104_1209")
//! - `DROPMARK_SOURCE`: path of the dropped file
//! - `DROPMARK_OUTPUT`: path of the placed artifact (item_done)
//! - `DROPMARK_ERROR`: failure detail (item_failed)
//! - `DROPMARK_ROOT`: path of the state directory

mod runner;
pub mod types;

pub use runner::context_to_env;
pub use types::{HookContext, HookEvent};

use std::path::{Path, PathBuf};

use crate::config::HooksConfig;
use runner::{execute_hook, log_hook_failure};

/// Dispatches events to configured scripts.
#[derive(Debug, Clone)]
pub struct HookRunner {
    config: HooksConfig,
    state_root: PathBuf,
}

impl HookRunner {
    pub fn new(config: HooksConfig, state_root: impl Into<PathBuf>) -> Self {
        Self {
            config,
            state_root: state_root.into(),
        }
    }

    /// A runner that never runs anything.
    pub fn disabled() -> Self {
        Self::new(
            HooksConfig {
                enabled: false,
                ..HooksConfig::default()
            },
            PathBuf::new(),
        )
    }

    pub fn state_root(&self) -> &Path {
        &self.state_root
    }

    fn script_for(&self, event: HookEvent) -> Option<&String> {
        if !self.config.enabled {
            return None;
        }
        self.config.get_script(&event.to_string())
    }

    /// Run the script for `event`, if any, and wait for it.
    pub async fn run(&self, event: HookEvent, context: HookContext) {
        let Some(script_name) = self.script_for(event) else {
            return;
        };
        let context = context.with_event(event);
        if let Err(e) =
            execute_hook(&self.state_root, script_name, &context, self.config.timeout).await
        {
            log_hook_failure(&self.state_root, script_name, &e);
            tracing::warn!("hook '{script_name}' failed: {e}");
        }
    }

    /// Run the script for `event` in the background.
    pub fn fire(&self, event: HookEvent, context: HookContext) {
        if self.script_for(event).is_none() {
            return;
        }
        let runner = self.clone();
        tokio::spawn(async move { runner.run(event, context).await });
    }
}

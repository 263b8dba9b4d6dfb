//! Hook types: the events scripts can subscribe to and the context they get.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::enum_display_fromstr;
use crate::error::DropmarkError;

/// Events that can trigger hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookEvent {
    /// Fired once the watcher is up and has claimed the instance record
    WatcherStarted,
    /// Fired when a matching file is first seen
    ItemDetected,
    /// Fired after an artifact has been placed and recorded
    ItemDone,
    /// Fired after an item has been recorded as failed
    ItemFailed,
}

enum_display_fromstr!(
    HookEvent,
    DropmarkError::invalid_hook_event,
    {
        WatcherStarted => "watcher_started",
        ItemDetected => "item_detected",
        ItemDone => "item_done",
        ItemFailed => "item_failed",
    }
);

impl HookEvent {
    /// Returns all possible hook events.
    pub fn all() -> &'static [HookEvent] {
        &[
            HookEvent::WatcherStarted,
            HookEvent::ItemDetected,
            HookEvent::ItemDone,
            HookEvent::ItemFailed,
        ]
    }
}

/// Context passed to hook scripts via environment variables.
#[derive(Debug, Clone, Default)]
pub struct HookContext {
    pub event: Option<HookEvent>,
    pub logical_key: Option<String>,
    pub source_path: Option<PathBuf>,
    pub output_path: Option<PathBuf>,
    pub error: Option<String>,
}

impl HookContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_event(mut self, event: HookEvent) -> Self {
        self.event = Some(event);
        self
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.logical_key = Some(key.into());
        self
    }

    pub fn with_source(mut self, path: impl Into<PathBuf>) -> Self {
        self.source_path = Some(path.into());
        self
    }

    pub fn with_output(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_path = Some(path.into());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DropmarkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to {operation} {path}: {source}")]
    Storage {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml_ng::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid status '{0}'")]
    InvalidStatus(String),

    #[error("invalid hook event '{0}'")]
    InvalidHookEvent(String),

    #[error("ledger entry '{0}' not found")]
    EntryNotFound(String),

    #[error("ledger entry '{key}' cannot move from {from} to {to}")]
    InvalidTransition {
        key: String,
        from: String,
        to: String,
    },

    #[error("ledger entry '{key}' is held by another owner ({holder})")]
    LedgerConflict { key: String, holder: String },

    #[error("ledger is corrupted at {path}: {reason}")]
    LedgerCorrupted { path: PathBuf, reason: String },

    #[error("could not lock {path}: {source}")]
    Lock {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("another instance (pid {pid}) is still running and could not be stopped")]
    InstanceConflict { pid: u32 },

    #[error("drop directory does not exist: {0}")]
    DropDirMissing(PathBuf),

    #[error("filesystem watcher error: {0}")]
    Watcher(String),

    #[error("hook '{hook_name}' timed out after {seconds} seconds")]
    HookTimeout { hook_name: String, seconds: u64 },

    #[error("hook '{hook_name}' failed: {message}")]
    HookFailed { hook_name: String, message: String },

    #[error("hook script not found: {0}")]
    HookScriptNotFound(PathBuf),

    #[error("hook security violation: {0}")]
    HookSecurity(String),

    #[error("logging setup failed: {0}")]
    Logging(String),

    #[error("{0}")]
    Other(String),
}

impl DropmarkError {
    pub fn invalid_status(value: String) -> Self {
        DropmarkError::InvalidStatus(value)
    }

    pub fn invalid_hook_event(value: String) -> Self {
        DropmarkError::InvalidHookEvent(value)
    }

    pub(crate) fn storage(
        operation: &'static str,
        path: impl Into<PathBuf>,
    ) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| DropmarkError::Storage {
            operation,
            path,
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, DropmarkError>;

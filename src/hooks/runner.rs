//! Hook execution engine.
//!
//! Handles the low-level details of running hook scripts: path validation,
//! process spawning, timeout handling, environment construction and failure
//! logging.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;

use jiff::Timestamp;
use tokio::process::Command as TokioCommand;
use tokio::time::timeout;

use super::types::HookContext;
use crate::error::{DropmarkError, Result};

/// The file within the state root where hook failures are logged.
const HOOK_LOG_FILE: &str = "hooks.log";

/// Reject script names that could escape the hooks directory.
fn validate_script_name(script_name: &str) -> Result<()> {
    if script_name.is_empty()
        || script_name.contains('/')
        || script_name.contains('\\')
        || script_name.contains('\0')
        || script_name == ".."
    {
        return Err(DropmarkError::HookSecurity(format!(
            "invalid script name '{script_name}'"
        )));
    }
    Ok(())
}

/// Resolve `script_name` inside `hooks_dir`, following symlinks, and make sure
/// the result is still inside it.
fn resolve_script(hooks_dir: &Path, script_name: &str) -> Result<PathBuf> {
    validate_script_name(script_name)?;

    let script_path = hooks_dir.join(script_name);
    if !script_path.exists() {
        return Err(DropmarkError::HookScriptNotFound(script_path));
    }

    let hooks_dir = hooks_dir
        .canonicalize()
        .map_err(DropmarkError::storage("resolve", hooks_dir))?;
    let script_path = script_path
        .canonicalize()
        .map_err(DropmarkError::storage("resolve", &script_path))?;

    if !script_path.starts_with(&hooks_dir) {
        return Err(DropmarkError::HookSecurity(format!(
            "script '{}' resolves outside the hooks directory",
            script_path.display()
        )));
    }
    Ok(script_path)
}

/// Run one hook script to completion.
pub(super) async fn execute_hook(
    state_root: &Path,
    script_name: &str,
    context: &HookContext,
    timeout_secs: u64,
) -> Result<()> {
    let script_path = resolve_script(&state_root.join("hooks"), script_name)?;

    let mut cmd = TokioCommand::new(&script_path);
    cmd.envs(context_to_env(context, state_root))
        .current_dir(state_root)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = cmd.spawn()?;
    let output = if timeout_secs == 0 {
        child.wait_with_output().await?
    } else {
        match timeout(Duration::from_secs(timeout_secs), child.wait_with_output()).await {
            Ok(output) => output?,
            // Dropping the future drops the child, which kills it
            Err(_) => {
                return Err(DropmarkError::HookTimeout {
                    hook_name: script_name.to_string(),
                    seconds: timeout_secs,
                });
            }
        }
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let message = if stderr.is_empty() {
            match output.status.code() {
                Some(code) => format!("exited with status {code}"),
                None => "terminated by a signal".to_string(),
            }
        } else {
            stderr
        };
        return Err(DropmarkError::HookFailed {
            hook_name: script_name.to_string(),
            message,
        });
    }
    Ok(())
}

/// Convert a HookContext to environment variables for the hook script.
pub fn context_to_env(context: &HookContext, state_root: &Path) -> HashMap<String, String> {
    let mut env = HashMap::new();

    if let Some(event) = &context.event {
        env.insert("DROPMARK_EVENT".to_string(), event.to_string());
    }
    if let Some(key) = &context.logical_key {
        env.insert("DROPMARK_KEY".to_string(), key.clone());
    }
    if let Some(source) = &context.source_path {
        env.insert("DROPMARK_SOURCE".to_string(), source.display().to_string());
    }
    if let Some(output) = &context.output_path {
        env.insert("DROPMARK_OUTPUT".to_string(), output.display().to_string());
    }
    if let Some(error) = &context.error {
        env.insert("DROPMARK_ERROR".to_string(), error.clone());
    }

    env.insert("DROPMARK_ROOT".to_string(), state_root.display().to_string());
    env
}

/// Append a timestamped failure line to `hooks.log`.
///
/// Problems writing the log are reported through tracing and otherwise
/// ignored; hooks never affect processing.
pub(super) fn log_hook_failure(state_root: &Path, hook_name: &str, error: &DropmarkError) {
    let log_path = state_root.join(HOOK_LOG_FILE);
    let log_entry = format!("{}: hook '{hook_name}' failed: {error}\n", Timestamp::now());

    #[cfg(unix)]
    let result = OpenOptions::new()
        .create(true)
        .append(true)
        .mode(0o600)
        .open(&log_path)
        .and_then(|mut file| file.write_all(log_entry.as_bytes()));

    #[cfg(not(unix))]
    let result = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .and_then(|mut file| file.write_all(log_entry.as_bytes()));

    if let Err(e) = result {
        tracing::warn!("failed to write to hook log {}: {}", log_path.display(), e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::HookEvent;

    #[test]
    fn test_validate_script_name() {
        assert!(validate_script_name("notify.sh").is_ok());
        for bad in ["", "..", "../escape.sh", "dir/notify.sh", "a\\b", "nul\0byte"] {
            assert!(
                matches!(validate_script_name(bad), Err(DropmarkError::HookSecurity(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_context_to_env_full() {
        let context = HookContext::new()
            .with_event(HookEvent::ItemDone)
            .with_key("20251104_1209")
            .with_source("/drop/20251104_1209_abc.mp4")
            .with_output("/out/wr_20251104_1209.mp4");

        let env = context_to_env(&context, Path::new(".dropmark"));

        assert_eq!(env.get("DROPMARK_EVENT"), Some(&"item_done".to_string()));
        assert_eq!(env.get("DROPMARK_KEY"), Some(&"20251104_1209".to_string()));
        assert_eq!(
            env.get("DROPMARK_SOURCE"),
            Some(&"/drop/20251104_1209_abc.mp4".to_string())
        );
        assert_eq!(
            env.get("DROPMARK_OUTPUT"),
            Some(&"/out/wr_20251104_1209.mp4".to_string())
        );
        assert_eq!(env.get("DROPMARK_ERROR"), None);
        assert_eq!(env.get("DROPMARK_ROOT"), Some(&".dropmark".to_string()));
    }

    #[test]
    fn test_context_to_env_minimal() {
        let context = HookContext::new().with_event(HookEvent::WatcherStarted);
        let env = context_to_env(&context, Path::new("/state"));
        assert_eq!(env.len(), 2);
        assert_eq!(env.get("DROPMARK_EVENT"), Some(&"watcher_started".to_string()));
    }
}

//! Top-level application configuration.
//!
//! Configuration is stored in `.dropmark/config.yaml` and includes:
//! - Drop and output directories
//! - Filename pattern settings
//! - Stability probe cadence and the per-item stall cap
//! - Worker, heartbeat and rescan settings for the engine
//! - The external transform command and its retry policy
//! - Hook script configuration
//!
//! Every value can be overridden by a `DROPMARK_*` environment variable and,
//! for the directories, by command-line flags.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DropmarkError, Result};
use crate::paths::config_path;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory producers drop raw captures into
    #[serde(default = "default_drop_dir")]
    pub drop_dir: PathBuf,

    /// Directory processed artifacts are placed into
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Whether subdirectories of the drop directory are watched too (default: true)
    #[serde(default = "default_recursive")]
    pub recursive: bool,

    #[serde(default)]
    pub naming: NamingConfig,

    #[serde(default)]
    pub stability: StabilityConfig,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub transform: TransformConfig,

    #[serde(default, skip_serializing_if = "HooksConfig::is_default")]
    pub hooks: HooksConfig,
}

fn default_drop_dir() -> PathBuf {
    PathBuf::from("drop")
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("output")
}

fn default_recursive() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            drop_dir: default_drop_dir(),
            output_dir: default_output_dir(),
            recursive: default_recursive(),
            naming: NamingConfig::default(),
            stability: StabilityConfig::default(),
            engine: EngineConfig::default(),
            transform: TransformConfig::default(),
            hooks: HooksConfig::default(),
        }
    }
}

/// Input filename shape and output naming
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamingConfig {
    /// Prefix of derived output names (default: "wr")
    #[serde(default = "default_output_prefix")]
    pub output_prefix: String,

    /// Accepted video extensions, compared case-insensitively (default: ["mp4"])
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,

    /// Exact digit count of the time token; `None` accepts any digit run (default: 4)
    #[serde(default = "default_time_digits")]
    pub time_digits: Option<usize>,
}

fn default_output_prefix() -> String {
    "wr".to_string()
}

fn default_extensions() -> Vec<String> {
    vec!["mp4".to_string()]
}

fn default_time_digits() -> Option<usize> {
    Some(4)
}

impl Default for NamingConfig {
    fn default() -> Self {
        Self {
            output_prefix: default_output_prefix(),
            extensions: default_extensions(),
            time_digits: default_time_digits(),
        }
    }
}

/// Write-completion detection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StabilityConfig {
    /// Interval between size samples in milliseconds (default: 2000)
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Consecutive identical non-zero samples required (default: 3)
    #[serde(default = "default_stable_samples")]
    pub stable_samples: u32,

    /// Minimum age of the last modification in milliseconds (default: 2000)
    #[serde(default = "default_quiet_period_ms")]
    pub quiet_period_ms: u64,

    /// Give up on a file that has not settled after this many seconds (default: 1800)
    #[serde(default = "default_stall_timeout_secs")]
    pub stall_timeout_secs: u64,
}

fn default_poll_interval_ms() -> u64 {
    2000
}

fn default_stable_samples() -> u32 {
    3
}

fn default_quiet_period_ms() -> u64 {
    2000
}

fn default_stall_timeout_secs() -> u64 {
    30 * 60
}

impl Default for StabilityConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            stable_samples: default_stable_samples(),
            quiet_period_ms: default_quiet_period_ms(),
            stall_timeout_secs: default_stall_timeout_secs(),
        }
    }
}

impl StabilityConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn quiet_period(&self) -> Duration {
        Duration::from_millis(self.quiet_period_ms)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs)
    }
}

/// Engine scheduling and liveness
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum transforms running at once (default: 1)
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// How often in-flight reservations and the instance record are renewed (default: 15)
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,

    /// Age after which an unrenewed heartbeat is considered dead (default: 60)
    #[serde(default = "default_heartbeat_grace_secs")]
    pub heartbeat_grace_secs: u64,

    /// Full drop-directory re-enumeration interval, 0 disables (default: 30)
    #[serde(default = "default_rescan_interval_secs")]
    pub rescan_interval_secs: u64,

    /// How long in-flight transforms may keep running after an interrupt (default: 30)
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

fn default_workers() -> usize {
    1
}

fn default_heartbeat_interval_secs() -> u64 {
    15
}

fn default_heartbeat_grace_secs() -> u64 {
    60
}

fn default_rescan_interval_secs() -> u64 {
    30
}

fn default_shutdown_grace_secs() -> u64 {
    30
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            heartbeat_grace_secs: default_heartbeat_grace_secs(),
            rescan_interval_secs: default_rescan_interval_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

impl EngineConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn heartbeat_grace(&self) -> Duration {
        Duration::from_secs(self.heartbeat_grace_secs)
    }

    pub fn rescan_interval(&self) -> Option<Duration> {
        (self.rescan_interval_secs > 0).then(|| Duration::from_secs(self.rescan_interval_secs))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// External transform command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformConfig {
    /// Program to run; a bare name is looked up on PATH (default: "sorawm")
    #[serde(default = "default_program")]
    pub program: String,

    /// Arguments; `{input}` and `{output}` are substituted per item
    #[serde(default = "default_args")]
    pub args: Vec<String>,

    /// Per-attempt timeout in seconds, 0 = no timeout (default: 0)
    #[serde(default)]
    pub timeout_secs: u64,

    /// Retries after the first attempt for transient failures (default: 2)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Fixed delay between attempts in milliseconds (default: 5000)
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Exit codes classified as transient (default: [75])
    #[serde(default = "default_transient_exit_codes")]
    pub transient_exit_codes: Vec<i32>,

    /// Case-insensitive stderr substrings classified as transient
    #[serde(default = "default_transient_patterns")]
    pub transient_patterns: Vec<String>,
}

fn default_program() -> String {
    "sorawm".to_string()
}

fn default_args() -> Vec<String> {
    vec!["{input}".to_string(), "{output}".to_string()]
}

fn default_max_retries() -> u32 {
    2
}

fn default_retry_delay_ms() -> u64 {
    5000
}

fn default_transient_exit_codes() -> Vec<i32> {
    vec![75]
}

fn default_transient_patterns() -> Vec<String> {
    vec![
        "out of memory".to_string(),
        "resource temporarily unavailable".to_string(),
    ]
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            args: default_args(),
            timeout_secs: 0,
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            transient_exit_codes: default_transient_exit_codes(),
            transient_patterns: default_transient_patterns(),
        }
    }
}

/// Hooks configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HooksConfig {
    /// Whether hooks are enabled (default: true)
    #[serde(default = "default_hooks_enabled")]
    pub enabled: bool,

    /// Timeout in seconds for hook scripts (default: 30, 0 = no timeout)
    #[serde(default = "default_hooks_timeout")]
    pub timeout: u64,

    /// Mapping of event names to script names (relative to .dropmark/hooks/)
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub scripts: HashMap<String, String>,
}

fn default_hooks_enabled() -> bool {
    true
}

fn default_hooks_timeout() -> u64 {
    30
}

impl Default for HooksConfig {
    fn default() -> Self {
        Self {
            enabled: default_hooks_enabled(),
            timeout: default_hooks_timeout(),
            scripts: HashMap::new(),
        }
    }
}

impl HooksConfig {
    /// Check if this config is the default (for serialization skip)
    pub fn is_default(&self) -> bool {
        self.enabled == default_hooks_enabled()
            && self.timeout == default_hooks_timeout()
            && self.scripts.is_empty()
    }

    /// Get the script name for a given event name
    pub fn get_script(&self, event_name: &str) -> Option<&String> {
        self.scripts.get(event_name)
    }
}

impl Config {
    /// Load configuration from the state root, apply environment overrides
    /// and validate the result.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&config_path())?;
        config.apply_env_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file, or return defaults if it does not exist
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Config::default());
        }

        let content = crate::fs::read_file(path)?;
        if content.trim().is_empty() {
            return Ok(Config::default());
        }
        let config: Config = serde_yaml_ng::from_str(&content)?;
        Ok(config)
    }

    /// Apply `DROPMARK_*` overrides. `lookup` abstracts the environment so
    /// the mapping can be exercised without touching process state.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        if let Some(dir) = get("DROPMARK_DROP_DIR") {
            self.drop_dir = PathBuf::from(dir);
        }
        if let Some(dir) = get("DROPMARK_OUTPUT_DIR") {
            self.output_dir = PathBuf::from(dir);
        }
        if let Some(value) = get("DROPMARK_RECURSIVE") {
            self.recursive = parse_env("DROPMARK_RECURSIVE", &value)?;
        }
        if let Some(value) = get("DROPMARK_POLL_INTERVAL_MS") {
            self.stability.poll_interval_ms = parse_env("DROPMARK_POLL_INTERVAL_MS", &value)?;
        }
        if let Some(value) = get("DROPMARK_STABLE_SAMPLES") {
            self.stability.stable_samples = parse_env("DROPMARK_STABLE_SAMPLES", &value)?;
        }
        if let Some(value) = get("DROPMARK_QUIET_PERIOD_MS") {
            self.stability.quiet_period_ms = parse_env("DROPMARK_QUIET_PERIOD_MS", &value)?;
        }
        if let Some(value) = get("DROPMARK_STALL_TIMEOUT_SECS") {
            self.stability.stall_timeout_secs = parse_env("DROPMARK_STALL_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = get("DROPMARK_WORKERS") {
            self.engine.workers = parse_env("DROPMARK_WORKERS", &value)?;
        }
        if let Some(value) = get("DROPMARK_RESCAN_INTERVAL_SECS") {
            self.engine.rescan_interval_secs =
                parse_env("DROPMARK_RESCAN_INTERVAL_SECS", &value)?;
        }
        if let Some(value) = get("DROPMARK_MAX_RETRIES") {
            self.transform.max_retries = parse_env("DROPMARK_MAX_RETRIES", &value)?;
        }
        if let Some(value) = get("DROPMARK_RETRY_DELAY_MS") {
            self.transform.retry_delay_ms = parse_env("DROPMARK_RETRY_DELAY_MS", &value)?;
        }
        if let Some(program) = get("DROPMARK_TRANSFORM_PROGRAM") {
            self.transform.program = program;
        }
        Ok(())
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.stability.stable_samples == 0 {
            return Err(DropmarkError::Config(
                "stability.stable_samples must be at least 1".to_string(),
            ));
        }
        if self.stability.poll_interval_ms == 0 {
            return Err(DropmarkError::Config(
                "stability.poll_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.engine.workers == 0 {
            return Err(DropmarkError::Config(
                "engine.workers must be at least 1".to_string(),
            ));
        }
        if self.engine.heartbeat_interval_secs == 0
            || self.engine.heartbeat_interval_secs >= self.engine.heartbeat_grace_secs
        {
            return Err(DropmarkError::Config(
                "engine.heartbeat_interval_secs must be non-zero and below heartbeat_grace_secs"
                    .to_string(),
            ));
        }
        if self.naming.extensions.is_empty() {
            return Err(DropmarkError::Config(
                "naming.extensions must list at least one extension".to_string(),
            ));
        }
        if self.transform.program.trim().is_empty() {
            return Err(DropmarkError::Config(
                "transform.program must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Render the effective configuration as YAML
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml_ng::to_string(self)?)
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| DropmarkError::Config(format!("invalid value '{value}' for {name}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.stability.poll_interval(), Duration::from_secs(2));
        assert_eq!(config.stability.stable_samples, 3);
        assert_eq!(config.stability.stall_timeout(), Duration::from_secs(1800));
        assert_eq!(config.engine.workers, 1);
        assert_eq!(config.transform.max_retries, 2);
        assert_eq!(config.naming.output_prefix, "wr");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_missing_file_returns_defaults() {
        let temp = TempDir::new().unwrap();
        let config = Config::load_from(&temp.path().join("config.yaml")).unwrap();
        assert_eq!(config.drop_dir, PathBuf::from("drop"));
    }

    #[test]
    fn test_partial_yaml_keeps_other_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.yaml");
        fs::write(
            &path,
            r#"
drop_dir: /data/incoming
stability:
  stable_samples: 5
transform:
  program: /opt/sorawm/bin/remove
  args: ["-i", "{input}", "-o", "{output}"]
"#,
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.drop_dir, PathBuf::from("/data/incoming"));
        assert_eq!(config.stability.stable_samples, 5);
        assert_eq!(config.stability.poll_interval_ms, 2000);
        assert_eq!(config.transform.program, "/opt/sorawm/bin/remove");
        assert_eq!(config.transform.max_retries, 2);
        assert_eq!(config.transform.transient_exit_codes, vec![75]);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config
            .apply_env_overrides(|name| match name {
                "DROPMARK_DROP_DIR" => Some("/in".to_string()),
                "DROPMARK_WORKERS" => Some("3".to_string()),
                "DROPMARK_POLL_INTERVAL_MS" => Some(" 250 ".to_string()),
                "DROPMARK_OUTPUT_DIR" => Some("".to_string()),
                _ => None,
            })
            .unwrap();

        assert_eq!(config.drop_dir, PathBuf::from("/in"));
        assert_eq!(config.engine.workers, 3);
        assert_eq!(config.stability.poll_interval_ms, 250);
        // Empty values are ignored
        assert_eq!(config.output_dir, PathBuf::from("output"));
    }

    #[test]
    fn test_env_override_rejects_garbage() {
        let mut config = Config::default();
        let err = config
            .apply_env_overrides(|name| {
                (name == "DROPMARK_STABLE_SAMPLES").then(|| "many".to_string())
            })
            .unwrap_err();
        assert!(err.to_string().contains("DROPMARK_STABLE_SAMPLES"));
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let mut config = Config::default();
        config.engine.workers = 0;
        assert!(matches!(config.validate(), Err(DropmarkError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_heartbeat_above_grace() {
        let mut config = Config::default();
        config.engine.heartbeat_interval_secs = 120;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_yaml_roundtrip_skips_default_hooks() {
        let yaml = Config::default().to_yaml().unwrap();
        assert!(!yaml.contains("hooks"));
        assert!(yaml.contains("drop_dir"));
    }
}

#![allow(dead_code)]

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Output, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dropmark::config::NamingConfig;
use dropmark::engine::{EngineSettings, IngestEngine};
use dropmark::ledger::{Owner, ProcessedLedger};
use dropmark::naming::NamePattern;
use dropmark::probe::ProbeSettings;
use dropmark::shutdown::{ShutdownTrigger, shutdown_channel};
use dropmark::transform::{RetryPolicy, Transform, TransformClient, TransformError};
use parking_lot::Mutex;
use tempfile::TempDir;

/// One scripted transform attempt.
#[derive(Debug, Clone)]
pub enum Step {
    Succeed,
    Transient(&'static str),
    Permanent(&'static str),
}

/// In-memory transform: copies the source on success and follows a script
/// of per-attempt results. Attempts past the end of the script succeed.
pub struct ScriptedTransform {
    script: Mutex<VecDeque<Step>>,
    calls: AtomicU32,
    delay: Duration,
}

impl ScriptedTransform {
    pub fn succeeding() -> Self {
        Self::scripted(Vec::new())
    }

    pub fn scripted(steps: Vec<Step>) -> Self {
        Self {
            script: Mutex::new(steps.into()),
            calls: AtomicU32::new(0),
            delay: Duration::ZERO,
        }
    }

    /// Make every attempt take `delay` before it resolves.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transform for ScriptedTransform {
    async fn run(&self, source: &Path, destination: &Path) -> Result<(), TransformError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let step = self.script.lock().pop_front().unwrap_or(Step::Succeed);
        match step {
            Step::Succeed => {
                let bytes = fs::read(source).map_err(|e| TransformError::Permanent(e.to_string()))?;
                let mut cleaned = b"cleaned:".to_vec();
                cleaned.extend_from_slice(&bytes);
                fs::write(destination, cleaned)
                    .map_err(|e| TransformError::Transient(e.to_string()))
            }
            Step::Transient(detail) => Err(TransformError::Transient(detail.to_string())),
            Step::Permanent(detail) => Err(TransformError::Permanent(detail.to_string())),
        }
    }
}

/// Fast settings suitable for tests.
pub fn fast_settings(root: &Path) -> EngineSettings {
    EngineSettings {
        probe: ProbeSettings {
            poll_interval: Duration::from_millis(20),
            stable_samples: 2,
            quiet_period: Duration::ZERO,
        },
        stall_timeout: Duration::from_secs(10),
        workers: 2,
        heartbeat_interval: Duration::from_millis(200),
        shutdown_grace: Duration::from_secs(2),
        output_dir: root.join("output"),
        staging_dir: root.join("state").join("staging"),
    }
}

/// Engine over a scratch drop/output/state layout.
pub struct EngineHarness {
    pub temp_dir: TempDir,
    pub transform: Arc<ScriptedTransform>,
    pub trigger: ShutdownTrigger,
    pub engine: IngestEngine,
}

impl EngineHarness {
    pub fn new(transform: ScriptedTransform) -> Self {
        Self::with_settings(transform, |_| {})
    }

    pub fn with_settings(
        transform: ScriptedTransform,
        adjust: impl FnOnce(&mut EngineSettings),
    ) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        fs::create_dir_all(temp_dir.path().join("drop")).expect("Failed to create drop dir");
        fs::create_dir_all(temp_dir.path().join("output")).expect("Failed to create output dir");

        let mut settings = fast_settings(temp_dir.path());
        adjust(&mut settings);
        let transform = Arc::new(transform);
        let (trigger, engine) = build_engine(
            temp_dir.path(),
            settings,
            Arc::clone(&transform),
            Owner::new(std::process::id(), "harness"),
        );
        Self {
            temp_dir,
            transform,
            trigger,
            engine,
        }
    }

    pub fn drop_dir(&self) -> PathBuf {
        self.temp_dir.path().join("drop")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.temp_dir.path().join("output")
    }

    pub fn ledger_path(&self) -> PathBuf {
        ledger_path(self.temp_dir.path())
    }

    pub fn ledger(&self) -> &Arc<ProcessedLedger> {
        self.engine.ledger()
    }

    /// Write a settled file into the drop directory.
    pub fn drop_file(&self, name: &str, content: &[u8]) -> PathBuf {
        let path = self.drop_dir().join(name);
        fs::write(&path, content).expect("Failed to write drop file");
        path
    }

    /// A second engine sharing this harness's directories and ledger file,
    /// as a restarted process would.
    pub fn restarted(
        &self,
        transform: Arc<ScriptedTransform>,
        owner: Owner,
    ) -> (ShutdownTrigger, IngestEngine) {
        build_engine(self.temp_dir.path(), fast_settings(self.temp_dir.path()), transform, owner)
    }
}

pub fn ledger_path(root: &Path) -> PathBuf {
    root.join("state").join("ledger.ndjson")
}

fn build_engine(
    root: &Path,
    settings: EngineSettings,
    transform: Arc<ScriptedTransform>,
    owner: Owner,
) -> (ShutdownTrigger, IngestEngine) {
    let ledger = ProcessedLedger::open(ledger_path(root), Duration::from_secs(60))
        .expect("Failed to open ledger");
    let client = TransformClient::new(
        transform,
        RetryPolicy {
            max_retries: 2,
            delay: Duration::from_millis(10),
        },
    );
    let (trigger, signal) = shutdown_channel();
    let engine = IngestEngine::new(
        settings,
        NamePattern::new(&NamingConfig::default()).expect("default pattern"),
        Arc::new(ledger),
        client,
        owner,
        signal,
    );
    (trigger, engine)
}

/// Helper to run the dropmark binary in an isolated temp directory
pub struct DropmarkTest {
    pub temp_dir: TempDir,
}

impl DropmarkTest {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        DropmarkTest { temp_dir }
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut command = Command::new(env!("CARGO_BIN_EXE_dropmark"));
        command
            .args(args)
            .current_dir(self.temp_dir.path())
            .env_remove("DROPMARK_ROOT")
            .env_remove("DROPMARK_DROP_DIR")
            .env_remove("DROPMARK_OUTPUT_DIR")
            .env_remove("DROPMARK_TRANSFORM_PROGRAM")
            .env("NO_COLOR", "1");
        command
    }

    pub fn run(&self, args: &[&str]) -> Output {
        self.command(args)
            .output()
            .expect("Failed to execute dropmark command")
    }

    /// Start dropmark in the background with captured output.
    pub fn spawn(&self, args: &[&str]) -> Child {
        self.command(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .expect("Failed to spawn dropmark command")
    }

    pub fn run_success(&self, args: &[&str]) -> String {
        let output = self.run(args);
        if !output.status.success() {
            panic!(
                "Command {:?} failed with status {:?}\nstdout: {}\nstderr: {}",
                args,
                output.status,
                String::from_utf8_lossy(&output.stdout),
                String::from_utf8_lossy(&output.stderr)
            );
        }
        String::from_utf8_lossy(&output.stdout).to_string()
    }

    pub fn run_failure(&self, args: &[&str]) -> String {
        let output = self.run(args);
        assert!(
            !output.status.success(),
            "Expected command {:?} to fail, but it succeeded",
            args
        );
        String::from_utf8_lossy(&output.stderr).to_string()
    }

    pub fn path(&self, relative: &str) -> PathBuf {
        self.temp_dir.path().join(relative)
    }

    pub fn write_config(&self, content: &str) {
        let dir = self.temp_dir.path().join(".dropmark");
        fs::create_dir_all(&dir).expect("Failed to create .dropmark directory");
        fs::write(dir.join("config.yaml"), content).expect("Failed to write config file");
    }

    /// Config with fast stability settings and `cp` as the transform.
    pub fn write_fast_config(&self) {
        self.write_config(
            r#"
drop_dir: drop
output_dir: output
stability:
  poll_interval_ms: 20
  stable_samples: 2
  quiet_period_ms: 0
transform:
  program: cp
  args: ["{input}", "{output}"]
  max_retries: 0
"#,
        );
    }

    pub fn drop_file(&self, name: &str, content: &[u8]) -> PathBuf {
        let dir = self.path("drop");
        fs::create_dir_all(&dir).expect("Failed to create drop directory");
        let path = dir.join(name);
        fs::write(&path, content).expect("Failed to write drop file");
        path
    }

    pub fn status_json(&self) -> serde_json::Value {
        let stdout = self.run_success(&["status", "--json"]);
        serde_json::from_str(&stdout).expect("status --json should print JSON")
    }
}

//! Transform implemented by running an external program.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command as TokioCommand;
use tokio::time::timeout;

use super::{Transform, TransformError};
use crate::config::TransformConfig;

/// Only the tail of stderr is kept for error details.
const STDERR_TAIL_BYTES: usize = 4096;

/// Runs `program args...` with `{input}` and `{output}` substituted.
#[derive(Debug, Clone)]
pub struct CommandTransform {
    program: String,
    args: Vec<String>,
    timeout: Option<Duration>,
    transient_exit_codes: Vec<i32>,
    transient_patterns: Vec<String>,
}

impl CommandTransform {
    pub fn from_config(config: &TransformConfig) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
            timeout: (config.timeout_secs > 0).then(|| Duration::from_secs(config.timeout_secs)),
            transient_exit_codes: config.transient_exit_codes.clone(),
            transient_patterns: config
                .transient_patterns
                .iter()
                .map(|p| p.to_lowercase())
                .collect(),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    fn build_args(&self, source: &Path, destination: &Path) -> Vec<OsString> {
        let input = source.to_string_lossy();
        let output = destination.to_string_lossy();
        self.args
            .iter()
            .map(|arg| {
                OsString::from(
                    arg.replace("{input}", &input)
                        .replace("{output}", &output),
                )
            })
            .collect()
    }

    fn classify_exit(&self, code: Option<i32>, stderr: &str) -> TransformError {
        let detail = match code {
            Some(code) => format!("{} exited with status {code}", self.program),
            None => format!("{} was terminated by a signal", self.program),
        };
        let detail = match stderr.trim() {
            "" => detail,
            tail => format!("{detail}: {tail}"),
        };

        let lowered = stderr.to_lowercase();
        let transient = match code {
            Some(code) => self.transient_exit_codes.contains(&code),
            // Killed from outside, typically the OOM killer
            None => true,
        } || self
            .transient_patterns
            .iter()
            .any(|pattern| !pattern.is_empty() && lowered.contains(pattern.as_str()));

        if transient {
            TransformError::Transient(detail)
        } else {
            TransformError::Permanent(detail)
        }
    }
}

#[async_trait]
impl Transform for CommandTransform {
    async fn run(&self, source: &Path, destination: &Path) -> Result<(), TransformError> {
        if !source.is_file() {
            return Err(TransformError::Permanent(format!(
                "source file is missing: {}",
                source.display()
            )));
        }

        let mut cmd = TokioCommand::new(&self.program);
        cmd.args(self.build_args(source, destination))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                TransformError::Permanent(format!("transform program not found: {}", self.program))
            }
            std::io::ErrorKind::PermissionDenied => TransformError::Permanent(format!(
                "transform program is not executable: {}",
                self.program
            )),
            _ => TransformError::Transient(format!("failed to start {}: {e}", self.program)),
        })?;

        // Drain stderr concurrently so a chatty child cannot block on a full pipe
        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(read_tail(stderr, STDERR_TAIL_BYTES)));

        let status = match self.timeout {
            None => child.wait().await,
            Some(limit) => match timeout(limit, child.wait()).await {
                Ok(status) => status,
                Err(_) => {
                    if let Err(e) = child.kill().await {
                        tracing::error!("failed to kill timed-out transform: {}", e);
                    }
                    return Err(TransformError::Permanent(format!(
                        "{} timed out after {} seconds",
                        self.program,
                        limit.as_secs()
                    )));
                }
            },
        }
        .map_err(|e| {
            TransformError::Transient(format!("failed to wait for {}: {e}", self.program))
        })?;

        let stderr = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        if !status.success() {
            return Err(self.classify_exit(status.code(), &stderr));
        }
        if !destination.is_file() {
            return Err(TransformError::Permanent(format!(
                "{} succeeded but wrote no output to {}",
                self.program,
                destination.display()
            )));
        }
        Ok(())
    }
}

/// Read `reader` to the end, keeping only its last `limit` bytes.
async fn read_tail<R: AsyncRead + Unpin>(mut reader: R, limit: usize) -> String {
    let mut tail = Vec::with_capacity(limit);
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                tail.extend_from_slice(&chunk[..n]);
                if tail.len() > limit {
                    tail.drain(..tail.len() - limit);
                }
            }
            Err(e) => {
                tracing::warn!("failed to read transform stderr: {}", e);
                break;
            }
        }
    }
    String::from_utf8_lossy(&tail).into_owned()
}

/// Resolve `program` the way process spawning will: paths are checked
/// directly, bare names are looked up on `PATH`.
pub fn find_program(program: &str) -> Option<PathBuf> {
    let candidate = Path::new(program);
    if candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(program))
        .find(|path| path.is_file())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn shell(script: &str) -> CommandTransform {
        CommandTransform::from_config(&TransformConfig {
            program: "sh".to_string(),
            args: vec![
                "-c".to_string(),
                script.to_string(),
                "sh".to_string(),
                "{input}".to_string(),
                "{output}".to_string(),
            ],
            ..TransformConfig::default()
        })
    }

    fn input(temp: &TempDir) -> PathBuf {
        let path = temp.path().join("20251104_1209_abc.mp4");
        std::fs::write(&path, b"raw").unwrap();
        path
    }

    #[tokio::test]
    async fn test_read_tail_keeps_last_bytes_only() {
        let mut noise = vec![b'x'; 20_000];
        noise.extend_from_slice(b"final error line");

        let tail = read_tail(noise.as_slice(), 64).await;

        assert_eq!(tail.len(), 64);
        assert!(tail.ends_with("final error line"));
        assert_eq!(read_tail(&b"short"[..], 64).await, "short");
    }

    #[test]
    fn test_placeholders_are_substituted() {
        let transform = CommandTransform::from_config(&TransformConfig {
            args: vec!["--in={input}".into(), "{output}".into(), "-q".into()],
            ..TransformConfig::default()
        });
        let args = transform.build_args(Path::new("/d/a.mp4"), Path::new("/s/wr_a.mp4"));
        assert_eq!(
            args,
            vec![
                OsString::from("--in=/d/a.mp4"),
                OsString::from("/s/wr_a.mp4"),
                OsString::from("-q")
            ]
        );
    }

    #[tokio::test]
    async fn test_success_writes_output() {
        let temp = TempDir::new().unwrap();
        let destination = temp.path().join("wr.mp4");
        shell(r#"cp "$1" "$2""#)
            .run(&input(&temp), &destination)
            .await
            .unwrap();
        assert_eq!(std::fs::read(&destination).unwrap(), b"raw");
    }

    #[tokio::test]
    async fn test_success_without_output_is_permanent() {
        let temp = TempDir::new().unwrap();
        let err = shell("exit 0")
            .run(&input(&temp), &temp.path().join("wr.mp4"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransformError::Permanent(_)));
        assert!(err.to_string().contains("wrote no output"));
    }

    #[tokio::test]
    async fn test_tempfail_exit_code_is_transient() {
        let temp = TempDir::new().unwrap();
        let err = shell("exit 75")
            .run(&input(&temp), &temp.path().join("wr.mp4"))
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_stderr_pattern_is_transient() {
        let temp = TempDir::new().unwrap();
        let err = shell("echo 'CUDA error: Out Of Memory' >&2; exit 1")
            .run(&input(&temp), &temp.path().join("wr.mp4"))
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert!(err.to_string().contains("Out Of Memory"));
    }

    #[tokio::test]
    async fn test_other_exit_is_permanent() {
        let temp = TempDir::new().unwrap();
        let err = shell("echo 'invalid data found' >&2; exit 1")
            .run(&input(&temp), &temp.path().join("wr.mp4"))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            TransformError::Permanent("sh exited with status 1: invalid data found".to_string())
        );
    }

    #[tokio::test]
    async fn test_missing_program_is_permanent() {
        let temp = TempDir::new().unwrap();
        let transform = CommandTransform::from_config(&TransformConfig {
            program: "/nonexistent/dropmark-transform".to_string(),
            ..TransformConfig::default()
        });
        let err = transform
            .run(&input(&temp), &temp.path().join("wr.mp4"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransformError::Permanent(_)));
    }

    #[tokio::test]
    async fn test_missing_source_is_permanent() {
        let temp = TempDir::new().unwrap();
        let err = shell(r#"cp "$1" "$2""#)
            .run(&temp.path().join("gone.mp4"), &temp.path().join("wr.mp4"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransformError::Permanent(_)));
    }

    #[tokio::test]
    async fn test_timeout_kills_child() {
        let temp = TempDir::new().unwrap();
        let mut transform = shell("sleep 30");
        transform.timeout = Some(Duration::from_millis(100));

        let started = std::time::Instant::now();
        let err = transform
            .run(&input(&temp), &temp.path().join("wr.mp4"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_find_program() {
        assert!(find_program("sh").is_some());
        assert!(find_program("dropmark-definitely-not-installed").is_none());
        assert!(find_program("/nonexistent/tool").is_none());
    }
}

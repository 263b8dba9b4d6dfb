//! Doctor command
//!
//! Checks the environment a watcher or batch run depends on: directories,
//! the transform program, the ledger and the instance record.

use jiff::Timestamp;
use owo_colors::OwoColorize;
use serde::Serialize;
use serde_json::json;

use super::{CommandOutput, DirOverrides, load_config};
use crate::config::Config;
use crate::error::Result;
use crate::instance::read_record;
use crate::ledger::{LedgerStatus, ProcessedLedger};
use crate::paths;
use crate::transform::find_program;

#[derive(Debug, Clone, Serialize)]
struct Check {
    name: &'static str,
    ok: bool,
    detail: String,
}

impl Check {
    fn pass(name: &'static str, detail: impl Into<String>) -> Self {
        Self {
            name,
            ok: true,
            detail: detail.into(),
        }
    }

    fn fail(name: &'static str, detail: impl Into<String>) -> Self {
        Self {
            name,
            ok: false,
            detail: detail.into(),
        }
    }
}

fn run_checks(config: &Config) -> Vec<Check> {
    let mut checks = Vec::new();

    checks.push(if config.drop_dir.is_dir() {
        Check::pass("drop directory", config.drop_dir.display().to_string())
    } else {
        Check::fail(
            "drop directory",
            format!("{} does not exist", config.drop_dir.display()),
        )
    });

    checks.push(if config.output_dir.is_dir() {
        Check::pass("output directory", config.output_dir.display().to_string())
    } else {
        Check::fail(
            "output directory",
            format!("{} does not exist", config.output_dir.display()),
        )
    });

    checks.push(match find_program(&config.transform.program) {
        Some(path) => Check::pass("transform program", path.display().to_string()),
        None => Check::fail(
            "transform program",
            format!("'{}' not found on PATH", config.transform.program),
        ),
    });

    let ledger_path = paths::ledger_path();
    checks.push(
        match ProcessedLedger::open(&ledger_path, config.engine.heartbeat_grace())
            .and_then(|ledger| Ok((ledger.entries()?, ledger.list_stale()?.len())))
        {
            Ok((entries, stale)) => {
                let count = |status| entries.iter().filter(|e| e.status == status).count();
                Check::pass(
                    "ledger",
                    format!(
                        "{} entries ({} done, {} failed, {} in progress, {} stale)",
                        entries.len(),
                        count(LedgerStatus::Done),
                        count(LedgerStatus::Failed),
                        count(LedgerStatus::InProgress),
                        stale
                    ),
                )
            }
            Err(e) => Check::fail("ledger", e.to_string()),
        },
    );

    checks.push(match read_record(&paths::instance_path()) {
        Ok(None) => Check::pass("instance", "no watcher running"),
        Ok(Some(record)) if record.is_live(config.engine.heartbeat_grace(), Timestamp::now()) => {
            Check::pass(
                "instance",
                format!("watcher running as pid {} ({})", record.pid, record.instance_id),
            )
        }
        Ok(Some(record)) => Check::pass(
            "instance",
            format!(
                "stale record from pid {} (last heartbeat {}), will be taken over",
                record.pid, record.heartbeat_at
            ),
        ),
        Err(e) => Check::fail("instance", e.to_string()),
    });

    checks
}

/// Run every check and print the results.
///
/// Returns whether all checks passed; callers exit non-zero otherwise.
pub fn cmd_doctor(output_json: bool) -> Result<bool> {
    let config = load_config(&DirOverrides::default())?;
    let checks = run_checks(&config);
    let healthy = checks.iter().all(|c| c.ok);

    let mut text = format!(
        "\n{}\n{}\n\n",
        "Doctor - Environment Check".bold(),
        "==========================".bold()
    );
    text.push_str(&format!(
        "state root: {}\n\n",
        paths::state_root().display().to_string().dimmed()
    ));
    for check in &checks {
        if check.ok {
            text.push_str(&format!("  {} {}: {}\n", "✓".green(), check.name, check.detail));
        } else {
            text.push_str(&format!(
                "  {} {}: {}\n",
                "✗".red(),
                check.name,
                check.detail.red()
            ));
        }
    }
    if healthy {
        text.push_str(&format!("\n{} All checks passed", "✓".green()));
    }

    CommandOutput::new(json!({
        "healthy": healthy,
        "checks": checks,
    }))
    .with_text(text)
    .print(output_json)?;

    Ok(healthy)
}

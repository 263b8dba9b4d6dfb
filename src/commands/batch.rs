//! `dropmark batch`: process everything already sitting in a directory.

use std::path::PathBuf;

use owo_colors::{OwoColorize, Stream};
use serde_json::json;
use tabled::settings::Style;
use tabled::{Table, Tabled};
use tracing::{info, warn};

use super::interactive::confirm;
use super::{
    CommandOutput, DirOverrides, build_engine, load_config, open_ledger, wait_for_termination,
};
use crate::error::{DropmarkError, Result};
use crate::frontend::scanner::dispatch;
use crate::frontend::{BatchScanner, BatchSummary, Candidate, CandidateState};
use crate::ledger::Owner;
use crate::naming::NamePattern;
use crate::shutdown::shutdown_channel;

#[derive(Debug, Default, Clone)]
pub struct BatchOptions {
    pub input_dir: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    /// Skip the confirmation prompt
    pub yes: bool,
    /// Reset Failed entries for the found files before dispatching
    pub retry_failed: bool,
    pub output_json: bool,
}

#[derive(Tabled)]
struct CandidateRow {
    #[tabled(rename = "File")]
    file: String,
    #[tabled(rename = "Key")]
    key: String,
    #[tabled(rename = "State")]
    state: String,
    #[tabled(rename = "Output")]
    output: String,
}

impl From<&Candidate> for CandidateRow {
    fn from(candidate: &Candidate) -> Self {
        let state = match candidate.state {
            CandidateState::New => "new".green().to_string(),
            CandidateState::Failed => match &candidate.last_error {
                Some(error) => format!("{} ({error})", "failed".red()),
                None => "failed".red().to_string(),
            },
            CandidateState::Stale => "stale".magenta().to_string(),
            CandidateState::InProgressElsewhere => "in progress elsewhere".cyan().to_string(),
            other => other.to_string().yellow().to_string(),
        };
        Self {
            file: candidate
                .path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            key: candidate.logical_key.clone(),
            state,
            output: candidate.output_name.clone(),
        }
    }
}

/// Enumerate, confirm, dispatch sequentially and report.
///
/// Returns the summary; callers exit non-zero when it has failures.
pub async fn cmd_batch(options: BatchOptions) -> Result<BatchSummary> {
    let config = load_config(&DirOverrides {
        drop_dir: options.input_dir.clone(),
        output_dir: options.output_dir.clone(),
    })?;
    if !config.drop_dir.is_dir() {
        return Err(DropmarkError::DropDirMissing(config.drop_dir.clone()));
    }

    let ledger = open_ledger(&config)?;
    let scanner = BatchScanner::new(
        &config.drop_dir,
        config.recursive,
        NamePattern::new(&config.naming)?,
        ledger.clone(),
    );

    let mut candidates = scanner.scan()?;
    if options.retry_failed {
        let mut reset = 0;
        for candidate in candidates.iter().filter(|c| c.state == CandidateState::Failed) {
            ledger.reset(&candidate.logical_key)?;
            reset += 1;
        }
        if reset > 0 {
            info!(reset, "failed entries reset for retry");
            candidates = scanner.scan()?;
        }
    }

    let done = candidates
        .iter()
        .filter(|c| c.state == CandidateState::Done)
        .count();
    let pending: Vec<Candidate> = candidates
        .into_iter()
        .filter(|c| c.state != CandidateState::Done)
        .collect();

    if pending.is_empty() {
        CommandOutput::new(json!({ "already_done": done, "processed": 0 }))
            .with_text(format!(
                "Nothing to process in {} ({} already done)",
                config.drop_dir.display(),
                done
            ))
            .print(options.output_json)?;
        return Ok(BatchSummary::default());
    }

    if !options.output_json {
        let mut table = Table::new(pending.iter().map(CandidateRow::from));
        table.with(Style::rounded());
        println!("{table}");
        if done > 0 {
            println!("{} already done, skipped", done.to_string().dimmed());
        }
    }

    let actionable = pending.iter().filter(|c| c.state.is_actionable()).count();
    if !options.yes && !confirm(&format!("Process {} file(s)", pending.len()))? {
        CommandOutput::new(json!({ "aborted": true, "processed": 0 }))
            .with_text("Aborted.")
            .print(options.output_json)?;
        return Ok(BatchSummary::default());
    }

    crate::fs::ensure_dir(&config.output_dir)?;
    let (trigger, signal) = shutdown_channel();
    let engine = build_engine(&config, ledger, Owner::current(), signal.clone())?;

    let interrupt = tokio::spawn(async move {
        wait_for_termination().await;
        warn!("interrupt received, finishing the current item");
        trigger.trigger();
    });
    info!(candidates = pending.len(), actionable, "starting batch");
    let summary = dispatch(&engine, pending, signal, config.engine.shutdown_grace()).await;
    interrupt.abort();

    print_summary(&summary, options.output_json)?;
    Ok(summary)
}

fn print_summary(summary: &BatchSummary, output_json: bool) -> Result<()> {
    let failed = summary.failed.len();
    let mut text = format!(
        "\n{} processed, {} recovered, {} skipped, {} failed",
        summary
            .processed
            .len()
            .if_supports_color(Stream::Stdout, |n| n.green()),
        summary.recovered.len(),
        summary.skipped.len(),
        failed.if_supports_color(Stream::Stdout, |n| {
            if failed == 0 { n.to_string() } else { n.red().to_string() }
        }),
    );
    for (path, error) in &summary.failed {
        text.push_str(&format!(
            "\n  {} {}: {}",
            "✗".if_supports_color(Stream::Stdout, |t| t.red()),
            path.display(),
            error.if_supports_color(Stream::Stdout, |t| t.dimmed())
        ));
    }
    if summary.interrupted {
        text.push_str(&format!(
            "\n{}",
            "Interrupted before all files were processed"
                .if_supports_color(Stream::Stdout, |t| t.yellow())
        ));
    }

    CommandOutput::new(serde_json::to_value(summary)?)
        .with_text(text)
        .print(output_json)
}

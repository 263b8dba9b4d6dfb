//! `dropmark status`: list ledger entries.

use jiff::Timestamp;
use owo_colors::OwoColorize;
use tabled::settings::Style;
use tabled::{Table, Tabled};

use super::{CommandOutput, DirOverrides, colored_status, load_config, open_ledger};
use crate::error::Result;
use crate::ledger::{LedgerEntry, LedgerStatus, ProcessedLedger};

#[derive(Tabled)]
struct EntryRow {
    #[tabled(rename = "Key")]
    key: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Attempts")]
    attempts: u32,
    #[tabled(rename = "Source")]
    source: String,
    #[tabled(rename = "Output")]
    output: String,
    #[tabled(rename = "Updated")]
    updated: String,
    #[tabled(rename = "Error")]
    error: String,
}

fn row(ledger: &ProcessedLedger, entry: &LedgerEntry, now: Timestamp) -> EntryRow {
    EntryRow {
        key: entry.logical_key.clone(),
        status: colored_status(entry.status, ledger.is_stale(entry, now)),
        attempts: entry.attempts,
        source: entry.source_path.display().to_string(),
        output: entry
            .output_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "-".to_string()),
        updated: entry.updated_at.strftime("%Y-%m-%d %H:%M:%S").to_string(),
        error: entry.last_error.clone().unwrap_or_default(),
    }
}

/// Print ledger entries, optionally restricted to one status.
pub fn cmd_status(filter: Option<LedgerStatus>, output_json: bool) -> Result<()> {
    let config = load_config(&DirOverrides::default())?;
    let ledger = open_ledger(&config)?;
    let entries = match filter {
        Some(status) => ledger.list_by_status(status)?,
        None => ledger.entries()?,
    };

    let text = if entries.is_empty() {
        match filter {
            Some(status) => format!("No {status} entries"),
            None => "Ledger is empty".to_string(),
        }
    } else {
        let now = Timestamp::now();
        let mut table = Table::new(entries.iter().map(|e| row(&ledger, e, now)));
        table.with(Style::rounded());
        let counts: Vec<String> = LedgerStatus::ALL
            .iter()
            .map(|status| {
                let count = entries.iter().filter(|e| e.status == *status).count();
                format!("{status}: {count}")
            })
            .collect();
        format!("{table}\n{}", counts.join("  ").dimmed())
    };

    CommandOutput::new(serde_json::to_value(&entries)?)
        .with_text(text)
        .print(output_json)
}

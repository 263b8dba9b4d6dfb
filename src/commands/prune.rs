//! `dropmark prune`: drop old terminal ledger entries.

use std::time::Duration;

use serde_json::json;

use super::{CommandOutput, DirOverrides, load_config, open_ledger};
use crate::error::Result;

const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

pub fn cmd_prune(older_than_days: u64, output_json: bool) -> Result<()> {
    let config = load_config(&DirOverrides::default())?;
    let ledger = open_ledger(&config)?;

    let horizon = Duration::from_secs(older_than_days.saturating_mul(SECONDS_PER_DAY));
    let removed = ledger.prune(horizon)?;

    CommandOutput::new(json!({
        "removed": removed,
        "older_than_days": older_than_days,
    }))
    .with_text(format!(
        "Pruned {removed} done/failed entr{} older than {older_than_days} day(s)",
        if removed == 1 { "y" } else { "ies" }
    ))
    .print(output_json)
}

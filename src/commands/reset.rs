//! `dropmark reset`: move Failed entries back to Pending.

use owo_colors::OwoColorize;

use super::{DirOverrides, load_config, open_ledger};
use crate::error::{DropmarkError, Result};
use crate::ledger::LedgerStatus;

/// Reset the given keys, or every Failed key when `all_failed` is set.
///
/// Each key is attempted; the command fails if any of them could not be
/// reset.
pub fn cmd_reset(keys: &[String], all_failed: bool) -> Result<()> {
    let config = load_config(&DirOverrides::default())?;
    let ledger = open_ledger(&config)?;

    let targets: Vec<String> = if all_failed {
        ledger
            .list_by_status(LedgerStatus::Failed)?
            .into_iter()
            .map(|entry| entry.logical_key)
            .collect()
    } else {
        keys.to_vec()
    };

    if targets.is_empty() {
        println!("Nothing to reset");
        return Ok(());
    }

    let mut failures = 0;
    for key in &targets {
        match ledger.reset(key) {
            Ok(_) => println!("{} {} -> {}", "✓".green(), key.cyan(), "pending".yellow()),
            Err(e) => {
                failures += 1;
                eprintln!("{} {}: {}", "✗".red(), key.cyan(), e);
            }
        }
    }
    println!(
        "{} entr{} reset; they are retried when their files are next seen",
        targets.len() - failures,
        if targets.len() - failures == 1 { "y" } else { "ies" }
    );

    if failures > 0 {
        return Err(DropmarkError::Other(format!(
            "{failures} of {} key(s) could not be reset",
            targets.len()
        )));
    }
    Ok(())
}

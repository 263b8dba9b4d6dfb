//! `dropmark config show`: print the effective configuration.

use owo_colors::OwoColorize;

use super::{CommandOutput, DirOverrides, load_config};
use crate::error::Result;
use crate::paths::config_path;

/// Show configuration after file, environment and flag overrides.
pub fn cmd_config_show(output_json: bool) -> Result<()> {
    let config = load_config(&DirOverrides::default())?;
    let path = config_path();
    let source = if path.exists() {
        path.display().to_string()
    } else {
        format!("{} (not present, using defaults)", path.display())
    };

    let text = format!(
        "{} {}\n\n{}",
        "Configuration:".cyan().bold(),
        source.dimmed(),
        config.to_yaml()?.trim_end()
    );
    CommandOutput::new(serde_json::to_value(&config)?)
        .with_text(text)
        .print(output_json)
}

//! Input filename recognition and output name derivation.
//!
//! Producers drop captures named `<YYYYMMDD>_<HHMM>_<suffix>.<ext>`. The
//! date and time tokens identify the capture; the suffix is random and is
//! deliberately left out of the logical key so that repeated deliveries of
//! the same capture collapse into a single item.

use std::path::Path;

use regex::Regex;

use crate::config::NamingConfig;
use crate::error::{DropmarkError, Result};

/// The pieces of a recognised input filename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedName {
    pub date_part: String,
    pub time_part: String,
    /// `<date>_<time>`, stable across suffixes
    pub logical_key: String,
    /// Extension as it appeared in the filename
    pub extension: String,
}

/// Compiled filename matcher plus the output naming rule.
#[derive(Debug, Clone)]
pub struct NamePattern {
    regex: Regex,
    extensions: Vec<String>,
    output_prefix: String,
}

impl NamePattern {
    pub fn new(config: &NamingConfig) -> Result<Self> {
        let time = match config.time_digits {
            Some(0) => {
                return Err(DropmarkError::Config(
                    "naming.time_digits must be at least 1".to_string(),
                ));
            }
            Some(width) => format!(r"\d{{{width}}}"),
            None => r"\d+".to_string(),
        };
        let regex = Regex::new(&format!(r"^(\d{{8}})_({time})_(.*)\.([^./\\]+)$"))
            .map_err(|e| DropmarkError::Config(format!("invalid filename pattern: {e}")))?;

        Ok(Self {
            regex,
            extensions: config
                .extensions
                .iter()
                .map(|ext| ext.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
            output_prefix: config.output_prefix.clone(),
        })
    }

    /// Match a bare filename. Returns `None` for anything that does not fit
    /// the expected shape.
    pub fn parse(&self, filename: &str) -> Option<ParsedName> {
        let caps = self.regex.captures(filename)?;
        let extension = caps.get(4)?.as_str();
        if !self
            .extensions
            .iter()
            .any(|accepted| accepted.eq_ignore_ascii_case(extension))
        {
            return None;
        }

        let date_part = caps.get(1)?.as_str().to_string();
        let time_part = caps.get(2)?.as_str().to_string();
        Some(ParsedName {
            logical_key: format!("{date_part}_{time_part}"),
            date_part,
            time_part,
            extension: extension.to_string(),
        })
    }

    /// Match the final component of a path.
    pub fn parse_path(&self, path: &Path) -> Option<ParsedName> {
        path.file_name()
            .and_then(|name| name.to_str())
            .and_then(|name| self.parse(name))
    }

    /// `<prefix>_<date>_<time>.<ext>`, extension lowercased.
    pub fn derive_output_name(&self, parsed: &ParsedName) -> String {
        format!(
            "{}_{}.{}",
            self.output_prefix,
            parsed.logical_key,
            parsed.extension.to_ascii_lowercase()
        )
    }
}

//! Interactive prompts, kept apart from command logic.

use std::io::{self, BufRead, Write};

use crate::error::Result;

/// Ask a yes/no question on stderr and read the answer from stdin.
///
/// Stdout stays reserved for command output such as `--json` documents.
/// Only `y` or `yes` (any case) confirms; end of input declines.
pub fn confirm(prompt: &str) -> Result<bool> {
    let stdin = io::stdin();
    confirm_with(prompt, &mut stdin.lock(), &mut io::stderr())
}

fn confirm_with(prompt: &str, input: &mut impl BufRead, output: &mut impl Write) -> Result<bool> {
    write!(output, "{prompt}? [y/N] ")?;
    output.flush()?;

    let mut line = String::new();
    input.read_line(&mut line)?;

    let answer = line.trim();
    Ok(answer.eq_ignore_ascii_case("y") || answer.eq_ignore_ascii_case("yes"))
}

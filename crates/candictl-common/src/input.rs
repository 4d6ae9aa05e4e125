//! Interactive confirmations

use std::io::{BufRead, IsTerminal, Write};

#[cfg(test)]
use mockall::automock;
use tracing::{info, warn};

/// Asks the operator a yes/no question
#[cfg_attr(test, automock)]
pub trait Prompter: Send + Sync {
    /// Ask `message`. `default_yes` is used when the operator just presses enter.
    fn confirm(&self, message: &str, default_yes: bool) -> bool;
}

/// Reads answers from the controlling terminal.
///
/// When stdin is not a terminal every question is declined.
#[derive(Debug, Default, Clone)]
pub struct TerminalPrompter {
    assume_yes: bool,
}

impl TerminalPrompter {
    /// Create a prompter. `assume_yes` answers every question positively.
    pub fn new(assume_yes: bool) -> Self {
        Self { assume_yes }
    }
}

impl Prompter for TerminalPrompter {
    fn confirm(&self, message: &str, default_yes: bool) -> bool {
        if self.assume_yes {
            info!("{} [auto-confirmed]", message);
            return true;
        }

        let stdin = std::io::stdin();
        if !stdin.is_terminal() {
            warn!("{} [declined: stdin is not a terminal]", message);
            return false;
        }

        let hint = if default_yes { "[Y/n]" } else { "[y/N]" };
        let mut stderr = std::io::stderr();
        let _ = write!(stderr, "{} {}: ", message, hint);
        let _ = stderr.flush();

        let mut line = String::new();
        if stdin.lock().read_line(&mut line).is_err() {
            return false;
        }
        parse_answer(&line, default_yes)
    }
}

/// Answers every question the same way
#[derive(Debug, Clone, Copy)]
pub struct StaticPrompter(pub bool);

impl Prompter for StaticPrompter {
    fn confirm(&self, message: &str, _default_yes: bool) -> bool {
        info!("{} [{}]", message, if self.0 { "yes" } else { "no" });
        self.0
    }
}

fn parse_answer(line: &str, default_yes: bool) -> bool {
    match line.trim().to_lowercase().as_str() {
        "" => default_yes,
        "y" | "yes" => true,
        _ => false,
    }
}

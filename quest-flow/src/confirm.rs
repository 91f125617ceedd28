//! Operator confirmation for mutating operations.
//!
//! Stages never read stdin themselves; they ask a [`Confirm`] implementation.
//! Low-risk prompts accept an empty answer as yes. Destructive prompts (remote
//! delete, local clear, overwrite) need an explicit answer.

use std::io::{BufRead, Write};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Risk {
    Low,
    Destructive,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmRequest {
    pub message: String,
    pub risk: Risk,
}

impl ConfirmRequest {
    pub fn low(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            risk: Risk::Low,
        }
    }

    pub fn destructive(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            risk: Risk::Destructive,
        }
    }
}

/// Decides whether a mutating operation may go ahead
pub trait Confirm: Send + Sync {
    fn confirm(&self, request: &ConfirmRequest) -> bool;
}

/// Approves everything (`--yes`)
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoApprove;

impl Confirm for AutoApprove {
    fn confirm(&self, _request: &ConfirmRequest) -> bool {
        true
    }
}

/// Interpret one line of operator input. `None` means ask again.
pub fn parse_answer(input: &str, risk: Risk) -> Option<bool> {
    match input.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" => Some(true),
        "n" | "no" => Some(false),
        "" if risk == Risk::Low => Some(true),
        _ => None,
    }
}

/// Prompts on stdout and reads answers from stdin
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsoleConfirm;

impl ConsoleConfirm {
    fn ask<R: BufRead, W: Write>(request: &ConfirmRequest, input: &mut R, output: &mut W) -> bool {
        let hint = match request.risk {
            Risk::Low => "[Y/n]",
            Risk::Destructive => "[y/n]",
        };

        loop {
            let _ = write!(output, "{} {} ", request.message, hint);
            let _ = output.flush();

            let mut line = String::new();
            match input.read_line(&mut line) {
                // closed input never approves
                Ok(0) | Err(_) => return false,
                Ok(_) => {}
            }

            match parse_answer(&line, request.risk) {
                Some(answer) => return answer,
                None => {
                    let _ = writeln!(output, "Please answer 'y' or 'n'.");
                }
            }
        }
    }
}

impl Confirm for ConsoleConfirm {
    fn confirm(&self, request: &ConfirmRequest) -> bool {
        let stdin = std::io::stdin();
        let mut input = stdin.lock();
        let mut output = std::io::stdout();
        Self::ask(request, &mut input, &mut output)
    }
}

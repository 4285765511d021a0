use crate::error_handling::{display_info, display_success, display_warning, UserFriendlyError};
use crate::execution::{Approval, Confirmer, ExecutionResult, ExecutionState};
use crate::extraction::CommandCandidate;
use crate::inference::PullProgress;
use anyhow::{anyhow, Result};
use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use std::io::{self, BufRead, Write};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusLevel {
    Info,
    Success,
    Warning,
}

/// Everything the session needs from the user-facing surface.
///
/// The terminal implementation talks to stdin/stdout; tests script it.
pub trait Frontend: Confirmer {
    /// Next line of input, or `None` at end of input
    fn read_input(&mut self) -> Result<Option<String>>;

    fn show_reply(&mut self, text: &str);

    fn show_result(&mut self, result: &ExecutionResult);

    fn show_status(&mut self, level: StatusLevel, message: &str);

    fn show_error(&mut self, error: &UserFriendlyError);

    fn show_help(&mut self);

    fn show_pull_progress(&mut self, progress: &PullProgress);

    /// Called before a potentially slow model call
    fn begin_wait(&mut self, _message: &str) {}

    /// Called once the model call returns, with or without a reply
    fn end_wait(&mut self) {}
}

pub const HELP_TEXT: &str = "\
Type a request in plain language and press Enter.

Commands suggested by the model are shown one at a time:
  y / yes    run the command
  n / no     skip it (the default)
  e / edit   change the command text before deciding
  a / all    run this command and the rest of the reply without asking
  c / cancel skip this command and the rest of the reply
  q / quit   skip the rest of the reply and leave the session

Directives:
  help       show this message
  exit       leave the session (Ctrl-D works too)";

/// Interactive terminal front end
pub struct TerminalFrontend {
    spinner: Option<ProgressBar>,
    pull_bar: Option<ProgressBar>,
}

impl TerminalFrontend {
    pub fn new() -> Self {
        Self {
            spinner: None,
            pull_bar: None,
        }
    }

    fn read_line(&self, prompt: &str) -> Result<Option<String>> {
        print!("{}", prompt);
        io::stdout().flush()?;

        let mut line = String::new();
        let read = io::stdin().lock().read_line(&mut line)?;
        if read == 0 {
            return Ok(None);
        }
        Ok(Some(line.trim_end_matches(['\n', '\r']).to_string()))
    }

    fn pull_bar(&mut self) -> &ProgressBar {
        self.pull_bar.get_or_insert_with(|| {
            let pb = ProgressBar::new(0);
            let style = ProgressStyle::default_bar()
                .template("{spinner:.cyan} {msg} [{bar:30.cyan/blue}] {bytes}/{total_bytes} ({eta})")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=>-");
            pb.set_style(style);
            pb.enable_steady_tick(Duration::from_millis(100));
            pb
        })
    }
}

impl Default for TerminalFrontend {
    fn default() -> Self {
        Self::new()
    }
}

impl Confirmer for TerminalFrontend {
    fn confirm(&mut self, candidate: &CommandCandidate) -> Result<Approval> {
        println!();
        println!("{}", "Proposed command:".bold());
        for line in candidate.normalized_text.lines() {
            println!("  {}", line.green());
        }
        if candidate.normalized_text != candidate.raw_text {
            println!("{} {}", "rewritten from:".dimmed(), candidate.raw_text.dimmed());
        }
        if candidate.needs_review {
            display_warning("This command uses syntax that may not work in your shell. Review it carefully.");
        }

        loop {
            let answer = self
                .read_line(&format!("{} ", "Run this command? [y]es/[n]o/[e]dit/[a]ll/[c]ancel rest/[q]uit:".bold().yellow()))?
                .ok_or_else(|| anyhow!("input closed while waiting for confirmation"))?;

            match answer.trim().to_lowercase().as_str() {
                "y" | "yes" => return Ok(Approval::Approve),
                "" | "n" | "no" => return Ok(Approval::Deny),
                "a" | "all" => return Ok(Approval::ApproveAll),
                "c" | "cancel" => return Ok(Approval::DenyRemaining),
                "q" | "quit" => return Ok(Approval::Quit),
                "e" | "edit" => {
                    let edited = self
                        .read_line(&format!("{} ", "New command:".bold()))?
                        .ok_or_else(|| anyhow!("input closed while editing"))?;
                    if edited.trim().is_empty() {
                        display_info("Empty edit ignored.");
                        continue;
                    }
                    return Ok(Approval::Edit(edited));
                }
                other => display_warning(&format!("Unrecognized answer '{}'. Please type y, n, e, a, c or q.", other)),
            }
        }
    }
}

impl Frontend for TerminalFrontend {
    fn read_input(&mut self) -> Result<Option<String>> {
        println!();
        self.read_line(&format!("{} ", "you ❯".bold().cyan()))
    }

    fn show_reply(&mut self, text: &str) {
        println!();
        println!("{}", "assistant ❯".bold().magenta());
        println!("{}", text.trim_end());
    }

    fn show_result(&mut self, result: &ExecutionResult) {
        match result.state {
            ExecutionState::Denied => {
                println!("{} {} {}", "⏭️".dimmed(), "Skipped:".dimmed(), result.command_text().dimmed());
            }
            // the session follows this with an execution error
            ExecutionState::SpawnFailed => {
                if !result.stderr.trim().is_empty() {
                    eprintln!("{}", result.stderr.trim_end().red());
                }
            }
            ExecutionState::Executed => {
                if !result.stdout.is_empty() {
                    print!("{}", result.stdout);
                    if !result.stdout.ends_with('\n') {
                        println!();
                    }
                }
                if !result.stderr.is_empty() {
                    eprint!("{}", result.stderr.red());
                    if !result.stderr.ends_with('\n') {
                        eprintln!();
                    }
                }
                match result.exit_code {
                    Some(0) => display_success("Command finished (exit status 0)"),
                    Some(code) => display_warning(&format!("Command exited with status {}", code)),
                    None => display_warning(result.error_detail.as_deref().unwrap_or("Command terminated")),
                }
            }
        }
    }

    fn show_status(&mut self, level: StatusLevel, message: &str) {
        match level {
            StatusLevel::Info => display_info(message),
            StatusLevel::Success => display_success(message),
            StatusLevel::Warning => display_warning(message),
        }
    }

    fn show_error(&mut self, error: &UserFriendlyError) {
        error.display();
    }

    fn show_help(&mut self) {
        println!("{}", HELP_TEXT);
    }

    fn show_pull_progress(&mut self, progress: &PullProgress) {
        let pb = self.pull_bar();
        if let Some(total) = progress.total {
            pb.set_length(total);
        }
        if let Some(completed) = progress.completed {
            pb.set_position(completed);
        }
        pb.set_message(progress.status.clone());
    }

    fn begin_wait(&mut self, message: &str) {
        let pb = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::default_spinner()
            .tick_chars("⠁⠂⠄⡀⢀⠠⠐⠈")
            .template("{spinner:.cyan} {msg}")
        {
            pb.set_style(style);
        }
        pb.set_message(message.to_string());
        pb.enable_steady_tick(Duration::from_millis(100));
        self.spinner = Some(pb);
    }

    fn end_wait(&mut self) {
        if let Some(pb) = self.spinner.take() {
            pb.finish_and_clear();
        }
        if let Some(pb) = self.pull_bar.take() {
            pb.finish_and_clear();
        }
    }
}

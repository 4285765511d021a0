use crate::error_handling::ErrorKind;
use crate::extraction::CommandCandidate;
use crate::log_debug;
use crate::logging::{get_logger, LogCategory};
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Instant;
use tokio::process::Command;

/// Shell exit status for "command not found"
const EXIT_NOT_FOUND: i32 = 127;
/// Shell exit status for "found but not executable"
const EXIT_NOT_EXECUTABLE: i32 = 126;

/// The user's answer to a proposed command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Approval {
    Approve,
    /// Run this command and every remaining one in the reply without asking
    ApproveAll,
    Deny,
    /// Skip this command and every remaining one in the reply
    DenyRemaining,
    /// Skip the remaining commands and end the session
    Quit,
    /// Replace the command text and ask again
    Edit(String),
}

/// Source of approve/deny/edit decisions
pub trait Confirmer {
    fn confirm(&mut self, candidate: &CommandCandidate) -> anyhow::Result<Approval>;
}

/// How the rest of a reply's commands should be handled after one decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Remaining {
    Ask,
    RunAll,
    SkipAll,
    Quit,
}

/// Terminal states of the execution gate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    Denied,
    Executed,
    SpawnFailed,
}

impl ExecutionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionState::Denied => "denied",
            ExecutionState::Executed => "executed",
            ExecutionState::SpawnFailed => "spawn_failed",
        }
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    /// The candidate as finally decided on; `normalized_text` holds any edit
    pub command: CommandCandidate,
    pub approved: bool,
    /// `None` when denied, when the process could not be started, or on a signal
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub error: Option<ErrorKind>,
    pub state: ExecutionState,
    pub error_detail: Option<String>,
}

impl ExecutionResult {
    fn denied(command: CommandCandidate) -> Self {
        Self {
            command,
            approved: false,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            error: None,
            state: ExecutionState::Denied,
            error_detail: None,
        }
    }

    fn spawn_failed(command: CommandCandidate, detail: String, stdout: String, stderr: String) -> Self {
        Self {
            command,
            approved: true,
            exit_code: None,
            stdout,
            stderr,
            error: Some(ErrorKind::SpawnFailed),
            state: ExecutionState::SpawnFailed,
            error_detail: Some(detail),
        }
    }

    /// The command text that was (or would have been) run
    pub fn command_text(&self) -> &str {
        &self.command.normalized_text
    }

    pub fn succeeded(&self) -> bool {
        self.state == ExecutionState::Executed && self.exit_code == Some(0)
    }

    /// Render the outcome for the model, truncating each stream to `max_chars`
    pub fn to_report(&self, max_chars: usize) -> String {
        let mut report = format!("$ {}\n", self.command_text());

        match self.state {
            ExecutionState::Denied => {
                report.push_str("[not run: the user declined this command]\n");
                return report;
            }
            ExecutionState::SpawnFailed => {
                report.push_str(&format!(
                    "[could not start: {}]\n",
                    self.error_detail.as_deref().unwrap_or("unknown error")
                ));
            }
            ExecutionState::Executed => match self.exit_code {
                Some(code) => report.push_str(&format!("[exit status {}]\n", code)),
                None => report.push_str(&format!(
                    "[{}]\n",
                    self.error_detail.as_deref().unwrap_or("terminated")
                )),
            },
        }

        if !self.stdout.trim().is_empty() {
            report.push_str("stdout:\n");
            report.push_str(&truncate_output(self.stdout.trim_end(), max_chars));
            report.push('\n');
        }
        if !self.stderr.trim().is_empty() {
            report.push_str("stderr:\n");
            report.push_str(&truncate_output(self.stderr.trim_end(), max_chars));
            report.push('\n');
        }

        report
    }
}

/// Keep the first `max_chars` characters, noting how much was cut
pub fn truncate_output(text: &str, max_chars: usize) -> String {
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_string();
    }
    let kept: String = text.chars().take(max_chars).collect();
    format!("{}\n...[truncated, {} of {} chars shown]", kept, max_chars, total)
}

/// The program a command line starts with, skipping `VAR=value` prefixes
fn leading_program(command: &str) -> Option<&str> {
    command
        .split_whitespace()
        .find(|word| !word.split_once('=').is_some_and(|(name, _)| !name.is_empty() && !name.contains('/')))
}

/// Whether a 126/127 status came from the shell failing to start the
/// command's own program, rather than from something later in the script
fn start_failure(command: &str, stderr: &str) -> bool {
    let Some(program) = leading_program(command) else {
        return false;
    };
    let Some(first_line) = stderr.lines().find(|l| !l.trim().is_empty()) else {
        return false;
    };

    let lower = first_line.to_lowercase();
    first_line.contains(program)
        && (lower.contains("not found")
            || lower.contains("no such file")
            || lower.contains("permission denied")
            || lower.contains("cannot execute")
            || lower.contains("unknown command"))
}

/// Runs approved commands through the active shell
pub struct ExecutionGate {
    shell: PathBuf,
    working_dir: PathBuf,
}

impl ExecutionGate {
    pub fn new(shell: PathBuf, working_dir: PathBuf) -> Self {
        Self { shell, working_dir }
    }

    /// Ask for approval, then run the command if approved.
    ///
    /// Edits re-present the new text until the user decides. A confirmer
    /// failure (closed stdin, for instance) counts as a denial. The second
    /// value says how the reply's remaining commands should be handled.
    pub async fn execute<C: Confirmer + ?Sized>(
        &self,
        candidate: &CommandCandidate,
        confirmer: &mut C,
    ) -> (ExecutionResult, Remaining) {
        let mut current = candidate.clone();

        loop {
            let remaining = match confirmer.confirm(&current) {
                Ok(Approval::Approve) => Remaining::Ask,
                Ok(Approval::ApproveAll) => Remaining::RunAll,
                Ok(Approval::Deny) => return (self.decline(current), Remaining::Ask),
                Ok(Approval::DenyRemaining) => return (self.decline(current), Remaining::SkipAll),
                Ok(Approval::Quit) => return (self.decline(current), Remaining::Quit),
                Ok(Approval::Edit(text)) => {
                    let text = text.trim();
                    if !text.is_empty() {
                        current.normalized_text = text.to_string();
                        current.needs_review = false;
                    }
                    continue;
                }
                Err(e) => {
                    if let Ok(logger) = get_logger() {
                        if let Ok(logger_guard) = logger.lock() {
                            let _ = logger_guard.log_warning(
                                LogCategory::Execution,
                                format!("Confirmation failed, treating as denied: {}", e),
                                None,
                            );
                        }
                    }
                    return (self.decline(current), Remaining::Ask);
                }
            };

            return (self.run_approved(current).await, remaining);
        }
    }

    /// Record a denial without spawning anything
    pub fn decline(&self, candidate: CommandCandidate) -> ExecutionResult {
        log_state(ExecutionState::Denied, None, None);
        ExecutionResult::denied(candidate)
    }

    /// Run a candidate the user already approved
    pub async fn run_approved(&self, candidate: CommandCandidate) -> ExecutionResult {
        log_debug!(LogCategory::Execution, format!("Running: {}", candidate.normalized_text));
        let start = Instant::now();

        let child = Command::new(&self.shell)
            .arg("-c")
            .arg(&candidate.normalized_text)
            .current_dir(&self.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let child = match child {
            Ok(child) => child,
            Err(e) => {
                let detail = format!("{}: {}", self.shell.display(), e);
                log_state(ExecutionState::SpawnFailed, None, Some(start));
                return ExecutionResult::spawn_failed(candidate, detail, String::new(), String::new());
            }
        };

        // wait_with_output drains both pipes concurrently while awaiting exit
        let output = match child.wait_with_output().await {
            Ok(output) => output,
            Err(e) => {
                log_state(ExecutionState::SpawnFailed, None, Some(start));
                return ExecutionResult::spawn_failed(candidate, e.to_string(), String::new(), String::new());
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        match output.status.code() {
            Some(code @ (EXIT_NOT_FOUND | EXIT_NOT_EXECUTABLE))
                if start_failure(&candidate.normalized_text, &stderr) =>
            {
                let detail = if code == EXIT_NOT_FOUND {
                    "command not found"
                } else {
                    "permission denied or not executable"
                };
                log_state(ExecutionState::SpawnFailed, Some(code), Some(start));
                ExecutionResult::spawn_failed(candidate, detail.to_string(), stdout, stderr)
            }
            code => {
                log_state(ExecutionState::Executed, code, Some(start));
                ExecutionResult {
                    command: candidate,
                    approved: true,
                    exit_code: code,
                    stdout,
                    stderr,
                    error: None,
                    state: ExecutionState::Executed,
                    error_detail: code.is_none().then(|| "terminated by signal".to_string()),
                }
            }
        }
    }
}

fn log_state(state: ExecutionState, exit_code: Option<i32>, start: Option<Instant>) {
    if let Ok(logger) = get_logger() {
        if let Ok(logger_guard) = logger.lock() {
            let _ = logger_guard.log_execution(
                state.as_str(),
                exit_code,
                start.map(|s| s.elapsed().as_millis() as u64),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use tempfile::TempDir;

    struct ScriptedConfirmer {
        answers: VecDeque<Approval>,
        seen: Vec<String>,
    }

    impl ScriptedConfirmer {
        fn new(answers: Vec<Approval>) -> Self {
            Self {
                answers: answers.into(),
                seen: Vec::new(),
            }
        }
    }

    impl Confirmer for ScriptedConfirmer {
        fn confirm(&mut self, candidate: &CommandCandidate) -> anyhow::Result<Approval> {
            self.seen.push(candidate.normalized_text.clone());
            self.answers
                .pop_front()
                .ok_or_else(|| anyhow::anyhow!("input closed"))
        }
    }

    fn candidate(text: &str) -> CommandCandidate {
        CommandCandidate {
            raw_text: text.to_string(),
            normalized_text: text.to_string(),
            source_turn_index: 1,
            needs_review: false,
        }
    }

    fn gate(dir: &TempDir) -> ExecutionGate {
        ExecutionGate::new(PathBuf::from("/bin/sh"), dir.path().to_path_buf())
    }

    async fn approve(dir: &TempDir, command: &str) -> ExecutionResult {
        let mut confirmer = ScriptedConfirmer::new(vec![Approval::Approve]);
        gate(dir).execute(&candidate(command), &mut confirmer).await.0
    }

    #[tokio::test]
    async fn test_denied_command_spawns_nothing() {
        let dir = TempDir::new().unwrap();
        let mut confirmer = ScriptedConfirmer::new(vec![Approval::Deny]);

        let (result, remaining) = gate(&dir).execute(&candidate("touch marker"), &mut confirmer).await;

        assert_eq!(result.state, ExecutionState::Denied);
        assert_eq!(remaining, Remaining::Ask);
        assert!(!result.approved);
        assert_eq!(result.exit_code, None);
        assert_eq!(result.error, None);
        assert!(!dir.path().join("marker").exists());
    }

    #[tokio::test]
    async fn test_approved_command_captures_output_in_working_dir() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("present.txt"), "x").unwrap();

        let result = approve(&dir, "ls; echo oops >&2").await;

        assert_eq!(result.state, ExecutionState::Executed);
        assert!(result.approved);
        assert_eq!(result.exit_code, Some(0));
        assert!(result.stdout.contains("present.txt"));
        assert_eq!(result.stderr.trim(), "oops");
        assert!(result.succeeded());
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_reported_not_an_error() {
        let dir = TempDir::new().unwrap();

        let result = approve(&dir, "exit 3").await;

        assert_eq!(result.state, ExecutionState::Executed);
        assert_eq!(result.exit_code, Some(3));
        assert_eq!(result.error, None);
        assert!(!result.succeeded());
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_failure() {
        let dir = TempDir::new().unwrap();

        let result = approve(&dir, "definitely-not-a-real-binary-4821 --help").await;

        assert_eq!(result.state, ExecutionState::SpawnFailed);
        assert_eq!(result.error, Some(ErrorKind::SpawnFailed));
        assert_eq!(result.exit_code, None);
        assert_eq!(result.error_detail.as_deref(), Some("command not found"));
        assert!(result.stderr.contains("definitely-not-a-real-binary-4821"));
    }

    #[tokio::test]
    async fn test_late_missing_binary_keeps_output_and_status() {
        let dir = TempDir::new().unwrap();

        let result = approve(&dir, "touch made.txt; echo IMPORTANT; nosuchbinary_xyz").await;

        assert_eq!(result.state, ExecutionState::Executed);
        assert_eq!(result.exit_code, Some(127));
        assert_eq!(result.error, None);
        assert_eq!(result.stdout, "IMPORTANT\n");
        assert!(dir.path().join("made.txt").exists());
    }

    #[tokio::test]
    async fn test_explicit_exit_127_is_an_ordinary_status() {
        let dir = TempDir::new().unwrap();

        let result = approve(&dir, "exit 127").await;

        assert_eq!(result.state, ExecutionState::Executed);
        assert_eq!(result.exit_code, Some(127));
    }

    #[tokio::test]
    async fn test_missing_shell_is_spawn_failure() {
        let dir = TempDir::new().unwrap();
        let gate = ExecutionGate::new(PathBuf::from("/nonexistent/shell"), dir.path().to_path_buf());
        let mut confirmer = ScriptedConfirmer::new(vec![Approval::Approve]);

        let (result, _) = gate.execute(&candidate("ls"), &mut confirmer).await;

        assert_eq!(result.state, ExecutionState::SpawnFailed);
        assert_eq!(result.exit_code, None);
        assert!(result.error_detail.unwrap().contains("/nonexistent/shell"));
    }

    #[tokio::test]
    async fn test_edit_is_re_presented_before_running() {
        let dir = TempDir::new().unwrap();
        let mut confirmer = ScriptedConfirmer::new(vec![
            Approval::Edit("echo edited".to_string()),
            Approval::Approve,
        ]);

        let (result, _) = gate(&dir).execute(&candidate("echo original"), &mut confirmer).await;

        assert_eq!(confirmer.seen, vec!["echo original", "echo edited"]);
        assert_eq!(result.command_text(), "echo edited");
        assert_eq!(result.command.raw_text, "echo original");
        assert_eq!(result.command.source_turn_index, 1);
        assert_eq!(result.stdout, "edited\n");
    }

    #[tokio::test]
    async fn test_batch_decisions() {
        let dir = TempDir::new().unwrap();

        let mut confirmer = ScriptedConfirmer::new(vec![Approval::ApproveAll]);
        let (result, remaining) = gate(&dir).execute(&candidate("echo first"), &mut confirmer).await;
        assert_eq!(remaining, Remaining::RunAll);
        assert_eq!(result.stdout, "first\n");

        let mut confirmer = ScriptedConfirmer::new(vec![Approval::DenyRemaining]);
        let (result, remaining) = gate(&dir).execute(&candidate("touch skipped"), &mut confirmer).await;
        assert_eq!(remaining, Remaining::SkipAll);
        assert_eq!(result.state, ExecutionState::Denied);

        let mut confirmer = ScriptedConfirmer::new(vec![Approval::Quit]);
        let (result, remaining) = gate(&dir).execute(&candidate("touch skipped"), &mut confirmer).await;
        assert_eq!(remaining, Remaining::Quit);
        assert_eq!(result.state, ExecutionState::Denied);
        assert!(!dir.path().join("skipped").exists());
    }

    #[tokio::test]
    async fn test_confirmer_failure_counts_as_denial() {
        let dir = TempDir::new().unwrap();
        let mut confirmer = ScriptedConfirmer::new(vec![]);

        let (result, _) = gate(&dir).execute(&candidate("touch marker"), &mut confirmer).await;

        assert_eq!(result.state, ExecutionState::Denied);
        assert!(!dir.path().join("marker").exists());
    }

    #[test]
    fn test_leading_program_skips_assignments() {
        assert_eq!(leading_program("LANG=C sort f"), Some("sort"));
        assert_eq!(leading_program("  ls -la"), Some("ls"));
        assert_eq!(leading_program("./run.sh --flag=x"), Some("./run.sh"));
        assert_eq!(leading_program(""), None);
    }

    #[test]
    fn test_report_truncates_output() {
        let result = ExecutionResult {
            command: candidate("seq 1 1000"),
            approved: true,
            exit_code: Some(0),
            stdout: "x".repeat(50),
            stderr: String::new(),
            error: None,
            state: ExecutionState::Executed,
            error_detail: None,
        };

        let report = result.to_report(10);

        assert!(report.starts_with("$ seq 1 1000\n[exit status 0]\nstdout:\n"));
        assert!(report.contains("xxxxxxxxxx\n...[truncated, 10 of 50 chars shown]"));
        assert!(!report.contains("stderr:"));
    }

    #[test]
    fn test_report_for_denied_command() {
        let report = ExecutionResult::denied(candidate("rm -rf build")).to_report(100);

        assert_eq!(report, "$ rm -rf build\n[not run: the user declined this command]\n");
    }
}

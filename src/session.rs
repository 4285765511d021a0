use crate::config::Config;
use crate::dialect::{ShellDialect, ShellEnvironment};
use crate::error_handling::{enhance_error, AgentError, ErrorKind};
use crate::execution::{ExecutionGate, ExecutionResult, ExecutionState, Remaining};
use crate::extraction::CommandExtractor;
use crate::frontend::{Frontend, StatusLevel};
use crate::inference::InferenceBackend;
use crate::logging::{LogCategory, LogContext};
use crate::prompt::system_prompt;
use crate::{log_debug, log_error, log_info, log_warning};
use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl Turn {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Append-only conversation record.
///
/// An optional system turn leads; after it, user and assistant turns
/// alternate starting with the user.
#[derive(Debug, Clone, Default)]
pub struct Transcript {
    turns: Vec<Turn>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_system(text: impl Into<String>) -> Self {
        Self {
            turns: vec![Turn::new(Role::System, text)],
        }
    }

    /// Append a turn, returning its index
    pub fn push(&mut self, turn: Turn) -> Result<usize> {
        if turn.role == Role::System {
            if !self.turns.is_empty() {
                bail!("a system turn can only lead the transcript");
            }
        } else {
            let expected = match self.turns.last().map(|t| t.role) {
                Some(Role::User) => Role::Assistant,
                _ => Role::User,
            };
            if turn.role != expected {
                bail!("expected a {} turn, got {}", expected, turn.role);
            }
        }

        self.turns.push(turn);
        Ok(self.turns.len() - 1)
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn get(&self, index: usize) -> Option<&Turn> {
        self.turns.get(index)
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// The turns to send to the model: the system turn plus at most
    /// `max_turns` of the most recent exchange turns, starting on a user turn
    pub fn context_window(&self, max_turns: Option<usize>) -> Vec<Turn> {
        let (system, rest) = match self.turns.split_first() {
            Some((first, rest)) if first.role == Role::System => (Some(first), rest),
            _ => (None, self.turns.as_slice()),
        };

        let mut start = max_turns.map_or(0, |max| rest.len().saturating_sub(max));
        if rest.get(start).is_some_and(|t| t.role == Role::Assistant) {
            start += 1;
        }

        system.into_iter().chain(rest[start..].iter()).cloned().collect()
    }
}

/// Per-session settings fixed at construction
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub model: String,
    pub dialect: ShellDialect,
    pub shell_name: String,
    pub max_context_turns: Option<usize>,
    pub max_output_chars: usize,
    pub follow_up_rounds: u32,
}

impl SessionConfig {
    pub fn new(config: &Config, shell: &ShellEnvironment) -> Self {
        Self {
            model: config.model.clone(),
            dialect: shell.dialect,
            shell_name: shell.name(),
            max_context_turns: config.max_context_turns,
            max_output_chars: config.max_output_chars,
            follow_up_rounds: config.follow_up_rounds,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit,
}

/// Drives the conversation: input, inference, extraction and gated execution
pub struct Session<B: InferenceBackend, F: Frontend> {
    backend: B,
    frontend: F,
    extractor: CommandExtractor,
    gate: ExecutionGate,
    settings: SessionConfig,
    transcript: Transcript,
    /// Results not yet seen by the model; folded into the next user turn
    pending_results: Vec<ExecutionResult>,
    model_ready: bool,
}

impl<B: InferenceBackend, F: Frontend> Session<B, F> {
    pub fn new(
        backend: B,
        frontend: F,
        config: &Config,
        shell: &ShellEnvironment,
        working_dir: PathBuf,
    ) -> Self {
        let settings = SessionConfig::new(config, shell);
        let extractor = CommandExtractor::from_config(config, shell.dialect);
        let prompt = system_prompt(
            settings.dialect,
            &settings.shell_name,
            extractor.fence(),
            extractor.languages(),
        );

        Self {
            backend,
            frontend,
            extractor,
            gate: ExecutionGate::new(shell.program.clone(), working_dir),
            settings,
            transcript: Transcript::with_system(prompt),
            pending_results: Vec::new(),
            model_ready: false,
        }
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn settings(&self) -> &SessionConfig {
        &self.settings
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn frontend(&self) -> &F {
        &self.frontend
    }

    pub fn pending_results(&self) -> &[ExecutionResult] {
        &self.pending_results
    }

    /// Probe the endpoint and make sure the model is present.
    ///
    /// Failures are reported and leave the session usable; the model check
    /// is retried before the next turn.
    pub async fn startup(&mut self) {
        let endpoint = self.backend.endpoint().to_string();

        if !self.backend.is_reachable().await {
            self.frontend.show_status(
                StatusLevel::Warning,
                &format!(
                    "Ollama is not reachable at {}. Start it with 'ollama serve'; your next message will try again.",
                    endpoint
                ),
            );
            return;
        }

        self.frontend
            .show_status(StatusLevel::Success, &format!("Connected to Ollama at {}", endpoint));
        if let Err(e) = self.ensure_model().await {
            self.report_error(&e);
        }
    }

    /// Check for the configured model and pull it if it is missing
    pub async fn ensure_model(&mut self) -> Result<(), AgentError> {
        let model = self.settings.model.clone();

        if self.backend.check_model_available(&model).await? {
            self.model_ready = true;
            return Ok(());
        }

        self.frontend.show_status(
            StatusLevel::Info,
            &format!("Model '{}' is not installed locally. Pulling it now...", model),
        );

        let (tx, mut rx) = mpsc::unbounded_channel();
        let pull = self.backend.pull_model(&model, Some(tx));
        tokio::pin!(pull);

        let result = loop {
            tokio::select! {
                result = &mut pull => break result,
                Some(progress) = rx.recv() => self.frontend.show_pull_progress(&progress),
            }
        };
        while let Ok(progress) = rx.try_recv() {
            self.frontend.show_pull_progress(&progress);
        }
        self.frontend.end_wait();

        result?;
        self.model_ready = true;
        self.frontend
            .show_status(StatusLevel::Success, &format!("Model '{}' is ready", model));
        Ok(())
    }

    /// Read and handle input until `exit` or end of input
    pub async fn run(&mut self) -> Result<()> {
        log_info!(
            LogCategory::Session,
            "Session started",
            LogContext::new()
                .with_component("session".to_string())
                .with_model(self.settings.model.clone())
                .with_shell(self.settings.shell_name.clone())
        );

        while let Some(line) = self.frontend.read_input()? {
            if self.handle_input(&line).await == Flow::Exit {
                break;
            }
        }

        log_info!(
            LogCategory::Session,
            format!("Session ended after {} turns", self.transcript.len())
        );
        Ok(())
    }

    pub async fn handle_input(&mut self, line: &str) -> Flow {
        let input = line.trim();

        if input.is_empty() {
            return Flow::Continue;
        }
        if input.eq_ignore_ascii_case("exit") {
            return Flow::Exit;
        }
        if input.eq_ignore_ascii_case("help") {
            self.frontend.show_help();
            return Flow::Continue;
        }

        self.process_turn(input).await
    }

    /// One user turn plus any follow-up rounds; `Flow::Exit` when the user
    /// quit from a confirmation prompt
    async fn process_turn(&mut self, input: &str) -> Flow {
        if !self.model_ready {
            if let Err(e) = self.ensure_model().await {
                // connectivity problems are reported by the chat call below
                if e.kind() == Some(ErrorKind::ModelUnavailable) {
                    self.report_error(&e);
                    return Flow::Continue;
                }
            }
        }

        let text = if self.pending_results.is_empty() {
            input.to_string()
        } else {
            format!(
                "Results of the commands from your last reply:\n\n{}\n{}",
                render_reports(&self.pending_results, self.settings.max_output_chars),
                input
            )
        };

        let Some(reply_index) = self.exchange(text).await else {
            return Flow::Continue;
        };
        self.pending_results.clear();
        let (mut results, mut flow) = self.run_candidates(reply_index).await;

        for round in 1..=self.settings.follow_up_rounds {
            if flow == Flow::Exit || !results.iter().any(|r| r.approved) {
                break;
            }
            log_debug!(LogCategory::Session, format!("Follow-up round {}", round));

            let report = format!(
                "I ran the commands you suggested. Here is what happened:\n\n{}\n\
                 Please analyze this output. If something failed, explain why and suggest a fix.",
                render_reports(&results, self.settings.max_output_chars)
            );
            match self.exchange(report).await {
                Some(index) => {
                    (results, flow) = self.run_candidates(index).await;
                }
                None => break,
            }
        }

        self.pending_results = results;
        flow
    }

    /// Send one user turn; commits both turns only when the model replies
    async fn exchange(&mut self, text: String) -> Option<usize> {
        let user_turn = Turn::new(Role::User, text);
        let mut turns = self.transcript.context_window(self.settings.max_context_turns);
        turns.push(user_turn.clone());

        self.frontend.begin_wait("Thinking...");
        let result = self.backend.converse(&turns).await;
        self.frontend.end_wait();

        let reply = match result {
            Ok(reply) => reply,
            Err(e) => {
                self.report_error(&e);
                return None;
            }
        };
        log_debug!(LogCategory::Session, format!("Reply: {}", reply));

        let committed = self
            .transcript
            .push(user_turn)
            .and_then(|_| self.transcript.push(Turn::new(Role::Assistant, reply.clone())));
        let index = match committed {
            Ok(index) => index,
            Err(e) => {
                log_error!(LogCategory::Session, format!("Transcript rejected turn: {}", e));
                return None;
            }
        };

        self.frontend.show_reply(&reply);
        Some(index)
    }

    /// Gate every command in the reply, in order
    async fn run_candidates(&mut self, turn_index: usize) -> (Vec<ExecutionResult>, Flow) {
        let Some(reply) = self.transcript.get(turn_index).map(|t| t.text.clone()) else {
            return (Vec::new(), Flow::Continue);
        };

        let candidates = self.extractor.extract(&reply, turn_index);
        let mut results = Vec::with_capacity(candidates.len());
        let mut remaining = Remaining::Ask;

        for candidate in &candidates {
            let result = match remaining {
                Remaining::Ask => {
                    let (result, next) = self.gate.execute(candidate, &mut self.frontend).await;
                    remaining = next;
                    result
                }
                Remaining::RunAll => self.gate.run_approved(candidate.clone()).await,
                Remaining::SkipAll | Remaining::Quit => self.gate.decline(candidate.clone()),
            };

            self.frontend.show_result(&result);
            if result.state == ExecutionState::SpawnFailed {
                let detail = result.error_detail.as_deref().unwrap_or("unknown error");
                self.report_error(&AgentError::SpawnFailed(format!("{}: {}", result.command_text(), detail)));
            }
            results.push(result);
        }

        let flow = if remaining == Remaining::Quit { Flow::Exit } else { Flow::Continue };
        (results, flow)
    }

    fn report_error(&mut self, error: &AgentError) {
        let kind = error.kind();
        log_warning!(
            LogCategory::Session,
            format!("Turn failed: {}", error),
            LogContext::new()
                .with_component("session".to_string())
                .with_error_code(kind.map(|k| k.as_str()).unwrap_or("other").to_string())
        );
        self.frontend.show_error(&enhance_error(error));
        if kind.is_some_and(|k| k.is_retryable()) {
            self.frontend
                .show_status(StatusLevel::Info, "This may be temporary. Send your message again to retry.");
        }
    }
}

fn render_reports(results: &[ExecutionResult], max_chars: usize) -> String {
    results
        .iter()
        .map(|r| r.to_report(max_chars))
        .collect::<Vec<_>>()
        .join("\n")
}

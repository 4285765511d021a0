use colored::*;
use std::fmt;
use thiserror::Error;
use crate::logging::{get_logger, LogCategory, LogContext};

/// The recoverable failure classes reported to the user and the transcript
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Inference endpoint unreachable (connection refused, timeout)
    Unavailable,
    /// Malformed or empty model output
    InvalidResponse,
    /// Model missing and could not be pulled
    ModelUnavailable,
    /// Command could not be started
    SpawnFailed,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::InvalidResponse => "invalid_response",
            ErrorKind::ModelUnavailable => "model_unavailable",
            ErrorKind::SpawnFailed => "spawn_failed",
        }
    }

    /// Whether retrying the same action later can succeed without user changes
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Unavailable | ErrorKind::InvalidResponse)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("inference endpoint {endpoint} is unreachable: {reason}")]
    Unavailable { endpoint: String, reason: String },

    #[error("model returned no usable reply: {0}")]
    InvalidResponse(String),

    #[error("model '{model}' is not available: {reason}")]
    ModelUnavailable { model: String, reason: String },

    #[error("command could not be started: {0}")]
    SpawnFailed(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("could not determine the active shell: {0}")]
    ShellDetection(String),
}

impl AgentError {
    /// The taxonomy class, or `None` for startup-only failures
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            AgentError::Unavailable { .. } => Some(ErrorKind::Unavailable),
            AgentError::InvalidResponse(_) => Some(ErrorKind::InvalidResponse),
            AgentError::ModelUnavailable { .. } => Some(ErrorKind::ModelUnavailable),
            AgentError::SpawnFailed(_) => Some(ErrorKind::SpawnFailed),
            AgentError::Configuration(_) | AgentError::ShellDetection(_) => None,
        }
    }
}

/// Enhanced error handling with actionable suggestions
#[derive(Debug, Clone)]
pub struct UserFriendlyError {
    pub error_type: ErrorType,
    pub message: String,
    pub suggestions: Vec<String>,
    pub technical_details: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ErrorType {
    Connection,
    Configuration,
    Provider,
    Model,
    Execution,
    System,
}

impl UserFriendlyError {
    pub fn new(error_type: ErrorType, message: String) -> Self {
        Self {
            error_type,
            message,
            suggestions: Vec::new(),
            technical_details: None,
        }
    }

    pub fn with_suggestions(mut self, suggestions: Vec<String>) -> Self {
        self.suggestions.extend(suggestions);
        self
    }

    pub fn with_technical_details(mut self, details: String) -> Self {
        self.technical_details = Some(details);
        self
    }

    pub fn title(&self) -> &'static str {
        match self.error_type {
            ErrorType::Connection => "Connection Error",
            ErrorType::Configuration => "Configuration Error",
            ErrorType::Provider => "Model Reply Error",
            ErrorType::Model => "Model Unavailable",
            ErrorType::Execution => "Execution Error",
            ErrorType::System => "System Error",
        }
    }

    /// Display the error in a user-friendly format with actionable suggestions
    pub fn display(&self) {
        if let Ok(logger) = get_logger() {
            if let Ok(logger_guard) = logger.lock() {
                let context = LogContext::new()
                    .with_component("error_handling".to_string())
                    .with_operation("display_error".to_string())
                    .with_error_code(format!("{:?}", self.error_type))
                    .with_success(false);

                let _ = logger_guard.log_error(
                    LogCategory::System,
                    format!("{:?}: {}", self.error_type, self.message),
                    Some(context),
                );
            }
        }

        let icon = match self.error_type {
            ErrorType::Connection => "🔌",
            ErrorType::Configuration => "⚙️",
            ErrorType::Provider => "🤖",
            ErrorType::Model => "📦",
            ErrorType::Execution => "🚫",
            ErrorType::System => "💻",
        };

        eprintln!("{} {}: {}",
            icon,
            self.title().bold().red(),
            self.message
        );

        if !self.suggestions.is_empty() {
            eprintln!("{} {}", "💡".cyan(), "Suggested solutions:".bold().yellow());
            for (i, suggestion) in self.suggestions.iter().enumerate() {
                eprintln!("  {}. {}", (i + 1).to_string().green(), suggestion);
            }
        }

        if let Some(details) = &self.technical_details {
            eprintln!("{} {}", "🔧".dimmed(), "Technical details:".dimmed());
            eprintln!("   {}", details.dimmed());
        }
    }
}

impl fmt::Display for UserFriendlyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for UserFriendlyError {}

/// Convert agent errors into user-friendly errors with actionable suggestions
pub fn enhance_error(error: &AgentError) -> UserFriendlyError {
    let friendly = match error {
        AgentError::Unavailable { endpoint, .. } => UserFriendlyError::new(
            ErrorType::Connection,
            "Unable to reach the local model service. Your message was not sent; try again.".to_string(),
        )
        .with_suggestions(vec![
            "Ensure Ollama is running: ollama serve".to_string(),
            format!("Check that the service answers at {}", endpoint),
            "If it runs in a container, start it with: docker-compose up -d".to_string(),
        ]),
        AgentError::InvalidResponse(_) => UserFriendlyError::new(
            ErrorType::Provider,
            "This turn produced no usable reply from the model".to_string(),
        )
        .with_suggestions(vec![
            "Rephrase the request and try again".to_string(),
            "Try a different model by editing the 'model' setting".to_string(),
        ]),
        AgentError::ModelUnavailable { model, .. } => UserFriendlyError::new(
            ErrorType::Model,
            format!("Model '{}' is not available, so the conversation cannot continue yet", model),
        )
        .with_suggestions(vec![
            format!("Pull the model manually: ollama pull {}", model),
            "List installed models: ollama list".to_string(),
            "Pick an installed model via the 'model' setting in the config file".to_string(),
        ]),
        AgentError::SpawnFailed(_) => UserFriendlyError::new(
            ErrorType::Execution,
            "The command could not be started".to_string(),
        )
        .with_suggestions(vec![
            "Check that the program is installed and on your PATH".to_string(),
            "Check file permissions on the program you tried to run".to_string(),
        ]),
        AgentError::Configuration(_) => UserFriendlyError::new(
            ErrorType::Configuration,
            "Configuration issue detected".to_string(),
        )
        .with_suggestions(vec![
            "Reset to defaults by deleting ~/.config/local-agent/config.json".to_string(),
            "Verify all settings are valid".to_string(),
        ]),
        AgentError::ShellDetection(_) => UserFriendlyError::new(
            ErrorType::System,
            "No usable shell was found on this system".to_string(),
        )
        .with_suggestions(vec![
            "Set the SHELL environment variable to your shell's path".to_string(),
            "Or set the 'shell' option in the config file".to_string(),
        ]),
    };

    friendly.with_technical_details(error.to_string())
}

/// Display success messages with consistent formatting
pub fn display_success(message: &str) {
    println!("{} {}", "✅".green(), message);
}

/// Display warning messages with consistent formatting
pub fn display_warning(message: &str) {
    println!("{} {}", "⚠️".yellow(), message.yellow());
}

/// Display info messages with consistent formatting
pub fn display_info(message: &str) {
    println!("{} {}", "💡".cyan(), message.dimmed());
}

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock};

/// Privacy-preserving session log
///
/// Command text, model replies and command output never reach the log file
/// unless debug mode is on. Debug mode is only enabled from the `--debug`
/// flag, which counts as the user's consent, and every debug line is marked.
pub struct AgentLogger {
    log_file_path: PathBuf,
    debug_mode: bool,
    writer: Arc<Mutex<Option<std::fs::File>>>,
}

/// Log entry structure for structured logging
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub category: LogCategory,
    pub message: String,
    pub context: Option<LogContext>,
    pub is_debug: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum LogLevel {
    Error,
    Warning,
    Info,
    Debug,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum LogCategory {
    System,
    Configuration,
    Inference,
    Extraction,
    Execution,
    Session,
}

/// Context information for log entries (privacy-safe)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogContext {
    pub component: Option<String>,
    pub operation: Option<String>,
    pub duration_ms: Option<u64>,
    pub error_code: Option<String>,
    pub model: Option<String>,
    pub shell: Option<String>,
    pub exit_code: Option<i32>,
    pub success: Option<bool>,
}

impl LogContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_component(mut self, component: String) -> Self {
        self.component = Some(component);
        self
    }

    pub fn with_operation(mut self, operation: String) -> Self {
        self.operation = Some(operation);
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_error_code(mut self, error_code: String) -> Self {
        self.error_code = Some(error_code);
        self
    }

    pub fn with_model(mut self, model: String) -> Self {
        self.model = Some(model);
        self
    }

    pub fn with_shell(mut self, shell: String) -> Self {
        self.shell = Some(shell);
        self
    }

    pub fn with_exit_code(mut self, exit_code: i32) -> Self {
        self.exit_code = Some(exit_code);
        self
    }

    pub fn with_success(mut self, success: bool) -> Self {
        self.success = Some(success);
        self
    }
}

impl AgentLogger {
    /// Create a logger writing to the default location under the config dir
    pub fn new() -> Result<Self> {
        Self::with_path(Self::default_log_file_path()?)
    }

    pub fn with_path(log_file_path: PathBuf) -> Result<Self> {
        if let Some(parent) = log_file_path.parent() {
            fs::create_dir_all(parent)?;
        }

        Ok(Self {
            log_file_path,
            debug_mode: false,
            writer: Arc::new(Mutex::new(None)),
        })
    }

    pub fn enable_debug_mode(&mut self) -> Result<()> {
        self.debug_mode = true;
        self.log_warning(
            LogCategory::System,
            "DEBUG MODE ACTIVE: commands and model replies will be logged".to_string(),
            None,
        )
    }

    pub fn log_error(&self, category: LogCategory, message: String, context: Option<LogContext>) -> Result<()> {
        self.write_log_entry(&self.entry(LogLevel::Error, category, message, context))
    }

    pub fn log_warning(&self, category: LogCategory, message: String, context: Option<LogContext>) -> Result<()> {
        self.write_log_entry(&self.entry(LogLevel::Warning, category, message, context))
    }

    pub fn log_info(&self, category: LogCategory, message: String, context: Option<LogContext>) -> Result<()> {
        self.write_log_entry(&self.entry(LogLevel::Info, category, message, context))
    }

    /// Log a debug event (dropped unless debug mode is on)
    pub fn log_debug(&self, category: LogCategory, message: String, context: Option<LogContext>) -> Result<()> {
        if !self.debug_mode {
            return Ok(());
        }

        let entry = LogEntry {
            timestamp: Utc::now(),
            level: LogLevel::Debug,
            category,
            message: format!("[DEBUG] {}", message),
            context,
            is_debug: true,
        };

        self.write_log_entry(&entry)
    }

    pub fn log_startup(&self, version: &str, model: &str, shell: &str) -> Result<()> {
        let context = LogContext::new()
            .with_component("system".to_string())
            .with_operation("startup".to_string())
            .with_model(model.to_string())
            .with_shell(shell.to_string());

        self.log_info(
            LogCategory::System,
            format!("local-agent {} started", version),
            Some(context),
        )
    }

    /// Log a call to the inference endpoint
    pub fn log_inference(&self, operation: &str, model: &str, duration_ms: u64, error_code: Option<&str>) -> Result<()> {
        let success = error_code.is_none();
        let mut context = LogContext::new()
            .with_component("inference".to_string())
            .with_operation(operation.to_string())
            .with_model(model.to_string())
            .with_duration_ms(duration_ms)
            .with_success(success);
        if let Some(code) = error_code {
            context = context.with_error_code(code.to_string());
        }

        let level = if success { LogLevel::Info } else { LogLevel::Warning };
        let message = format!(
            "Inference {}: {} ({}ms)",
            operation,
            if success { "success" } else { "failed" },
            duration_ms
        );

        self.write_log_entry(&self.entry(level, LogCategory::Inference, message, Some(context)))
    }

    /// Log the terminal state of one execution gate pass
    pub fn log_execution(&self, state: &str, exit_code: Option<i32>, duration_ms: Option<u64>) -> Result<()> {
        let mut context = LogContext::new()
            .with_component("execution".to_string())
            .with_operation(state.to_string());
        if let Some(code) = exit_code {
            context = context.with_exit_code(code);
        }
        if let Some(ms) = duration_ms {
            context = context.with_duration_ms(ms);
        }

        let level = if state == "spawn_failed" { LogLevel::Warning } else { LogLevel::Info };
        self.write_log_entry(&self.entry(
            level,
            LogCategory::Execution,
            format!("Command {}", state.replace('_', " ")),
            Some(context),
        ))
    }

    fn entry(&self, level: LogLevel, category: LogCategory, message: String, context: Option<LogContext>) -> LogEntry {
        LogEntry {
            timestamp: Utc::now(),
            level,
            category,
            message: self.redact_sensitive_info(&message),
            context,
            is_debug: false,
        }
    }

    fn default_log_file_path() -> Result<PathBuf> {
        let mut log_path =
            dirs::config_dir().ok_or_else(|| anyhow!("Could not find config directory"))?;
        log_path.push("local-agent");
        log_path.push("agent.log");
        Ok(log_path)
    }

    fn write_log_entry(&self, entry: &LogEntry) -> Result<()> {
        let mut writer_guard = self
            .writer
            .lock()
            .map_err(|_| anyhow!("Failed to acquire log writer lock"))?;

        if writer_guard.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.log_file_path)?;
            *writer_guard = Some(file);
        }

        if let Some(ref mut file) = *writer_guard {
            writeln!(file, "{}", self.format_log_entry(entry))?;
            file.flush()?;
        }

        Ok(())
    }

    fn format_log_entry(&self, entry: &LogEntry) -> String {
        let timestamp = entry.timestamp.format("%Y-%m-%d %H:%M:%S UTC");
        let level = format!("{:?}", entry.level).to_uppercase();
        let category = format!("{:?}", entry.category).to_uppercase();

        let mut formatted = format!("[{}] {} {} {}", timestamp, level, category, entry.message);

        if let Some(ref context) = entry.context {
            let mut parts = Vec::new();

            if let Some(ref component) = context.component {
                parts.push(format!("component={}", component));
            }
            if let Some(ref operation) = context.operation {
                parts.push(format!("operation={}", operation));
            }
            if let Some(duration) = context.duration_ms {
                parts.push(format!("duration={}ms", duration));
            }
            if let Some(ref error_code) = context.error_code {
                parts.push(format!("error={}", error_code));
            }
            if let Some(ref model) = context.model {
                parts.push(format!("model={}", model));
            }
            if let Some(ref shell) = context.shell {
                parts.push(format!("shell={}", shell));
            }
            if let Some(code) = context.exit_code {
                parts.push(format!("exit_code={}", code));
            }
            if let Some(success) = context.success {
                parts.push(format!("success={}", success));
            }

            if !parts.is_empty() {
                formatted.push_str(&format!(" [{}]", parts.join(", ")));
            }
        }

        if entry.is_debug {
            formatted = format!("🐛 DEBUG: {}", formatted);
        }

        formatted
    }

    fn redact_sensitive_info(&self, message: &str) -> String {
        if self.debug_mode {
            return message.to_string();
        }

        static PATTERNS: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
        let patterns = PATTERNS.get_or_init(|| {
            [
                (r"/home/[^/\s]+", "/home/[USER]"),
                (r"/Users/[^/\s]+", "/Users/[USER]"),
                (r"api_key=\S+", "api_key=[REDACTED]"),
                (r"token=\S+", "token=[REDACTED]"),
                (r"password=\S+", "password=[REDACTED]"),
                (r"://[^@/\s]+@", "://[REDACTED]@"),
            ]
            .into_iter()
            .filter_map(|(pattern, replacement)| Regex::new(pattern).ok().map(|re| (re, replacement)))
            .collect()
        });

        let mut redacted = message.to_string();
        for (pattern, replacement) in patterns {
            redacted = pattern.replace_all(&redacted, *replacement).to_string();
        }
        redacted
    }

    pub fn log_path(&self) -> &PathBuf {
        &self.log_file_path
    }
}

static GLOBAL_LOGGER: OnceLock<Arc<Mutex<AgentLogger>>> = OnceLock::new();

/// Initialize the global logger
pub fn init_logger(debug: bool) -> Result<()> {
    let mut logger = AgentLogger::new()?;
    if debug {
        logger.enable_debug_mode()?;
    }
    let _ = GLOBAL_LOGGER.set(Arc::new(Mutex::new(logger)));
    Ok(())
}

/// Get the global logger instance
pub fn get_logger() -> Result<Arc<Mutex<AgentLogger>>> {
    GLOBAL_LOGGER
        .get()
        .cloned()
        .ok_or_else(|| anyhow!("Logger not initialized. Call init_logger() first."))
}

#[macro_export]
macro_rules! log_error {
    ($category:expr, $message:expr) => {
        if let Ok(logger) = $crate::logging::get_logger() {
            if let Ok(logger_guard) = logger.lock() {
                let _ = logger_guard.log_error($category, $message.to_string(), None);
            }
        }
    };
    ($category:expr, $message:expr, $context:expr) => {
        if let Ok(logger) = $crate::logging::get_logger() {
            if let Ok(logger_guard) = logger.lock() {
                let _ = logger_guard.log_error($category, $message.to_string(), Some($context));
            }
        }
    };
}

#[macro_export]
macro_rules! log_warning {
    ($category:expr, $message:expr) => {
        if let Ok(logger) = $crate::logging::get_logger() {
            if let Ok(logger_guard) = logger.lock() {
                let _ = logger_guard.log_warning($category, $message.to_string(), None);
            }
        }
    };
    ($category:expr, $message:expr, $context:expr) => {
        if let Ok(logger) = $crate::logging::get_logger() {
            if let Ok(logger_guard) = logger.lock() {
                let _ = logger_guard.log_warning($category, $message.to_string(), Some($context));
            }
        }
    };
}

#[macro_export]
macro_rules! log_info {
    ($category:expr, $message:expr) => {
        if let Ok(logger) = $crate::logging::get_logger() {
            if let Ok(logger_guard) = logger.lock() {
                let _ = logger_guard.log_info($category, $message.to_string(), None);
            }
        }
    };
    ($category:expr, $message:expr, $context:expr) => {
        if let Ok(logger) = $crate::logging::get_logger() {
            if let Ok(logger_guard) = logger.lock() {
                let _ = logger_guard.log_info($category, $message.to_string(), Some($context));
            }
        }
    };
}

#[macro_export]
macro_rules! log_debug {
    ($category:expr, $message:expr) => {
        if let Ok(logger) = $crate::logging::get_logger() {
            if let Ok(logger_guard) = logger.lock() {
                let _ = logger_guard.log_debug($category, $message.to_string(), None);
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn create_test_logger() -> (AgentLogger, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let logger = AgentLogger::with_path(temp_dir.path().join("logs").join("agent.log")).unwrap();
        (logger, temp_dir)
    }

    #[test]
    fn test_log_error_writes_level_and_category() {
        let (logger, _temp_dir) = create_test_logger();

        logger
            .log_error(LogCategory::Inference, "endpoint down".to_string(), None)
            .unwrap();

        let log_content = fs::read_to_string(logger.log_path()).unwrap();
        assert!(log_content.contains("ERROR INFERENCE endpoint down"));
    }

    #[test]
    fn test_debug_logs_only_in_debug_mode() {
        let (mut logger, _temp_dir) = create_test_logger();

        logger
            .log_debug(LogCategory::Execution, "ls -la".to_string(), None)
            .unwrap();
        assert!(!logger.log_path().exists());

        logger.enable_debug_mode().unwrap();
        logger
            .log_debug(LogCategory::Execution, "ls -la".to_string(), None)
            .unwrap();

        let log_content = fs::read_to_string(logger.log_path()).unwrap();
        assert!(log_content.contains("🐛 DEBUG"));
        assert!(log_content.contains("[DEBUG] ls -la"));
    }

    #[test]
    fn test_redact_sensitive_info() {
        let (logger, _temp_dir) = create_test_logger();

        let redacted = logger.redact_sensitive_info(
            "cwd /home/alex/project token=abc123 url http://user:pw@localhost:11434",
        );

        assert!(redacted.contains("/home/[USER]/project"));
        assert!(redacted.contains("token=[REDACTED]"));
        assert!(redacted.contains("http://[REDACTED]@localhost:11434"));
        assert!(!redacted.contains("alex"));
        assert!(!redacted.contains("abc123"));
    }

    #[test]
    fn test_log_inference_failure_is_warning() {
        let (logger, _temp_dir) = create_test_logger();

        logger
            .log_inference("converse", "llama3:8b", 12, Some("unavailable"))
            .unwrap();

        let log_content = fs::read_to_string(logger.log_path()).unwrap();
        assert!(log_content.contains("WARNING INFERENCE Inference converse: failed (12ms)"));
        assert!(log_content.contains("error=unavailable"));
        assert!(log_content.contains("model=llama3:8b"));
    }

    #[test]
    fn test_log_execution_context() {
        let (logger, _temp_dir) = create_test_logger();

        logger.log_execution("executed", Some(2), Some(40)).unwrap();

        let log_content = fs::read_to_string(logger.log_path()).unwrap();
        assert!(log_content.contains("INFO EXECUTION Command executed"));
        assert!(log_content.contains("exit_code=2"));
        assert!(log_content.contains("duration=40ms"));
    }

    #[test]
    fn test_log_entry_formatting() {
        let (logger, _temp_dir) = create_test_logger();

        let entry = LogEntry {
            timestamp: Utc::now(),
            level: LogLevel::Warning,
            category: LogCategory::Session,
            message: "Test formatting".to_string(),
            context: Some(
                LogContext::new()
                    .with_component("session".to_string())
                    .with_shell("fish".to_string())
                    .with_success(false),
            ),
            is_debug: false,
        };

        let formatted = logger.format_log_entry(&entry);
        assert!(formatted.contains("WARNING SESSION Test formatting"));
        assert!(formatted.contains("[component=session, shell=fish, success=false]"));
    }
}

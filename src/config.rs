use crate::error_handling::{display_info, display_warning, enhance_error, AgentError};
use crate::logging::{get_logger, LogCategory, LogContext};
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_ollama_url")]
    pub ollama_url: String,

    #[serde(default = "default_ai_timeout")]
    pub ai_timeout: u64,

    /// Info strings that mark a fenced block as executable
    #[serde(default = "default_command_languages")]
    pub command_languages: Vec<String>,

    #[serde(default = "default_fence")]
    pub fence: String,

    /// Shell path override; `$SHELL` is used when absent
    #[serde(default)]
    pub shell: Option<String>,

    #[serde(default)]
    pub max_context_turns: Option<usize>,

    #[serde(default = "default_max_output_chars")]
    pub max_output_chars: usize,

    #[serde(default)]
    pub follow_up_rounds: u32,

    #[serde(default)]
    pub temperature: Option<f32>,
}

fn default_model() -> String {
    "llama3:8b".to_string()
}

fn default_ollama_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_ai_timeout() -> u64 {
    120000 // 2 minutes; first replies from a cold model are slow
}

fn default_command_languages() -> Vec<String> {
    vec!["bash".to_string(), "shell".to_string(), "sh".to_string()]
}

fn default_fence() -> String {
    "```".to_string()
}

fn default_max_output_chars() -> usize {
    4000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model: default_model(),
            ollama_url: default_ollama_url(),
            ai_timeout: default_ai_timeout(),
            command_languages: default_command_languages(),
            fence: default_fence(),
            shell: None,
            max_context_turns: None,
            max_output_chars: default_max_output_chars(),
            follow_up_rounds: 0,
            temperature: None,
        }
    }
}

impl Config {
    /// Load from the default location under the user's config directory
    pub fn load() -> Self {
        Self::load_from(Self::get_config_path())
    }

    /// Load from `path`, falling back to defaults on any problem.
    ///
    /// A missing file is created with the defaults. An unreadable or invalid
    /// file is left alone so the user can fix it, and defaults are used for
    /// this run.
    pub fn load_from(config_path: Option<PathBuf>) -> Self {
        let Some(path) = config_path else {
            return Self::default();
        };

        if !path.exists() {
            let config = Self::default();
            if let Err(e) = config.save_to(&path) {
                display_warning(&format!("Could not write default configuration: {}", e));
            }
            return config;
        }

        match Self::read_file(&path) {
            Ok(config) => {
                if let Ok(logger) = get_logger() {
                    if let Ok(logger_guard) = logger.lock() {
                        let context = LogContext::new()
                            .with_component("config".to_string())
                            .with_operation("load".to_string())
                            .with_model(config.model.clone());
                        let _ = logger_guard.log_info(
                            LogCategory::Configuration,
                            "Configuration loaded".to_string(),
                            Some(context),
                        );
                    }
                }
                config
            }
            Err(e) => {
                if let Ok(logger) = get_logger() {
                    if let Ok(logger_guard) = logger.lock() {
                        let _ = logger_guard.log_warning(
                            LogCategory::Configuration,
                            format!("Invalid configuration, using defaults: {}", e),
                            None,
                        );
                    }
                }
                enhance_error(&AgentError::Configuration(e.to_string())).display();
                display_info("Using defaults for this session.");
                Self::default()
            }
        }
    }

    fn read_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.ai_timeout == 0 {
            return Err(anyhow!("ai_timeout must be greater than 0"));
        }

        if self.ai_timeout > 600000 {
            return Err(anyhow!("ai_timeout cannot exceed 10 minutes (600000ms)"));
        }

        if !self.ollama_url.starts_with("http://") && !self.ollama_url.starts_with("https://") {
            return Err(anyhow!("ollama_url must be a valid HTTP/HTTPS URL"));
        }

        if self.model.trim().is_empty() {
            return Err(anyhow!("model name cannot be empty"));
        }

        if self.command_languages.iter().all(|l| l.trim().is_empty()) {
            return Err(anyhow!("command_languages must name at least one language"));
        }

        if self.fence.len() < 3 || !(self.fence.chars().all(|c| c == '`') || self.fence.chars().all(|c| c == '~')) {
            return Err(anyhow!("fence must be at least three backticks or tildes"));
        }

        if self.max_context_turns == Some(0) {
            return Err(anyhow!("max_context_turns must be greater than 0 when set"));
        }

        if self.max_output_chars == 0 {
            return Err(anyhow!("max_output_chars must be greater than 0"));
        }

        if self.follow_up_rounds > 5 {
            return Err(anyhow!("follow_up_rounds cannot exceed 5"));
        }

        if let Some(t) = self.temperature {
            if !(0.0..=2.0).contains(&t) {
                return Err(anyhow!("temperature must be between 0.0 and 2.0"));
            }
        }

        Ok(())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        self.validate()?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn get_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|mut path| {
            path.push("local-agent");
            path.push("config.json");
            path
        })
    }
}

use crate::config::Config;
use crate::dialect::{normalize_with_report, ShellDialect};
use crate::logging::{LogCategory, LogContext};
use crate::{log_debug, log_info};

/// A command found in a model reply, ready for the execution gate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandCandidate {
    /// Block contents after cleanup, before dialect rewriting
    pub raw_text: String,
    pub normalized_text: String,
    pub source_turn_index: usize,
    pub needs_review: bool,
}

/// Finds executable commands in model replies.
///
/// A command is the contents of a fenced block whose info string names one of
/// the configured command languages. Everything else in the reply is prose.
pub struct CommandExtractor {
    fence: String,
    languages: Vec<String>,
    dialect: ShellDialect,
}

enum Fence<'a> {
    Open(&'a str),
    Close,
}

enum BlockState {
    Prose,
    Command { lines: Vec<String>, ambiguous: bool },
    Other,
}

impl CommandExtractor {
    pub fn new(fence: &str, languages: &[String], dialect: ShellDialect) -> Self {
        Self {
            fence: fence.to_string(),
            languages: languages.iter().map(|l| l.trim().to_lowercase()).collect(),
            dialect,
        }
    }

    pub fn from_config(config: &Config, dialect: ShellDialect) -> Self {
        Self::new(&config.fence, &config.command_languages, dialect)
    }

    pub fn languages(&self) -> &[String] {
        &self.languages
    }

    pub fn fence(&self) -> &str {
        &self.fence
    }

    /// Extract the ordered command candidates from one assistant reply
    pub fn extract(&self, response: &str, source_turn_index: usize) -> Vec<CommandCandidate> {
        let mut candidates = Vec::new();
        let mut state = BlockState::Prose;
        let mut discarded = 0usize;

        for line in response.lines() {
            let fence = self.classify_fence(line);

            state = match (state, fence) {
                (BlockState::Prose, Some(Fence::Open(info))) => {
                    if self.is_command_language(info) {
                        BlockState::Command {
                            lines: Vec::new(),
                            ambiguous: false,
                        }
                    } else {
                        BlockState::Other
                    }
                }
                (BlockState::Prose, Some(Fence::Close)) => BlockState::Other,
                (BlockState::Prose, None) => BlockState::Prose,

                (BlockState::Other, Some(Fence::Close)) => BlockState::Prose,
                (BlockState::Other, _) => BlockState::Other,

                (BlockState::Command { lines, ambiguous }, Some(Fence::Close)) => {
                    if ambiguous {
                        discarded += 1;
                    } else if let Some(candidate) = self.build_candidate(&lines, source_turn_index) {
                        candidates.push(candidate);
                    }
                    BlockState::Prose
                }
                (BlockState::Command { lines, .. }, Some(Fence::Open(_))) => BlockState::Command {
                    lines,
                    ambiguous: true,
                },
                (BlockState::Command { mut lines, ambiguous }, None) => {
                    lines.push(line.to_string());
                    BlockState::Command { lines, ambiguous }
                }
            };
        }

        if discarded > 0 {
            log_debug!(
                LogCategory::Extraction,
                format!("Discarded {} ambiguous command block(s)", discarded)
            );
        }
        log_info!(
            LogCategory::Extraction,
            format!("Extracted {} command candidate(s)", candidates.len()),
            LogContext::new()
                .with_component("extraction".to_string())
                .with_operation("extract".to_string())
        );

        candidates
    }

    fn classify_fence<'a>(&self, line: &'a str) -> Option<Fence<'a>> {
        let trimmed = line.trim();
        if !trimmed.starts_with(self.fence.as_str()) {
            return None;
        }

        let fence_char = self.fence.chars().next()?;
        let info = trimmed.trim_start_matches(fence_char).trim();

        if info.is_empty() {
            return Some(Fence::Close);
        }
        // a fenced span opened and closed on one line is inline code
        if info.ends_with(self.fence.as_str()) {
            return None;
        }
        Some(Fence::Open(info))
    }

    fn is_command_language(&self, info: &str) -> bool {
        info.split_whitespace()
            .next()
            .map(|lang| lang.to_lowercase())
            .is_some_and(|lang| self.languages.iter().any(|l| *l == lang))
    }

    fn build_candidate(&self, lines: &[String], source_turn_index: usize) -> Option<CommandCandidate> {
        let raw_text = clean_block(lines);
        if raw_text.is_empty() {
            return None;
        }

        let normalized = normalize_with_report(&raw_text, self.dialect);
        if normalized.changed {
            log_debug!(
                LogCategory::Extraction,
                format!("Rewrote '{}' as '{}'", raw_text, normalized.text)
            );
        }
        if normalized.needs_review {
            log_debug!(LogCategory::Extraction, format!("Needs review: {}", raw_text));
        }

        Some(CommandCandidate {
            normalized_text: normalized.text,
            needs_review: normalized.needs_review,
            raw_text,
            source_turn_index,
        })
    }
}

/// Tidy a block for execution.
///
/// The block's common indentation is removed; relative indentation stays.
/// Blank lines, comment lines and leading `$ ` prompts are dropped, except
/// inside heredoc bodies, which are kept verbatim.
fn clean_block(lines: &[String]) -> String {
    let indent = lines
        .iter()
        .filter(|line| !line.trim().is_empty())
        .map(|line| leading_whitespace(line))
        .min()
        .unwrap_or(0);

    let mut cleaned = Vec::new();
    let mut heredoc: Option<String> = None;

    for line in lines {
        let cut = indent.min(leading_whitespace(line));
        let line = line.get(cut..).unwrap_or_else(|| line.trim_start());

        if let Some(delimiter) = &heredoc {
            if line.trim() == delimiter {
                heredoc = None;
            }
            cleaned.push(line.to_string());
            continue;
        }

        let trimmed = line.trim_start();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = match trimmed.strip_prefix("$ ") {
            Some(rest) => rest.trim_start(),
            None => line,
        };
        if line.trim().is_empty() {
            continue;
        }

        heredoc = heredoc_delimiter(line);
        cleaned.push(line.trim_end().to_string());
    }

    cleaned.join("\n")
}

fn leading_whitespace(line: &str) -> usize {
    line.len() - line.trim_start().len()
}

/// The terminator of a heredoc opened on this line, if any
fn heredoc_delimiter(line: &str) -> Option<String> {
    let mut rest = line;
    loop {
        let start = rest.find("<<")?;
        let after = &rest[start + 2..];
        // `<<<` is a here-string
        if let Some(stripped) = after.strip_prefix('<') {
            rest = stripped.trim_start_matches('<');
            continue;
        }

        let word = after.strip_prefix('-').unwrap_or(after).trim_start();
        let delimiter: String = match word.chars().next() {
            Some(quote @ ('\'' | '"')) => word[1..].chars().take_while(|c| *c != quote).collect(),
            _ => word
                .chars()
                .take_while(|c| !c.is_whitespace() && !";|&<>()".contains(*c))
                .filter(|c| !matches!(c, '\\' | '\'' | '"'))
                .collect(),
        };

        if delimiter.starts_with(|c: char| c.is_alphabetic() || c == '_') {
            return Some(delimiter);
        }
        rest = after;
    }
}

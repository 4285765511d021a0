use crate::error_handling::AgentError;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::path::{Path, PathBuf};

const FALLBACK_SHELL: &str = "/bin/sh";

/// Shell syntax family the host shell speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShellDialect {
    Posix,
    Fish,
}

impl ShellDialect {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShellDialect::Posix => "posix",
            ShellDialect::Fish => "fish",
        }
    }
}

impl fmt::Display for ShellDialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The shell commands run through, resolved once at startup
#[derive(Debug, Clone, PartialEq)]
pub struct ShellEnvironment {
    pub program: PathBuf,
    pub dialect: ShellDialect,
    /// Why the requested shell was replaced by `/bin/sh`, if it was
    pub fallback_reason: Option<String>,
}

impl ShellEnvironment {
    /// Resolve the active shell from the configured override or `$SHELL`
    pub fn detect(configured: Option<&str>) -> Result<Self, AgentError> {
        let requested = configured
            .map(str::to_string)
            .or_else(|| std::env::var("SHELL").ok());
        Self::resolve(requested.as_deref(), |path| path.exists())
    }

    fn resolve(requested: Option<&str>, exists: impl Fn(&Path) -> bool) -> Result<Self, AgentError> {
        let fallback = |reason: String| {
            let sh = Path::new(FALLBACK_SHELL);
            if exists(sh) {
                Ok(Self {
                    program: sh.to_path_buf(),
                    dialect: ShellDialect::Posix,
                    fallback_reason: Some(reason),
                })
            } else {
                Err(AgentError::ShellDetection(format!(
                    "{}, and {} is not available",
                    reason, FALLBACK_SHELL
                )))
            }
        };

        let Some(path) = requested.map(str::trim).filter(|p| !p.is_empty()) else {
            return fallback("SHELL is not set".to_string());
        };

        if !exists(Path::new(path)) {
            return fallback(format!("{} does not exist", path));
        }

        match Self::classify(path) {
            Some(dialect) => Ok(Self {
                program: PathBuf::from(path),
                dialect,
                fallback_reason: None,
            }),
            None => fallback(format!("{} is not a supported shell", path)),
        }
    }

    /// Map a shell path to its dialect by file name
    pub fn classify(path: &str) -> Option<ShellDialect> {
        let name = Path::new(path).file_name()?.to_str()?;
        match name {
            "fish" => Some(ShellDialect::Fish),
            "bash" | "zsh" | "sh" | "dash" | "ksh" | "mksh" | "ash" => Some(ShellDialect::Posix),
            _ => None,
        }
    }

    pub fn name(&self) -> String {
        self.program
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(FALLBACK_SHELL)
            .to_string()
    }
}

/// Outcome of normalizing one command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Normalized {
    pub text: String,
    pub changed: bool,
    /// The command used a construct with no mechanical translation and was left as is
    pub needs_review: bool,
}

/// Rewrite `command` so it is valid for `dialect`
pub fn normalize(command: &str, dialect: ShellDialect) -> String {
    normalize_with_report(command, dialect).text
}

pub fn normalize_with_report(command: &str, dialect: ShellDialect) -> Normalized {
    match rewrite(command, dialect) {
        Ok(text) => Normalized {
            changed: text != command,
            text,
            needs_review: false,
        },
        Err(_) => Normalized {
            text: command.to_string(),
            changed: false,
            needs_review: true,
        },
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Unsupported(&'static str);

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Word(String),
    Op(&'static str),
}

#[derive(Debug, Clone, Default)]
struct Features {
    heredoc: bool,
    process_subst: bool,
    arithmetic: bool,
    subst_in_dquote: bool,
    param_operator: bool,
}

impl Features {
    fn check_fish(&self) -> Result<(), Unsupported> {
        if self.heredoc {
            return Err(Unsupported("heredoc"));
        }
        if self.process_subst {
            return Err(Unsupported("process substitution"));
        }
        if self.arithmetic {
            return Err(Unsupported("arithmetic expansion"));
        }
        if self.subst_in_dquote {
            return Err(Unsupported("substitution inside double quotes"));
        }
        if self.param_operator {
            return Err(Unsupported("parameter expansion operator"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Statement {
    words: Vec<String>,
    sep: Option<&'static str>,
}

fn rewrite(command: &str, dialect: ShellDialect) -> Result<String, Unsupported> {
    let (tokens, features) = Lexer::new(command).tokenize()?;
    let original = split_statements(tokens.clone());

    let rewritten = match dialect {
        ShellDialect::Fish => {
            features.check_fish()?;
            to_fish(split_statements(merge_tests(tokens)?))?
        }
        ShellDialect::Posix => {
            // heredoc bodies are data, not statements
            if features.heredoc {
                return Err(Unsupported("heredoc"));
            }
            to_posix(original.clone())?
        }
    };

    if rewritten == original {
        Ok(command.to_string())
    } else {
        Ok(render(&rewritten))
    }
}

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    features: Features,
}

impl Lexer {
    fn new(input: &str) -> Self {
        Self {
            chars: input.chars().collect(),
            pos: 0,
            features: Features::default(),
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn op(&mut self, tokens: &mut Vec<Token>, op: &'static str) {
        self.pos += op.len();
        tokens.push(Token::Op(op));
    }

    fn tokenize(mut self) -> Result<(Vec<Token>, Features), Unsupported> {
        let mut tokens = Vec::new();

        while let Some(c) = self.peek() {
            match c {
                ' ' | '\t' | '\r' => self.pos += 1,
                '\\' if self.peek_at(1) == Some('\n') => self.pos += 2,
                '\n' => self.op(&mut tokens, "\n"),
                '#' => {
                    while self.peek().is_some_and(|c| c != '\n') {
                        self.pos += 1;
                    }
                }
                ';' if self.peek_at(1) == Some(';') => self.op(&mut tokens, ";;"),
                ';' => self.op(&mut tokens, ";"),
                '&' if self.peek_at(1) == Some('&') => self.op(&mut tokens, "&&"),
                '&' if self.peek_at(1) != Some('>') => self.op(&mut tokens, "&"),
                '|' if self.peek_at(1) == Some('|') => self.op(&mut tokens, "||"),
                '|' if self.peek_at(1) == Some('&') => self.op(&mut tokens, "|&"),
                '|' => self.op(&mut tokens, "|"),
                '(' if matches!(tokens.last(), None | Some(Token::Op(_))) => self.op(&mut tokens, "("),
                ')' => self.op(&mut tokens, ")"),
                _ => {
                    let word = self.word()?;
                    tokens.push(Token::Word(word));
                }
            }
        }

        Ok((tokens, self.features))
    }

    fn take_until(&mut self, end: usize, out: &mut String) {
        out.extend(&self.chars[self.pos..=end]);
        self.pos = end + 1;
    }

    fn word(&mut self) -> Result<String, Unsupported> {
        let mut out = String::new();

        while let Some(c) = self.peek() {
            match c {
                ' ' | '\t' | '\r' | '\n' | ';' | '|' | ')' => break,
                '&' if (out.is_empty() && self.peek_at(1) == Some('>'))
                    || out.ends_with('>')
                    || out.ends_with('<') =>
                {
                    out.push(c);
                    self.pos += 1;
                }
                '&' => break,
                '\\' => {
                    if self.peek_at(1) == Some('\n') {
                        self.pos += 2;
                        continue;
                    }
                    out.push(c);
                    self.pos += 1;
                    if let Some(next) = self.peek() {
                        out.push(next);
                        self.pos += 1;
                    }
                }
                '\'' => {
                    let end = find_char(&self.chars, self.pos + 1, '\'')
                        .ok_or(Unsupported("unterminated quote"))?;
                    self.take_until(end, &mut out);
                }
                '"' => self.double_quoted(&mut out)?,
                '`' => {
                    let end = find_backtick(&self.chars, self.pos + 1)
                        .ok_or(Unsupported("unterminated backtick"))?;
                    self.take_until(end, &mut out);
                }
                '$' if self.peek_at(1) == Some('(') => {
                    if self.peek_at(2) == Some('(') {
                        self.features.arithmetic = true;
                    }
                    let end = matching_paren(&self.chars, self.pos + 1)
                        .ok_or(Unsupported("unbalanced parenthesis"))?;
                    self.take_until(end, &mut out);
                }
                '$' if self.peek_at(1) == Some('{') => {
                    let end = find_char(&self.chars, self.pos + 2, '}')
                        .ok_or(Unsupported("unterminated parameter expansion"))?;
                    let inner: String = self.chars[self.pos + 2..end].iter().collect();
                    if !is_identifier(&inner) {
                        self.features.param_operator = true;
                    }
                    self.take_until(end, &mut out);
                }
                '(' => {
                    let end = matching_paren(&self.chars, self.pos)
                        .ok_or(Unsupported("unbalanced parenthesis"))?;
                    self.take_until(end, &mut out);
                }
                '<' | '>' => {
                    match self.peek_at(1) {
                        Some('<') if c == '<' => self.features.heredoc = true,
                        Some('(') => self.features.process_subst = true,
                        _ => {}
                    }
                    out.push(c);
                    self.pos += 1;
                }
                _ => {
                    out.push(c);
                    self.pos += 1;
                }
            }
        }

        Ok(out)
    }

    fn double_quoted(&mut self, out: &mut String) -> Result<(), Unsupported> {
        out.push('"');
        self.pos += 1;

        loop {
            let c = self.peek().ok_or(Unsupported("unterminated quote"))?;
            out.push(c);
            self.pos += 1;

            match c {
                '\\' => {
                    if let Some(next) = self.peek() {
                        out.push(next);
                        self.pos += 1;
                    }
                }
                '"' => return Ok(()),
                '`' => self.features.subst_in_dquote = true,
                '$' => match self.peek() {
                    Some('(') => self.features.subst_in_dquote = true,
                    Some('{') => {
                        let inner_ok = find_char(&self.chars, self.pos + 1, '}').is_some_and(|end| {
                            let inner: String = self.chars[self.pos + 1..end].iter().collect();
                            is_identifier(&inner)
                        });
                        if !inner_ok {
                            self.features.param_operator = true;
                        }
                    }
                    _ => {}
                },
                _ => {}
            }
        }
    }
}

fn find_char(chars: &[char], from: usize, target: char) -> Option<usize> {
    (from..chars.len()).find(|&i| chars[i] == target)
}

fn find_backtick(chars: &[char], from: usize) -> Option<usize> {
    let mut i = from;
    while i < chars.len() {
        match chars[i] {
            '\\' => i += 1,
            '`' => return Some(i),
            _ => {}
        }
        i += 1;
    }
    None
}

/// Index of the `)` closing the `(` at `open`, skipping quoted text
fn matching_paren(chars: &[char], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut i = open;

    while i < chars.len() {
        match chars[i] {
            '\\' => i += 1,
            '\'' => i = find_char(chars, i + 1, '\'')?,
            '"' => {
                i += 1;
                while i < chars.len() && chars[i] != '"' {
                    if chars[i] == '\\' {
                        i += 1;
                    }
                    i += 1;
                }
                if i >= chars.len() {
                    return None;
                }
            }
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
        i += 1;
    }

    None
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn split_assignment(word: &str) -> Option<(&str, &str)> {
    let (name, value) = word.split_once('=')?;
    is_identifier(name).then_some((name, value))
}

fn split_statements(tokens: Vec<Token>) -> Vec<Statement> {
    let mut statements = Vec::new();
    let mut words = Vec::new();

    for token in tokens {
        match token {
            Token::Word(w) => words.push(w),
            Token::Op(op) => statements.push(Statement {
                words: std::mem::take(&mut words),
                sep: Some(op),
            }),
        }
    }

    if !words.is_empty() {
        statements.push(Statement { words, sep: None });
    }

    statements
}

fn render(statements: &[Statement]) -> String {
    let mut out = String::new();

    for statement in statements {
        out.push_str(&statement.words.join(" "));
        if let Some(sep) = statement.sep {
            out.push_str(match sep {
                ";" => "; ",
                "\n" => "\n",
                "(" => "(",
                ")" => ")",
                "&&" => " && ",
                "||" => " || ",
                "|" => " | ",
                "|&" => " |& ",
                "&" => " & ",
                ";;" => ";; ",
                _ => " ",
            });
        }
    }

    out.trim().to_string()
}

/// Collapse `[[ ... ]]` into a fish `test` invocation
fn merge_tests(tokens: Vec<Token>) -> Result<Vec<Token>, Unsupported> {
    let mut out = Vec::with_capacity(tokens.len());
    let mut in_test = false;

    for token in tokens {
        match token {
            Token::Word(w) if w == "=~" => return Err(Unsupported("regex match")),
            Token::Word(w) if w == "[[" && !in_test => {
                in_test = true;
                out.push(Token::Word("test".to_string()));
            }
            Token::Word(w) if w == "]]" && in_test => in_test = false,
            Token::Word(w) if in_test && w == "==" => out.push(Token::Word("=".to_string())),
            Token::Word(w) if in_test && (w.starts_with('<') || w.starts_with('>')) => {
                return Err(Unsupported("string ordering in test"))
            }
            Token::Op("&&") if in_test => out.push(Token::Word("-a".to_string())),
            Token::Op("||") if in_test => out.push(Token::Word("-o".to_string())),
            Token::Op(_) if in_test => return Err(Unsupported("grouping inside test")),
            other => out.push(other),
        }
    }

    if in_test {
        return Err(Unsupported("unterminated test"));
    }
    Ok(out)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Block {
    If,
    Loop,
    Begin,
}

fn to_fish(statements: Vec<Statement>) -> Result<Vec<Statement>, Unsupported> {
    let mut out = Vec::new();
    let mut blocks = Vec::new();

    for statement in statements {
        if matches!(statement.sep, Some("(") | Some(")") | Some(";;") | Some("|&")) {
            return Err(Unsupported("subshell or operator without fish equivalent"));
        }
        if statement.words.is_empty() {
            out.push(statement);
            continue;
        }

        let words = statement
            .words
            .iter()
            .map(|w| fish_word(w))
            .collect::<Result<Vec<_>, _>>()?;
        let (prefix, rest) = fish_block_prefix(words, &mut blocks)?;
        let mut commands = fish_command(rest)?;

        if prefix.is_empty() && commands.is_empty() {
            // keyword-only line such as `then` or `do`
            continue;
        }
        if commands.is_empty() {
            commands.push(Vec::new());
        }
        let mut first = prefix;
        first.append(&mut commands[0]);
        commands[0] = first;

        let last = commands.len() - 1;
        for (i, words) in commands.into_iter().enumerate() {
            out.push(Statement {
                words,
                sep: if i == last { statement.sep } else { Some(";") },
            });
        }
    }

    if !blocks.is_empty() {
        return Err(Unsupported("unbalanced block"));
    }
    Ok(out)
}

fn expect_block(blocks: &[Block], kind: Block) -> Result<(), Unsupported> {
    if blocks.last() == Some(&kind) {
        Ok(())
    } else {
        Err(Unsupported("unbalanced block"))
    }
}

/// Split leading block keywords off a statement, translating them for fish
fn fish_block_prefix(
    words: Vec<String>,
    blocks: &mut Vec<Block>,
) -> Result<(Vec<String>, Vec<String>), Unsupported> {
    let mut prefix: Vec<String> = Vec::new();
    let mut rest: VecDeque<String> = words.into();

    while let Some(word) = rest.front().cloned() {
        match word.as_str() {
            "then" => {
                expect_block(blocks, Block::If)?;
                rest.pop_front();
            }
            "do" => {
                expect_block(blocks, Block::Loop)?;
                rest.pop_front();
            }
            "else" => {
                expect_block(blocks, Block::If)?;
                rest.pop_front();
                prefix.push(word);
                if rest.front().is_some_and(|w| w == "if") {
                    rest.pop_front();
                    prefix.push("if".to_string());
                }
            }
            "elif" => {
                expect_block(blocks, Block::If)?;
                rest.pop_front();
                prefix.extend(["else".to_string(), "if".to_string()]);
            }
            "if" => {
                blocks.push(Block::If);
                rest.pop_front();
                prefix.push(word);
            }
            "while" => {
                blocks.push(Block::Loop);
                rest.pop_front();
                prefix.push(word);
            }
            "until" => {
                blocks.push(Block::Loop);
                rest.pop_front();
                prefix.extend(["while".to_string(), "not".to_string()]);
            }
            "for" => {
                if rest.get(1).is_some_and(|w| w.starts_with("((")) {
                    return Err(Unsupported("arithmetic for loop"));
                }
                blocks.push(Block::Loop);
                prefix.extend(rest.drain(..));
            }
            "begin" => {
                blocks.push(Block::Begin);
                rest.pop_front();
                prefix.push(word);
            }
            "fi" | "done" | "end" => {
                if rest.len() != 1 {
                    return Err(Unsupported("redirection on block end"));
                }
                let top = blocks.pop().ok_or(Unsupported("unbalanced block"))?;
                let expected = match word.as_str() {
                    "fi" => Some(Block::If),
                    "done" => Some(Block::Loop),
                    _ => None,
                };
                if expected.is_some_and(|kind| kind != top) {
                    return Err(Unsupported("unbalanced block"));
                }
                rest.clear();
                prefix.push("end".to_string());
            }
            "!" | "not" => {
                rest.pop_front();
                prefix.push(word);
            }
            "case" | "esac" | "select" | "function" | "switch" | "coproc" | "{" | "}" => {
                return Err(Unsupported("compound command without fish equivalent"));
            }
            _ => break,
        }
    }

    Ok((prefix, rest.into()))
}

fn fish_command(words: Vec<String>) -> Result<Vec<Vec<String>>, Unsupported> {
    let Some(first) = words.first() else {
        return Ok(Vec::new());
    };

    if first.ends_with("()") || words.get(1).is_some_and(|w| w == "()") {
        return Err(Unsupported("function definition"));
    }

    match first.as_str() {
        "export" => {
            let args = &words[1..];
            if args.is_empty() {
                return Err(Unsupported("bare export"));
            }
            args.iter()
                .map(|arg| {
                    if let Some((name, value)) = split_assignment(arg) {
                        Ok(fish_set(&["-x"], name, value))
                    } else if is_identifier(arg) {
                        Ok(fish_set(&["-x"], arg, &format!("${}", arg)))
                    } else {
                        Err(Unsupported("export option"))
                    }
                })
                .collect()
        }
        "unset" => {
            let names: Vec<&String> = words[1..].iter().filter(|w| *w != "-v").collect();
            if names.is_empty() || names.iter().any(|n| !is_identifier(n)) {
                return Err(Unsupported("unset option"));
            }
            Ok(names
                .into_iter()
                .map(|name| vec!["set".to_string(), "-e".to_string(), name.clone()])
                .collect())
        }
        _ if words.iter().all(|w| split_assignment(w).is_some()) => Ok(words
            .iter()
            .filter_map(|w| split_assignment(w))
            .map(|(name, value)| fish_set(&[], name, value))
            .collect()),
        _ => Ok(vec![words]),
    }
}

fn fish_set(flags: &[&str], name: &str, value: &str) -> Vec<String> {
    let mut words = vec!["set".to_string()];
    words.extend(flags.iter().map(|f| f.to_string()));
    words.push(name.to_string());
    words.push(if value.is_empty() { "\"\"".to_string() } else { value.to_string() });
    words
}

/// Translate expansions inside a single word for fish
fn fish_word(word: &str) -> Result<String, Unsupported> {
    let chars: Vec<char> = word.chars().collect();
    let mut out = String::with_capacity(word.len());
    let mut in_double = false;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();

        match c {
            '\\' => {
                out.push(c);
                if let Some(n) = next {
                    out.push(n);
                }
                i += 2;
                continue;
            }
            '\'' if !in_double => {
                let end = find_char(&chars, i + 1, '\'').ok_or(Unsupported("unterminated quote"))?;
                out.extend(&chars[i..=end]);
                i = end + 1;
                continue;
            }
            '"' => in_double = !in_double,
            '$' if next == Some('?') => {
                out.push_str("$status");
                i += 2;
                continue;
            }
            '$' if next == Some('{') => {
                let end = find_char(&chars, i + 2, '}').ok_or(Unsupported("unterminated parameter expansion"))?;
                let name: String = chars[i + 2..end].iter().collect();
                if !is_identifier(&name) {
                    return Err(Unsupported("parameter expansion operator"));
                }
                out.push_str(&format!("{{${}}}", name));
                i = end + 1;
                continue;
            }
            '$' if next == Some('(') && !in_double => {
                let end = matching_paren(&chars, i + 1).ok_or(Unsupported("unbalanced parenthesis"))?;
                let inner: String = chars[i + 2..end].iter().collect();
                out.push_str(&format!("({})", rewrite(&inner, ShellDialect::Fish)?));
                i = end + 1;
                continue;
            }
            '`' if !in_double => {
                let end = find_backtick(&chars, i + 1).ok_or(Unsupported("unterminated backtick"))?;
                let inner: String = chars[i + 1..end].iter().collect();
                out.push_str(&format!("({})", rewrite(&inner, ShellDialect::Fish)?));
                i = end + 1;
                continue;
            }
            '{' if !in_double => {
                if let Some((start, stop, end)) = brace_range(&chars, i) {
                    out.push_str(&format!("(seq {} {})", start, stop));
                    i = end + 1;
                    continue;
                }
            }
            _ => {}
        }

        out.push(c);
        i += 1;
    }

    Ok(out)
}

/// Parse `{a..b}` with integer bounds starting at `open`
fn brace_range(chars: &[char], open: usize) -> Option<(String, String, usize)> {
    fn integer(chars: &[char], mut i: usize) -> Option<(String, usize)> {
        let start = i;
        if chars.get(i) == Some(&'-') {
            i += 1;
        }
        let digits_start = i;
        while chars.get(i).is_some_and(|c| c.is_ascii_digit()) {
            i += 1;
        }
        (i > digits_start).then(|| (chars[start..i].iter().collect(), i))
    }

    let (start, i) = integer(chars, open + 1)?;
    if chars.get(i) != Some(&'.') || chars.get(i + 1) != Some(&'.') {
        return None;
    }
    let (stop, i) = integer(chars, i + 2)?;
    (chars.get(i) == Some(&'}')).then_some((start, stop, i))
}

fn to_posix(statements: Vec<Statement>) -> Result<Vec<Statement>, Unsupported> {
    let mut out: Vec<Statement> = Vec::new();

    for statement in statements {
        let mut words = statement
            .words
            .iter()
            .map(|w| posix_word(w))
            .collect::<Result<Vec<_>, _>>()?;

        if let Some(joiner) = match words.first().map(String::as_str) {
            Some("and") => Some("&&"),
            Some("or") => Some("||"),
            _ => None,
        } {
            let previous = out
                .last_mut()
                .filter(|p| !p.words.is_empty() && matches!(p.sep, Some(";") | Some("\n")))
                .ok_or(Unsupported("and/or without a preceding command"))?;
            previous.sep = Some(joiner);
            words.remove(0);
            if words.is_empty() {
                return Err(Unsupported("and/or without a command"));
            }
        }

        if words.first().is_some_and(|w| w == "not") {
            words[0] = "!".to_string();
        }

        let bash_function = words.first().is_some_and(|w| w == "function") && words.iter().any(|w| w == "{");
        if !bash_function
            && words
                .first()
                .is_some_and(|w| matches!(w.as_str(), "function" | "switch" | "begin" | "end"))
        {
            return Err(Unsupported("fish block without posix equivalent"));
        }
        if words.first().is_some_and(|w| w == "set") {
            if let Some(rewritten) = posix_set(&words[1..])? {
                words = rewritten;
            }
        }

        out.push(Statement {
            words,
            sep: statement.sep,
        });
    }

    Ok(out)
}

/// Translate a fish `set` invocation; `None` means it is ordinary POSIX `set`
fn posix_set(args: &[String]) -> Result<Option<Vec<String>>, Unsupported> {
    let mut export = false;
    let mut erase = false;
    let mut i = 0;

    while let Some(flag) = args.get(i).filter(|a| a.starts_with('-')) {
        match flag.as_str() {
            "-x" | "--export" => export = true,
            "-gx" | "-xg" | "-Ux" | "-xU" => export = true,
            "-e" | "--erase" => erase = true,
            "-ge" | "-eg" => erase = true,
            "-g" | "-l" | "-U" | "--global" | "--local" => {}
            _ => return Ok(None),
        }
        i += 1;
    }

    let Some(name) = args.get(i).filter(|n| is_identifier(n)) else {
        return Ok(None);
    };
    let values = &args[i + 1..];

    if erase {
        if values.iter().any(|v| !is_identifier(v)) {
            return Err(Unsupported("set -e with non-variable argument"));
        }
        let mut words = vec!["unset".to_string(), name.clone()];
        words.extend(values.iter().cloned());
        return Ok(Some(words));
    }

    if values.len() > 1 {
        return Err(Unsupported("list assignment"));
    }
    let assignment = format!("{}={}", name, values.first().map(String::as_str).unwrap_or(""));

    Ok(Some(if export {
        vec!["export".to_string(), assignment]
    } else {
        vec![assignment]
    }))
}

/// Translate fish expansions in one word: `$status` becomes `$?` and an
/// unquoted `(cmd)` becomes `$(cmd)`
fn posix_word(word: &str) -> Result<String, Unsupported> {
    let chars: Vec<char> = word.chars().collect();
    let mut out = String::with_capacity(word.len() + 1);
    let mut in_single = false;
    let mut in_double = false;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '\\' if !in_single => {
                out.push(c);
                if let Some(&n) = chars.get(i + 1) {
                    out.push(n);
                }
                i += 2;
                continue;
            }
            '\'' if !in_double => in_single = !in_single,
            '"' if !in_single => in_double = !in_double,
            '`' if !in_single => {
                let end = find_backtick(&chars, i + 1).ok_or(Unsupported("unterminated backtick"))?;
                out.extend(&chars[i..=end]);
                i = end + 1;
                continue;
            }
            '$' if !in_single && chars.get(i + 1) == Some(&'(') => {
                let end = matching_paren(&chars, i + 1).ok_or(Unsupported("unbalanced parenthesis"))?;
                if chars.get(i + 2) == Some(&'(') {
                    out.extend(&chars[i..=end]);
                } else {
                    let inner: String = chars[i + 2..end].iter().collect();
                    out.push_str(&format!("$({})", rewrite(&inner, ShellDialect::Posix)?));
                }
                i = end + 1;
                continue;
            }
            '$' if !in_single => {
                let rest: String = chars[i + 1..].iter().take(7).collect();
                if rest.starts_with("status")
                    && !rest[6..].chars().next().is_some_and(|n| n.is_ascii_alphanumeric() || n == '_')
                {
                    out.push_str("$?");
                    i += 7;
                    continue;
                }
            }
            '(' if !in_single && !in_double && opens_fish_substitution(i.checked_sub(1).map(|p| chars[p])) => {
                let end = matching_paren(&chars, i).ok_or(Unsupported("unbalanced parenthesis"))?;
                let inner: String = chars[i + 1..end].iter().collect();
                out.push_str(&format!("$({})", rewrite(&inner, ShellDialect::Posix)?));
                i = end + 1;
                continue;
            }
            _ => {}
        }
        out.push(c);
        i += 1;
    }

    Ok(out)
}

/// A `(` after these characters is bash syntax (arrays, globs, process
/// substitution, function names), not a fish command substitution
fn opens_fish_substitution(previous: Option<char>) -> bool {
    !previous.is_some_and(|p| {
        p.is_ascii_alphanumeric() || matches!(p, '_' | '$' | '<' | '>' | '=' | '@' | '!' | '?' | '*' | '+')
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fish(cmd: &str) -> String {
        normalize(cmd, ShellDialect::Fish)
    }

    fn posix(cmd: &str) -> String {
        normalize(cmd, ShellDialect::Posix)
    }

    #[test]
    fn test_fish_export() {
        assert_eq!(fish("export X=1"), "set -x X 1");
        assert_eq!(fish("export A=1 B=\"two words\""), "set -x A 1; set -x B \"two words\"");
        assert_eq!(fish("export EDITOR"), "set -x EDITOR $EDITOR");
    }

    #[test]
    fn test_fish_assignments() {
        assert_eq!(fish("COUNT=3"), "set COUNT 3");
        assert_eq!(fish("NOW=$(date +%s)"), "set NOW (date +%s)");
        assert_eq!(fish("EMPTY="), "set EMPTY \"\"");
        // env prefix form runs unchanged in fish
        assert_eq!(fish("LANG=C sort file.txt"), "LANG=C sort file.txt");
        assert_eq!(fish("unset X Y"), "set -e X; set -e Y");
    }

    #[test]
    fn test_fish_substitutions() {
        assert_eq!(fish("echo $(whoami)"), "echo (whoami)");
        assert_eq!(fish("echo `uname -r`"), "echo (uname -r)");
        assert_eq!(fish("echo $(basename $(pwd))"), "echo (basename (pwd))");
        assert_eq!(fish("echo ${HOME}/bin"), "echo {$HOME}/bin");
        assert_eq!(fish("echo $?"), "echo $status");
        assert_eq!(fish("echo '$(not touched)'"), "echo '$(not touched)'");
    }

    #[test]
    fn test_fish_loops() {
        assert_eq!(fish("for i in {1..5}; do echo $i; done"), "for i in (seq 1 5); echo $i; end");
        assert_eq!(fish("for i in $(seq 1 5); do echo $i; done"), "for i in (seq 1 5); echo $i; end");
        assert_eq!(
            fish("for i in {1..2}; do for j in {1..3}; do echo $i $j; done; done"),
            "for i in (seq 1 2); for j in (seq 1 3); echo $i $j; end; end"
        );
        assert_eq!(fish("until false; do sleep 1; done"), "while not false; sleep 1; end");
        assert_eq!(
            fish("while read -r line\ndo\n  echo $line\ndone"),
            "while read -r line\necho $line\nend"
        );
    }

    #[test]
    fn test_fish_conditionals() {
        assert_eq!(
            fish("if [[ $USER == root ]]; then echo admin; elif [ -f x ]; then echo x; else echo user; fi"),
            "if test $USER = root; echo admin; else if [ -f x ]; echo x; else echo user; end"
        );
        assert_eq!(fish("[[ -d src && -f Cargo.toml ]] && cargo build"), "test -d src -a -f Cargo.toml && cargo build");
    }

    #[test]
    fn test_fish_passthrough() {
        for cmd in [
            "ls -la",
            "ps aux | grep python",
            "echo 'Hello' > output.txt",
            "long_running_command &",
            "cd /tmp && ls 2>&1",
            "echo \"$HOME\"",
        ] {
            let report = normalize_with_report(cmd, ShellDialect::Fish);
            assert_eq!(report.text, cmd);
            assert!(!report.changed);
            assert!(!report.needs_review, "{}", cmd);
        }
    }

    #[test]
    fn test_fish_unsupported_constructs_need_review() {
        for cmd in [
            "cat <<EOF\nhi\nEOF",
            "diff <(ls a) <(ls b)",
            "echo $((1 + 2))",
            "case $x in a) echo a;; esac",
            "greet() { echo hi; }",
            "[[ $x =~ ^a ]]",
            "echo ${name:-default}",
            "echo \"today is $(date)\"",
            "if true; then echo x",
            "(cd /tmp && ls)",
            "echo 'unterminated",
        ] {
            let report = normalize_with_report(cmd, ShellDialect::Fish);
            assert!(report.needs_review, "{}", cmd);
            assert_eq!(report.text, cmd);
            assert!(!report.changed);
        }
    }

    #[test]
    fn test_posix_from_fish() {
        assert_eq!(posix("set -x PATH_EXTRA /opt/bin"), "export PATH_EXTRA=/opt/bin");
        assert_eq!(posix("set -gx EDITOR vim"), "export EDITOR=vim");
        assert_eq!(posix("set name world"), "name=world");
        assert_eq!(posix("set -e name"), "unset name");
        assert_eq!(posix("echo $status"), "echo $?");
        assert_eq!(posix("echo $status_code"), "echo $status_code");
        assert_eq!(posix("make; and echo ok; or echo failed"), "make && echo ok || echo failed");
        assert_eq!(posix("not grep -q x f"), "! grep -q x f");
    }

    #[test]
    fn test_posix_leaves_posix_set_alone() {
        for cmd in ["set -euo pipefail", "set -e", "set -x", "set -- a b", "ls -la", "if [ -f x ]; then cat x; fi"] {
            let report = normalize_with_report(cmd, ShellDialect::Posix);
            assert_eq!(report.text, cmd);
            assert!(!report.needs_review, "{}", cmd);
        }
    }

    #[test]
    fn test_posix_unsupported_constructs_need_review() {
        for cmd in ["set -x PATH /a /b", "and echo hi", "function greet; echo hi; end"] {
            let report = normalize_with_report(cmd, ShellDialect::Posix);
            assert!(report.needs_review, "{}", cmd);
            assert_eq!(report.text, cmd);
        }
    }

    #[test]
    fn test_posix_heredoc_body_is_not_rewritten() {
        for cmd in [
            "cat > ~/.config/fish/conf.d/editor.fish <<'EOF'\nset -x EDITOR vim\nEOF",
            "cat <<EOF > notes.txt\nnot   now,   later\nEOF",
        ] {
            let report = normalize_with_report(cmd, ShellDialect::Posix);
            assert_eq!(report.text, cmd);
            assert!(!report.changed);
            assert!(report.needs_review, "{}", cmd);
        }
    }

    #[test]
    fn test_posix_command_substitution_from_fish() {
        assert_eq!(posix("echo (date)"), "echo $(date)");
        assert_eq!(posix("set NOW (date +%s)"), "NOW=$(date +%s)");
        assert_eq!(posix("set -x KERNEL (uname -r)"), "export KERNEL=$(uname -r)");
        assert_eq!(posix("echo (basename (pwd))"), "echo $(basename $(pwd))");
        assert_eq!(posix("test (count $argv) -eq 0; and echo none"), "test $(count $argv) -eq 0 && echo none");
    }

    #[test]
    fn test_posix_keeps_bash_parentheses() {
        for cmd in [
            "files=(a b c)",
            "diff <(ls a) <(ls b)",
            "echo $(date)",
            "echo $((1 + 2))",
            "echo \"(quoted)\" '(single)'",
            "greet() { echo hi; }",
            "shopt -s extglob; ls !(*.txt)",
        ] {
            let report = normalize_with_report(cmd, ShellDialect::Posix);
            assert_eq!(report.text, cmd);
            assert!(!report.needs_review, "{}", cmd);
        }
    }

    #[test]
    fn test_posix_bash_function_keyword_is_not_fish() {
        let cmd = "function greet { echo hi; }";

        let report = normalize_with_report(cmd, ShellDialect::Posix);

        assert_eq!(report.text, cmd);
        assert!(!report.needs_review);
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let corpus = [
            "export X=1",
            "export A=1 B=2 && env",
            "NOW=$(date +%s)",
            "for i in {1..5}; do echo $i; done",
            "if [[ -f a ]]; then export OK=1; fi",
            "until false; do sleep 1; done",
            "echo ${HOME} $? `pwd`",
            "set -x PATH_EXTRA /opt/bin",
            "make; and echo ok",
            "cat <<EOF\nx\nEOF",
            "ls   -la",
            "echo (date)",
        ];

        for dialect in [ShellDialect::Fish, ShellDialect::Posix] {
            for cmd in corpus {
                let once = normalize(cmd, dialect);
                assert_eq!(normalize(&once, dialect), once, "{} ({})", cmd, dialect);
            }
        }
    }

    #[test]
    fn test_classify_shell() {
        assert_eq!(ShellEnvironment::classify("/usr/bin/fish"), Some(ShellDialect::Fish));
        assert_eq!(ShellEnvironment::classify("/bin/bash"), Some(ShellDialect::Posix));
        assert_eq!(ShellEnvironment::classify("/usr/local/bin/zsh"), Some(ShellDialect::Posix));
        assert_eq!(ShellEnvironment::classify("/bin/dash"), Some(ShellDialect::Posix));
        assert_eq!(ShellEnvironment::classify("/usr/bin/nu"), None);
    }

    #[test]
    fn test_resolve_shell() {
        let all_exist = |_: &Path| true;

        let fish = ShellEnvironment::resolve(Some("/usr/bin/fish"), all_exist).unwrap();
        assert_eq!(fish.dialect, ShellDialect::Fish);
        assert_eq!(fish.program, PathBuf::from("/usr/bin/fish"));
        assert!(fish.fallback_reason.is_none());
        assert_eq!(fish.name(), "fish");

        let other = ShellEnvironment::resolve(Some("/usr/bin/nu"), all_exist).unwrap();
        assert_eq!(other.program, PathBuf::from("/bin/sh"));
        assert_eq!(other.dialect, ShellDialect::Posix);
        assert!(other.fallback_reason.unwrap().contains("not a supported shell"));

        let unset = ShellEnvironment::resolve(None, all_exist).unwrap();
        assert_eq!(unset.program, PathBuf::from("/bin/sh"));
    }

    #[test]
    fn test_resolve_fails_without_any_shell() {
        let result = ShellEnvironment::resolve(None, |_| false);
        assert!(matches!(result, Err(AgentError::ShellDetection(_))));

        let missing = ShellEnvironment::resolve(Some("/opt/fish"), |p| p != Path::new("/opt/fish"));
        assert_eq!(missing.unwrap().program, PathBuf::from("/bin/sh"));
    }
}

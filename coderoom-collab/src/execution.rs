//! Interface to the external code-execution sandbox.
//!
//! Running code is a stateless request/response call that never touches room
//! state. This module only defines the request/response types, the language
//! table the sandbox understands, and the [`CodeExecutor`] seam; the HTTP
//! client for a concrete sandbox lives outside this crate.

use async_trait::async_trait;
use std::fmt;
use std::str::FromStr;

/// Languages the sandbox can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Language {
    JavaScript,
    Python,
    C,
    Cpp,
    Java,
    TypeScript,
    Ruby,
    Go,
    Php,
}

impl Language {
    pub const ALL: [Language; 9] = [
        Language::JavaScript,
        Language::Python,
        Language::C,
        Language::Cpp,
        Language::Java,
        Language::TypeScript,
        Language::Ruby,
        Language::Go,
        Language::Php,
    ];

    /// Sandbox language id.
    pub fn sandbox_id(self) -> u32 {
        match self {
            Language::JavaScript => 63,
            Language::Python => 71,
            Language::C => 50,
            Language::Cpp => 54,
            Language::Java => 62,
            Language::TypeScript => 74,
            Language::Ruby => 72,
            Language::Go => 60,
            Language::Php => 68,
        }
    }

    /// Canonical identifier, as sent in `lang` fields.
    pub fn as_str(self) -> &'static str {
        match self {
            Language::JavaScript => "javascript",
            Language::Python => "python",
            Language::C => "c",
            Language::Cpp => "cpp",
            Language::Java => "java",
            Language::TypeScript => "typescript",
            Language::Ruby => "ruby",
            Language::Go => "go",
            Language::Php => "php",
        }
    }
}

impl Default for Language {
    fn default() -> Self {
        Language::JavaScript
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Language {
    type Err = ExecutionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lang = match s.trim().to_ascii_lowercase().as_str() {
            "javascript" | "js" | "nodejs" | "node" => Language::JavaScript,
            "python" | "python3" | "py" => Language::Python,
            "c" => Language::C,
            "cpp" | "c++" => Language::Cpp,
            "java" => Language::Java,
            "typescript" | "ts" => Language::TypeScript,
            "ruby" | "rb" => Language::Ruby,
            "go" | "golang" => Language::Go,
            "php" => Language::Php,
            _ => return Err(ExecutionError::UnsupportedLanguage(s.to_string())),
        };
        Ok(lang)
    }
}

/// A request to run one source buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionRequest {
    pub source: String,
    pub language: Language,
}

impl ExecutionRequest {
    /// Build a request from client-supplied fields.
    ///
    /// A missing or blank language means JavaScript.
    pub fn new(source: impl Into<String>, language: Option<&str>) -> Result<Self, ExecutionError> {
        let language = match language {
            Some(lang) if !lang.trim().is_empty() => lang.parse()?,
            _ => Language::default(),
        };
        Ok(Self {
            source: source.into(),
            language,
        })
    }

    /// Source as the sandbox should receive it.
    ///
    /// The sandbox compiles Java as `Main.java`, so the first declared class is
    /// renamed to `Main` everywhere it appears as a whole word.
    pub fn prepared_source(&self) -> String {
        if self.language != Language::Java {
            return self.source.clone();
        }
        match first_class_name(&self.source) {
            Some(name) if name != "Main" => replace_word(&self.source, name, "Main"),
            _ => self.source.clone(),
        }
    }
}

/// What the sandbox reported.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    /// Human readable status, e.g. "Accepted" or "Runtime Error (NZEC)"
    pub status: String,
}

impl ExecutionResult {
    /// Text to show the user: stdout, or stderr when stdout is empty.
    pub fn output(&self) -> &str {
        if self.stdout.is_empty() {
            &self.stderr
        } else {
            &self.stdout
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecutionError {
    #[error("Unsupported language: {0}")]
    UnsupportedLanguage(String),

    #[error("Execution backend error: {0}")]
    Backend(String),
}

/// Anything that can run code on behalf of a room member.
#[async_trait]
pub trait CodeExecutor: Send + Sync {
    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionResult, ExecutionError>;
}

fn is_word_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Name following the first standalone `class` keyword.
fn first_class_name(source: &str) -> Option<&str> {
    let mut search_from = 0;
    while let Some(offset) = source[search_from..].find("class") {
        let start = search_from + offset;
        let end = start + "class".len();
        search_from = end;

        let boundary_before = source[..start].chars().next_back().map_or(true, |c| !is_word_char(c));
        let rest = &source[end..];
        let trimmed = rest.trim_start();
        if !boundary_before || trimmed.len() == rest.len() {
            continue;
        }

        let ident_len = trimmed
            .char_indices()
            .find(|(_, c)| !is_word_char(*c))
            .map_or(trimmed.len(), |(i, _)| i);
        let ident = &trimmed[..ident_len];
        if ident.starts_with(|c: char| c.is_ascii_alphabetic() || c == '_') {
            return Some(ident);
        }
    }
    None
}

/// Replace whole-word occurrences of `word`.
fn replace_word(source: &str, word: &str, replacement: &str) -> String {
    let mut out = String::with_capacity(source.len());
    let mut rest = source;
    let mut prev: Option<char> = None;

    while let Some(pos) = rest.find(word) {
        let before = rest[..pos].chars().next_back().or(prev);
        let after = rest[pos + word.len()..].chars().next();
        let standalone = !before.is_some_and(is_word_char) && !after.is_some_and(is_word_char);

        out.push_str(&rest[..pos]);
        out.push_str(if standalone { replacement } else { word });
        prev = word.chars().next_back();
        rest = &rest[pos + word.len()..];
    }
    out.push_str(rest);
    out
}

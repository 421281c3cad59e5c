//! Launch description for one REPL child: executable, arguments, and prompt detection.

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Whitespace handling applied to a line before it is tested against the prompt pattern.
///
/// The line terminator (`\n` or `\r\n`) is never part of the line, whatever the mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum LineNormalization {
    /// Match the line exactly as received.
    #[default]
    Raw,
    /// Strip trailing whitespace only.
    TrimEnd,
    /// Strip leading and trailing whitespace.
    Trim,
}

impl LineNormalization {
    pub fn apply(self, line: &str) -> &str {
        match self {
            LineNormalization::Raw => line,
            LineNormalization::TrimEnd => line.trim_end(),
            LineNormalization::Trim => line.trim(),
        }
    }
}

/// Longest glued prompt `prompt_prefix_len` looks for.
const MAX_PROMPT_LEN: usize = 256;

/// Prompt detector: a regex with find semantics plus the normalization to apply first.
///
/// Matching is heuristic. A REPL may print ordinary text that happens to match the
/// pattern, and such a line will be taken as a prompt boundary.
#[derive(Debug, Clone)]
pub struct PromptMatcher {
    regex: Regex,
    normalization: LineNormalization,
    partial_lines: bool,
}

impl PromptMatcher {
    pub fn new(pattern: &str) -> Result<Self, ConfigError> {
        let regex = Regex::new(pattern).map_err(|source| ConfigError::InvalidPrompt {
            pattern: pattern.to_string(),
            source,
        })?;
        Ok(Self {
            regex,
            normalization: LineNormalization::default(),
            partial_lines: true,
        })
    }

    pub fn with_normalization(mut self, normalization: LineNormalization) -> Self {
        self.normalization = normalization;
        self
    }

    /// Whether an unterminated output tail may be recognized as a prompt.
    ///
    /// Interactive interpreters print their prompt without a newline, so this is on
    /// by default.
    pub fn with_partial_lines(mut self, enabled: bool) -> Self {
        self.partial_lines = enabled;
        self
    }

    pub fn is_prompt(&self, line: &str) -> bool {
        self.regex.is_match(self.normalization.apply(line))
    }

    /// Byte length of the shortest leading part of `line` that is a prompt on its own.
    ///
    /// A child that prints its prompt and then more output before the drain reads it
    /// leaves the prompt glued to the start of the next line, e.g. `> got:x`. Only
    /// proper prefixes of up to 256 bytes are tried, so a line that is
    /// entirely a prompt gives `None`.
    pub fn prompt_prefix_len(&self, line: &str) -> Option<usize> {
        line.char_indices()
            .skip(1)
            .map(|(end, _)| end)
            .take_while(|&end| end <= MAX_PROMPT_LEN)
            .find(|&end| self.is_prompt(&line[..end]))
    }

    pub fn pattern(&self) -> &str {
        self.regex.as_str()
    }

    pub fn normalization(&self) -> LineNormalization {
        self.normalization
    }

    pub fn matches_partial_lines(&self) -> bool {
        self.partial_lines
    }
}

/// Everything needed to spawn a REPL. Fixed once a bridge is constructed.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    command: String,
    args: Vec<String>,
    prompt: PromptMatcher,
    merge_stderr: bool,
}

impl LaunchSpec {
    pub fn new<I, S>(command: impl Into<String>, args: I, prompt: PromptMatcher) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command: command.into(),
            args: args.into_iter().map(Into::into).collect(),
            prompt,
            merge_stderr: true,
        }
    }

    pub fn with_merge_stderr(mut self, merge: bool) -> Self {
        self.merge_stderr = merge;
        self
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn prompt(&self) -> &PromptMatcher {
        &self.prompt
    }

    pub fn merges_stderr(&self) -> bool {
        self.merge_stderr
    }

    /// Command and arguments joined for display, e.g. `python3 -i -u`.
    pub fn command_line(&self) -> String {
        std::iter::once(self.command.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

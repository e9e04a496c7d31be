//! Line grammar of the cell simulator wire protocol.
//!
//! Protocol Overview:
//! - Format: ASCII text, one command per line
//! - Terminator: LF only (`\n`)
//! - Requests: a verb optionally followed by space-separated arguments (`SETV 3 3.7`)
//! - Replies: one or more lines. A line beginning with `OK:` ends the exchange
//!   successfully, a line beginning with `Error:` ends it with a failure. Any
//!   other line is informational.
//!
//! Lines are classified once, when they come off the link, into [`ResponseLine`].
//! Higher layers match on the variant instead of re-inspecting prefixes.

use std::fmt;

use crate::error::{CellSimError, CellSimResult};

/// Prefix of a successful terminal line.
pub const SUCCESS_MARKER: &str = "OK:";

/// Prefix of a failed terminal line.
pub const FAILURE_MARKER: &str = "Error:";

/// One logical request.
///
/// Guaranteed non-empty and free of line terminators, so writing it followed by
/// a single `\n` always produces exactly one protocol line.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Command(String);

impl Command {
    /// Validate `text` as a command. Surrounding whitespace is trimmed.
    pub fn new(text: impl Into<String>) -> CellSimResult<Self> {
        let text = text.into();
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(CellSimError::InvalidCommand("empty command".into()));
        }
        if trimmed.contains(['\n', '\r']) {
            return Err(CellSimError::InvalidCommand(format!(
                "embedded line terminator in {:?}",
                trimmed
            )));
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Built-in command text known to be valid.
    pub(crate) fn fixed(text: &'static str) -> Self {
        debug_assert!(!text.is_empty() && !text.contains(['\n', '\r']));
        Self(text.to_string())
    }

    /// Full command text without terminator.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First whitespace-separated token (`SETV` in `SETV 3 3.7`).
    pub fn verb(&self) -> &str {
        self.0.split_whitespace().next().unwrap_or_default()
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A single received line, classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseLine {
    /// `OK:<payload>`
    Success(String),
    /// `Error:<payload>`
    Failure(String),
    /// Anything else (progress or debug output from the firmware)
    Plain(String),
}

impl ResponseLine {
    /// Classify an already-trimmed line.
    pub fn classify(line: &str) -> Self {
        if let Some(payload) = line.strip_prefix(SUCCESS_MARKER) {
            ResponseLine::Success(payload.to_string())
        } else if let Some(payload) = line.strip_prefix(FAILURE_MARKER) {
            ResponseLine::Failure(payload.to_string())
        } else {
            ResponseLine::Plain(line.to_string())
        }
    }

    /// Terminal lines end an exchange.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ResponseLine::Plain(_))
    }

    /// Payload after the marker, or the whole text for plain lines.
    pub fn payload(&self) -> &str {
        match self {
            ResponseLine::Success(p) | ResponseLine::Failure(p) | ResponseLine::Plain(p) => p,
        }
    }
}

impl fmt::Display for ResponseLine {
    /// Reconstructs the line as it appeared on the wire.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseLine::Success(p) => write!(f, "{}{}", SUCCESS_MARKER, p),
            ResponseLine::Failure(p) => write!(f, "{}{}", FAILURE_MARKER, p),
            ResponseLine::Plain(p) => f.write_str(p),
        }
    }
}

/// How an exchange ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome<'a> {
    /// Terminal `OK:` line with its payload
    Success(&'a str),
    /// Terminal `Error:` line with its payload
    Failure(&'a str),
    /// Deadline expired before any terminal line
    Indeterminate,
}

/// Ordered lines of one reply, in receipt order.
///
/// Never contains anything after a terminal line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Response {
    lines: Vec<ResponseLine>,
}

impl Response {
    /// Create an empty response.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a line. Returns `true` if the line was terminal and accumulation
    /// must stop.
    pub(crate) fn push(&mut self, line: ResponseLine) -> bool {
        let terminal = line.is_terminal();
        self.lines.push(line);
        terminal
    }

    /// All lines in receipt order.
    pub fn lines(&self) -> &[ResponseLine] {
        &self.lines
    }

    /// First received line, if any.
    pub fn first(&self) -> Option<&ResponseLine> {
        self.lines.first()
    }

    /// Number of lines received.
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    /// `true` if nothing at all was received.
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// The terminal line, if the exchange completed.
    pub fn terminal(&self) -> Option<&ResponseLine> {
        self.lines.last().filter(|line| line.is_terminal())
    }

    /// Classify the exchange as a whole.
    pub fn outcome(&self) -> Outcome<'_> {
        match self.terminal() {
            Some(ResponseLine::Success(p)) => Outcome::Success(p),
            Some(ResponseLine::Failure(p)) => Outcome::Failure(p),
            _ => Outcome::Indeterminate,
        }
    }

    /// `true` only for a completed exchange ending in `OK:`.
    pub fn is_success(&self) -> bool {
        matches!(self.outcome(), Outcome::Success(_))
    }

    /// Lines as they appeared on the wire.
    pub fn to_text_lines(&self) -> Vec<String> {
        self.lines.iter().map(ToString::to_string).collect()
    }
}

impl<'a> IntoIterator for &'a Response {
    type Item = &'a ResponseLine;
    type IntoIter = std::slice::Iter<'a, ResponseLine>;

    fn into_iter(self) -> Self::IntoIter {
        self.lines.iter()
    }
}

//! Error types for the session runtime.
//!
//! Script failures never surface here: they are reported inside an
//! [`ExecResult`](crate::sandbox::executor::ExecResult) with a non-zero exit
//! code. `SandboxError` covers host-level problems (bad configuration,
//! unknown sessions, malformed submissions).

use std::time::Duration;

use thiserror::Error;

/// Errors raised by the session runtime itself.
#[derive(Error, Debug)]
pub enum SandboxError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// `EXECUTOR_BACKEND` named a backend that does not exist.
    #[error("unknown executor backend '{0}' (expected 'interpreted' or 'restricted')")]
    UnknownBackend(String),

    /// No session with this id is registered with the manager.
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// A submission arrived before `create()` or after `teardown()`.
    #[error("session is not ready; call create() or reset() first")]
    SessionNotReady,

    /// The submission did not have the expected shape.
    #[error("invalid submission: {0}")]
    InvalidSubmission(String),

    /// The worker thread owning a session has exited.
    #[error("session worker is gone: {0}")]
    WorkerGone(String),

    /// The script runtime of a namespace panicked while serving a request.
    #[error("script runtime failure: {0}")]
    Runtime(String),

    /// The worker did not answer in time.
    #[error("session worker did not reply within {0:?}")]
    ReplyTimeout(Duration),

    /// I/O error while setting up a session.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SandboxError {
    /// Parses the stderr of a failed run into its exception parts.
    pub fn from_script_stderr(stderr: &str) -> Option<ScriptException> {
        parse_script_exception(stderr)
    }

    /// Check if the session was missing or already closed.
    pub fn is_session_not_found(&self) -> bool {
        matches!(self, SandboxError::SessionNotFound(_))
    }

    /// Check if this error came from the session state machine.
    pub fn is_not_ready(&self) -> bool {
        matches!(self, SandboxError::SessionNotReady)
    }

    /// Check if the submission was rejected before execution.
    pub fn is_invalid_submission(&self) -> bool {
        matches!(self, SandboxError::InvalidSubmission(_) | SandboxError::Json(_))
    }
}

/// Result type alias for sandbox operations.
pub type Result<T> = std::result::Result<T, SandboxError>;

/// An exception reported in the stderr of a failed run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptException {
    /// The exception class name (e.g. "ValueError").
    pub exception_type: String,
    /// The exception message, possibly empty.
    pub message: String,
    /// The traceback block, if the stderr contained one.
    pub traceback: Option<String>,
}

impl ScriptException {
    pub fn is_import_error(&self) -> bool {
        matches!(self.exception_type.as_str(), "ImportError" | "ModuleNotFoundError")
    }

    pub fn is_syntax_error(&self) -> bool {
        self.exception_type == "SyntaxError"
    }

    pub fn is_timeout(&self) -> bool {
        self.exception_type == "TimeoutError"
    }

    pub fn is_name_error(&self) -> bool {
        matches!(self.exception_type.as_str(), "NameError" | "UnboundLocalError")
    }
}

/// Parse an exception from the stderr of a run.
///
/// Picks the last line shaped like `Type: message` (or a bare `Type`) and
/// the traceback block leading up to it.
pub fn parse_script_exception(stderr: &str) -> Option<ScriptException> {
    if stderr.trim().is_empty() {
        return None;
    }

    let lines: Vec<&str> = stderr.lines().collect();
    let mut exception_line = None;
    let mut traceback_start = None;

    for (i, line) in lines.iter().enumerate() {
        if line.starts_with("Traceback (most recent call last):") {
            traceback_start = Some(i);
        }
        if !line.starts_with(' ')
            && !line.is_empty()
            && !line.starts_with("Traceback")
            && looks_like_exception(line)
        {
            exception_line = Some((i, *line));
        }
    }

    let (line_idx, exception_str) = exception_line?;
    let (exception_type, message) = match exception_str.find(':') {
        Some(colon_pos) => (
            exception_str[..colon_pos].trim().to_string(),
            exception_str[colon_pos + 1..].trim().to_string(),
        ),
        None => (exception_str.trim().to_string(), String::new()),
    };

    let traceback = traceback_start
        .filter(|start| *start <= line_idx)
        .map(|start| lines[start..=line_idx].join("\n"));

    Some(ScriptException {
        exception_type,
        message,
        traceback,
    })
}

/// Check if a line looks like `SomethingError: message`.
fn looks_like_exception(line: &str) -> bool {
    let exception_suffixes = ["Error", "Exception", "Warning"];
    let standalone_exceptions = ["KeyboardInterrupt", "SystemExit", "StopIteration"];

    let name_end = line.find(':').unwrap_or(line.len());
    let name = &line[..name_end];
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.') {
        return false;
    }
    // Qualified names like `json.JSONDecodeError` start with a module path.
    let name = name.rsplit('.').next().unwrap_or(name);
    if !name.chars().next().is_some_and(|c| c.is_ascii_uppercase()) {
        return false;
    }

    exception_suffixes.iter().any(|suffix| name.ends_with(suffix))
        || standalone_exceptions.contains(&name)
}

//! Engine-level error types.

use serde_json::Value;
use thiserror::Error;

use actions::InvokerError;

/// Canonical error kinds, used for catcher matching and user-facing reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Schema,
    Referential,
    PathNotFound,
    TypeError,
    NoChoiceMatched,
    ActionFailed,
    Timeout,
    Cancelled,
    Transport,
}

impl ErrorKind {
    /// The wire token for this kind.  Catchers match against these strings
    /// (or the `States.ALL` wildcard).
    pub fn token(self) -> &'static str {
        match self {
            ErrorKind::Schema => "SCHEMA_ERROR",
            ErrorKind::Referential => "REFERENTIAL_ERROR",
            ErrorKind::PathNotFound => "PATH_NOT_FOUND",
            ErrorKind::TypeError => "TYPE_ERROR",
            ErrorKind::NoChoiceMatched => "NO_CHOICE_MATCHED",
            ErrorKind::ActionFailed => "ACTION_FAILED",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::Cancelled => "CANCELLED",
            ErrorKind::Transport => "TRANSPORT_ERROR",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.token())
    }
}

/// Errors raised while interpreting a flow.
///
/// Validation failures are *not* represented here; the validator accumulates
/// [`ValidationError`] records instead (a CLI lints the whole definition at
/// once), whereas interpretation fails fast, subject to catcher matching.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A path expression did not have the `$`/`$.<key>` shape.
    #[error("malformed path expression '{0}'")]
    MalformedPath(String),

    /// A non-tolerant read resolved no value.
    #[error("no value at '{path}'")]
    PathNotFound { path: String },

    /// A comparator, predicate, or wait field received an incompatible value.
    #[error("type error: {message}")]
    TypeError { message: String },

    /// A Choice state had no matching rule and no default.
    #[error("choice state '{state}' had no matching rule and no default branch")]
    NoChoiceMatched { state: String },

    /// The invoker reported a terminal FAILED status for an action.
    #[error("action state '{state}' reported FAILED")]
    ActionFailed { state: String, result: Value },

    /// `wait_time` elapsed before the action reached a terminal status.
    #[error("action state '{state}' did not reach a terminal status within {wait_time} s")]
    Timeout { state: String, wait_time: u64 },

    /// The per-run deadline supplied by the caller elapsed.
    #[error("run deadline exceeded")]
    DeadlineExceeded,

    /// The external cancellation signal fired.
    #[error("run cancelled")]
    Cancelled,

    /// Invoker-level transport or protocol failure.
    #[error("invoker failure: {0}")]
    Transport(#[from] InvokerError),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::MalformedPath(_) => ErrorKind::Schema,
            EngineError::PathNotFound { .. } => ErrorKind::PathNotFound,
            EngineError::TypeError { .. } => ErrorKind::TypeError,
            EngineError::NoChoiceMatched { .. } => ErrorKind::NoChoiceMatched,
            EngineError::ActionFailed { .. } => ErrorKind::ActionFailed,
            EngineError::Timeout { .. } => ErrorKind::Timeout,
            EngineError::DeadlineExceeded => ErrorKind::Timeout,
            EngineError::Cancelled => ErrorKind::Cancelled,
            EngineError::Transport(_) => ErrorKind::Transport,
        }
    }
}

/// One defect found by the validator.
///
/// Independent of any output format so both the CLI and library callers can
/// render it.  `path` is the location of the offense inside the definition
/// document, e.g. `$.states.Lookup.next`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub kind: ErrorKind,
    pub path: String,
    pub message: String,
}

impl ValidationError {
    pub fn schema(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Schema,
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn referential(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Referential,
            path: path.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} at {}: {}", self.kind, self.path, self.message)
    }
}

impl std::error::Error for ValidationError {}

use serde::{Deserialize, Serialize};

/// Tracebacks are truncated before they enter a message or DLQ entry so a
/// pathological handler cannot bloat the hot store.
pub const MAX_TRACEBACK_LEN: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Timeout,
    Connection,
    Validation,
    Handler,
    CircuitOpen,
    Unknown,
}

impl ErrorCategory {
    /// Whether the retry layer may reattempt a failure of this category.
    /// Validation failures are final: the same input will fail the same
    /// way on every attempt.
    pub fn is_retryable(self) -> bool {
        !matches!(self, Self::Validation)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Connection => "connection",
            Self::Validation => "validation",
            Self::Handler => "handler",
            Self::CircuitOpen => "circuit_open",
            Self::Unknown => "unknown",
        }
    }
}

/// Structured failure record carried in completion messages, node state,
/// and DLQ entries. Plain data on the wire; never a language-native
/// error object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub category: ErrorCategory,
    pub message: String,
    #[serde(default)]
    pub traceback: String,
    pub retryable: bool,
}

impl ErrorDetail {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
            traceback: String::new(),
            retryable: category.is_retryable(),
        }
    }

    pub fn with_traceback(mut self, traceback: impl Into<String>) -> Self {
        let mut traceback = traceback.into();
        if traceback.len() > MAX_TRACEBACK_LEN {
            let mut cut = MAX_TRACEBACK_LEN;
            while !traceback.is_char_boundary(cut) {
                cut -= 1;
            }
            traceback.truncate(cut);
        }
        self.traceback = traceback;
        self
    }

    pub fn non_retryable(mut self) -> Self {
        self.retryable = false;
        self
    }

    /// Best-effort category from an error message, for failures that
    /// reach the worker boundary without an explicit classification.
    pub fn classify(message: &str) -> ErrorCategory {
        let lowered = message.to_ascii_lowercase();
        if ["timeout", "timed out", "deadline"]
            .iter()
            .any(|p| lowered.contains(p))
        {
            return ErrorCategory::Timeout;
        }
        if ["connection", "unavailable", "refused", "reset", "broken pipe"]
            .iter()
            .any(|p| lowered.contains(p))
        {
            return ErrorCategory::Connection;
        }
        if ["validation", "invalid", "schema", "malformed"]
            .iter()
            .any(|p| lowered.contains(p))
        {
            return ErrorCategory::Validation;
        }
        ErrorCategory::Unknown
    }

    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        Self::new(Self::classify(&message), message)
    }
}

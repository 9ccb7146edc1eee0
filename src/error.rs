use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Diagnostic severity level.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticSeverity {
    Error,
    Warning,
}

/// A structured diagnostic message produced during validation or normalization.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: DiagnosticSeverity,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub message: String,
}

/// Error kind for parse failures.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseErrorKind {
    Syntax,
    TypeMismatch,
    UnknownVariant,
}

/// Produced by `parse` when YAML deserialization fails.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParseError {
    pub kind: ParseErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.path {
            Some(path) => write!(f, "{}: {}", path, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for ParseError {}

/// Produced by `validate` when a template violates a structural rule.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationError {
    pub rule: String,
    pub path: String,
    pub message: String,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at {}: {}", self.rule, self.path, self.message)
    }
}

impl std::error::Error for ValidationError {}

/// Result of validation: errors and warnings.
#[derive(Clone, Debug, Default)]
pub struct ValidationResult {
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<Diagnostic>,
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Combined error type for the `load` entry point.
#[derive(Clone, Debug)]
pub enum TemplateError {
    Parse(ParseError),
    Validation(ValidationError),
}

impl fmt::Display for TemplateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TemplateError::Parse(e) => write!(f, "Parse error: {}", e),
            TemplateError::Validation(e) => write!(f, "Validation error: {}", e),
        }
    }
}

impl std::error::Error for TemplateError {}

/// Classification of a transport failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportErrorKind {
    Timeout,
    ConnectionRefused,
    Dns,
    Io,
    Other,
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransportErrorKind::Timeout => "timeout",
            TransportErrorKind::ConnectionRefused => "connection refused",
            TransportErrorKind::Dns => "dns failure",
            TransportErrorKind::Io => "i/o error",
            TransportErrorKind::Other => "transport error",
        };
        f.write_str(s)
    }
}

/// Runtime failures of the execution engine.
///
/// Each variant maps to one class of the error taxonomy: configuration
/// problems abort the smallest enclosing scope, transport failures are
/// retried, protocol failures count as a non-match, cancellation stops work
/// silently, and fatal errors abort one run.
#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum ExecError {
    #[error("configuration error: {message}")]
    Config { message: String },

    #[error("{kind} talking to {target}: {message}")]
    Transport {
        kind: TransportErrorKind,
        target: String,
        message: String,
    },

    #[error("protocol error from {target}: {message}")]
    Protocol { target: String, message: String },

    #[error("cancelled")]
    Cancelled,

    #[error("fatal engine error: {message}")]
    Fatal { message: String },
}

impl ExecError {
    pub fn config(message: impl Into<String>) -> Self {
        ExecError::Config {
            message: message.into(),
        }
    }

    pub fn transport(
        kind: TransportErrorKind,
        target: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        ExecError::Transport {
            kind,
            target: target.into(),
            message: message.into(),
        }
    }

    pub fn protocol(target: impl Into<String>, message: impl Into<String>) -> Self {
        ExecError::Protocol {
            target: target.into(),
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        ExecError::Fatal {
            message: message.into(),
        }
    }

    /// Only transport failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ExecError::Transport { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ExecError::Cancelled)
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, ExecError::Fatal { .. })
    }
}

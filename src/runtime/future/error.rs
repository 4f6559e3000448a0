//! Errors that cross suspension points
//!
//! A computation that fails inside a forked task produces an `ErrorInfo`. It
//! is stored in the task's future and handed back to the first `wait` as
//! `TaskError::Raised`; later waits see the same info as `TaskError::Failed`.

use std::any::Any;
use std::fmt;
use std::panic::Location;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Source location where an error was constructed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Origin {
    pub file: String,
    pub line: u32,
    pub column: u32,
}

impl Origin {
    #[track_caller]
    pub fn caller() -> Self {
        Self::from(Location::caller())
    }

    /// Placeholder for errors whose origin is not known (panics, remote
    /// failures without location).
    pub fn unknown() -> Self {
        Self {
            file: "<unknown>".to_string(),
            line: 0,
            column: 0,
        }
    }
}

impl From<&Location<'_>> for Origin {
    fn from(loc: &Location<'_>) -> Self {
        Self {
            file: loc.file().to_string(),
            line: loc.line(),
            column: loc.column(),
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)
    }
}

/// An error captured when a computation fails.
///
/// Serializable, so a worker process can ship it back with a job response.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: String,
    pub message: String,
    pub origin: Origin,
}

impl ErrorInfo {
    /// Create an error; the origin is the caller's location.
    #[track_caller]
    pub fn new(
        kind: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            origin: Origin::caller(),
        }
    }

    /// Capture any error type; the kind is the error's type name.
    #[track_caller]
    pub fn from_error<E: std::error::Error>(err: &E) -> Self {
        let kind = std::any::type_name::<E>();
        let kind = kind.rsplit("::").next().unwrap_or(kind);
        Self {
            kind: kind.to_string(),
            message: err.to_string(),
            origin: Origin::caller(),
        }
    }

    /// Capture a panic payload.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Self {
            kind: "panic".to_string(),
            message,
            origin: Origin::unknown(),
        }
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "{}: {} (at {})", self.kind, self.message, self.origin)
    }
}

impl std::error::Error for ErrorInfo {}

/// Convert foreign errors into `ErrorInfo` at the `?` site.
///
/// ```
/// use tasklane::runtime::future::{ErrorInfo, Raise};
///
/// fn parse(s: &str) -> Result<i64, ErrorInfo> {
///     s.parse::<i64>().raise_as("ParseError")
/// }
/// assert_eq!(parse("x").unwrap_err().kind, "ParseError");
/// ```
pub trait Raise<T> {
    fn raise_as(
        self,
        kind: &str,
    ) -> Result<T, ErrorInfo>;
}

impl<T, E: fmt::Display> Raise<T> for Result<T, E> {
    #[track_caller]
    fn raise_as(
        self,
        kind: &str,
    ) -> Result<T, ErrorInfo> {
        match self {
            Ok(v) => Ok(v),
            Err(e) => Err(ErrorInfo {
                kind: kind.to_string(),
                message: e.to_string(),
                origin: Origin::caller(),
            }),
        }
    }
}

/// Error returned by `wait` when the awaited computation failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    /// First delivery of the error: propagate it.
    #[error("{0}")]
    Raised(ErrorInfo),
    /// The error was already raised by an earlier wait; this is a plain value.
    #[error("already raised: {0}")]
    Failed(ErrorInfo),
}

impl TaskError {
    pub fn info(&self) -> &ErrorInfo {
        match self {
            TaskError::Raised(info) | TaskError::Failed(info) => info,
        }
    }

    pub fn is_raised(&self) -> bool {
        matches!(self, TaskError::Raised(_))
    }

    pub fn into_info(self) -> ErrorInfo {
        match self {
            TaskError::Raised(info) | TaskError::Failed(info) => info,
        }
    }
}

/// Re-raise inside another computation with `?`, keeping the original info.
impl From<TaskError> for ErrorInfo {
    fn from(err: TaskError) -> Self {
        err.into_info()
    }
}

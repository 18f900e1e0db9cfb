//! Unified error handling for the route session core.
//!
//! Every fallible operation in the crate returns [`Result`]. Store failures,
//! malformed imports and service failures each have their own variant so the
//! session can decide whether the dependent render or sync may proceed.

use thiserror::Error;

/// Axes along which an edited route differs from its pre-edit snapshot,
/// when the recompute criterion cannot be chosen automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EditConflict {
    pub origin_changed: bool,
    pub order_changed: bool,
}

/// Unified error type for route session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Import payload could not be parsed or matched no accepted key shape
    #[error("Format error: {message}")]
    Format { message: String },

    /// Persistent store transaction failed
    #[error("Persistence error: {message}")]
    Persistence { message: String },

    /// Route computation service failed
    #[error("HTTP error{}: {message}", status_suffix(.status_code))]
    Http {
        message: String,
        status_code: Option<u16>,
    },

    /// Live position source reported a failure
    #[error("Position error: {0}")]
    Position(PositionError),

    /// Selection pointer does not reference a live route
    #[error("No route at ({index1}, {index2})")]
    InvalidSelection { index1: usize, index2: usize },

    /// Command is not allowed in the current UI state
    #[error("Command '{command}' not allowed in state {state}")]
    InvalidState { command: String, state: String },

    /// Both origin and visiting order changed; the operator has to pick a criterion
    #[error("Edit changed origin and order, choose a recompute criterion")]
    AmbiguousEdit(EditConflict),

    /// Configuration error
    #[error("Configuration error: {message}")]
    Config { message: String },
}

fn status_suffix(status_code: &Option<u16>) -> String {
    status_code
        .map(|code| format!(" ({})", code))
        .unwrap_or_default()
}

/// Live position failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionError {
    PermissionDenied,
    Unavailable,
    Timeout,
}

impl std::fmt::Display for PositionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PositionError::PermissionDenied => write!(f, "permission denied"),
            PositionError::Unavailable => write!(f, "position unavailable"),
            PositionError::Timeout => write!(f, "timed out"),
        }
    }
}

impl From<rusqlite::Error> for SessionError {
    fn from(e: rusqlite::Error) -> Self {
        SessionError::Persistence {
            message: e.to_string(),
        }
    }
}

impl From<rmp_serde::encode::Error> for SessionError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        SessionError::Persistence {
            message: format!("encode: {}", e),
        }
    }
}

impl From<rmp_serde::decode::Error> for SessionError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        SessionError::Persistence {
            message: format!("decode: {}", e),
        }
    }
}

/// Result type alias for route session operations.
pub type Result<T> = std::result::Result<T, SessionError>;

/// Extension trait for converting Option to SessionError.
pub trait OptionExt<T> {
    /// Convert Option to Result with an invalid selection error.
    fn ok_or_selection(self, index1: usize, index2: usize) -> Result<T>;

    /// Convert Option to Result with a format error.
    fn ok_or_format(self, message: &str) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_selection(self, index1: usize, index2: usize) -> Result<T> {
        self.ok_or(SessionError::InvalidSelection { index1, index2 })
    }

    fn ok_or_format(self, message: &str) -> Result<T> {
        self.ok_or_else(|| SessionError::Format {
            message: message.to_string(),
        })
    }
}

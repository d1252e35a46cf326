//! Custom error types for the client.
//!
//! This module defines the primary error type, `MdmlError`, for the whole crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to
//! report the conditions that stop a message from being handed to the broker.
//!
//! ## Error Hierarchy
//!
//! - **`Parse`**: the input document (configuration text, received envelope) is
//!   not well-formed.
//! - **`Schema`**: the document parses but a required field is missing or has the
//!   wrong shape. Carries the configuration section that failed.
//! - **`Format`**: a value violates a naming or character-class rule, such as an
//!   image filename or an experiment run ID.
//! - **`Shape`**: a structural mismatch in data, such as vector columns of
//!   different lengths.
//! - **`Auth`**: an operation that needs a bearer token was attempted without one.
//! - **`Transport`**, **`Serialization`**, **`Io`** and **`Settings`** wrap failures
//!   from the collaborators around the core.
//!
//! All of these are local and synchronous. Nothing in the crate retries; a failed
//! validation aborts the send before the transport is touched.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type Result<T> = std::result::Result<T, MdmlError>;

/// Errors raised while validating, building, chunking or sending messages.
#[derive(Error, Debug)]
pub enum MdmlError {
    /// Malformed input document.
    #[error("Parse error: {0}")]
    Parse(String),

    /// Well-formed document missing required fields.
    #[error("Schema error in '{section}' section: {message}")]
    Schema {
        /// Configuration section that failed (`experiment`, `devices`, ...).
        section: String,
        /// What was missing or invalid.
        message: String,
    },

    /// Value violates a naming or character-class constraint.
    #[error("Format error: {0}")]
    Format(String),

    /// Structural mismatch in supplied data.
    #[error("Shape error: {0}")]
    Shape(String),

    /// Required credential absent.
    #[error("Authentication error: {0}")]
    Auth(String),

    /// The transport adapter refused or failed a send/receive.
    #[error("Transport error: {0}")]
    Transport(String),

    /// JSON serialization of an envelope failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// File access failed (CLI and settings loading only).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Client settings could not be loaded or are invalid.
    #[error("Settings error: {0}")]
    Settings(String),
}

/// Coarse classification of [`MdmlError`], for callers that branch on the
/// failure category rather than the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// See [`MdmlError::Parse`].
    Parse,
    /// See [`MdmlError::Schema`].
    Schema,
    /// See [`MdmlError::Format`].
    Format,
    /// See [`MdmlError::Shape`].
    Shape,
    /// See [`MdmlError::Auth`].
    Auth,
    /// Transport, serialization, I/O and settings failures.
    Environment,
}

impl MdmlError {
    pub(crate) fn schema(section: impl Into<String>, message: impl Into<String>) -> Self {
        MdmlError::Schema {
            section: section.into(),
            message: message.into(),
        }
    }

    /// Returns the category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            MdmlError::Parse(_) => ErrorKind::Parse,
            MdmlError::Schema { .. } => ErrorKind::Schema,
            MdmlError::Format(_) => ErrorKind::Format,
            MdmlError::Shape(_) => ErrorKind::Shape,
            MdmlError::Auth(_) => ErrorKind::Auth,
            MdmlError::Transport(_)
            | MdmlError::Serialization(_)
            | MdmlError::Io(_)
            | MdmlError::Settings(_) => ErrorKind::Environment,
        }
    }
}

impl From<figment::Error> for MdmlError {
    fn from(value: figment::Error) -> Self {
        MdmlError::Settings(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_error_names_section() {
        let err = MdmlError::schema("devices", "device 'DEV1' is missing 'headers'");
        assert_eq!(err.kind(), ErrorKind::Schema);
        let msg = err.to_string();
        assert!(msg.contains("'devices'"));
        assert!(msg.contains("headers"));
    }

    #[test]
    fn json_errors_are_environment_failures() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: MdmlError = json_err.into();
        assert_eq!(err.kind(), ErrorKind::Environment);
    }

    #[test]
    fn kinds_follow_variants() {
        assert_eq!(MdmlError::Parse("x".into()).kind(), ErrorKind::Parse);
        assert_eq!(MdmlError::Format("x".into()).kind(), ErrorKind::Format);
        assert_eq!(MdmlError::Shape("x".into()).kind(), ErrorKind::Shape);
        assert_eq!(MdmlError::Auth("x".into()).kind(), ErrorKind::Auth);
    }
}

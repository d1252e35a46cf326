//! Messages from the server's debug channel (`<ROOT>_DEBUG/<EXP>`).
//!
//! The server reports notes, errors and analysis results there as
//! `{"type": "...", "message": ..., "analysis_id": "..."}`.

use crate::error::{MdmlError, Result};
use serde::Deserialize;
use serde_json::Value;
use std::fmt;

/// Category of a debug message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DebugKind {
    /// Informational note.
    Note,
    /// Server-side failure.
    Error,
    /// Result of an analysis run.
    Results,
    /// Anything else the server sends.
    Other(String),
}

impl From<&str> for DebugKind {
    fn from(value: &str) -> Self {
        match value {
            "NOTE" => DebugKind::Note,
            "ERROR" => DebugKind::Error,
            "RESULTS" => DebugKind::Results,
            other => DebugKind::Other(other.to_string()),
        }
    }
}

impl fmt::Display for DebugKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DebugKind::Note => f.write_str("NOTE"),
            DebugKind::Error => f.write_str("ERROR"),
            DebugKind::Results => f.write_str("RESULTS"),
            DebugKind::Other(other) => f.write_str(other),
        }
    }
}

/// A decoded debug-channel message.
#[derive(Debug, Clone, PartialEq)]
pub struct DebugMessage {
    /// Category.
    pub kind: DebugKind,
    /// Body; text for notes and errors, arbitrary JSON for results.
    pub message: Value,
    /// Analysis that produced a `RESULTS` message.
    pub analysis_id: Option<String>,
}

#[derive(Deserialize)]
struct RawDebug {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    message: Value,
    #[serde(default)]
    analysis_id: Option<String>,
}

impl DebugMessage {
    /// Parses a debug-channel body.
    ///
    /// # Errors
    ///
    /// [`MdmlError::Parse`] if the body is not a JSON object with a `type`.
    pub fn parse(text: &str) -> Result<Self> {
        let raw: RawDebug = serde_json::from_str(text)
            .map_err(|e| MdmlError::Parse(format!("invalid debug message: {e}")))?;
        Ok(Self {
            kind: DebugKind::from(raw.kind.as_str()),
            message: raw.message,
            analysis_id: raw.analysis_id,
        })
    }

    /// The message body as text, if it is a string.
    pub fn text(&self) -> Option<&str> {
        self.message.as_str()
    }
}

impl fmt::Display for DebugMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let body = match &self.message {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        };
        match (&self.kind, &self.analysis_id) {
            (DebugKind::Results, Some(id)) => write!(f, "RESULTS for '{id}': {body}"),
            (kind, _) => write!(f, "{kind}: {body}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_known_kinds() {
        let note = DebugMessage::parse(r#"{"type": "NOTE", "message": "config received"}"#).unwrap();
        assert_eq!(note.kind, DebugKind::Note);
        assert_eq!(note.text(), Some("config received"));
        assert_eq!(note.to_string(), "NOTE: config received");

        let result = DebugMessage::parse(
            r#"{"type": "RESULTS", "analysis_id": "ADD1", "message": {"sum": 3}}"#,
        )
        .unwrap();
        assert_eq!(result.kind, DebugKind::Results);
        assert_eq!(result.analysis_id.as_deref(), Some("ADD1"));
        assert_eq!(result.message, json!({"sum": 3}));
        assert_eq!(result.to_string(), r#"RESULTS for 'ADD1': {"sum":3}"#);
    }

    #[test]
    fn unknown_kind_is_kept() {
        let msg = DebugMessage::parse(r#"{"type": "WARN", "message": "x"}"#).unwrap();
        assert_eq!(msg.kind, DebugKind::Other("WARN".into()));
    }

    #[test]
    fn missing_type_is_a_parse_error() {
        assert!(DebugMessage::parse(r#"{"message": "x"}"#).is_err());
        assert!(DebugMessage::parse("not json").is_err());
    }
}

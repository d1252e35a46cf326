//! Topic routing convention.
//!
//! ```text
//! <ROOT>/<EXPERIMENT_ID>/CONFIG
//! <ROOT>/<EXPERIMENT_ID>/DATA/<DEVICE_ID>
//! <ROOT>/<EXPERIMENT_ID>/FUNCX/<DEVICE_ID>
//! <ROOT>/<EXPERIMENT_ID>/DLHUB/<DEVICE_ID>
//! <ROOT>/<EXPERIMENT_ID>/RESET
//! <ROOT>/<EXPERIMENT_ID>/REPLAY/<RUN_ID>
//! <ROOT>_DEBUG/<EXPERIMENT_ID>
//! ```
//!
//! Experiment and device IDs are always upper-cased in the path. Run IDs are
//! used verbatim.

use crate::error::{MdmlError, Result};
use crate::validation::is_not_empty;
use std::fmt;

/// Default root segment.
pub const DEFAULT_ROOT: &str = "MDML";

/// The routing segment that follows the experiment ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopicKind {
    /// Experiment configuration.
    Config,
    /// Device data (scalar, vector, image, chunked file).
    Data,
    /// Analysis trigger.
    Funcx,
    /// Model-inference trigger.
    Dlhub,
    /// Experiment reset.
    Reset,
    /// Replay request for a previous run.
    Replay,
}

impl TopicKind {
    /// Wire spelling of the kind segment.
    pub fn as_str(&self) -> &'static str {
        match self {
            TopicKind::Config => "CONFIG",
            TopicKind::Data => "DATA",
            TopicKind::Funcx => "FUNCX",
            TopicKind::Dlhub => "DLHUB",
            TopicKind::Reset => "RESET",
            TopicKind::Replay => "REPLAY",
        }
    }

    fn from_segment(segment: &str) -> Option<Self> {
        match segment {
            "CONFIG" => Some(TopicKind::Config),
            "DATA" => Some(TopicKind::Data),
            "FUNCX" => Some(TopicKind::Funcx),
            "DLHUB" => Some(TopicKind::Dlhub),
            "RESET" => Some(TopicKind::Reset),
            "REPLAY" => Some(TopicKind::Replay),
            _ => None,
        }
    }

    /// Whether topics of this kind end with a device or run segment.
    pub fn has_target(&self) -> bool {
        !matches!(self, TopicKind::Config | TopicKind::Reset)
    }
}

impl fmt::Display for TopicKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A received topic split back into its parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedTopic {
    /// One of the experiment topics.
    Experiment {
        /// Kind segment.
        kind: TopicKind,
        /// Device or run segment, for kinds that have one.
        target: Option<String>,
    },
    /// The experiment's debug/result channel.
    Debug,
}

/// Builds topics for one experiment under one root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicBuilder {
    root: String,
    experiment_id: String,
}

impl TopicBuilder {
    /// Creates a builder. The experiment ID is upper-cased.
    pub fn new(root: impl Into<String>, experiment_id: &str) -> Self {
        Self {
            root: root.into(),
            experiment_id: experiment_id.to_uppercase(),
        }
    }

    /// The normalized experiment ID.
    pub fn experiment_id(&self) -> &str {
        &self.experiment_id
    }

    /// The root segment.
    pub fn root(&self) -> &str {
        &self.root
    }

    fn base(&self) -> String {
        format!("{}/{}", self.root, self.experiment_id)
    }

    /// `<ROOT>/<EXP>/CONFIG`
    pub fn config(&self) -> String {
        format!("{}/{}", self.base(), TopicKind::Config)
    }

    /// `<ROOT>/<EXP>/RESET`
    pub fn reset(&self) -> String {
        format!("{}/{}", self.base(), TopicKind::Reset)
    }

    /// `<ROOT>/<EXP>/DATA/<DEVICE>`
    pub fn data(&self, device_id: &str) -> Result<String> {
        self.device_topic(TopicKind::Data, device_id)
    }

    /// `<ROOT>/<EXP>/FUNCX/<DEVICE>`
    pub fn funcx(&self, device_id: &str) -> Result<String> {
        self.device_topic(TopicKind::Funcx, device_id)
    }

    /// `<ROOT>/<EXP>/DLHUB/<DEVICE>`
    pub fn dlhub(&self, device_id: &str) -> Result<String> {
        self.device_topic(TopicKind::Dlhub, device_id)
    }

    /// `<ROOT>/<EXP>/REPLAY/<RUN_ID>`
    pub fn replay(&self, run_id: &str) -> Result<String> {
        crate::validation::is_valid_run_id(run_id).map_err(|e| MdmlError::Format(e.into()))?;
        if run_id.is_empty() {
            return Err(MdmlError::Format("Replay requires a run ID".into()));
        }
        Ok(format!("{}/{}/{}", self.base(), TopicKind::Replay, run_id))
    }

    /// `<ROOT>_DEBUG/<EXP>`
    pub fn debug(&self) -> String {
        format!("{}_DEBUG/{}", self.root, self.experiment_id)
    }

    fn device_topic(&self, kind: TopicKind, device_id: &str) -> Result<String> {
        check_segment(device_id)?;
        Ok(format!("{}/{}/{}", self.base(), kind, device_id.to_uppercase()))
    }

    /// Classifies a topic received for this experiment. Returns `None` for
    /// topics belonging to another root or experiment.
    pub fn parse(&self, topic: &str) -> Option<ParsedTopic> {
        if topic == self.debug() {
            return Some(ParsedTopic::Debug);
        }
        let rest = topic.strip_prefix(&self.base())?.strip_prefix('/')?;
        let mut parts = rest.splitn(2, '/');
        let kind = TopicKind::from_segment(parts.next()?)?;
        let target = parts.next().map(str::to_string);
        if kind.has_target() != target.is_some() {
            return None;
        }
        Some(ParsedTopic::Experiment { kind, target })
    }
}

/// Device IDs become a single topic level: no separators, no MQTT wildcards.
fn check_segment(segment: &str) -> Result<()> {
    is_not_empty(segment).map_err(|e| MdmlError::Format(format!("Device {e}")))?;
    if segment.contains(['/', '+', '#']) {
        return Err(MdmlError::Format(format!(
            "Device ID '{segment}' contains a topic separator or wildcard"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn topics_are_upper_cased() {
        let topics = TopicBuilder::new(DEFAULT_ROOT, "test");
        assert_eq!(topics.config(), "MDML/TEST/CONFIG");
        assert_eq!(topics.reset(), "MDML/TEST/RESET");
        assert_eq!(topics.data("dev1").unwrap(), "MDML/TEST/DATA/DEV1");
        assert_eq!(topics.funcx("Temp_Analysis").unwrap(), "MDML/TEST/FUNCX/TEMP_ANALYSIS");
        assert_eq!(topics.dlhub("mnist").unwrap(), "MDML/TEST/DLHUB/MNIST");
        assert_eq!(topics.replay("run_1").unwrap(), "MDML/TEST/REPLAY/run_1");
        assert_eq!(topics.debug(), "MDML_DEBUG/TEST");
    }

    #[test]
    fn rejects_bad_segments() {
        let topics = TopicBuilder::new(DEFAULT_ROOT, "test");
        assert_eq!(topics.data("").unwrap_err().kind(), ErrorKind::Format);
        assert_eq!(topics.data("a/b").unwrap_err().kind(), ErrorKind::Format);
        assert_eq!(topics.data("a+").unwrap_err().kind(), ErrorKind::Format);
        assert_eq!(topics.replay("run-1").unwrap_err().kind(), ErrorKind::Format);
        assert_eq!(topics.replay("").unwrap_err().kind(), ErrorKind::Format);
    }

    #[test]
    fn parses_own_topics() {
        let topics = TopicBuilder::new("ROOT", "exp");
        assert_eq!(
            topics.parse("ROOT/EXP/DATA/DEV1"),
            Some(ParsedTopic::Experiment {
                kind: TopicKind::Data,
                target: Some("DEV1".into())
            })
        );
        assert_eq!(
            topics.parse("ROOT/EXP/RESET"),
            Some(ParsedTopic::Experiment {
                kind: TopicKind::Reset,
                target: None
            })
        );
        assert_eq!(topics.parse("ROOT_DEBUG/EXP"), Some(ParsedTopic::Debug));
        assert_eq!(topics.parse("ROOT/OTHER/RESET"), None);
        assert_eq!(topics.parse("ROOT/EXP/DATA"), None);
        assert_eq!(topics.parse("ROOT/EXP/NOPE/X"), None);
    }
}

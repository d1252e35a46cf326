//! Message envelope construction.
//!
//! Every message sent to the broker is an [`OutboundMessage`]: a topic from
//! [`TopicBuilder`] and a JSON body. [`EnvelopeBuilder`] has one method per
//! envelope kind and enforces that kind's rules before anything is serialized,
//! so a rejected message never reaches the transport.
//!
//! All envelopes carry `sys_timestamp`, the sender's wall-clock time in
//! nanoseconds, next to any caller-supplied logical `timestamp`.

use crate::clock::Clock;
use crate::config::NormalizedConfig;
use crate::error::{MdmlError, Result};
use crate::topic::TopicBuilder;
use crate::validation::is_valid_filename;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

/// Body of a soft reset.
pub const RESET_BODY: &str = r#"{"reset": 1}"#;

/// Body of a hard reset.
pub const HARD_RESET_BODY: &str = r#"{"reset": 1, "hard_reset": 1}"#;

/// Image metadata keys the server fills in itself.
pub const RESERVED_IMAGE_METADATA: [&str; 2] = ["time", "filepath"];

/// A message ready for the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    /// Destination topic.
    pub topic: String,
    /// Serialized body.
    pub payload: String,
}

/// Logical collection time of a data message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Timestamp {
    /// One nanosecond Unix timestamp for the whole message.
    Nanos(i64),
    /// Let the server stamp the data on arrival.
    #[default]
    None,
    /// The data carries its own per-row timestamps.
    Many,
}

impl From<i64> for Timestamp {
    fn from(value: i64) -> Self {
        Timestamp::Nanos(value)
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Timestamp::Nanos(ns) => serializer.serialize_i64(*ns),
            Timestamp::None => serializer.serialize_str("none"),
            Timestamp::Many => serializer.serialize_str("many"),
        }
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Int(i64),
            Text(String),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Int(ns) => Ok(Timestamp::Nanos(ns)),
            Raw::Text(text) => match text.as_str() {
                "none" => Ok(Timestamp::None),
                "many" => Ok(Timestamp::Many),
                other => other
                    .parse()
                    .map(Timestamp::Nanos)
                    .map_err(|_| de::Error::custom(format!("invalid timestamp '{other}'"))),
            },
        }
    }
}

/// Which representation a data envelope carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataFormat {
    /// Key/value mapping.
    Dict,
    /// Ordered list.
    List,
    /// Text, optionally delimited.
    String,
}

impl fmt::Display for DataFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DataFormat::Dict => "dict",
            DataFormat::List => "list",
            DataFormat::String => "string",
        })
    }
}

/// Payload of a scalar/tabular data message.
///
/// The format tag is derived from the variant, so a message can never mix
/// representations, and only text carries a delimiter.
#[derive(Debug, Clone, PartialEq)]
pub enum DataValue {
    /// A text row, split on `delimiter` downstream when one is given.
    Text {
        /// Row text.
        value: String,
        /// Field delimiter.
        delimiter: Option<String>,
    },
    /// An ordered list of values.
    Sequence(Vec<Value>),
    /// Named values; field names are self-describing.
    Mapping(Map<String, Value>),
}

impl DataValue {
    /// Text with a field delimiter.
    pub fn delimited(value: impl Into<String>, delimiter: impl Into<String>) -> Self {
        DataValue::Text {
            value: value.into(),
            delimiter: Some(delimiter.into()),
        }
    }

    /// Text sent as one opaque value.
    pub fn text(value: impl Into<String>) -> Self {
        DataValue::Text {
            value: value.into(),
            delimiter: None,
        }
    }

    /// Classifies a JSON value. Scalars other than strings are rejected.
    pub fn from_json(value: Value) -> Result<Self> {
        match value {
            Value::String(s) => Ok(DataValue::text(s)),
            Value::Array(items) => Ok(DataValue::Sequence(items)),
            Value::Object(map) => Ok(DataValue::Mapping(map)),
            other => Err(MdmlError::Shape(format!(
                "data must be a string, list or mapping, got {other}"
            ))),
        }
    }

    /// Format tag for this representation.
    pub fn format(&self) -> DataFormat {
        match self {
            DataValue::Text { .. } => DataFormat::String,
            DataValue::Sequence(_) => DataFormat::List,
            DataValue::Mapping(_) => DataFormat::Dict,
        }
    }

    fn into_parts(self) -> (Value, Option<String>) {
        match self {
            DataValue::Text { value, delimiter } => (Value::String(value), delimiter),
            DataValue::Sequence(items) => (Value::Array(items), None),
            DataValue::Mapping(map) => (Value::Object(map), None),
        }
    }
}

impl From<Vec<Value>> for DataValue {
    fn from(value: Vec<Value>) -> Self {
        DataValue::Sequence(value)
    }
}

impl From<Map<String, Value>> for DataValue {
    fn from(value: Map<String, Value>) -> Self {
        DataValue::Mapping(value)
    }
}

/// Request for a scalar/tabular data message.
#[derive(Debug, Clone, PartialEq)]
pub struct DataMessage {
    device_id: String,
    data: DataValue,
    timestamp: Timestamp,
    add_device: bool,
    influx: bool,
}

impl DataMessage {
    /// New message for `device_id`. Stored in the time-series database by default.
    pub fn new(device_id: impl Into<String>, data: impl Into<DataValue>) -> Self {
        Self {
            device_id: device_id.into(),
            data: data.into(),
            timestamp: Timestamp::None,
            add_device: false,
            influx: true,
        }
    }

    /// Sets the logical timestamp.
    pub fn timestamp(mut self, timestamp: impl Into<Timestamp>) -> Self {
        self.timestamp = timestamp.into();
        self
    }

    /// Asks the server to register the device from this message's field names.
    pub fn add_device(mut self, add_device: bool) -> Self {
        self.add_device = add_device;
        self
    }

    /// Whether to store the data in the time-series database.
    pub fn influx(mut self, influx: bool) -> Self {
        self.influx = influx;
        self
    }

    /// Target device.
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Payload.
    pub fn data(&self) -> &DataValue {
        &self.data
    }

    /// Whether the device registration flag is set.
    pub fn adds_device(&self) -> bool {
        self.add_device
    }
}

/// Wire body of a data message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataEnvelope {
    /// Upper-cased device ID.
    pub device_id: String,
    /// Payload in the representation named by `data_format`.
    pub data: Value,
    /// Representation tag.
    pub data_format: DataFormat,
    /// Field delimiter, only for `string` data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_delimiter: Option<String>,
    /// Logical collection time.
    pub timestamp: Timestamp,
    /// Register the device from this message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub add_device: Option<bool>,
    /// Time-series measurement name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub influx_measurement: Option<String>,
    /// Send time, nanoseconds.
    pub sys_timestamp: i64,
}

/// Request for a vector (columnar) data message.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorMessage {
    device_id: String,
    data: Value,
    timestamp: Timestamp,
    tags: Vec<String>,
    add_device: bool,
    influx: bool,
}

impl VectorMessage {
    /// `data` must be a mapping from column name to a list of numbers.
    pub fn new(device_id: impl Into<String>, data: Value) -> Self {
        Self {
            device_id: device_id.into(),
            data,
            timestamp: Timestamp::None,
            tags: Vec::new(),
            add_device: false,
            influx: true,
        }
    }

    /// Sets the logical timestamp.
    pub fn timestamp(mut self, timestamp: impl Into<Timestamp>) -> Self {
        self.timestamp = timestamp.into();
        self
    }

    /// Columns used as index/grouping variables.
    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Asks the server to register the device from this message's columns.
    pub fn add_device(mut self, add_device: bool) -> Self {
        self.add_device = add_device;
        self
    }

    /// Whether to store the data in the time-series database.
    pub fn influx(mut self, influx: bool) -> Self {
        self.influx = influx;
        self
    }

    /// Target device.
    pub fn device_id(&self) -> &str {
        &self.device_id
    }
}

/// Wire body of a vector data message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorEnvelope {
    /// Upper-cased device ID.
    pub device_id: String,
    /// Column name to equal-length numeric column.
    pub data: Map<String, Value>,
    /// Always `"vector"`.
    pub data_type: String,
    /// Logical collection time.
    pub timestamp: Timestamp,
    /// Index/grouping columns.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Register the device from this message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub add_device: Option<bool>,
    /// Time-series measurement name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub influx_measurement: Option<String>,
    /// Send time, nanoseconds.
    pub sys_timestamp: i64,
}

/// Base64 text of an encoded image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImagePayload(String);

impl ImagePayload {
    /// Wraps text that is already base64.
    pub fn from_base64(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    /// Base64-encodes raw image bytes (already in PNG/JPEG/... form).
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(BASE64.encode(bytes))
    }

    /// The base64 text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Request for an image message.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageMessage {
    device_id: String,
    image: ImagePayload,
    filename: String,
    timestamp: Option<i64>,
    metadata: Map<String, Value>,
    add_device: bool,
}

impl ImageMessage {
    /// New image message. Without a filename one is generated.
    pub fn new(device_id: impl Into<String>, image: ImagePayload) -> Self {
        Self {
            device_id: device_id.into(),
            image,
            filename: String::new(),
            timestamp: None,
            metadata: Map::new(),
            add_device: false,
        }
    }

    /// Storage filename, `name.ext`. Empty means auto-generate.
    pub fn filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = filename.into();
        self
    }

    /// Capture time in nanoseconds. Defaults to the send time.
    pub fn timestamp(mut self, timestamp_ns: i64) -> Self {
        self.timestamp = Some(timestamp_ns);
        self
    }

    /// Extra per-image values stored next to the file path.
    pub fn metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Asks the server to register the device from this message.
    pub fn add_device(mut self, add_device: bool) -> Self {
        self.add_device = add_device;
        self
    }

    /// Target device.
    pub fn device_id(&self) -> &str {
        &self.device_id
    }
}

/// Wire body of an image message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageEnvelope {
    /// Upper-cased device ID.
    pub device_id: String,
    /// Base64 image.
    pub data: String,
    /// Always `"image"`.
    pub data_type: String,
    /// Capture time, nanoseconds.
    pub timestamp: i64,
    /// Storage filename.
    pub filename: String,
    /// Extra per-image values.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
    /// Register the device from this message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub add_device: Option<bool>,
    /// Send time, nanoseconds.
    pub sys_timestamp: i64,
}

/// Request to run a registered analysis function.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisMessage {
    device_id: String,
    function_id: String,
    endpoint_id: String,
    parameters: Value,
    queries: Option<Value>,
    trigger: Vec<String>,
}

impl AnalysisMessage {
    /// Results are stored under `device_id`.
    pub fn new(
        device_id: impl Into<String>,
        function_id: impl Into<String>,
        endpoint_id: impl Into<String>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            function_id: function_id.into(),
            endpoint_id: endpoint_id.into(),
            parameters: Value::Object(Map::new()),
            queries: None,
            trigger: Vec::new(),
        }
    }

    /// Custom parameters passed to the function.
    pub fn parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }

    /// Description of the stored data the function receives.
    pub fn queries(mut self, queries: Value) -> Self {
        self.queries = Some(queries);
        self
    }

    /// Devices whose new data re-runs the analysis.
    pub fn trigger<I, S>(mut self, devices: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.trigger = devices.into_iter().map(Into::into).collect();
        self
    }
}

/// Wire body of an analysis trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisEnvelope {
    /// Registered function.
    pub function_id: String,
    /// Compute endpoint.
    pub endpoint_id: String,
    /// Custom parameters.
    pub parameters: Value,
    /// Data queries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queries: Option<Value>,
    /// Upper-cased trigger devices.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub trigger: Vec<String>,
    /// Request time, nanoseconds.
    pub timestamp: i64,
    /// Bearer token.
    pub globus_token: String,
    /// Send time, nanoseconds.
    pub sys_timestamp: i64,
}

/// Function run on the model output before it is stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FuncxCallback {
    /// Compute endpoint.
    pub endpoint_uuid: String,
    /// Registered function.
    pub function_uuid: String,
    /// Also store the raw model output.
    pub save_intermediate: bool,
}

/// Request to run a hosted model on some data.
#[derive(Debug, Clone, PartialEq)]
pub struct DlhubMessage {
    device_id: String,
    model_id: String,
    data: Value,
    callback: Option<FuncxCallback>,
}

impl DlhubMessage {
    /// Results are stored under `device_id`.
    pub fn new(device_id: impl Into<String>, model_id: impl Into<String>, data: Value) -> Self {
        Self {
            device_id: device_id.into(),
            model_id: model_id.into(),
            data,
            callback: None,
        }
    }

    /// Post-processing function for the model output.
    pub fn callback(mut self, callback: FuncxCallback) -> Self {
        self.callback = Some(callback);
        self
    }
}

/// Wire body of a model-inference trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DlhubEnvelope {
    /// Model input.
    pub data: Value,
    /// Hosted model.
    pub model_id: String,
    /// Post-processing function.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback: Option<FuncxCallback>,
    /// Request time, nanoseconds.
    pub timestamp: i64,
    /// Bearer token.
    pub globus_token: String,
    /// Send time, nanoseconds.
    pub sys_timestamp: i64,
}

/// Wire body of a replay request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayEnvelope {
    /// Upper-cased experiment ID.
    pub experiment_id: String,
    /// Run to replay.
    pub experiment_run_id: String,
    /// Send time, nanoseconds.
    pub sys_timestamp: i64,
}

/// Builds envelopes for one experiment.
///
/// Owns the per-experiment image counter used for generated filenames, so
/// one builder should live as long as the experiment session.
pub struct EnvelopeBuilder {
    topics: TopicBuilder,
    clock: Arc<dyn Clock>,
    image_counter: u64,
}

impl fmt::Debug for EnvelopeBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnvelopeBuilder")
            .field("topics", &self.topics)
            .field("image_counter", &self.image_counter)
            .finish_non_exhaustive()
    }
}

impl EnvelopeBuilder {
    /// Builder for `experiment_id` under `root`.
    pub fn new(root: impl Into<String>, experiment_id: &str, clock: Arc<dyn Clock>) -> Self {
        Self {
            topics: TopicBuilder::new(root, experiment_id),
            clock,
            image_counter: 0,
        }
    }

    /// Topic builder for this experiment.
    pub fn topics(&self) -> &TopicBuilder {
        &self.topics
    }

    /// Number of filenames generated so far.
    pub fn images_named(&self) -> u64 {
        self.image_counter
    }

    fn finish<T: Serialize>(&self, topic: String, body: &T, kind: &str) -> Result<OutboundMessage> {
        let payload = serde_json::to_string(body)?;
        tracing::debug!(topic = %topic, bytes = payload.len(), kind, "Envelope built");
        Ok(OutboundMessage { topic, payload })
    }

    /// Configuration message. The config must belong to this experiment.
    pub fn config(&self, config: &NormalizedConfig) -> Result<OutboundMessage> {
        if config.experiment_id() != self.topics.experiment_id() {
            return Err(MdmlError::schema(
                "experiment",
                format!(
                    "configuration is for experiment '{}' but this session is '{}'",
                    config.experiment_id(),
                    self.topics.experiment_id()
                ),
            ));
        }
        let message = OutboundMessage {
            topic: self.topics.config(),
            payload: config.as_text().to_string(),
        };
        tracing::debug!(topic = %message.topic, bytes = message.payload.len(), "Config envelope built");
        Ok(message)
    }

    /// Scalar/tabular data message.
    ///
    /// # Errors
    ///
    /// [`MdmlError::Shape`] if `add_device` is set on non-mapping data, since
    /// only a mapping names its fields. [`MdmlError::Format`] for a device ID
    /// that cannot be a topic level.
    pub fn data(&self, message: DataMessage) -> Result<OutboundMessage> {
        let topic = self.topics.data(&message.device_id)?;
        let format = message.data.format();
        if message.add_device && format != DataFormat::Dict {
            return Err(MdmlError::Shape(format!(
                "add_device requires mapping data so field names are known, got {format}"
            )));
        }
        if let DataValue::Text { delimiter: None, .. } = &message.data {
            tracing::warn!(
                device_id = %message.device_id,
                "String data sent without a delimiter; it will be stored as a single value"
            );
        }

        let device_id = message.device_id.to_uppercase();
        let (data, data_delimiter) = message.data.into_parts();
        let envelope = DataEnvelope {
            influx_measurement: message.influx.then(|| device_id.clone()),
            device_id,
            data,
            data_format: format,
            data_delimiter,
            timestamp: message.timestamp,
            add_device: message.add_device.then_some(true),
            sys_timestamp: self.clock.now_ns(),
        };
        self.finish(topic, &envelope, "data")
    }

    /// Vector (columnar) data message.
    ///
    /// # Errors
    ///
    /// [`MdmlError::Shape`] if the data is not a mapping of numeric lists, if
    /// the columns differ in length, or if a tag names no column.
    pub fn vector(&self, message: VectorMessage) -> Result<OutboundMessage> {
        let topic = self.topics.data(&message.device_id)?;
        let columns = match message.data {
            Value::Object(map) => map,
            other => {
                return Err(MdmlError::Shape(format!(
                    "vector data must be a mapping of column name to values, got {other}"
                )))
            }
        };
        if columns.is_empty() {
            return Err(MdmlError::Shape("vector data has no columns".into()));
        }

        let mut length = None;
        for (name, column) in &columns {
            let values = column.as_array().ok_or_else(|| {
                MdmlError::Shape(format!("vector column '{name}' must be a list"))
            })?;
            if let Some(bad) = values.iter().find(|v| !v.is_number()) {
                return Err(MdmlError::Shape(format!(
                    "vector column '{name}' contains non-numeric value {bad}"
                )));
            }
            match length {
                None => length = Some(values.len()),
                Some(expected) if expected != values.len() => {
                    return Err(MdmlError::Shape(format!(
                        "vector column '{name}' has {} values, expected {expected}",
                        values.len()
                    )))
                }
                Some(_) => {}
            }
        }
        if let Some(tag) = message.tags.iter().find(|t| !columns.contains_key(*t)) {
            return Err(MdmlError::Shape(format!("vector tag '{tag}' is not a column")));
        }

        let device_id = message.device_id.to_uppercase();
        let envelope = VectorEnvelope {
            influx_measurement: message.influx.then(|| device_id.clone()),
            device_id,
            data: columns,
            data_type: "vector".into(),
            timestamp: message.timestamp,
            tags: message.tags,
            add_device: message.add_device.then_some(true),
            sys_timestamp: self.clock.now_ns(),
        };
        self.finish(topic, &envelope, "vector")
    }

    /// Image message.
    ///
    /// An empty filename is replaced by `<EXPERIMENT_ID>_<n>.jpg`, `n` counting
    /// up from 1 for this builder.
    ///
    /// # Errors
    ///
    /// [`MdmlError::Format`] if the filename is not `name.ext` or the metadata
    /// uses a reserved key.
    pub fn image(&mut self, message: ImageMessage) -> Result<OutboundMessage> {
        let topic = self.topics.data(&message.device_id)?;
        if !message.filename.is_empty() {
            is_valid_filename(&message.filename)
                .map_err(|e| MdmlError::Format(format!("{e}: '{}'", message.filename)))?;
        }
        if let Some(key) = RESERVED_IMAGE_METADATA
            .iter()
            .find(|k| message.metadata.contains_key(**k))
        {
            return Err(MdmlError::Format(format!(
                "image metadata key '{key}' is reserved"
            )));
        }

        let filename = if message.filename.is_empty() {
            self.image_counter += 1;
            format!("{}_{}.jpg", self.topics.experiment_id(), self.image_counter)
        } else {
            message.filename
        };
        let now = self.clock.now_ns();
        let envelope = ImageEnvelope {
            device_id: message.device_id.to_uppercase(),
            data: message.image.0,
            data_type: "image".into(),
            timestamp: message.timestamp.unwrap_or(now),
            filename,
            metadata: message.metadata,
            add_device: message.add_device.then_some(true),
            sys_timestamp: now,
        };
        self.finish(topic, &envelope, "image")
    }

    /// Analysis trigger. `token` is the bearer token from a prior login.
    ///
    /// # Errors
    ///
    /// [`MdmlError::Auth`] without a token; nothing is built in that case.
    pub fn analysis(&self, message: AnalysisMessage, token: Option<&str>) -> Result<OutboundMessage> {
        let token = require_token(token, "analysis")?;
        let topic = self.topics.funcx(&message.device_id)?;
        if message.function_id.is_empty() || message.endpoint_id.is_empty() {
            return Err(MdmlError::Format(
                "analysis requires both a function_id and an endpoint_id".into(),
            ));
        }
        for device in &message.trigger {
            self.topics.data(device)?;
        }
        let now = self.clock.now_ns();
        let envelope = AnalysisEnvelope {
            function_id: message.function_id,
            endpoint_id: message.endpoint_id,
            parameters: message.parameters,
            queries: message.queries,
            trigger: message.trigger.iter().map(|d| d.to_uppercase()).collect(),
            timestamp: now,
            globus_token: token.to_string(),
            sys_timestamp: now,
        };
        self.finish(topic, &envelope, "analysis")
    }

    /// Model-inference trigger. Same token rule as [`Self::analysis`].
    pub fn dlhub(&self, message: DlhubMessage, token: Option<&str>) -> Result<OutboundMessage> {
        let token = require_token(token, "model inference")?;
        let topic = self.topics.dlhub(&message.device_id)?;
        if message.model_id.is_empty() {
            return Err(MdmlError::Format("model inference requires a model_id".into()));
        }
        let now = self.clock.now_ns();
        let envelope = DlhubEnvelope {
            data: message.data,
            model_id: message.model_id,
            callback: message.callback,
            timestamp: now,
            globus_token: token.to_string(),
            sys_timestamp: now,
        };
        self.finish(topic, &envelope, "dlhub")
    }

    /// Reset message; `hard` also discards the server's experiment state.
    pub fn reset(&self, hard: bool) -> OutboundMessage {
        OutboundMessage {
            topic: self.topics.reset(),
            payload: if hard { HARD_RESET_BODY } else { RESET_BODY }.to_string(),
        }
    }

    /// Replay request for a previous run of this experiment.
    pub fn replay(&self, run_id: &str) -> Result<OutboundMessage> {
        let topic = self.topics.replay(run_id)?;
        let envelope = ReplayEnvelope {
            experiment_id: self.topics.experiment_id().to_string(),
            experiment_run_id: run_id.to_string(),
            sys_timestamp: self.clock.now_ns(),
        };
        self.finish(topic, &envelope, "replay")
    }
}

fn require_token<'a>(token: Option<&'a str>, what: &str) -> Result<&'a str> {
    match token {
        Some(t) if !t.is_empty() => Ok(t),
        _ => Err(MdmlError::Auth(format!(
            "{what} requires an auth token; log in before sending"
        ))),
    }
}

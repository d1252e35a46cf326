//! Experiment configuration model and validation.
//!
//! An experiment configuration is a JSON document with two top-level sections:
//!
//! ```json
//! {
//!   "experiment": {
//!     "experiment_id": "TEST",
//!     "experiment_notes": "...",
//!     "experiment_devices": ["DEV1"]
//!   },
//!   "devices": [ { "device_id": "DEV1", "headers": [...], ... } ]
//! }
//! ```
//!
//! [`validate`] checks the document and produces a [`NormalizedConfig`]: the
//! run ID merged in, the experiment ID upper-cased, and the document frozen as
//! the exact text that will be published on the `CONFIG` topic. The caller's
//! input is consumed and never modified in place.
//!
//! [`auto_config`] is the relaxed variant. It skips field-level validation and
//! returns a skeleton with no devices; devices are then registered by the first
//! data message sent for each new device ID (see `add_device` on the data
//! envelope).
//!
//! No network or disk access happens here.

use crate::error::{MdmlError, Result};
use crate::validation::{is_non_negative, is_not_empty, is_valid_run_id};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;

/// Required keys of the `experiment` section.
pub const EXPERIMENT_FIELDS: [&str; 3] = ["experiment_id", "experiment_notes", "experiment_devices"];

/// Required keys of every entry in the `devices` section.
pub const DEVICE_FIELDS: [&str; 9] = [
    "device_id",
    "device_name",
    "device_output",
    "device_output_rate",
    "device_data_type",
    "device_notes",
    "headers",
    "data_types",
    "data_units",
];

/// Kind of data a device produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceDataType {
    /// Delimited text or numeric rows.
    #[serde(rename = "text/numeric")]
    TextNumeric,
    /// Base64-encoded images.
    #[serde(rename = "image")]
    Image,
    /// Parallel equal-length columns.
    #[serde(rename = "vector")]
    Vector,
}

/// One device entry of the `devices` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Unique device identifier.
    pub device_id: String,
    /// Human readable name.
    pub device_name: String,
    /// Description of what the device outputs.
    pub device_output: String,
    /// Expected messages per second.
    pub device_output_rate: f64,
    /// Kind of data produced.
    pub device_data_type: DeviceDataType,
    /// Free-form notes.
    pub device_notes: String,
    /// Column names.
    pub headers: Vec<String>,
    /// Column types, parallel to `headers`.
    pub data_types: Vec<String>,
    /// Column units, parallel to `headers`.
    pub data_units: Vec<String>,
    /// Headers stored as tags rather than fields in the time-series store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub influx_tags: Option<Vec<String>>,
    /// Marks a device that receives analysis results.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis_results: Option<bool>,
    /// Expected analysis runtime.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_runtime_ms: Option<u64>,
    /// Any other keys, passed through untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The `experiment` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentSection {
    /// Experiment identifier (upper-cased once normalized).
    pub experiment_id: String,
    /// Optional run identifier, `[A-Za-z0-9_]*`.
    #[serde(default)]
    pub experiment_run_id: String,
    /// Free-form notes.
    pub experiment_notes: String,
    /// IDs of the devices taking part, each matching one entry of `devices`.
    pub experiment_devices: Vec<String>,
    /// Any other keys, passed through untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Typed view of a validated configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    /// Experiment section.
    pub experiment: ExperimentSection,
    /// Device list.
    pub devices: Vec<DeviceConfig>,
}

impl ExperimentConfig {
    /// Looks up a device by ID (case-insensitive, as topics are upper-cased).
    pub fn device(&self, device_id: &str) -> Option<&DeviceConfig> {
        self.devices
            .iter()
            .find(|d| d.device_id.eq_ignore_ascii_case(device_id))
    }
}

/// Input accepted by [`validate`].
#[derive(Debug, Clone)]
pub enum ConfigSource {
    /// Raw JSON text.
    Text(String),
    /// An already-parsed document.
    Document(Value),
}

impl From<&str> for ConfigSource {
    fn from(value: &str) -> Self {
        ConfigSource::Text(value.to_string())
    }
}

impl From<String> for ConfigSource {
    fn from(value: String) -> Self {
        ConfigSource::Text(value)
    }
}

impl From<Value> for ConfigSource {
    fn from(value: Value) -> Self {
        ConfigSource::Document(value)
    }
}

/// How a configuration was accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationMode {
    /// Every field checked; devices are fixed by the document.
    Strict,
    /// Skeleton only; devices are inferred from their first data message.
    Auto,
}

/// A configuration ready to be published on the `CONFIG` topic.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedConfig {
    mode: ValidationMode,
    experiment_id: String,
    run_id: String,
    typed: Option<ExperimentConfig>,
    document: Value,
    text: String,
}

impl NormalizedConfig {
    fn freeze(
        mode: ValidationMode,
        typed: Option<ExperimentConfig>,
        document: Value,
        experiment_id: String,
        run_id: String,
    ) -> Result<Self> {
        let text = serde_json::to_string(&document)?;
        Ok(Self {
            mode,
            experiment_id,
            run_id,
            typed,
            document,
            text,
        })
    }

    /// Validation mode that produced this config.
    pub fn mode(&self) -> ValidationMode {
        self.mode
    }

    /// Whether devices may be registered from their first data message.
    pub fn allows_device_inference(&self) -> bool {
        self.mode == ValidationMode::Auto
    }

    /// Upper-cased experiment ID.
    pub fn experiment_id(&self) -> &str {
        &self.experiment_id
    }

    /// Run ID (empty when none was given).
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Typed view; `None` for auto configurations.
    pub fn experiment(&self) -> Option<&ExperimentConfig> {
        self.typed.as_ref()
    }

    /// The normalized document.
    pub fn document(&self) -> &Value {
        &self.document
    }

    /// The serialized document, exactly as it will be sent.
    pub fn as_text(&self) -> &str {
        &self.text
    }

    /// Returns a copy with `globus_token` merged at the top level, for servers
    /// that run analyses on the user's behalf.
    pub fn with_token(self, token: &str) -> Result<Self> {
        let mut document = self.document;
        if let Value::Object(map) = &mut document {
            map.insert("globus_token".into(), Value::String(token.to_string()));
        }
        Self::freeze(
            self.mode,
            self.typed,
            document,
            self.experiment_id,
            self.run_id,
        )
    }
}

/// Validates a configuration and normalizes it for sending.
///
/// `run_id` overrides `experiment.experiment_run_id` when non-empty.
///
/// # Errors
///
/// * [`MdmlError::Format`] if `run_id` (or the run ID already in the document)
///   contains characters outside `[A-Za-z0-9_]`.
/// * [`MdmlError::Parse`] if text input is not a JSON object.
/// * [`MdmlError::Schema`] naming the failing section for missing keys, wrong
///   field types, or violated cross-field invariants.
pub fn validate(source: impl Into<ConfigSource>, run_id: &str) -> Result<NormalizedConfig> {
    check_run_id(run_id)?;

    let mut document = match source.into() {
        ConfigSource::Text(text) => serde_json::from_str::<Value>(&text)
            .map_err(|e| MdmlError::Parse(format!("configuration is not valid JSON: {e}")))?,
        ConfigSource::Document(value) => value,
    };

    let root = document
        .as_object_mut()
        .ok_or_else(|| MdmlError::Parse("configuration must be a JSON object".into()))?;

    for key in ["experiment", "devices"] {
        if !root.contains_key(key) {
            return Err(MdmlError::schema(key, format!("missing top-level key '{key}'")));
        }
    }

    let experiment = root
        .get_mut("experiment")
        .and_then(Value::as_object_mut)
        .ok_or_else(|| MdmlError::schema("experiment", "'experiment' must be an object"))?;
    for field in EXPERIMENT_FIELDS {
        if !experiment.contains_key(field) {
            return Err(MdmlError::schema(
                "experiment",
                format!("missing required field '{field}'"),
            ));
        }
    }
    if !run_id.is_empty() {
        experiment.insert("experiment_run_id".into(), Value::String(run_id.into()));
    }
    if let Some(Value::String(id)) = experiment.get_mut("experiment_id") {
        *id = id.to_uppercase();
    }
    let section: ExperimentSection = serde_json::from_value(Value::Object(experiment.clone()))
        .map_err(|e| MdmlError::schema("experiment", e.to_string()))?;

    let raw_devices = root
        .get("devices")
        .and_then(Value::as_array)
        .ok_or_else(|| MdmlError::schema("devices", "'devices' must be a list"))?;
    let mut devices = Vec::with_capacity(raw_devices.len());
    for (index, raw) in raw_devices.iter().enumerate() {
        devices.push(parse_device(index, raw)?);
    }

    let typed = ExperimentConfig {
        experiment: section,
        devices,
    };
    check_invariants(&typed)?;

    let experiment_id = typed.experiment.experiment_id.clone();
    let run_id = typed.experiment.experiment_run_id.clone();
    tracing::debug!(
        experiment_id = %experiment_id,
        run_id = %run_id,
        devices = typed.devices.len(),
        "Configuration validated"
    );
    NormalizedConfig::freeze(ValidationMode::Strict, Some(typed), document, experiment_id, run_id)
}

/// Builds the skeleton configuration used when devices are inferred at runtime.
///
/// Only the run ID is checked. The resulting document carries `"auto": true`
/// and an empty device list.
pub fn auto_config(experiment_id: &str, run_id: &str) -> Result<NormalizedConfig> {
    check_run_id(run_id)?;
    check_id("experiment", experiment_id)?;
    let experiment_id = experiment_id.to_uppercase();

    let mut experiment = Map::new();
    experiment.insert("experiment_id".into(), Value::String(experiment_id.clone()));
    experiment.insert("experiment_notes".into(), Value::String(String::new()));
    experiment.insert("experiment_devices".into(), Value::Array(Vec::new()));
    if !run_id.is_empty() {
        experiment.insert("experiment_run_id".into(), Value::String(run_id.into()));
    }

    let mut root = Map::new();
    root.insert("experiment".into(), Value::Object(experiment));
    root.insert("devices".into(), Value::Array(Vec::new()));
    root.insert("auto".into(), Value::Bool(true));

    tracing::debug!(experiment_id = %experiment_id, "Auto configuration created");
    NormalizedConfig::freeze(
        ValidationMode::Auto,
        None,
        Value::Object(root),
        experiment_id,
        run_id.to_string(),
    )
}

fn check_id(section: &str, id: &str) -> Result<()> {
    is_not_empty(id).map_err(|e| MdmlError::schema(section, format!("{section} {e}")))
}

fn check_run_id(run_id: &str) -> Result<()> {
    is_valid_run_id(run_id).map_err(|e| MdmlError::Format(format!("{e}: '{run_id}'")))
}

fn parse_device(index: usize, raw: &Value) -> Result<DeviceConfig> {
    let fields = raw
        .as_object()
        .ok_or_else(|| MdmlError::schema("devices", format!("device #{index} must be an object")))?;
    let label = fields
        .get("device_id")
        .and_then(Value::as_str)
        .map(|id| format!("device #{index} ('{id}')"))
        .unwrap_or_else(|| format!("device #{index}"));

    for field in DEVICE_FIELDS {
        if !fields.contains_key(field) {
            return Err(MdmlError::schema(
                "devices",
                format!("{label} is missing required field '{field}'"),
            ));
        }
    }
    serde_json::from_value(raw.clone())
        .map_err(|e| MdmlError::schema("devices", format!("{label}: {e}")))
}

fn check_invariants(config: &ExperimentConfig) -> Result<()> {
    let experiment = &config.experiment;
    check_id("experiment", &experiment.experiment_id)?;
    check_run_id(&experiment.experiment_run_id)?;

    // Topics upper-case device IDs, so uniqueness is case-insensitive.
    let mut ids = HashSet::new();
    for device in &config.devices {
        if !ids.insert(device.device_id.to_uppercase()) {
            return Err(MdmlError::schema(
                "devices",
                format!("duplicate device_id '{}'", device.device_id),
            ));
        }
        check_device(device)?;
    }

    for listed in &experiment.experiment_devices {
        if !ids.contains(&listed.to_uppercase()) {
            return Err(MdmlError::schema(
                "experiment",
                format!("experiment_devices references unknown device '{listed}'"),
            ));
        }
    }
    Ok(())
}

fn check_device(device: &DeviceConfig) -> Result<()> {
    let id = &device.device_id;
    let fail = |message: String| Err(MdmlError::schema("devices", message));

    if let Err(e) = is_not_empty(id) {
        return fail(format!("device {e}"));
    }
    if let Err(e) = is_non_negative(device.device_output_rate) {
        return fail(format!("device '{id}' device_output_rate: {e}"));
    }

    let columns = device.headers.len();
    if device.data_types.len() != columns || device.data_units.len() != columns {
        return fail(format!(
            "device '{id}' has {} headers, {} data_types and {} data_units; they must match",
            columns,
            device.data_types.len(),
            device.data_units.len()
        ));
    }
    if columns == 0 && device.device_data_type != DeviceDataType::Image {
        return fail(format!("device '{id}' must declare at least one header"));
    }

    if let Some(tags) = &device.influx_tags {
        if let Some(tag) = tags.iter().find(|t| !device.headers.contains(t)) {
            return fail(format!("device '{id}' influx tag '{tag}' is not one of its headers"));
        }
    }
    Ok(())
}

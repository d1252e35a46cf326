//! Client settings using Figment.
//!
//! Settings are layered, later sources winning:
//! 1. built-in defaults
//! 2. `mdml.toml` (or an explicit path)
//! 3. environment variables prefixed with `MDML_`, `__` separating sections
//!
//! # Example
//! ```no_run
//! use mdml_client::settings::ClientSettings;
//!
//! // MDML_BROKER__HOST=broker.example.org overrides [broker] host
//! let settings = ClientSettings::load()?;
//! settings.validate()?;
//! println!("Broker: {}:{}", settings.broker.host, settings.broker.port);
//! # Ok::<(), mdml_client::MdmlError>(())
//! ```

use crate::error::{MdmlError, Result};
use crate::topic::DEFAULT_ROOT;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default settings file name.
pub const DEFAULT_SETTINGS_FILE: &str = "mdml.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "MDML_";

const VALID_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
const VALID_FORMATS: [&str; 3] = ["pretty", "compact", "json"];

/// Top-level client settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientSettings {
    /// Broker connection
    #[serde(default)]
    pub broker: BrokerSettings,
    /// Experiment defaults
    #[serde(default)]
    pub experiment: ExperimentSettings,
    /// Chunk reassembly
    #[serde(default)]
    pub reassembly: ReassemblySettings,
    /// Log output
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Broker connection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerSettings {
    /// Broker host name or address
    #[serde(default = "default_host")]
    pub host: String,
    /// Broker port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Username, if the broker requires login
    #[serde(default)]
    pub username: Option<String>,
    /// Password, if the broker requires login
    #[serde(default)]
    pub password: Option<String>,
    /// Client ID; a random one is generated when unset
    #[serde(default)]
    pub client_id: Option<String>,
    /// Keep-alive interval in seconds
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    /// Largest packet accepted or sent, in bytes
    #[serde(default = "default_max_packet")]
    pub max_packet_bytes: usize,
}

/// Experiment defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentSettings {
    /// First topic segment
    #[serde(default = "default_root")]
    pub root_topic: String,
    /// Bodies longer than this many bytes are sent in chunks
    #[serde(default)]
    pub chunk_size: Option<usize>,
}

/// Reassembly settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReassemblySettings {
    /// Incomplete transfers older than this are dropped (unbounded when unset)
    #[serde(default)]
    pub max_age_secs: Option<f64>,
}

/// Log output settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_level")]
    pub level: String,
    /// Output format (pretty, compact, json)
    #[serde(default = "default_format")]
    pub format: String,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    1883
}

fn default_keep_alive() -> u64 {
    60
}

fn default_max_packet() -> usize {
    10 * 1024 * 1024
}

fn default_root() -> String {
    DEFAULT_ROOT.to_string()
}

fn default_level() -> String {
    "info".to_string()
}

fn default_format() -> String {
    "pretty".to_string()
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            username: None,
            password: None,
            client_id: None,
            keep_alive_secs: default_keep_alive(),
            max_packet_bytes: default_max_packet(),
        }
    }
}

impl Default for ExperimentSettings {
    fn default() -> Self {
        Self {
            root_topic: default_root(),
            chunk_size: None,
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            format: default_format(),
        }
    }
}

impl ClientSettings {
    /// Load from `mdml.toml` in the working directory and the environment.
    /// A missing file is not an error.
    pub fn load() -> Result<Self> {
        Self::load_from(DEFAULT_SETTINGS_FILE)
    }

    /// Load from a specific file path and the environment.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let settings: Self = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        tracing::debug!(path = %path.as_ref().display(), "Settings loaded");
        Ok(settings)
    }

    /// Validate settings after loading.
    pub fn validate(&self) -> Result<()> {
        if self.broker.host.trim().is_empty() {
            return Err(MdmlError::Settings("broker.host cannot be empty".into()));
        }
        if self.broker.port == 0 {
            return Err(MdmlError::Settings("broker.port cannot be 0".into()));
        }

        let level = self.logging.level.to_lowercase();
        if !VALID_LEVELS.contains(&level.as_str()) {
            return Err(MdmlError::Settings(format!(
                "Invalid logging.level '{}'. Must be one of: {}",
                self.logging.level,
                VALID_LEVELS.join(", ")
            )));
        }
        let format = self.logging.format.to_lowercase();
        if !VALID_FORMATS.contains(&format.as_str()) {
            return Err(MdmlError::Settings(format!(
                "Invalid logging.format '{}'. Must be one of: {}",
                self.logging.format,
                VALID_FORMATS.join(", ")
            )));
        }

        let root = &self.experiment.root_topic;
        if root.is_empty() || root.contains(['/', '+', '#']) {
            return Err(MdmlError::Settings(format!(
                "experiment.root_topic '{root}' must be a single non-empty topic level"
            )));
        }
        if self.experiment.chunk_size == Some(0) {
            return Err(MdmlError::Settings(
                "experiment.chunk_size must be greater than 0".into(),
            ));
        }
        if let Some(age) = self.reassembly.max_age_secs {
            if age.is_nan() || age <= 0.0 {
                return Err(MdmlError::Settings(format!(
                    "reassembly.max_age_secs must be positive, got {age}"
                )));
            }
        }
        Ok(())
    }
}

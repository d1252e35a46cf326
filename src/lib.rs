//! # MDML Client Library
//!
//! Client for publishing experiment data to an MDML message broker. The
//! broker-side server does the heavy lifting (routing, storage, analysis);
//! this crate makes sure that what reaches it is well-formed: configurations
//! are validated, every message kind gets a correctly shaped envelope on the
//! right topic, and payloads too large for one message travel as chunks that
//! the receiving side can reassemble.
//!
//! ## Crate Structure
//!
//! - **`config`**: experiment/device configuration model and the validator that
//!   produces a ready-to-send `NormalizedConfig` (strict or auto mode).
//! - **`envelope`**: one builder method per envelope kind (data, vector, image,
//!   analysis trigger, model-inference trigger, reset, replay).
//! - **`chunk`**: chunk splitting and out-of-order reassembly.
//! - **`topic`**: the `<ROOT>/<EXPERIMENT>/<KIND>/<DEVICE>` routing convention.
//! - **`session`**: the `Experiment` handle tying validation, envelopes,
//!   chunking and a transport together.
//! - **`transport`**: the publish/subscribe seam, with an in-memory
//!   implementation and an MQTT one behind the `mqtt` feature.
//! - **`debug`**: decoding of the server's debug/result channel.
//! - **`schema`**: JSON Schema inference from sample records.
//! - **`auth`**, **`clock`**: injected token and time sources.
//! - **`error`**: the `MdmlError` type shared by the whole crate.
//! - **`settings`**, **`logging`**: layered client settings and tracing setup.
//! - **`validation`**: character-class checks for run IDs and filenames.

pub mod auth;
pub mod chunk;
pub mod clock;
pub mod config;
pub mod debug;
pub mod envelope;
pub mod error;
pub mod logging;
pub mod schema;
pub mod session;
pub mod settings;
pub mod topic;
pub mod transport;
pub mod validation;

pub use chunk::{chunk, ChunkEnvelope, Reassembled, ReassembledPayload, Reassembler};
pub use config::{auto_config, validate, NormalizedConfig, ValidationMode};
pub use envelope::{
    AnalysisMessage, DataMessage, DataValue, DlhubMessage, EnvelopeBuilder, ImageMessage,
    ImagePayload, OutboundMessage, Timestamp, VectorMessage,
};
pub use error::{ErrorKind, MdmlError, Result};
pub use session::{Experiment, Inbound};
pub use transport::{InboundMessage, MemoryTransport, Transport};

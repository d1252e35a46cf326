//! Experiment session handle.
//!
//! [`Experiment`] is the caller-owned handle for one experiment: it holds the
//! validated configuration, the envelope builder (and with it the image
//! counter), the chunk reassembler and the transport. Every publish goes
//! validate → build → (chunk) → send, and a failure at any step leaves the
//! transport untouched.
//!
//! ```no_run
//! use mdml_client::{DataMessage, DataValue, Experiment, MemoryTransport};
//!
//! let mut exp = Experiment::builder("fsp").build(MemoryTransport::new())?;
//! exp.add_config(std::fs::read_to_string("fsp.json")?, "run_1")?;
//! exp.send_config()?;
//! exp.publish_data(DataMessage::new("dht11", DataValue::delimited("21.5\t40", "\t")))?;
//! exp.reset(false)?;
//! # Ok::<(), mdml_client::MdmlError>(())
//! ```

use crate::auth::{StaticToken, TokenProvider};
use crate::chunk::{self, ChunkEnvelope, ChunkInput, Reassembled, Reassembler, DEFAULT_CHUNK_SIZE};
use crate::clock::{Clock, SystemClock};
use crate::config::{self, ConfigSource, NormalizedConfig};
use crate::debug::DebugMessage;
use crate::envelope::{
    AnalysisMessage, DataFormat, DataMessage, DlhubMessage, EnvelopeBuilder, ImageMessage,
    OutboundMessage, VectorMessage,
};
use crate::error::{MdmlError, Result};
use crate::settings::ClientSettings;
use crate::topic::{ParsedTopic, TopicBuilder, DEFAULT_ROOT};
use crate::transport::{InboundMessage, Transport};
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

/// Something received by [`Experiment::poll`].
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// A note, error or analysis result from the server.
    Debug(DebugMessage),
    /// A chunked transfer that just completed.
    File {
        /// Topic the chunks arrived on.
        topic: String,
        /// The reassembled payload.
        file: Reassembled,
    },
    /// Any other message, untouched.
    Message(InboundMessage),
}

/// Options for an [`Experiment`].
pub struct ExperimentBuilder {
    experiment_id: String,
    root: String,
    clock: Arc<dyn Clock>,
    tokens: Arc<dyn TokenProvider>,
    chunk_size: Option<usize>,
    max_transfer_age: Option<f64>,
}

impl ExperimentBuilder {
    /// Defaults: root `MDML`, system clock, no token, no chunking.
    pub fn new(experiment_id: &str) -> Self {
        Self {
            experiment_id: experiment_id.to_string(),
            root: DEFAULT_ROOT.to_string(),
            clock: Arc::new(SystemClock),
            tokens: Arc::new(StaticToken::absent()),
            chunk_size: None,
            max_transfer_age: None,
        }
    }

    /// Root topic segment (default `MDML`).
    pub fn root(mut self, root: impl Into<String>) -> Self {
        self.root = root.into();
        self
    }

    /// Clock used for `sys_timestamp` and chunk times.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Source of the bearer token for analysis and model triggers.
    pub fn token_provider(mut self, tokens: Arc<dyn TokenProvider>) -> Self {
        self.tokens = tokens;
        self
    }

    /// Bodies longer than `bytes` are sent as chunks.
    pub fn chunk_size(mut self, bytes: usize) -> Self {
        self.chunk_size = Some(bytes);
        self
    }

    /// Incomplete inbound transfers older than this are dropped on poll.
    pub fn max_transfer_age(mut self, secs: f64) -> Self {
        self.max_transfer_age = Some(secs);
        self
    }

    /// Applies the `[experiment]` and `[reassembly]` settings sections.
    pub fn settings(mut self, settings: &ClientSettings) -> Self {
        self.root = settings.experiment.root_topic.clone();
        self.chunk_size = settings.experiment.chunk_size;
        self.max_transfer_age = settings.reassembly.max_age_secs;
        self
    }

    /// Creates the session.
    ///
    /// # Errors
    ///
    /// [`MdmlError::Format`] if the experiment ID is empty or cannot be a topic
    /// level, [`MdmlError::Shape`] for a zero chunk size.
    pub fn build<T: Transport>(self, transport: T) -> Result<Experiment<T>> {
        if self.experiment_id.is_empty() || self.experiment_id.contains(['/', '+', '#']) {
            return Err(MdmlError::Format(format!(
                "experiment ID '{}' must be a single non-empty topic level",
                self.experiment_id
            )));
        }
        if self.chunk_size == Some(0) {
            return Err(MdmlError::Shape("chunk_size must be greater than 0".into()));
        }
        let envelopes = EnvelopeBuilder::new(self.root, &self.experiment_id, self.clock.clone());
        let reassembler = Reassembler::new().with_clock(self.clock.clone());
        tracing::debug!(
            experiment_id = %envelopes.topics().experiment_id(),
            root = %envelopes.topics().root(),
            "Experiment session created"
        );
        Ok(Experiment {
            transport,
            envelopes,
            clock: self.clock,
            tokens: self.tokens,
            chunk_size: self.chunk_size,
            max_transfer_age: self.max_transfer_age,
            config: None,
            reassembler,
            known_devices: HashSet::new(),
        })
    }
}

/// Session handle for one experiment.
pub struct Experiment<T: Transport> {
    transport: T,
    envelopes: EnvelopeBuilder,
    clock: Arc<dyn Clock>,
    tokens: Arc<dyn TokenProvider>,
    chunk_size: Option<usize>,
    max_transfer_age: Option<f64>,
    config: Option<NormalizedConfig>,
    reassembler: Reassembler,
    known_devices: HashSet<String>,
}

impl<T: Transport> std::fmt::Debug for Experiment<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Experiment")
            .field("envelopes", &self.envelopes)
            .field("chunk_size", &self.chunk_size)
            .field("config", &self.config.as_ref().map(NormalizedConfig::mode))
            .field("pending_transfers", &self.reassembler.pending())
            .finish_non_exhaustive()
    }
}

impl Experiment<crate::transport::MemoryTransport> {
    /// Shorthand for [`ExperimentBuilder::new`].
    pub fn builder(experiment_id: &str) -> ExperimentBuilder {
        ExperimentBuilder::new(experiment_id)
    }
}

impl<T: Transport> Experiment<T> {
    /// Upper-cased experiment ID.
    pub fn experiment_id(&self) -> &str {
        self.envelopes.topics().experiment_id()
    }

    /// Topic builder for this experiment.
    pub fn topics(&self) -> &TopicBuilder {
        self.envelopes.topics()
    }

    /// The configuration added last, if any.
    pub fn config(&self) -> Option<&NormalizedConfig> {
        self.config.as_ref()
    }

    /// The transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// The transport, mutably.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Ends the session and returns the transport.
    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Validates and stores a configuration; `run_id` may be empty.
    ///
    /// If a token is available it is merged into the document as
    /// `globus_token`.
    ///
    /// # Errors
    ///
    /// Any validation error, or [`MdmlError::Schema`] if the configuration
    /// names another experiment.
    pub fn add_config(&mut self, source: impl Into<ConfigSource>, run_id: &str) -> Result<()> {
        let config = config::validate(source, run_id)?;
        if config.experiment_id() != self.experiment_id() {
            return Err(MdmlError::schema(
                "experiment",
                format!(
                    "configuration is for experiment '{}' but this session is '{}'",
                    config.experiment_id(),
                    self.experiment_id()
                ),
            ));
        }
        self.store_config(config)
    }

    /// Stores a skeleton configuration; devices are registered from their
    /// first data message.
    pub fn add_auto_config(&mut self, run_id: &str) -> Result<()> {
        let config = config::auto_config(self.experiment_id(), run_id)?;
        self.store_config(config)
    }

    fn store_config(&mut self, config: NormalizedConfig) -> Result<()> {
        let config = match self.tokens.token() {
            Some(token) => config.with_token(&token)?,
            None => config,
        };
        tracing::info!(
            experiment_id = %config.experiment_id(),
            run_id = %config.run_id(),
            mode = ?config.mode(),
            "Configuration added"
        );
        self.known_devices.clear();
        self.config = Some(config);
        Ok(())
    }

    /// Publishes the stored configuration.
    ///
    /// # Errors
    ///
    /// [`MdmlError::Schema`] if no configuration has been added.
    pub fn send_config(&mut self) -> Result<()> {
        let config = self.config.as_ref().ok_or_else(|| {
            MdmlError::schema("experiment", "no configuration has been added to this session")
        })?;
        let message = self.envelopes.config(config)?;
        self.dispatch(message)?;
        tracing::info!(experiment_id = %self.experiment_id(), "Configuration sent");
        Ok(())
    }

    /// Publishes scalar/tabular data.
    ///
    /// In auto mode the first message for a device must carry mapping data; it
    /// is sent with `add_device` so the server can register the device.
    pub fn publish_data(&mut self, message: DataMessage) -> Result<()> {
        let device = message.device_id().to_uppercase();
        let register = self.needs_registration(&device, message.data().format() == DataFormat::Dict)?;
        let adds_device = register || message.adds_device();
        let message = if register { message.add_device(true) } else { message };
        let outbound = self.envelopes.data(message)?;
        self.dispatch(outbound)?;
        self.mark_known(device, adds_device);
        Ok(())
    }

    /// Publishes columnar vector data.
    pub fn publish_vector_data(&mut self, message: VectorMessage) -> Result<()> {
        let device = message.device_id().to_uppercase();
        let register = self.needs_registration(&device, true)?;
        let message = if register { message.add_device(true) } else { message };
        let outbound = self.envelopes.vector(message)?;
        self.dispatch(outbound)?;
        self.mark_known(device, register);
        Ok(())
    }

    /// Publishes an image.
    pub fn publish_image(&mut self, message: ImageMessage) -> Result<()> {
        let device = message.device_id().to_uppercase();
        let register = self.needs_registration(&device, true)?;
        let message = if register { message.add_device(true) } else { message };
        let outbound = self.envelopes.image(message)?;
        self.dispatch(outbound)?;
        self.mark_known(device, register);
        Ok(())
    }

    /// Triggers an analysis. Requires a token; without one nothing is sent.
    pub fn publish_analysis(&mut self, message: AnalysisMessage) -> Result<()> {
        let token = self.tokens.token();
        let outbound = self.envelopes.analysis(message, token.as_deref())?;
        self.dispatch(outbound)
    }

    /// Triggers a model inference. Requires a token; without one nothing is sent.
    pub fn use_dlhub(&mut self, message: DlhubMessage) -> Result<()> {
        let token = self.tokens.token();
        let outbound = self.envelopes.dlhub(message, token.as_deref())?;
        self.dispatch(outbound)
    }

    /// Sends a binary file in base64 chunks on the device's data topic.
    /// Returns the number of chunks sent.
    pub fn publish_file(&mut self, device_id: &str, bytes: &[u8], file_id: &str) -> Result<usize> {
        let topic = self.topics().data(device_id)?;
        let size = self.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE);
        let chunks = chunk::chunk(bytes, size, file_id)?.with_clock(self.clock.clone());
        self.send_chunks(&topic, chunks)
    }

    /// Asks the server to reset the experiment. `hard` also drops its state.
    pub fn reset(&mut self, hard: bool) -> Result<()> {
        let message = self.envelopes.reset(hard);
        self.transport.send(&message)?;
        tracing::info!(experiment_id = %self.experiment_id(), hard, "Reset sent");
        Ok(())
    }

    /// Asks the server to replay a previous run.
    pub fn replay(&mut self, run_id: &str) -> Result<()> {
        let message = self.envelopes.replay(run_id)?;
        self.dispatch(message)?;
        tracing::info!(experiment_id = %self.experiment_id(), run_id, "Replay requested");
        Ok(())
    }

    /// Subscribes to the server's debug/result channel.
    pub fn subscribe_debug(&mut self) -> Result<()> {
        let topic = self.topics().debug();
        self.transport.subscribe(&topic)
    }

    /// Subscribes to a device's data topic, e.g. to receive chunked files.
    pub fn subscribe_data(&mut self, device_id: &str) -> Result<()> {
        let topic = self.topics().data(device_id)?;
        self.transport.subscribe(&topic)
    }

    /// Next inbound item, without blocking.
    ///
    /// Chunks on this experiment's topics are absorbed until a transfer
    /// completes. Messages on foreign topics are returned untouched. Stale
    /// transfers are evicted first when a maximum age is configured.
    pub fn poll(&mut self) -> Result<Option<Inbound>> {
        if let Some(max_age) = self.max_transfer_age {
            self.evict_stale_transfers(max_age);
        }
        while let Some(message) = self.transport.receive()? {
            match self.topics().parse(&message.topic) {
                Some(ParsedTopic::Debug) => {
                    let decoded = DebugMessage::parse(message.text()?)?;
                    tracing::debug!(kind = %decoded.kind, "Debug message received");
                    return Ok(Some(Inbound::Debug(decoded)));
                }
                Some(ParsedTopic::Experiment { .. }) => {}
                None => return Ok(Some(Inbound::Message(message))),
            }
            let chunk = message
                .text()
                .ok()
                .and_then(|text| ChunkEnvelope::from_json(text).ok());
            match chunk {
                Some(chunk) => {
                    if let Some(file) = self.reassembler.ingest(chunk)? {
                        return Ok(Some(Inbound::File {
                            topic: message.topic,
                            file,
                        }));
                    }
                }
                None => return Ok(Some(Inbound::Message(message))),
            }
        }
        Ok(None)
    }

    /// Drops inbound transfers whose first chunk arrived more than
    /// `max_age_secs` ago by the session clock.
    pub fn evict_stale_transfers(&mut self, max_age_secs: f64) -> Vec<String> {
        self.reassembler.evict_stale(max_age_secs)
    }

    /// Inbound transfers still missing parts.
    pub fn pending_transfers(&self) -> usize {
        self.reassembler.pending()
    }

    fn needs_registration(&self, device: &str, has_mapping: bool) -> Result<bool> {
        let inferring = self
            .config
            .as_ref()
            .is_some_and(NormalizedConfig::allows_device_inference);
        if !inferring || self.known_devices.contains(device) {
            return Ok(false);
        }
        if !has_mapping {
            return Err(MdmlError::Shape(format!(
                "first message for new device '{device}' must carry mapping data so its fields can be registered"
            )));
        }
        Ok(true)
    }

    fn mark_known(&mut self, device: String, registered: bool) {
        if registered && self.known_devices.insert(device.clone()) {
            tracing::info!(device_id = %device, "Device registered from data");
        }
    }

    /// Sends a message, chunking the body when it exceeds the chunk size.
    fn dispatch(&mut self, message: OutboundMessage) -> Result<()> {
        match self.chunk_size {
            Some(size) if message.payload.len() > size => {
                let file_id = Uuid::new_v4().to_string();
                let OutboundMessage { topic, payload } = message;
                let chunks = chunk::chunk(ChunkInput::text(payload), size, &file_id)?
                    .with_clock(self.clock.clone());
                self.send_chunks(&topic, chunks).map(|_| ())
            }
            _ => self.transport.send(&message),
        }
    }

    fn send_chunks(&mut self, topic: &str, chunks: chunk::Chunks) -> Result<usize> {
        let total = chunks.total();
        for part in chunks {
            let message = OutboundMessage {
                topic: topic.to_string(),
                payload: part.to_json()?,
            };
            self.transport.send(&message)?;
        }
        tracing::debug!(topic, parts = total, "Chunked transfer sent");
        Ok(total)
    }
}

//! Broker transport seam.
//!
//! The session hands finished [`OutboundMessage`]s to a [`Transport`] and polls
//! it for [`InboundMessage`]s. Delivery guarantees, reconnects and QoS belong to
//! the implementation; the session treats every send as fire-and-forget.
//!
//! - [`MemoryTransport`] records traffic in memory. Tests and offline tools use it.
//! - `mqtt::MqttTransport` (feature `mqtt`) talks to a real broker via `rumqttc`.

use crate::envelope::OutboundMessage;
use crate::error::{MdmlError, Result};
use std::collections::VecDeque;

/// A message received from the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Topic it arrived on.
    pub topic: String,
    /// Raw body.
    pub payload: Vec<u8>,
}

impl InboundMessage {
    /// Creates a message from a topic and body.
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }

    /// Body as UTF-8.
    ///
    /// # Errors
    ///
    /// [`MdmlError::Parse`] if the body is not valid UTF-8.
    pub fn text(&self) -> Result<&str> {
        std::str::from_utf8(&self.payload)
            .map_err(|e| MdmlError::Parse(format!("message on '{}' is not UTF-8: {e}", self.topic)))
    }
}

/// Publish/subscribe adapter.
pub trait Transport: Send {
    /// Publishes one message.
    fn send(&mut self, message: &OutboundMessage) -> Result<()>;

    /// Starts receiving messages on `topic`.
    fn subscribe(&mut self, topic: &str) -> Result<()>;

    /// Next received message, without blocking.
    fn receive(&mut self) -> Result<Option<InboundMessage>>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn send(&mut self, message: &OutboundMessage) -> Result<()> {
        (**self).send(message)
    }

    fn subscribe(&mut self, topic: &str) -> Result<()> {
        (**self).subscribe(topic)
    }

    fn receive(&mut self) -> Result<Option<InboundMessage>> {
        (**self).receive()
    }
}

/// In-memory transport: records sends and replays queued inbound messages.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    sent: Vec<OutboundMessage>,
    subscriptions: Vec<String>,
    inbound: VecDeque<InboundMessage>,
    offline: bool,
}

impl MemoryTransport {
    /// Empty transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything sent so far, oldest first.
    pub fn sent(&self) -> &[OutboundMessage] {
        &self.sent
    }

    /// Drains the sent log.
    pub fn take_sent(&mut self) -> Vec<OutboundMessage> {
        std::mem::take(&mut self.sent)
    }

    /// Topics subscribed so far.
    pub fn subscriptions(&self) -> &[String] {
        &self.subscriptions
    }

    /// Queues a message for [`Transport::receive`].
    pub fn push_inbound(&mut self, message: InboundMessage) {
        self.inbound.push_back(message);
    }

    /// While offline, sends and subscribes fail with [`MdmlError::Transport`].
    pub fn set_offline(&mut self, offline: bool) {
        self.offline = offline;
    }

    fn check_online(&self) -> Result<()> {
        if self.offline {
            return Err(MdmlError::Transport("transport is offline".into()));
        }
        Ok(())
    }
}

impl Transport for MemoryTransport {
    fn send(&mut self, message: &OutboundMessage) -> Result<()> {
        self.check_online()?;
        self.sent.push(message.clone());
        Ok(())
    }

    fn subscribe(&mut self, topic: &str) -> Result<()> {
        self.check_online()?;
        if !self.subscriptions.iter().any(|t| t == topic) {
            self.subscriptions.push(topic.to_string());
        }
        Ok(())
    }

    fn receive(&mut self) -> Result<Option<InboundMessage>> {
        Ok(self.inbound.pop_front())
    }
}

/// MQTT broker transport.
#[cfg(feature = "mqtt")]
pub mod mqtt {
    use super::{InboundMessage, Transport};
    use crate::envelope::OutboundMessage;
    use crate::error::{MdmlError, Result};
    use crate::settings::BrokerSettings;
    use rumqttc::{Client, Event, MqttOptions, Outgoing, Packet, QoS};
    use std::sync::mpsc::{self, Receiver, TryRecvError};
    use std::thread::JoinHandle;
    use std::time::Duration;

    /// Blocking `rumqttc` client with a background thread driving the
    /// connection. Incoming publishes are forwarded over a channel.
    pub struct MqttTransport {
        client: Client,
        inbound: Receiver<InboundMessage>,
        worker: Option<JoinHandle<()>>,
    }

    impl std::fmt::Debug for MqttTransport {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("MqttTransport").finish_non_exhaustive()
        }
    }

    impl MqttTransport {
        /// Connects using `settings`. The connection is established lazily by
        /// the event thread; errors there are logged and retried.
        pub fn connect(settings: &BrokerSettings) -> Result<Self> {
            let client_id = settings
                .client_id
                .clone()
                .unwrap_or_else(|| format!("mdml-{}", uuid::Uuid::new_v4()));
            let mut options = MqttOptions::new(client_id, settings.host.clone(), settings.port);
            options.set_keep_alive(Duration::from_secs(settings.keep_alive_secs));
            options.set_max_packet_size(settings.max_packet_bytes, settings.max_packet_bytes);
            if let (Some(username), Some(password)) = (&settings.username, &settings.password) {
                options.set_credentials(username, password);
            }

            let (client, mut connection) = Client::new(options, 10);
            let (tx, rx) = mpsc::channel();
            let host = settings.host.clone();
            let worker = std::thread::Builder::new()
                .name("mdml-mqtt".into())
                .spawn(move || {
                    tracing::debug!(host = %host, "MQTT event loop started");
                    for event in connection.iter() {
                        match event {
                            Ok(Event::Incoming(Packet::Publish(publish))) => {
                                let message = InboundMessage::new(publish.topic, publish.payload.to_vec());
                                if tx.send(message).is_err() {
                                    break;
                                }
                            }
                            Ok(Event::Incoming(Packet::Disconnect))
                            | Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
                            Ok(_) => {}
                            Err(e) => {
                                tracing::error!(host = %host, error = %e, "MQTT connection error");
                                std::thread::sleep(Duration::from_secs(5));
                            }
                        }
                    }
                    tracing::debug!(host = %host, "MQTT event loop stopped");
                })?;

            tracing::info!(host = %settings.host, port = settings.port, "MQTT transport created");
            Ok(Self {
                client,
                inbound: rx,
                worker: Some(worker),
            })
        }

        /// Sends DISCONNECT and waits for the event thread.
        pub fn disconnect(mut self) -> Result<()> {
            self.client
                .disconnect()
                .map_err(|e| MdmlError::Transport(e.to_string()))?;
            if let Some(worker) = self.worker.take() {
                if worker.join().is_err() {
                    tracing::warn!("MQTT event thread panicked");
                }
            }
            Ok(())
        }
    }

    impl Transport for MqttTransport {
        fn send(&mut self, message: &OutboundMessage) -> Result<()> {
            self.client
                .publish(
                    message.topic.as_str(),
                    QoS::AtLeastOnce,
                    false,
                    message.payload.as_bytes().to_vec(),
                )
                .map_err(|e| MdmlError::Transport(e.to_string()))
        }

        fn subscribe(&mut self, topic: &str) -> Result<()> {
            self.client
                .subscribe(topic, QoS::AtLeastOnce)
                .map_err(|e| MdmlError::Transport(e.to_string()))
        }

        fn receive(&mut self) -> Result<Option<InboundMessage>> {
            match self.inbound.try_recv() {
                Ok(message) => Ok(Some(message)),
                Err(TryRecvError::Empty) => Ok(None),
                Err(TryRecvError::Disconnected) => {
                    Err(MdmlError::Transport("MQTT event loop has stopped".into()))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn message(topic: &str) -> OutboundMessage {
        OutboundMessage {
            topic: topic.into(),
            payload: "{}".into(),
        }
    }

    #[test]
    fn records_sends_in_order() {
        let mut transport = MemoryTransport::new();
        transport.send(&message("A")).unwrap();
        transport.send(&message("B")).unwrap();
        let topics: Vec<_> = transport.sent().iter().map(|m| m.topic.as_str()).collect();
        assert_eq!(topics, ["A", "B"]);
        assert_eq!(transport.take_sent().len(), 2);
        assert!(transport.sent().is_empty());
    }

    #[test]
    fn boxed_transport_forwards_every_call() {
        let mut transport: Box<dyn Transport> = Box::new(MemoryTransport::new());
        transport.subscribe("MDML_DEBUG/TEST").unwrap();
        transport.send(&message("A")).unwrap();
        assert!(transport.receive().unwrap().is_none());

        let mut offline = MemoryTransport::new();
        offline.set_offline(true);
        let mut boxed: Box<dyn Transport> = Box::new(offline);
        assert!(boxed.subscribe("MDML_DEBUG/TEST").is_err());
    }

    #[test]
    fn offline_transport_refuses_sends() {
        let mut transport = MemoryTransport::new();
        transport.set_offline(true);
        let err = transport.send(&message("A")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Environment);
        assert!(transport.sent().is_empty());
    }

    #[test]
    fn inbound_is_fifo_and_subscriptions_dedup() {
        let mut transport = MemoryTransport::new();
        transport.subscribe("X").unwrap();
        transport.subscribe("X").unwrap();
        assert_eq!(transport.subscriptions(), ["X".to_string()]);

        transport.push_inbound(InboundMessage::new("X", "first"));
        transport.push_inbound(InboundMessage::new("X", "second"));
        assert_eq!(transport.receive().unwrap().unwrap().text().unwrap(), "first");
        assert_eq!(transport.receive().unwrap().unwrap().text().unwrap(), "second");
        assert!(transport.receive().unwrap().is_none());
    }

    #[test]
    fn non_utf8_body_is_a_parse_error() {
        let message = InboundMessage::new("X", vec![0xff, 0xfe]);
        assert_eq!(message.text().unwrap_err().kind(), ErrorKind::Parse);
    }
}

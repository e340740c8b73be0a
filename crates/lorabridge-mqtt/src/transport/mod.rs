//! Broker transports
//!
//! A transport owns one physical broker connection. It reports connection
//! changes and inbound publishes as [`TransportEvent`]s on the channel given
//! to [`BrokerTransport::connect`], and keeps reconnecting on its own after
//! the first successful connect. Subscription replay is left to the caller.
//!
//! - [`rumqtt::MqttTransport`] - MQTT 3.1.1 over TCP or TLS via `rumqttc`
//! - [`crate::test_utils::MockTransport`] - scripted transport for tests

mod rumqtt;

pub use rumqtt::MqttTransport;
pub use rumqttc::QoS;

use crate::error::{BridgeError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Trait for broker transports
#[async_trait]
pub trait BrokerTransport: Send + Sync {
    /// Open the connection, resolving once the broker accepted it
    ///
    /// Events for the lifetime of the connection, including automatic
    /// reconnects, are sent on `events`.
    async fn connect(&self, events: mpsc::Sender<TransportEvent>) -> Result<()>;

    /// Issue a broker-level subscribe
    ///
    /// Resolves when the request was accepted for sending.
    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<()>;

    /// Issue a broker-level unsubscribe
    async fn unsubscribe(&self, topic: &str) -> Result<()>;

    /// Publish a payload
    async fn publish(&self, topic: &str, qos: QoS, payload: Bytes) -> Result<()>;

    /// Close the connection
    async fn disconnect(&self) -> Result<()>;

    /// Get the transport name (for logging)
    fn name(&self) -> &str;
}

/// Events reported by a connected transport
#[derive(Debug)]
pub enum TransportEvent {
    /// The transport reconnected on its own
    Connected,
    /// The connection dropped; the transport keeps retrying
    ConnectionLost(String),
    /// An inbound publish
    Message(BrokerMessage),
}

/// Connection state for broker clients
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected
    Disconnected,
    /// Connection in progress
    Connecting,
    /// Successfully connected
    Connected,
    /// Connection lost, waiting on the transport to reconnect
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Reconnecting => write!(f, "reconnecting"),
        }
    }
}

/// Performs the broker-level acknowledgement of one delivery
#[async_trait]
pub trait Acknowledger: Send + Sync {
    /// Acknowledge the delivery
    async fn ack(&self) -> Result<()>;
}

/// An inbound broker publish
///
/// Clones share the acknowledgement: whichever clone calls [`ack`](Self::ack)
/// first performs it, later calls are no-ops.
#[derive(Clone)]
pub struct BrokerMessage {
    topic: String,
    payload: Bytes,
    acker: Option<Arc<dyn Acknowledger>>,
    acked: Arc<AtomicBool>,
}

impl BrokerMessage {
    /// Create a message that needs no broker-level acknowledgement
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            acker: None,
            acked: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Create a message acknowledged through `acker`
    pub fn with_acknowledger(
        topic: impl Into<String>,
        payload: impl Into<Bytes>,
        acker: Arc<dyn Acknowledger>,
    ) -> Self {
        Self {
            acker: Some(acker),
            ..Self::new(topic, payload)
        }
    }

    /// Concrete topic the message was published on
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Raw payload
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Whether the message has been acknowledged
    pub fn is_acked(&self) -> bool {
        self.acked.load(Ordering::SeqCst)
    }

    /// Acknowledge the message; at most once across all clones
    pub async fn ack(&self) -> Result<()> {
        if self.acked.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        match &self.acker {
            Some(acker) => acker.ack().await,
            None => Ok(()),
        }
    }
}

impl fmt::Debug for BrokerMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerMessage")
            .field("topic", &self.topic)
            .field("payload_len", &self.payload.len())
            .field("acked", &self.is_acked())
            .finish()
    }
}

/// Convert a configured QoS level
pub fn qos_from_u8(qos: u8) -> Result<QoS> {
    match qos {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(BridgeError::InvalidConfig(format!(
            "unsupported mqtt qos {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::CountingAcker;

    #[test]
    fn test_connection_state_display() {
        assert_eq!(ConnectionState::Connected.to_string(), "connected");
        assert_eq!(ConnectionState::Reconnecting.to_string(), "reconnecting");
    }

    #[tokio::test]
    async fn test_ack_once_across_clones() {
        let (acker, count) = CountingAcker::new();
        let message = BrokerMessage::with_acknowledger("t/1", vec![1u8], Arc::new(acker));
        let clone = message.clone();

        message.ack().await.unwrap();
        clone.ack().await.unwrap();
        message.ack().await.unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(clone.is_acked());
    }

    #[test]
    fn test_qos_from_u8() {
        assert_eq!(qos_from_u8(1).unwrap(), QoS::AtLeastOnce);
        assert!(qos_from_u8(3).is_err());
    }
}

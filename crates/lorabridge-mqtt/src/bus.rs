//! Internal message bus
//!
//! The proxy publishes canonical messages to, and consumes downlink requests
//! from, an organisation-internal bus. [`InternalBus`] is that bus's
//! interface; [`MqttBus`] implements it on a second MQTT connection.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::debug;

use crate::client::BrokerClient;
use crate::error::Result;
use crate::transport::BrokerMessage;

/// Default capacity of bus subscription channels
pub const DEFAULT_BUS_CAPACITY: usize = 16;

/// Publish/subscribe interface of the internal bus
#[async_trait]
pub trait InternalBus: Send + Sync {
    /// Publish one message, returning a bus-assigned message id
    async fn publish(&self, topic: &str, data: Bytes) -> Result<String>;

    /// Consume a named subscription
    async fn subscribe(&self, subscription: &str) -> Result<mpsc::Receiver<BusDelivery>>;
}

/// A message received from a bus subscription
///
/// Must be acknowledged once handled.
#[derive(Debug, Clone)]
pub struct BusDelivery {
    message: BrokerMessage,
}

impl BusDelivery {
    /// Message body
    pub fn data(&self) -> &[u8] {
        self.message.payload()
    }

    /// Topic or subscription the message arrived on
    pub fn subscription(&self) -> &str {
        self.message.topic()
    }

    /// Acknowledge the delivery; later calls are no-ops
    pub async fn ack(&self) -> Result<()> {
        self.message.ack().await
    }

    /// Whether the delivery has been acknowledged
    pub fn is_acked(&self) -> bool {
        self.message.is_acked()
    }
}

impl From<BrokerMessage> for BusDelivery {
    fn from(message: BrokerMessage) -> Self {
        Self { message }
    }
}

/// Internal bus carried over MQTT
pub struct MqttBus {
    client: BrokerClient,
    sequence: AtomicU64,
}

impl MqttBus {
    /// Create a bus over a broker client; the client is connected on demand
    pub fn new(client: BrokerClient) -> Self {
        Self {
            client,
            sequence: AtomicU64::new(0),
        }
    }

    /// Underlying broker client
    pub fn client(&self) -> &BrokerClient {
        &self.client
    }
}

#[async_trait]
impl InternalBus for MqttBus {
    async fn publish(&self, topic: &str, data: Bytes) -> Result<String> {
        self.client.connect().await?;
        self.client.publish(topic, data).await?;
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(format!("{topic}/{sequence}"))
    }

    async fn subscribe(&self, subscription: &str) -> Result<mpsc::Receiver<BusDelivery>> {
        self.client.connect().await?;
        let mut messages = self
            .client
            .subscribe_channel(subscription, DEFAULT_BUS_CAPACITY)
            .await?;

        let (tx, rx) = mpsc::channel(DEFAULT_BUS_CAPACITY);
        let name = subscription.to_string();
        tokio::spawn(async move {
            while let Some(message) = messages.recv().await {
                if tx.send(BusDelivery::from(message)).await.is_err() {
                    break;
                }
            }
            debug!("Bus subscription {} closed", name);
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectConfig;
    use crate::test_utils::{wait_until, MockTransport};
    use std::sync::Arc;

    fn bus(transport: &Arc<MockTransport>) -> MqttBus {
        let client = BrokerClient::new(transport.clone(), &ConnectConfig::default()).unwrap();
        MqttBus::new(client)
    }

    #[tokio::test]
    async fn test_publish_connects_on_demand() {
        let transport = Arc::new(MockTransport::new());
        let bus = bus(&transport);

        let first = bus.publish("uplinks", Bytes::from_static(b"{}")).await.unwrap();
        let second = bus.publish("uplinks", Bytes::from_static(b"{}")).await.unwrap();

        assert_ne!(first, second);
        assert_eq!(transport.connect_attempts(), 1);
        assert_eq!(transport.published().len(), 2);
    }

    #[tokio::test]
    async fn test_subscription_ack_reaches_broker() {
        let transport = Arc::new(MockTransport::new());
        let bus = bus(&transport);
        let mut deliveries = bus.subscribe("downlinks").await.unwrap();

        let acks = transport.inject("downlinks", b"request".to_vec()).await;
        let delivery = deliveries.recv().await.unwrap();
        assert_eq!(delivery.data(), b"request");
        assert_eq!(delivery.subscription(), "downlinks");

        delivery.ack().await.unwrap();
        delivery.ack().await.unwrap();
        wait_until(|| acks.load(Ordering::SeqCst) == 1).await;
    }
}

//! Test utilities for exercising the bridge without a live broker
//!
//! - [`MockTransport`] - scripted broker transport recording every call
//! - [`MemoryBus`] - in-memory internal bus
//! - [`envelopes`] - TTN v3 wire envelopes for tests
//!
//! # Example
//!
//! ```rust,ignore
//! use lorabridge_mqtt::test_utils::{MockTransport, MemoryBus};
//!
//! let transport = Arc::new(MockTransport::new());
//! let client = BrokerClient::new(transport.clone(), &ConnectConfig::default())?;
//! client.connect().await?;
//!
//! let acks = transport.inject("v3/app@ttn/devices/dev/up", envelope).await;
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::bus::{BusDelivery, InternalBus, DEFAULT_BUS_CAPACITY};
use crate::error::{BridgeError, Result};
use crate::transport::{Acknowledger, BrokerMessage, BrokerTransport, QoS, TransportEvent};

/// Acknowledger counting how often it was invoked
#[derive(Debug, Default)]
pub(crate) struct CountingAcker {
    count: Arc<AtomicUsize>,
}

impl CountingAcker {
    /// Create an acker and the counter it increments
    pub(crate) fn new() -> (Self, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        (
            Self {
                count: count.clone(),
            },
            count,
        )
    }
}

#[async_trait]
impl Acknowledger for CountingAcker {
    async fn ack(&self) -> Result<()> {
        self.count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Acknowledger whose ack never reaches the broker
struct LostAcker;

#[async_trait]
impl Acknowledger for LostAcker {
    async fn ack(&self) -> Result<()> {
        Err(BridgeError::NotConnected)
    }
}

fn acked_message(topic: &str, payload: Vec<u8>) -> (BrokerMessage, Arc<AtomicUsize>) {
    let (acker, count) = CountingAcker::new();
    (
        BrokerMessage::with_acknowledger(topic, payload, Arc::new(acker)),
        count,
    )
}

#[derive(Default)]
struct MockState {
    events: Option<mpsc::Sender<TransportEvent>>,
    connect_attempts: usize,
    connect_failures: usize,
    connect_delay: Duration,
    publish_delay: Duration,
    failing_subscribes: HashSet<String>,
    failing_publishes: HashSet<String>,
    subscribed: Vec<String>,
    unsubscribed: Vec<String>,
    published: Vec<(String, Vec<u8>)>,
    disconnects: usize,
}

/// Mock broker transport for testing
///
/// Connects instantly unless told otherwise, records subscribe, unsubscribe
/// and publish calls, and lets tests inject inbound messages and connection
/// events.
#[derive(Default)]
pub struct MockTransport {
    state: Mutex<MockState>,
}

impl MockTransport {
    /// Create a new mock transport
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` connect attempts
    pub fn fail_connects(&self, n: usize) {
        self.state.lock().connect_failures = n;
    }

    /// Delay every connect attempt
    pub fn set_connect_delay(&self, delay: Duration) {
        self.state.lock().connect_delay = delay;
    }

    /// Delay every publish
    pub fn set_publish_delay(&self, delay: Duration) {
        self.state.lock().publish_delay = delay;
    }

    /// Reject subscriptions to `topic`
    pub fn fail_subscribe(&self, topic: &str) {
        self.state.lock().failing_subscribes.insert(topic.to_string());
    }

    /// Reject publishes to `topic`
    pub fn fail_publish(&self, topic: &str) {
        self.state.lock().failing_publishes.insert(topic.to_string());
    }

    /// Number of connect calls so far
    pub fn connect_attempts(&self) -> usize {
        self.state.lock().connect_attempts
    }

    /// Number of disconnect calls so far
    pub fn disconnects(&self) -> usize {
        self.state.lock().disconnects
    }

    /// Topics passed to subscribe, in call order
    pub fn subscribed_topics(&self) -> Vec<String> {
        self.state.lock().subscribed.clone()
    }

    /// Topics passed to unsubscribe, in call order
    pub fn unsubscribed_topics(&self) -> Vec<String> {
        self.state.lock().unsubscribed.clone()
    }

    /// Publishes so far as (topic, payload)
    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.state.lock().published.clone()
    }

    /// Forget recorded subscribe, unsubscribe and publish calls
    pub fn clear_calls(&self) {
        let mut state = self.state.lock();
        state.subscribed.clear();
        state.unsubscribed.clear();
        state.published.clear();
    }

    fn events(&self) -> Option<mpsc::Sender<TransportEvent>> {
        self.state.lock().events.clone()
    }

    async fn emit(&self, event: TransportEvent) {
        if let Some(events) = self.events() {
            let _ = events.send(event).await;
        }
    }

    /// Deliver an inbound publish; returns the message's ack counter
    pub async fn inject(&self, topic: &str, payload: Vec<u8>) -> Arc<AtomicUsize> {
        let (message, acks) = acked_message(topic, payload);
        self.emit(TransportEvent::Message(message)).await;
        acks
    }

    /// Deliver an inbound publish whose acknowledgement fails
    pub async fn inject_unackable(&self, topic: &str, payload: Vec<u8>) {
        let message = BrokerMessage::with_acknowledger(topic, payload, Arc::new(LostAcker));
        self.emit(TransportEvent::Message(message)).await;
    }

    /// Report a lost connection
    pub async fn drop_connection(&self, reason: &str) {
        self.emit(TransportEvent::ConnectionLost(reason.to_string()))
            .await;
    }

    /// Report a successful automatic reconnect
    pub async fn restore_connection(&self) {
        self.emit(TransportEvent::Connected).await;
    }
}

#[async_trait]
impl BrokerTransport for MockTransport {
    async fn connect(&self, events: mpsc::Sender<TransportEvent>) -> Result<()> {
        let (delay, fail) = {
            let mut state = self.state.lock();
            state.connect_attempts += 1;
            let fail = state.connect_failures > 0;
            if fail {
                state.connect_failures -= 1;
            }
            (state.connect_delay, fail)
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if fail {
            return Err(BridgeError::Connection("connection refused".to_string()));
        }

        self.state.lock().events = Some(events);
        Ok(())
    }

    async fn subscribe(&self, topic: &str, _qos: QoS) -> Result<()> {
        let mut state = self.state.lock();
        if state.failing_subscribes.contains(topic) {
            return Err(BridgeError::subscription(topic, "not authorized"));
        }
        state.subscribed.push(topic.to_string());
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<()> {
        self.state.lock().unsubscribed.push(topic.to_string());
        Ok(())
    }

    async fn publish(&self, topic: &str, _qos: QoS, payload: Bytes) -> Result<()> {
        let delay = self.state.lock().publish_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        if state.failing_publishes.contains(topic) {
            return Err(BridgeError::publish(topic, "broker rejected publish"));
        }
        state.published.push((topic.to_string(), payload.to_vec()));
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.disconnects += 1;
        state.events = None;
        Ok(())
    }

    fn name(&self) -> &str {
        "MockTransport"
    }
}

/// In-memory internal bus
#[derive(Default)]
pub struct MemoryBus {
    published: Mutex<Vec<(String, Vec<u8>)>>,
    subscriptions: Mutex<HashMap<String, mpsc::Sender<BusDelivery>>>,
    failing: AtomicBool,
    sequence: AtomicU64,
    publish_delay: Mutex<Duration>,
}

impl MemoryBus {
    /// Create an empty bus
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every publish fail (or succeed again)
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Hold every publish for `delay` before accepting it
    pub fn set_publish_delay(&self, delay: Duration) {
        *self.publish_delay.lock() = delay;
    }

    /// Everything published, as (topic, data)
    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.published.lock().clone()
    }

    /// Data published on one topic
    pub fn published_on(&self, topic: &str) -> Vec<Vec<u8>> {
        self.published
            .lock()
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, data)| data.clone())
            .collect()
    }

    /// Deliver a message to a subscription; returns its ack counter
    pub async fn deliver(&self, subscription: &str, data: Vec<u8>) -> Arc<AtomicUsize> {
        let (message, acks) = acked_message(subscription, data);
        let sender = self.subscriptions.lock().get(subscription).cloned();
        if let Some(sender) = sender {
            let _ = sender.send(BusDelivery::from(message)).await;
        }
        acks
    }
}

#[async_trait]
impl InternalBus for MemoryBus {
    async fn publish(&self, topic: &str, data: Bytes) -> Result<String> {
        let delay = *self.publish_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(BridgeError::publish(topic, "bus unavailable"));
        }
        self.published.lock().push((topic.to_string(), data.to_vec()));
        let id = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(id.to_string())
    }

    async fn subscribe(&self, subscription: &str) -> Result<mpsc::Receiver<BusDelivery>> {
        let (tx, rx) = mpsc::channel(DEFAULT_BUS_CAPACITY);
        self.subscriptions
            .lock()
            .insert(subscription.to_string(), tx);
        Ok(rx)
    }
}

/// Poll `condition` until it holds, panicking after five seconds
pub async fn wait_until(condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within 5s"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// TTN v3 wire envelopes
pub mod envelopes {
    use serde_json::{json, Value};

    /// Uplink with one radio metadata entry
    pub fn uplink(device_id: &str, frm_payload: &str) -> Vec<u8> {
        uplink_value(device_id, frm_payload, true).to_string().into_bytes()
    }

    /// Uplink without radio metadata
    pub fn uplink_without_metadata(device_id: &str, frm_payload: &str) -> Vec<u8> {
        uplink_value(device_id, frm_payload, false)
            .to_string()
            .into_bytes()
    }

    fn uplink_value(device_id: &str, frm_payload: &str, metadata: bool) -> Value {
        let rx_metadata = if metadata {
            json!([{
                "gateway_ids": {"gateway_id": "gw-1"},
                "rssi": -80,
                "snr": 5.5,
                "location": {"latitude": 1.0, "longitude": 2.0, "altitude": 3}
            }])
        } else {
            json!([])
        };
        json!({
            "end_device_ids": {
                "device_id": device_id,
                "application_ids": {"application_id": "my-app"},
                "dev_eui": "0004A30B001C0530"
            },
            "received_at": "2024-05-01T12:00:00Z",
            "uplink_message": {
                "f_port": 1,
                "frm_payload": frm_payload,
                "rx_metadata": rx_metadata
            }
        })
    }

    /// Join accept
    pub fn join(device_id: &str) -> Vec<u8> {
        json!({
            "end_device_ids": {"device_id": device_id},
            "received_at": "2024-05-01T12:00:00Z",
            "join_accept": {"session_key_id": "AXA="}
        })
        .to_string()
        .into_bytes()
    }

    /// Downlink lifecycle event for `stage` (`queued`, `sent`, `ack`, `nack`, `failed`)
    pub fn downlink_event(device_id: &str, stage: &str, frm_payload: &str) -> Vec<u8> {
        let body = json!({"f_port": 15, "frm_payload": frm_payload, "priority": "HIGH"});
        let key = match stage {
            "failed" => "downlink_failed",
            other => return downlink_stage(device_id, &format!("downlink_{other}"), body),
        };
        downlink_stage(
            device_id,
            key,
            json!({"downlink": body, "error": {"name": "no_gateway"}}),
        )
    }

    fn downlink_stage(device_id: &str, key: &str, body: Value) -> Vec<u8> {
        let mut envelope = json!({
            "end_device_ids": {"device_id": device_id},
            "received_at": "2024-05-01T12:00:00Z",
        });
        envelope[key] = body;
        envelope.to_string().into_bytes()
    }

    /// Uplink error event
    pub fn uplink_error(device_id: &str) -> Vec<u8> {
        json!({
            "name": "as.up.data.process.fail",
            "identifiers": [{"device_ids": {"device_id": device_id}}],
            "end_device_ids": {"device_id": device_id},
            "data": {"message": "decoder failed"}
        })
        .to_string()
        .into_bytes()
    }
}

//! Resilient broker client
//!
//! Wraps a [`BrokerTransport`] with bounded connect retries, a subscription
//! registry, and replay of every registered subscription when the transport
//! reports that it reconnected.
//!
//! ```text
//! Disconnected ──connect()──► Connecting ──ConnAck──► Connected
//!      ▲                          │                     │   ▲
//!      └──── retries exhausted ───┘        connection lost   │ reconnected,
//!                                                       ▼   │ subscriptions replayed
//!                                                   Reconnecting
//! ```

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::ConnectConfig;
use crate::error::{BridgeError, Result};
use crate::registry::{Handler, SubscriptionRegistry};
use crate::transport::{
    qos_from_u8, BrokerMessage, BrokerTransport, ConnectionState, QoS, TransportEvent,
};

/// Capacity of the transport event channel
const EVENT_CAPACITY: usize = 64;

struct Inner {
    transport: Arc<dyn BrokerTransport>,
    config: ConnectConfig,
    publish_qos: QoS,
    subscribe_qos: QoS,
    registry: SubscriptionRegistry,
    state: watch::Sender<ConnectionState>,
    // Bumped on every connection loss
    epoch: AtomicU64,
    connect_lock: tokio::sync::Mutex<()>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

/// Broker client with retrying connect and subscription replay
///
/// Cheap to clone; clones share the connection and registry.
#[derive(Clone)]
pub struct BrokerClient {
    inner: Arc<Inner>,
}

impl BrokerClient {
    /// Create a client over a transport
    pub fn new(transport: Arc<dyn BrokerTransport>, config: &ConnectConfig) -> Result<Self> {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Ok(Self {
            inner: Arc::new(Inner {
                transport,
                publish_qos: qos_from_u8(config.publish_qos)?,
                subscribe_qos: qos_from_u8(config.subscribe_qos)?,
                config: config.clone(),
                registry: SubscriptionRegistry::new(),
                state,
                epoch: AtomicU64::new(0),
                connect_lock: tokio::sync::Mutex::new(()),
                dispatcher: Mutex::new(None),
            }),
        })
    }

    /// Connect to the broker
    ///
    /// Makes up to `retries` attempts, `retry_delay` apart. An attempt that
    /// outlives `attempt_timeout` is logged and then awaited to completion.
    /// Returns immediately if already connected.
    pub async fn connect(&self) -> Result<()> {
        let _guard = self.inner.connect_lock.lock().await;

        match self.state() {
            ConnectionState::Connected | ConnectionState::Reconnecting => {
                debug!("Already connected to {}", self.inner.transport.name());
                return Ok(());
            }
            _ => {}
        }

        let name = self.inner.transport.name().to_string();
        let retries = self.inner.config.retries;
        self.inner.state.send_replace(ConnectionState::Connecting);
        info!("Connecting to broker: {}", name);

        let mut last_error = None;
        for attempt in 1..=retries {
            let (events_tx, events_rx) = mpsc::channel(EVENT_CAPACITY);
            match self.attempt(events_tx).await {
                Ok(()) => {
                    let dispatcher = tokio::spawn(dispatch(self.inner.clone(), events_rx));
                    if let Some(old) = self.inner.dispatcher.lock().replace(dispatcher) {
                        old.abort();
                    }
                    self.inner.state.send_replace(ConnectionState::Connected);
                    info!("Connected to broker: {} (attempt {})", name, attempt);
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        "Connection attempt {}/{} to {} failed: {}",
                        attempt, retries, name, e
                    );
                    last_error = Some(e);
                    if attempt < retries {
                        tokio::time::sleep(self.inner.config.retry_delay).await;
                    }
                }
            }
        }

        self.inner.state.send_replace(ConnectionState::Disconnected);
        let reason = match last_error {
            Some(e) => format!("{} after {} attempts: {}", name, retries, e),
            None => format!("{}: no connection attempts configured", name),
        };
        error!("Giving up connecting to broker: {}", reason);
        Err(BridgeError::Connection(reason))
    }

    async fn attempt(&self, events: mpsc::Sender<TransportEvent>) -> Result<()> {
        let connecting = self.inner.transport.connect(events);
        tokio::pin!(connecting);

        match tokio::time::timeout(self.inner.config.attempt_timeout, &mut connecting).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    "Connection to {} took longer than expected ({:?}), still waiting",
                    self.inner.transport.name(),
                    self.inner.config.attempt_timeout
                );
                connecting
                    .await
                    .map_err(|e| BridgeError::ConnectionTimeout {
                        duration_ms: u64::try_from(self.inner.config.attempt_timeout.as_millis())
                            .unwrap_or(u64::MAX),
                        reason: e.to_string(),
                    })
            }
        }
    }

    /// Register `handler` for a topic filter and subscribe at the broker
    ///
    /// Re-subscribing a registered filter replaces its handler.
    pub async fn subscribe(&self, topic: &str, handler: Handler) -> Result<()> {
        match self.state() {
            ConnectionState::Disconnected | ConnectionState::Connecting => {
                return Err(BridgeError::NotConnected)
            }
            ConnectionState::Reconnecting => {
                self.inner.registry.insert(topic, handler);
                debug!("Subscription to {} deferred until reconnect", topic);
                return Ok(());
            }
            ConnectionState::Connected => {}
        }

        if self.inner.registry.insert(topic, handler) {
            debug!("Replaced handler for {}", topic);
        }

        if let Err(e) = self
            .inner
            .transport
            .subscribe(topic, self.inner.subscribe_qos)
            .await
        {
            self.inner.registry.remove(topic);
            return Err(e);
        }

        info!("Subscribed to {}", topic);
        Ok(())
    }

    /// Subscribe with a fresh bounded channel and return its receiver
    pub async fn subscribe_channel(
        &self,
        topic: &str,
        capacity: usize,
    ) -> Result<mpsc::Receiver<BrokerMessage>> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.subscribe(topic, tx).await?;
        Ok(rx)
    }

    /// Remove a subscription
    pub async fn unsubscribe(&self, topic: &str) -> Result<()> {
        self.inner.registry.remove(topic);
        if self.is_connected() {
            self.inner.transport.unsubscribe(topic).await?;
        }
        debug!("Unsubscribed from {}", topic);
        Ok(())
    }

    /// Publish at the configured QoS
    pub async fn publish(&self, topic: &str, payload: impl Into<Bytes>) -> Result<()> {
        match self.state() {
            ConnectionState::Disconnected | ConnectionState::Connecting => {
                Err(BridgeError::NotConnected)
            }
            _ => {
                self.inner
                    .transport
                    .publish(topic, self.inner.publish_qos, payload.into())
                    .await
            }
        }
    }

    /// Close the connection and drop every subscription
    ///
    /// Handler channels are closed, which ends consumers reading them.
    pub async fn disconnect(&self) -> Result<()> {
        let _guard = self.inner.connect_lock.lock().await;
        if self.state() == ConnectionState::Disconnected {
            return Ok(());
        }

        self.inner.registry.clear();
        let result = self.inner.transport.disconnect().await;
        if let Some(dispatcher) = self.inner.dispatcher.lock().take() {
            dispatcher.abort();
        }
        self.inner.state.send_replace(ConnectionState::Disconnected);
        info!("Disconnected from broker: {}", self.inner.transport.name());
        result
    }

    /// Whether the connection is up
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Registered topic filters
    pub fn topics(&self) -> Vec<String> {
        self.inner.registry.topics()
    }

    /// Transport name, for logging
    pub fn name(&self) -> &str {
        self.inner.transport.name()
    }
}

async fn dispatch(inner: Arc<Inner>, mut events: mpsc::Receiver<TransportEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::Message(message) => inner.deliver(message).await,
            TransportEvent::ConnectionLost(reason) => {
                inner.epoch.fetch_add(1, Ordering::SeqCst);
                inner.state.send_replace(ConnectionState::Reconnecting);
                error!(
                    "Connection to {} lost: {}; reconnecting",
                    inner.transport.name(),
                    reason
                );
            }
            TransportEvent::Connected => {
                // Replayed off this task so deliveries keep flowing while
                // the broker answers the subscribes
                tokio::spawn(inner.clone().restore());
            }
        }
    }
    debug!("Broker event dispatcher stopped");
}

impl Inner {
    async fn deliver(&self, message: BrokerMessage) {
        let handlers = self.registry.handlers_for(message.topic());

        let mut delivered = false;
        for handler in handlers {
            // Waits for room: a full handler slows down the transport
            if handler.send(message.clone()).await.is_ok() {
                delivered = true;
            }
        }

        if !delivered {
            warn!("Unhandled message: topic={}", message.topic());
            if let Err(e) = message.ack().await {
                warn!("Failed to acknowledge unhandled message: {}", e);
            }
        }
    }

    async fn restore(self: Arc<Self>) {
        let epoch = self.epoch.load(Ordering::SeqCst);
        self.resubscribe().await;

        // A loss during the replay leaves the state to the next reconnect
        let restored = self.state.send_if_modified(|state| {
            let current = *state == ConnectionState::Reconnecting
                && self.epoch.load(Ordering::SeqCst) == epoch;
            if current {
                *state = ConnectionState::Connected;
            }
            current
        });
        if restored {
            info!("Reconnected to broker: {}", self.transport.name());
        }
    }

    async fn resubscribe(&self) {
        let topics = self.registry.topics();
        let mut replayed = 0;
        for topic in &topics {
            match self.transport.subscribe(topic, self.subscribe_qos).await {
                Ok(()) => replayed += 1,
                Err(e) => error!("Failed to restore subscription to {}: {}", topic, e),
            }
        }
        info!(
            "Restored {}/{} subscriptions on {}",
            replayed,
            topics.len(),
            self.transport.name()
        );
    }
}

//! BridgeProxy - broker to internal bus forwarding service
//!
//! Wires one [`BrokerClient`], one [`TopicAdapter`], one [`PayloadAdjuster`]
//! and an [`InternalBus`] together:
//!
//! - Broker → bus: one forwarding loop per category, each reading its own
//!   bounded channel in arrival order
//! - Bus → broker: one loop consuming downlink requests, when the
//!   deployment accepts downlinks
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          BridgeProxy                             │
//! ├──────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  ┌──────────────┐  join    ┌──────────┐                          │
//! │  │ BrokerClient │─────────►│ loop     │──┐                       │
//! │  │              │  up      ├──────────┤  │  TopicAdapter         │
//! │  │  registry    │─────────►│ loop     │──┼─► PayloadAdjuster ──► │ InternalBus
//! │  │  dispatcher  │  down/*  ├──────────┤  │                       │
//! │  │              │─────────►│ loop     │──┘                       │
//! │  │              │          └──────────┘                          │
//! │  │              │◄── down/replace ◄── downlink loop ◄────────────│ downlinks
//! │  └──────────────┘                                                │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every broker message is acknowledged once processed, whether or not it
//! parsed or reached the bus. Malformed or unpublishable messages are logged
//! and dropped instead of being redelivered.
//!
//! # Example
//!
//! ```rust,ignore
//! let mut proxy = BridgeProxy::new(client, adapter, Arc::new(IdentityAdjuster), bus, &config);
//! proxy.initialize().await?;
//! let handle = proxy.run().await?;
//!
//! tokio::signal::ctrl_c().await?;
//! handle.shutdown().await?;
//! ```

use chrono::Utc;
use futures::future::join_all;
use lorabridge_core::{Category, LoraMessage, SimpleMessage};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::adapter::{TopicAdapter, ALL_DEVICES};
use crate::adjuster::PayloadAdjuster;
use crate::bus::{BusDelivery, InternalBus};
use crate::client::BrokerClient;
use crate::config::{BridgeConfig, BusConfig, ProxyConfig};
use crate::error::{BridgeError, Result};
use crate::transport::BrokerMessage;

/// Proxy statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyStats {
    /// Broker messages received on any category
    pub received: u64,
    /// Messages published to the internal bus
    pub forwarded: u64,
    /// Broker messages that failed to parse
    pub decode_errors: u64,
    /// Uplinks whose payload adjustment failed
    pub adjust_errors: u64,
    /// Failed internal bus publishes
    pub publish_errors: u64,
    /// Broker messages acknowledged
    pub acknowledged: u64,
    /// Downlinks handed to the broker
    pub downlinks_sent: u64,
    /// Downlink requests that could not be sent
    pub downlink_errors: u64,
    /// Downlink requests addressed to another application
    pub source_mismatches: u64,
}

#[derive(Debug, Default)]
struct Counters {
    received: AtomicU64,
    forwarded: AtomicU64,
    decode_errors: AtomicU64,
    adjust_errors: AtomicU64,
    publish_errors: AtomicU64,
    acknowledged: AtomicU64,
    downlinks_sent: AtomicU64,
    downlink_errors: AtomicU64,
    source_mismatches: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ProxyStats {
        ProxyStats {
            received: self.received.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            adjust_errors: self.adjust_errors.load(Ordering::Relaxed),
            publish_errors: self.publish_errors.load(Ordering::Relaxed),
            acknowledged: self.acknowledged.load(Ordering::Relaxed),
            downlinks_sent: self.downlinks_sent.load(Ordering::Relaxed),
            downlink_errors: self.downlink_errors.load(Ordering::Relaxed),
            source_mismatches: self.source_mismatches.load(Ordering::Relaxed),
        }
    }
}

struct Context {
    client: BrokerClient,
    adapter: Arc<dyn TopicAdapter>,
    adjuster: Arc<dyn PayloadAdjuster>,
    bus: Arc<dyn InternalBus>,
    topics: BusConfig,
    config: ProxyConfig,
    counters: Arc<Counters>,
}

struct CategoryChannel {
    category: Category,
    topic: String,
    messages: mpsc::Receiver<BrokerMessage>,
}

/// Forwards broker traffic to the internal bus and downlinks back
pub struct BridgeProxy {
    context: Arc<Context>,
    channels: Vec<CategoryChannel>,
}

impl BridgeProxy {
    /// Create a proxy from its collaborators
    pub fn new(
        client: BrokerClient,
        adapter: Arc<dyn TopicAdapter>,
        adjuster: Arc<dyn PayloadAdjuster>,
        bus: Arc<dyn InternalBus>,
        config: &BridgeConfig,
    ) -> Self {
        Self {
            context: Arc::new(Context {
                client,
                adapter,
                adjuster,
                bus,
                topics: config.bus.clone(),
                config: config.proxy.clone(),
                counters: Arc::new(Counters::default()),
            }),
            channels: Vec::new(),
        }
    }

    /// Connect and subscribe to every configured category
    ///
    /// Fails on the first subscription error, after removing the
    /// subscriptions already made.
    pub async fn initialize(&mut self) -> Result<()> {
        let ctx = self.context.clone();
        ctx.client.connect().await?;

        let mut categories: Vec<Category> = Vec::new();
        for category in &ctx.config.categories {
            if !categories.contains(category) {
                categories.push(*category);
            }
        }

        for category in categories {
            let topic = ctx.adapter.topic_for(ALL_DEVICES, category);
            match ctx
                .client
                .subscribe_channel(&topic, ctx.config.channel_capacity)
                .await
            {
                Ok(messages) => {
                    debug!("Subscribed {} channel: topic={}", category, topic);
                    self.channels.push(CategoryChannel {
                        category,
                        topic,
                        messages,
                    });
                }
                Err(e) => {
                    error!("Could not subscribe to {}: {}", category, e);
                    self.rollback().await;
                    return Err(match e {
                        BridgeError::Subscription { .. } => e,
                        other => BridgeError::subscription(topic, other),
                    });
                }
            }
        }

        info!(
            "Proxy initialized for {}: {} categories via {}",
            ctx.adapter.source(),
            self.channels.len(),
            ctx.adapter.name()
        );
        Ok(())
    }

    async fn rollback(&mut self) {
        for channel in self.channels.drain(..) {
            if let Err(e) = self.context.client.unsubscribe(&channel.topic).await {
                warn!("Failed to remove subscription {}: {}", channel.topic, e);
            }
        }
    }

    /// Categories with an active subscription
    pub fn categories(&self) -> Vec<Category> {
        self.channels.iter().map(|c| c.category).collect()
    }

    /// Spawn the forwarding loops and return without waiting on them
    pub async fn run(self) -> Result<ProxyHandle> {
        if self.channels.is_empty() {
            return Err(BridgeError::InvalidConfig(
                "proxy must be initialized before it runs".to_string(),
            ));
        }

        let ctx = self.context;
        let mut tasks = Vec::with_capacity(self.channels.len());
        for channel in self.channels {
            tasks.push(tokio::spawn(forward(ctx.clone(), channel)));
        }

        let downlink_task = match (&ctx.topics.downlinks, ctx.config.can_downlink) {
            (Some(subscription), true) => {
                let requests = ctx.bus.subscribe(subscription).await?;
                info!("Accepting downlinks from {}", subscription);
                Some(tokio::spawn(downlinks(ctx.clone(), requests)))
            }
            _ => {
                debug!("Downlinks disabled for {}", ctx.adapter.source());
                None
            }
        };

        info!("Proxy running: {} forwarding loops", tasks.len());
        Ok(ProxyHandle {
            client: ctx.client.clone(),
            counters: ctx.counters.clone(),
            tasks,
            downlink_task,
        })
    }
}

async fn forward(ctx: Arc<Context>, mut channel: CategoryChannel) {
    let category = channel.category;
    debug!("Forwarding loop started: {}", category);

    while let Some(message) = channel.messages.recv().await {
        Counters::bump(&ctx.counters.received);
        let parsed = ctx.process(category, &message);

        match message.ack().await {
            Ok(()) => Counters::bump(&ctx.counters.acknowledged),
            Err(e) => warn!(
                "Failed to acknowledge {}: topic={}, {}",
                category,
                message.topic(),
                e
            ),
        }

        if let Some(lora) = parsed {
            ctx.publish(category, &lora).await;
        }
    }

    debug!("Forwarding loop stopped: {}", category);
}

async fn downlinks(ctx: Arc<Context>, mut requests: mpsc::Receiver<BusDelivery>) {
    while let Some(request) = requests.recv().await {
        match ctx.send_downlink(request.data()).await {
            Ok(()) => Counters::bump(&ctx.counters.downlinks_sent),
            Err(e) => {
                Counters::bump(&ctx.counters.downlink_errors);
                error!("Could not send downlink: {} ({})", e, e.error_code());
            }
        }
        if let Err(e) = request.ack().await {
            warn!("Failed to acknowledge downlink request: {}", e);
        }
    }
    debug!("Downlink loop stopped");
}

impl Context {
    fn process(&self, category: Category, message: &BrokerMessage) -> Option<LoraMessage> {
        if category == Category::UplinkError {
            warn!(
                "Uplink error: topic={}, event={}",
                message.topic(),
                String::from_utf8_lossy(message.payload())
            );
        }

        let mut lora = match self.adapter.parse(category, message.payload()) {
            Ok(lora) => lora,
            Err(e) => {
                Counters::bump(&self.counters.decode_errors);
                error!(
                    "Dropping malformed {}: topic={}, {}",
                    category,
                    message.topic(),
                    e
                );
                return None;
            }
        };

        if category == Category::Uplink {
            if let Err(e) = self.adjuster.adjust(&mut lora) {
                Counters::bump(&self.counters.adjust_errors);
                warn!(
                    "Payload adjustment failed: device={}, {}",
                    lora.device_uid(),
                    e
                );
            }
        }

        Some(lora)
    }

    async fn publish(&self, category: Category, lora: &LoraMessage) {
        let Some(topic) = self.topics.topic_for(category) else {
            if category != Category::UplinkError {
                warn!("No bus topic for {}: device={}", category, lora.device_uid());
            }
            return;
        };

        let result = match lora.to_json() {
            Ok(data) => self.bus.publish(topic, data.into()).await,
            Err(e) => Err(e.into()),
        };

        match result {
            Ok(id) => {
                Counters::bump(&self.counters.forwarded);
                info!(
                    "Forwarded {}: device={}, topic={}, id={}",
                    category,
                    lora.device_uid(),
                    topic,
                    id
                );
            }
            Err(e) => {
                Counters::bump(&self.counters.publish_errors);
                error!(
                    "Failed to publish {}: device={}, topic={}, {}",
                    category,
                    lora.device_uid(),
                    topic,
                    e
                );
            }
        }
    }

    async fn send_downlink(&self, data: &[u8]) -> Result<()> {
        let request = SimpleMessage::from_json(data)
            .map_err(|e| BridgeError::Decode(format!("invalid downlink request: {e}")))?;

        if request.source() != self.adapter.source() {
            Counters::bump(&self.counters.source_mismatches);
            warn!(
                "Downlink source does not match proxy: proxy={}, request={}",
                self.adapter.source(),
                request.source()
            );
        }

        // Replace so a device never has more than one queued downlink
        let topic = self.adapter.downlink_topic_replace(request.device_uid());
        let correlation_id = format!("{}-{}", request.device_uid(), Utc::now().timestamp());
        let payload = self
            .adapter
            .render_downlink(&request, Some(vec![correlation_id]))?;

        tokio::time::timeout(
            self.config.downlink_publish_timeout,
            self.client.publish(&topic, payload),
        )
        .await
        .map_err(|_| BridgeError::publish(&topic, "timed out waiting for broker"))??;

        info!(
            "Sent downlink: device={}, payload={}",
            request.device_uid(),
            hex(&request.payload)
        );
        Ok(())
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Handle for a running proxy
pub struct ProxyHandle {
    client: BrokerClient,
    counters: Arc<Counters>,
    tasks: Vec<JoinHandle<()>>,
    downlink_task: Option<JoinHandle<()>>,
}

impl ProxyHandle {
    /// Current statistics
    pub fn stats(&self) -> ProxyStats {
        self.counters.snapshot()
    }

    /// Number of forwarding loops still running
    pub fn active_loops(&self) -> usize {
        self.tasks.iter().filter(|task| !task.is_finished()).count()
    }

    /// Whether the downlink loop was started
    pub fn accepts_downlinks(&self) -> bool {
        self.downlink_task.is_some()
    }

    /// Disconnect from the broker and wait for the loops to drain
    pub async fn shutdown(self) -> Result<()> {
        info!("Proxy shutdown requested");
        if let Some(task) = self.downlink_task {
            task.abort();
        }

        let result = self.client.disconnect().await;
        for result in join_all(self.tasks).await {
            if let Err(e) = result {
                warn!("Forwarding loop ended abnormally: {}", e);
            }
        }

        info!("Proxy stopped: {:?}", self.counters.snapshot());
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::TtnV3;
    use crate::adjuster::IdentityAdjuster;
    use crate::config::{BridgeConfigBuilder, ConnectConfig};
    use crate::test_utils::{MemoryBus, MockTransport};

    fn proxy(transport: &Arc<MockTransport>, config: &BridgeConfig) -> BridgeProxy {
        let client = BrokerClient::new(transport.clone(), &ConnectConfig::default()).unwrap();
        BridgeProxy::new(
            client,
            Arc::new(TtnV3::new("my-app")),
            Arc::new(IdentityAdjuster),
            Arc::new(MemoryBus::new()),
            config,
        )
    }

    #[tokio::test]
    async fn test_initialize_subscribes_every_category() {
        let transport = Arc::new(MockTransport::new());
        let config = BridgeConfigBuilder::new().application("my-app", "key").build();
        let mut proxy = proxy(&transport, &config);

        proxy.initialize().await.unwrap();

        assert_eq!(proxy.categories(), Category::DEFAULT_INBOUND.to_vec());
        assert_eq!(
            transport.subscribed_topics(),
            vec![
                "v3/my-app@ttn/devices/+/join",
                "v3/my-app@ttn/devices/+/up",
                "v3/my-app@ttn/devices/+/events/up/error",
                "v3/my-app@ttn/devices/+/down/queued",
                "v3/my-app@ttn/devices/+/down/sent",
                "v3/my-app@ttn/devices/+/down/failed",
            ]
        );
    }

    #[tokio::test]
    async fn test_initialize_dedupes_categories() {
        let transport = Arc::new(MockTransport::new());
        let config = BridgeConfigBuilder::new()
            .application("my-app", "key")
            .categories([Category::Uplink, Category::Uplink, Category::DownlinkAck])
            .build();
        let mut proxy = proxy(&transport, &config);

        proxy.initialize().await.unwrap();
        assert_eq!(
            proxy.categories(),
            vec![Category::Uplink, Category::DownlinkAck]
        );
    }

    #[tokio::test]
    async fn test_initialize_fails_fast_and_rolls_back() {
        let transport = Arc::new(MockTransport::new());
        transport.fail_subscribe("v3/my-app@ttn/devices/+/events/up/error");
        let config = BridgeConfigBuilder::new().application("my-app", "key").build();
        let mut proxy = proxy(&transport, &config);

        let err = proxy.initialize().await.unwrap_err();

        assert!(matches!(err, BridgeError::Subscription { .. }));
        assert!(proxy.categories().is_empty());
        assert_eq!(
            transport.unsubscribed_topics(),
            vec!["v3/my-app@ttn/devices/+/join", "v3/my-app@ttn/devices/+/up"]
        );
        // Nothing was wired, so there is nothing to run
        assert!(proxy.run().await.is_err());
    }

    #[test]
    fn test_hex() {
        assert_eq!(hex(&[0x00, 0x02, 0xDE]), "0002de");
    }
}

//! Configuration types for the bridge
//!
//! This module provides configuration structures for the broker connection,
//! connect/retry behavior, the protocol adapter, the proxy and the internal
//! bus. Configuration files are JSON, one per deployment
//! (`<deployment>-config.json`).

use lorabridge_core::Category;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::address::BrokerAddress;
use crate::error::{BridgeError, Result};

/// Default number of connect attempts
pub const DEFAULT_CONNECT_RETRIES: u32 = 5;

/// Default delay between connect attempts
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Default time to wait on a connect attempt before warning
pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(1);

/// Default wait for the broker to answer a subscribe
pub const DEFAULT_SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default capacity of each category channel
pub const DEFAULT_CHANNEL_CAPACITY: usize = 10;

/// Default bound on publish acknowledgement for downlinks
pub const DEFAULT_DOWNLINK_PUBLISH_TIMEOUT: Duration = Duration::from_secs(2);

/// Default MQTT keep-alive interval
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(30);

/// Main configuration for a bridge deployment
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Network-server broker connection
    #[serde(default)]
    pub broker: BrokerConfig,

    /// Connect and retry behavior
    #[serde(default)]
    pub connect: ConnectConfig,

    /// Protocol adapter selection
    #[serde(default)]
    pub adapter: AdapterConfig,

    /// Proxy behavior
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Internal bus connection and topics
    #[serde(default)]
    pub bus: BusConfig,
}

impl BridgeConfig {
    /// Load a configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read(path.as_ref())?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// Load `<deployment>-config.json` from a directory
    pub fn for_deployment(dir: impl AsRef<Path>, deployment: &str) -> Result<Self> {
        Self::from_file(Self::deployment_path(dir, deployment))
    }

    /// Path of the configuration file for a deployment
    pub fn deployment_path(dir: impl AsRef<Path>, deployment: &str) -> PathBuf {
        dir.as_ref().join(format!("{deployment}-config.json"))
    }

    /// Check the configuration for missing or inconsistent settings
    pub fn validate(&self) -> Result<()> {
        if self.broker.app_id.is_empty() {
            return Err(BridgeError::MissingConfig("broker.app_id".to_string()));
        }
        BrokerAddress::parse(&self.broker.address)?;

        if self.proxy.categories.is_empty() {
            return Err(BridgeError::InvalidConfig(
                "proxy.categories must not be empty".to_string(),
            ));
        }
        if self.proxy.channel_capacity == 0 {
            return Err(BridgeError::InvalidConfig(
                "proxy.channel_capacity must be positive".to_string(),
            ));
        }
        if self.connect.publish_qos > 2 || self.connect.subscribe_qos > 2 {
            return Err(BridgeError::InvalidConfig("qos must be 0, 1 or 2".to_string()));
        }
        if self.proxy.can_downlink && self.bus.downlinks.is_none() {
            return Err(BridgeError::MissingConfig("bus.downlinks".to_string()));
        }
        if let Some(address) = &self.bus.address {
            BrokerAddress::parse(address)?;
        }
        Ok(())
    }
}

/// TLS material; all fields optional
///
/// With nothing set, the system trust roots are used and no client
/// certificate is presented.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsConfig {
    /// PEM file with the CA to trust instead of the system roots
    #[serde(default)]
    pub ca_path: Option<PathBuf>,
    /// PEM client certificate
    #[serde(default)]
    pub client_cert_path: Option<PathBuf>,
    /// PEM client private key
    #[serde(default)]
    pub client_key_path: Option<PathBuf>,
}

/// Everything needed to open one MQTT connection
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionSettings {
    /// Broker address as configured
    pub address: String,
    /// MQTT client identifier
    pub client_id: String,
    /// Username, if any
    pub username: Option<String>,
    /// Password or access key
    pub password: String,
    /// Keep-alive interval
    pub keep_alive: Duration,
    /// TLS material
    pub tls: TlsConfig,
}

/// Network-server broker connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Broker address, e.g. `eu1.cloud.thethings.network` or `mqtts://host:8883`
    #[serde(default)]
    pub address: String,

    /// Application identifier on the network server
    #[serde(default)]
    pub app_id: String,

    /// Username; defaults to `<app_id>@<network>`
    #[serde(default)]
    pub username: Option<String>,

    /// Application access key
    #[serde(default)]
    pub app_key: String,

    /// MQTT client identifier
    #[serde(default = "default_client_id")]
    pub client_id: String,

    /// Keep-alive interval
    #[serde(with = "humantime_serde", default = "default_keep_alive")]
    pub keep_alive: Duration,

    /// TLS material
    #[serde(default)]
    pub tls: TlsConfig,
}

fn default_client_id() -> String {
    "lorabridge".to_string()
}

fn default_keep_alive() -> Duration {
    DEFAULT_KEEP_ALIVE
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            app_id: String::new(),
            username: None,
            app_key: String::new(),
            client_id: default_client_id(),
            keep_alive: DEFAULT_KEEP_ALIVE,
            tls: TlsConfig::default(),
        }
    }
}

impl BrokerConfig {
    /// Username to present, falling back to `<app_id>@<network>`
    pub fn username(&self, network: &str) -> String {
        self.username
            .clone()
            .unwrap_or_else(|| format!("{}@{}", self.app_id, network))
    }

    /// Connection settings for the broker transport
    pub fn connection_settings(&self, network: &str) -> ConnectionSettings {
        ConnectionSettings {
            address: self.address.clone(),
            client_id: self.client_id.clone(),
            username: Some(self.username(network)),
            password: self.app_key.clone(),
            keep_alive: self.keep_alive,
            tls: self.tls.clone(),
        }
    }
}

/// Connect and retry behavior of a broker client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectConfig {
    /// Number of connect attempts before giving up
    #[serde(default = "default_retries")]
    pub retries: u32,

    /// Delay between failed attempts
    #[serde(with = "humantime_serde", default = "default_retry_delay")]
    pub retry_delay: Duration,

    /// How long to wait on an attempt before warning and waiting on
    #[serde(with = "humantime_serde", default = "default_attempt_timeout")]
    pub attempt_timeout: Duration,

    /// Pause between automatic reconnect polls after a connection loss
    #[serde(with = "humantime_serde", default = "default_reconnect_delay")]
    pub reconnect_delay: Duration,

    /// How long a subscribe waits for the broker's SUBACK
    #[serde(with = "humantime_serde", default = "default_subscribe_timeout")]
    pub subscribe_timeout: Duration,

    /// QoS for publishes
    #[serde(default)]
    pub publish_qos: u8,

    /// QoS for subscriptions
    #[serde(default)]
    pub subscribe_qos: u8,

    /// Capacity of the MQTT client request queue
    #[serde(default = "default_request_capacity")]
    pub request_capacity: usize,
}

fn default_retries() -> u32 {
    DEFAULT_CONNECT_RETRIES
}

fn default_retry_delay() -> Duration {
    DEFAULT_RETRY_DELAY
}

fn default_attempt_timeout() -> Duration {
    DEFAULT_ATTEMPT_TIMEOUT
}

fn default_reconnect_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_subscribe_timeout() -> Duration {
    DEFAULT_SUBSCRIBE_TIMEOUT
}

fn default_request_capacity() -> usize {
    100
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            retries: DEFAULT_CONNECT_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
            reconnect_delay: default_reconnect_delay(),
            subscribe_timeout: DEFAULT_SUBSCRIBE_TIMEOUT,
            publish_qos: 0,
            subscribe_qos: 0,
            request_capacity: default_request_capacity(),
        }
    }
}

/// Supported network-server protocol versions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterKind {
    /// The Things Stack v3 MQTT integration
    #[default]
    TtnV3,
}

/// Protocol adapter selection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterConfig {
    /// Adapter implementation
    #[serde(default)]
    pub kind: AdapterKind,

    /// Topic namespace prefix
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Network (tenant) name appended to the application id
    #[serde(default = "default_network")]
    pub network: String,
}

fn default_namespace() -> String {
    "v3".to_string()
}

fn default_network() -> String {
    "ttn".to_string()
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            kind: AdapterKind::TtnV3,
            namespace: default_namespace(),
            network: default_network(),
        }
    }
}

/// Proxy behavior configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Broker categories to subscribe to and forward
    #[serde(default = "default_categories")]
    pub categories: Vec<Category>,

    /// Capacity of each category channel
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Bound on waiting for the broker to accept a downlink
    #[serde(with = "humantime_serde", default = "default_downlink_publish_timeout")]
    pub downlink_publish_timeout: Duration,

    /// Whether this deployment accepts downlink requests
    #[serde(default)]
    pub can_downlink: bool,
}

fn default_categories() -> Vec<Category> {
    Category::DEFAULT_INBOUND.to_vec()
}

fn default_channel_capacity() -> usize {
    DEFAULT_CHANNEL_CAPACITY
}

fn default_downlink_publish_timeout() -> Duration {
    DEFAULT_DOWNLINK_PUBLISH_TIMEOUT
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            categories: default_categories(),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            downlink_publish_timeout: DEFAULT_DOWNLINK_PUBLISH_TIMEOUT,
            can_downlink: false,
        }
    }
}

/// Internal bus connection and topic names
///
/// Every topic is optional; a category without a topic is still consumed
/// and acknowledged but not forwarded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Bus broker address; `None` leaves the bus to the embedding program
    #[serde(default)]
    pub address: Option<String>,

    /// MQTT client identifier on the bus
    #[serde(default = "default_bus_client_id")]
    pub client_id: String,

    /// Bus username
    #[serde(default)]
    pub username: Option<String>,

    /// Bus password
    #[serde(default)]
    pub password: String,

    /// TLS material for the bus connection
    #[serde(default)]
    pub tls: TlsConfig,

    /// Topic for joins
    #[serde(default)]
    pub joins: Option<String>,

    /// Topic for uplinks
    #[serde(default)]
    pub uplinks: Option<String>,

    /// Topic for uplink errors
    #[serde(default)]
    pub uplink_errors: Option<String>,

    /// Topic for downlink receipts (queued, sent, ack, nack)
    #[serde(default)]
    pub downlink_receipts: Option<String>,

    /// Topic for failed downlinks; falls back to `downlink_receipts`
    #[serde(default)]
    pub downlink_errors: Option<String>,

    /// Subscription carrying downlink requests
    #[serde(default)]
    pub downlinks: Option<String>,
}

fn default_bus_client_id() -> String {
    "lorabridge-bus".to_string()
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            address: None,
            client_id: default_bus_client_id(),
            username: None,
            password: String::new(),
            tls: TlsConfig::default(),
            joins: None,
            uplinks: None,
            uplink_errors: None,
            downlink_receipts: None,
            downlink_errors: None,
            downlinks: None,
        }
    }
}

impl BusConfig {
    /// Bus topic a category is forwarded to
    pub fn topic_for(&self, category: Category) -> Option<&str> {
        match category {
            Category::Join => self.joins.as_deref(),
            Category::Uplink => self.uplinks.as_deref(),
            Category::UplinkError => self.uplink_errors.as_deref(),
            Category::DownlinkQueued
            | Category::DownlinkSent
            | Category::DownlinkAck
            | Category::DownlinkNack => self.downlink_receipts.as_deref(),
            Category::DownlinkFailed => self
                .downlink_errors
                .as_deref()
                .or(self.downlink_receipts.as_deref()),
        }
    }

    /// Connection settings when the bus is an MQTT broker
    pub fn connection_settings(&self) -> Option<ConnectionSettings> {
        self.address.as_ref().map(|address| ConnectionSettings {
            address: address.clone(),
            client_id: self.client_id.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            keep_alive: DEFAULT_KEEP_ALIVE,
            tls: self.tls.clone(),
        })
    }
}

/// Builder for BridgeConfig
#[derive(Debug, Default)]
pub struct BridgeConfigBuilder {
    config: BridgeConfig,
}

impl BridgeConfigBuilder {
    /// Create a new builder with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the broker address
    pub fn broker_address(mut self, address: impl Into<String>) -> Self {
        self.config.broker.address = address.into();
        self
    }

    /// Set application id and access key
    pub fn application(mut self, app_id: impl Into<String>, app_key: impl Into<String>) -> Self {
        self.config.broker.app_id = app_id.into();
        self.config.broker.app_key = app_key.into();
        self
    }

    /// Set connect retries and delay
    pub fn retries(mut self, retries: u32, delay: Duration) -> Self {
        self.config.connect.retries = retries;
        self.config.connect.retry_delay = delay;
        self
    }

    /// Replace the subscribed categories
    pub fn categories(mut self, categories: impl IntoIterator<Item = Category>) -> Self {
        self.config.proxy.categories = categories.into_iter().collect();
        self
    }

    /// Set the per-category channel capacity
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.config.proxy.channel_capacity = capacity;
        self
    }

    /// Route a category to a bus topic
    pub fn bus_topic(mut self, category: Category, topic: impl Into<String>) -> Self {
        let topic = Some(topic.into());
        match category {
            Category::Join => self.config.bus.joins = topic,
            Category::Uplink => self.config.bus.uplinks = topic,
            Category::UplinkError => self.config.bus.uplink_errors = topic,
            Category::DownlinkFailed => self.config.bus.downlink_errors = topic,
            _ => self.config.bus.downlink_receipts = topic,
        }
        self
    }

    /// Accept downlink requests from a bus subscription
    pub fn downlinks(mut self, subscription: impl Into<String>) -> Self {
        self.config.bus.downlinks = Some(subscription.into());
        self.config.proxy.can_downlink = true;
        self
    }

    /// Build the configuration
    pub fn build(self) -> BridgeConfig {
        self.config
    }
}

// Custom serde module for Duration with humantime
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

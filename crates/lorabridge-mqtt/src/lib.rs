//! LoRaWAN MQTT Bridge to the Internal Message Bus
//!
//! This crate bridges the MQTT broker of a LoRaWAN network server to an
//! organisation-internal message bus. Device traffic (joins, uplinks,
//! uplink errors and downlink receipts) is parsed into canonical messages
//! and forwarded; downlink requests from the bus are rendered and published
//! to the device's broker topic.
//!
//! # Architecture
//!
//! The bridge is built in four layers:
//!
//! 1. **Transport** - one physical broker connection ([`MqttTransport`])
//! 2. **Resilient Client** - retrying connect and subscription replay
//!    ([`BrokerClient`])
//! 3. **Adapters** - wire-format parsing and rendering ([`TopicAdapter`],
//!    [`TtnV3`]) plus the optional [`PayloadAdjuster`]
//! 4. **Proxy** - per-category forwarding loops ([`BridgeProxy`])
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use lorabridge_mqtt::{
//!     BridgeConfig, BridgeProxy, BrokerClient, IdentityAdjuster, MqttBus, MqttTransport,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = BridgeConfig::for_deployment("/etc/lorabridge", "production")?;
//!     config.validate()?;
//!
//!     let settings = config.broker.connection_settings(&config.adapter.network);
//!     let transport = Arc::new(MqttTransport::new(settings, &config.connect)?);
//!     let client = BrokerClient::new(transport, &config.connect)?;
//!
//!     let adapter = lorabridge_mqtt::adapter::from_config(&config.adapter, &config.broker.app_id, None);
//!     let mut proxy = BridgeProxy::new(client, adapter, Arc::new(IdentityAdjuster), bus, &config);
//!     proxy.initialize().await?;
//!     let handle = proxy.run().await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     handle.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Delivery Semantics
//!
//! Forwarding is at-least-once from the broker's point of view and
//! best-effort per message: a broker message is acknowledged after it was
//! processed, even when it failed to parse or could not be published.
//! Nothing is buffered across a broker outage.

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

// Connection layer
pub mod address;
pub mod client;
pub mod config;
pub mod error;
pub mod registry;
pub mod transport;

// Transformation layer
pub mod adapter;
pub mod adjuster;

// Forwarding
pub mod bus;
pub mod proxy;

// Testing utilities
pub mod test_utils;

pub use address::{BrokerAddress, BrokerScheme};
pub use client::BrokerClient;
pub use config::{
    AdapterConfig, AdapterKind, BridgeConfig, BridgeConfigBuilder, BrokerConfig, BusConfig,
    ConnectConfig, ConnectionSettings, ProxyConfig, TlsConfig,
};
pub use error::{BridgeError, Result};
pub use registry::{topic_matches, SubscriptionRegistry};
pub use transport::{
    BrokerMessage, BrokerTransport, ConnectionState, MqttTransport, QoS, TransportEvent,
};

pub use adapter::{DeviceIdRemapper, TopicAdapter, TtnV3, ALL_DEVICES};
pub use adjuster::{IdentityAdjuster, PayloadAdjuster};

pub use bus::{BusDelivery, InternalBus, MqttBus};
pub use proxy::{BridgeProxy, ProxyHandle, ProxyStats};

pub use test_utils::{MemoryBus, MockTransport};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

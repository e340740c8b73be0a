//! Topic transform adapters
//!
//! An adapter isolates one network-server wire format: it names broker
//! topics, parses inbound envelopes into canonical messages and renders
//! outbound downlink requests. The proxy holds a single adapter for its
//! lifetime and never inspects which one it is.

mod ttn_v3;

pub use ttn_v3::TtnV3;

use lorabridge_core::{Category, LoraMessage, SimpleMessage};
use std::sync::Arc;

use crate::config::{AdapterConfig, AdapterKind};
use crate::error::Result;

/// Device selector matching every device in a topic filter
pub const ALL_DEVICES: &str = "+";

/// Maps a network-server device id to the id used on the internal bus
pub trait DeviceIdRemapper: Send + Sync {
    /// Translate one device id
    fn remap(&self, device_id: &str) -> String;
}

impl<F> DeviceIdRemapper for F
where
    F: Fn(&str) -> String + Send + Sync,
{
    fn remap(&self, device_id: &str) -> String {
        self(device_id)
    }
}

/// Wire-format specific topic naming, parsing and rendering
pub trait TopicAdapter: Send + Sync {
    /// Adapter name (for logging)
    fn name(&self) -> &str;

    /// Source identifier stamped on parsed messages
    fn source(&self) -> &str;

    /// Topic carrying uplinks for `device`
    fn uplink_topic(&self, device: &str) -> String;

    /// Topic carrying uplink errors for `device`
    fn uplink_errors_topic(&self, device: &str) -> String;

    /// Topic appending a downlink to the device queue
    fn downlink_topic_push(&self, device: &str) -> String;

    /// Topic replacing the device downlink queue
    fn downlink_topic_replace(&self, device: &str) -> String;

    /// Topic for any category
    fn topic_for(&self, device: &str, category: Category) -> String;

    /// Parse a join event
    fn parse_join(&self, raw: &[u8]) -> Result<SimpleMessage>;

    /// Parse an uplink, with radio metadata when reported
    fn parse_uplink(&self, raw: &[u8]) -> Result<LoraMessage>;

    /// Wrap an uplink error event; the payload is the raw event
    fn parse_uplink_error(&self, raw: &[u8]) -> Result<SimpleMessage>;

    /// Parse a downlink lifecycle event
    fn parse_downlink_event(&self, raw: &[u8], category: Category) -> Result<SimpleMessage>;

    /// Render a downlink request envelope
    fn render_downlink(
        &self,
        message: &SimpleMessage,
        correlation_ids: Option<Vec<String>>,
    ) -> Result<Vec<u8>>;

    /// Parse any inbound category into an enriched message
    fn parse(&self, category: Category, raw: &[u8]) -> Result<LoraMessage> {
        match category {
            Category::Join => self.parse_join(raw).map(LoraMessage::from),
            Category::Uplink => self.parse_uplink(raw),
            Category::UplinkError => self.parse_uplink_error(raw).map(LoraMessage::from),
            downlink => self
                .parse_downlink_event(raw, downlink)
                .map(LoraMessage::from),
        }
    }
}

/// Build the configured adapter
pub fn from_config(
    config: &AdapterConfig,
    app_id: &str,
    remapper: Option<Arc<dyn DeviceIdRemapper>>,
) -> Arc<dyn TopicAdapter> {
    match config.kind {
        AdapterKind::TtnV3 => {
            let mut adapter = TtnV3::new(app_id)
                .with_namespace(config.namespace.clone())
                .with_network(config.network.clone());
            if let Some(remapper) = remapper {
                adapter = adapter.with_remapper(remapper);
            }
            Arc::new(adapter)
        }
    }
}

//! The Things Stack v3 adapter
//!
//! Topics follow `<namespace>/<app_id>@<network>/devices/<device>/<path>`,
//! with `v3` and `ttn` as the default namespace and network.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use lorabridge_core::{BrokerDevice, Category, Location, LoraMessage, Signal, SimpleMessage};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use super::{DeviceIdRemapper, TopicAdapter};
use crate::error::{BridgeError, Result};

/// Application port used for downlinks
pub const DOWNLINK_F_PORT: u8 = 15;

/// Priority requested for downlinks
pub const DOWNLINK_PRIORITY: &str = "HIGH";

/// TTN v3 topic adapter
#[derive(Clone)]
pub struct TtnV3 {
    app_id: String,
    namespace: String,
    network: String,
    remapper: Option<Arc<dyn DeviceIdRemapper>>,
}

impl TtnV3 {
    /// Create an adapter for an application on the public `ttn` network
    pub fn new(app_id: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            namespace: "v3".to_string(),
            network: "ttn".to_string(),
            remapper: None,
        }
    }

    /// Set the topic namespace
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Set the network (tenant) name
    pub fn with_network(mut self, network: impl Into<String>) -> Self {
        self.network = network.into();
        self
    }

    /// Remap device ids of parsed messages
    pub fn with_remapper(mut self, remapper: Arc<dyn DeviceIdRemapper>) -> Self {
        self.remapper = Some(remapper);
        self
    }

    fn topic(&self, device: &str, path: &str) -> String {
        format!(
            "{}/{}@{}/devices/{}/{}",
            self.namespace, self.app_id, self.network, device, path
        )
    }

    fn device(&self, ids: &EndDeviceIds) -> BrokerDevice {
        let uid = match &self.remapper {
            Some(remapper) => remapper.remap(&ids.device_id),
            None => ids.device_id.clone(),
        };
        BrokerDevice::new(self.app_id.clone(), uid)
    }
}

fn decode<T: DeserializeOwned>(raw: &[u8], what: &str) -> Result<T> {
    serde_json::from_slice(raw)
        .map_err(|e| BridgeError::Decode(format!("invalid {what} envelope: {e}")))
}

fn decode_payload(frm_payload: Option<&str>) -> Result<Vec<u8>> {
    match frm_payload {
        Some(encoded) => Ok(STANDARD.decode(encoded)?),
        None => Ok(Vec::new()),
    }
}

#[derive(Debug, Default, Deserialize)]
struct EndDeviceIds {
    #[serde(default)]
    device_id: String,
    #[serde(default)]
    dev_eui: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UplinkV3 {
    end_device_ids: EndDeviceIds,
    #[serde(default)]
    received_at: Option<DateTime<Utc>>,
    uplink_message: UplinkMessage,
}

#[derive(Debug, Deserialize)]
struct UplinkMessage {
    #[serde(default)]
    frm_payload: Option<String>,
    #[serde(default)]
    rx_metadata: Vec<RxMetadata>,
}

#[derive(Debug, Deserialize)]
struct RxMetadata {
    #[serde(default)]
    rssi: i32,
    #[serde(default)]
    snr: f64,
    // Gateways without a fixed position omit it
    #[serde(default)]
    location: RxLocation,
}

#[derive(Debug, Default, Deserialize)]
struct RxLocation {
    #[serde(default)]
    latitude: f64,
    #[serde(default)]
    longitude: f64,
    // Reported as an integer number of meters
    #[serde(default)]
    altitude: f64,
}

#[derive(Debug, Deserialize)]
struct JoinV3 {
    end_device_ids: EndDeviceIds,
    #[serde(default)]
    received_at: Option<DateTime<Utc>>,
    #[serde(default)]
    frm_payload: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct DownlinkBody {
    #[serde(default)]
    frm_payload: Option<String>,
}

// Failed events nest the original request under `downlink`
#[derive(Debug, Default, Deserialize)]
struct DownlinkFailedBody {
    #[serde(default)]
    frm_payload: Option<String>,
    #[serde(default)]
    downlink: Option<DownlinkBody>,
}

#[derive(Debug, Deserialize)]
struct DownlinkV3 {
    end_device_ids: EndDeviceIds,
    #[serde(default)]
    received_at: Option<DateTime<Utc>>,
    #[serde(default)]
    downlink_queued: Option<DownlinkBody>,
    #[serde(default)]
    downlink_sent: Option<DownlinkBody>,
    #[serde(default)]
    downlink_ack: Option<DownlinkBody>,
    #[serde(default)]
    downlink_nack: Option<DownlinkBody>,
    #[serde(default)]
    downlink_failed: Option<DownlinkFailedBody>,
}

fn body(stage: &Option<DownlinkBody>) -> Option<&str> {
    stage.as_ref().and_then(|b| b.frm_payload.as_deref())
}

impl DownlinkV3 {
    fn frm_payload(&self, category: Category) -> Result<Option<&str>> {
        Ok(match category {
            Category::DownlinkQueued => body(&self.downlink_queued),
            Category::DownlinkSent => body(&self.downlink_sent),
            Category::DownlinkAck => body(&self.downlink_ack),
            Category::DownlinkNack => body(&self.downlink_nack),
            Category::DownlinkFailed => self.downlink_failed.as_ref().and_then(|failed| {
                failed
                    .frm_payload
                    .as_deref()
                    .or_else(|| body(&failed.downlink))
            }),
            other => {
                return Err(BridgeError::Decode(format!(
                    "{other} is not a downlink event"
                )))
            }
        })
    }
}

#[derive(Debug, Deserialize)]
struct ErrorEventV3 {
    #[serde(default)]
    end_device_ids: Option<EndDeviceIds>,
    #[serde(default)]
    identifiers: Vec<EventIdentifier>,
}

#[derive(Debug, Deserialize)]
struct EventIdentifier {
    #[serde(default)]
    device_ids: Option<EndDeviceIds>,
}

#[derive(Debug, Serialize)]
struct DownlinksV3 {
    downlinks: Vec<DownlinkRequest>,
}

#[derive(Debug, Serialize)]
struct DownlinkRequest {
    f_port: u8,
    frm_payload: String,
    priority: &'static str,
    confirmed: bool,
    correlation_ids: Option<Vec<String>>,
}

impl TopicAdapter for TtnV3 {
    fn name(&self) -> &str {
        "ttn_v3"
    }

    fn source(&self) -> &str {
        &self.app_id
    }

    fn uplink_topic(&self, device: &str) -> String {
        self.topic(device, Category::Uplink.path())
    }

    fn uplink_errors_topic(&self, device: &str) -> String {
        self.topic(device, Category::UplinkError.path())
    }

    fn downlink_topic_push(&self, device: &str) -> String {
        self.topic(device, "down/push")
    }

    fn downlink_topic_replace(&self, device: &str) -> String {
        self.topic(device, "down/replace")
    }

    fn topic_for(&self, device: &str, category: Category) -> String {
        self.topic(device, category.path())
    }

    fn parse_join(&self, raw: &[u8]) -> Result<SimpleMessage> {
        let join: JoinV3 = decode(raw, "join")?;
        debug!("Decoded join: device={}", join.end_device_ids.device_id);

        Ok(SimpleMessage::at(
            self.device(&join.end_device_ids),
            decode_payload(join.frm_payload.as_deref())?,
            join.received_at.unwrap_or_else(Utc::now),
        ))
    }

    fn parse_uplink(&self, raw: &[u8]) -> Result<LoraMessage> {
        let uplink: UplinkV3 = decode(raw, "uplink")?;
        debug!(
            "Decoded uplink: device={}, eui={:?}, {} metadata entries",
            uplink.end_device_ids.device_id,
            uplink.end_device_ids.dev_eui,
            uplink.uplink_message.rx_metadata.len()
        );

        let message = SimpleMessage::at(
            self.device(&uplink.end_device_ids),
            decode_payload(uplink.uplink_message.frm_payload.as_deref())?,
            uplink.received_at.unwrap_or_else(Utc::now),
        );

        let lora = LoraMessage::new(message);
        Ok(match uplink.uplink_message.rx_metadata.first() {
            Some(metadata) => {
                let l = &metadata.location;
                lora.with_radio(
                    Signal::new(metadata.rssi, metadata.snr),
                    Location::new(l.latitude, l.longitude, l.altitude),
                )
            }
            None => lora,
        })
    }

    fn parse_uplink_error(&self, raw: &[u8]) -> Result<SimpleMessage> {
        let event: ErrorEventV3 = decode(raw, "uplink error")?;
        let ids = event.end_device_ids.or_else(|| {
            event
                .identifiers
                .into_iter()
                .find_map(|identifier| identifier.device_ids)
        });

        Ok(SimpleMessage::new(
            self.device(&ids.unwrap_or_default()),
            raw.to_vec(),
        ))
    }

    fn parse_downlink_event(&self, raw: &[u8], category: Category) -> Result<SimpleMessage> {
        let downlink: DownlinkV3 = decode(raw, "downlink")?;
        debug!(
            "Decoded downlink event: device={}, stage={}",
            downlink.end_device_ids.device_id, category
        );

        let payload = decode_payload(downlink.frm_payload(category)?)?;
        Ok(SimpleMessage::at(
            self.device(&downlink.end_device_ids),
            payload,
            downlink.received_at.unwrap_or_else(Utc::now),
        ))
    }

    fn render_downlink(
        &self,
        message: &SimpleMessage,
        correlation_ids: Option<Vec<String>>,
    ) -> Result<Vec<u8>> {
        let request = DownlinksV3 {
            downlinks: vec![DownlinkRequest {
                f_port: DOWNLINK_F_PORT,
                frm_payload: STANDARD.encode(&message.payload),
                priority: DOWNLINK_PRIORITY,
                confirmed: true,
                correlation_ids,
            }],
        };
        Ok(serde_json::to_vec(&request)?)
    }
}

//! Canonical messages exchanged with the internal bus
//!
//! Field names on the wire follow the established bus format
//! (`Source`, `DeviceUID`, `Payload`, `Time`, `Signal`, `Location`).
//! Payload bytes are carried as standard base64.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::location::{Location, Signal};

/// Broker-side identity of a device
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BrokerDevice {
    #[serde(rename = "Source", default)]
    source: String,
    #[serde(rename = "DeviceUID", default)]
    device_uid: String,
}

impl BrokerDevice {
    /// Create a device identity from a network/application id and device uid
    pub fn new(source: impl Into<String>, device_uid: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            device_uid: device_uid.into(),
        }
    }

    /// Network or application identifier
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Device unique identifier
    pub fn device_uid(&self) -> &str {
        &self.device_uid
    }
}

/// Protocol-neutral message: a device, its payload and a timestamp
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimpleMessage {
    /// Device the message belongs to
    #[serde(flatten)]
    pub device: BrokerDevice,
    /// Raw frame payload
    #[serde(rename = "Payload", with = "payload_base64", default)]
    pub payload: Vec<u8>,
    /// When the message was received
    #[serde(rename = "Time", default = "Utc::now")]
    pub time: DateTime<Utc>,
}

impl SimpleMessage {
    /// Create a message stamped with the current time
    pub fn new(device: BrokerDevice, payload: Vec<u8>) -> Self {
        Self::at(device, payload, Utc::now())
    }

    /// Create a message with an explicit timestamp
    pub fn at(device: BrokerDevice, payload: Vec<u8>, time: DateTime<Utc>) -> Self {
        Self {
            device,
            payload,
            time,
        }
    }

    /// Shorthand for the device uid
    pub fn device_uid(&self) -> &str {
        self.device.device_uid()
    }

    /// Shorthand for the source identifier
    pub fn source(&self) -> &str {
        self.device.source()
    }

    /// Encode as bus JSON
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode from bus JSON
    pub fn from_json(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Canonical message enriched with optional radio metadata
///
/// Enrichment fields are `None` when the network server reported no
/// metadata. They are omitted from the JSON rather than zero-filled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoraMessage {
    /// The canonical message
    #[serde(flatten)]
    pub message: SimpleMessage,
    /// Signal quality of the first receiving gateway
    #[serde(rename = "Signal", default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<Signal>,
    /// Location of the first receiving gateway
    #[serde(rename = "Location", default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
}

impl LoraMessage {
    /// Wrap a canonical message with no enrichment
    pub fn new(message: SimpleMessage) -> Self {
        Self {
            message,
            signal: None,
            location: None,
        }
    }

    /// Attach radio metadata
    pub fn with_radio(mut self, signal: Signal, location: Location) -> Self {
        self.signal = Some(signal);
        self.location = Some(location);
        self
    }

    /// Shorthand for the device uid
    pub fn device_uid(&self) -> &str {
        self.message.device_uid()
    }

    /// Raw frame payload
    pub fn payload(&self) -> &[u8] {
        &self.message.payload
    }

    /// Mutable access for payload adjusters
    pub fn payload_mut(&mut self) -> &mut Vec<u8> {
        &mut self.message.payload
    }

    /// Encode as bus JSON
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode from bus JSON
    pub fn from_json(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

impl From<SimpleMessage> for LoraMessage {
    fn from(message: SimpleMessage) -> Self {
        LoraMessage::new(message)
    }
}

// Payload bytes as base64; null and missing both decode to empty
mod payload_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(payload: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(payload))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<String>::deserialize(deserializer)? {
            Some(encoded) => STANDARD.decode(encoded).map_err(serde::de::Error::custom),
            None => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample() -> SimpleMessage {
        let time = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        SimpleMessage::at(BrokerDevice::new("app", "dev-1"), vec![0xDE, 0xAD], time)
    }

    #[test]
    fn test_simple_message_wire_format() {
        let json: serde_json::Value = serde_json::from_slice(&sample().to_json().unwrap()).unwrap();
        assert_eq!(json["Source"], "app");
        assert_eq!(json["DeviceUID"], "dev-1");
        assert_eq!(json["Payload"], "3q0=");
        assert_eq!(json["Time"], "2024-05-01T12:00:00Z");
    }

    #[test]
    fn test_enrichment_absent_is_omitted() {
        let lora = LoraMessage::new(sample());
        let json: serde_json::Value = serde_json::from_slice(&lora.to_json().unwrap()).unwrap();
        assert!(json.get("Signal").is_none());
        assert!(json.get("Location").is_none());

        let decoded = LoraMessage::from_json(&lora.to_json().unwrap()).unwrap();
        assert_eq!(decoded.signal, None);
        assert_eq!(decoded.location, None);
    }

    #[test]
    fn test_zero_enrichment_is_kept() {
        let lora = LoraMessage::new(sample())
            .with_radio(Signal::new(0, 0.0), Location::new(0.0, 0.0, 0.0));
        let decoded = LoraMessage::from_json(&lora.to_json().unwrap()).unwrap();
        assert_eq!(decoded.signal, Some(Signal::new(0, 0.0)));
        assert_eq!(decoded.location, Some(Location::new(0.0, 0.0, 0.0)));
    }

    #[test]
    fn test_downlink_request_decoding() {
        // Requests from the bus may omit the timestamp and carry a null payload
        let json = br#"{"Source":"app","DeviceUID":"dev-9","Payload":null}"#;
        let message = SimpleMessage::from_json(json).unwrap();
        assert_eq!(message.device_uid(), "dev-9");
        assert!(message.payload.is_empty());
    }

    #[test]
    fn test_invalid_base64_rejected() {
        let json = br#"{"Source":"app","DeviceUID":"d","Payload":"!!"}"#;
        assert!(SimpleMessage::from_json(json).is_err());
    }
}

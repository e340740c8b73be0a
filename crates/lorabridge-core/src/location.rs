//! Radio metadata attached to enriched uplinks

use serde::{Deserialize, Serialize};

/// Gateway location reported with an uplink
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    /// Latitude in degrees (-90 to 90)
    #[serde(rename = "Latitude")]
    pub latitude: f64,
    /// Longitude in degrees (-180 to 180)
    #[serde(rename = "Longitude")]
    pub longitude: f64,
    /// Altitude in meters
    #[serde(rename = "Altitude")]
    pub altitude: f64,
}

impl Location {
    /// Create a new location
    pub fn new(latitude: f64, longitude: f64, altitude: f64) -> Self {
        Self {
            latitude,
            longitude,
            altitude,
        }
    }
}

/// Received signal quality
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    /// Received signal strength indicator (dBm)
    #[serde(rename = "Rssi")]
    pub rssi: i32,
    /// Signal-to-noise ratio (dB)
    #[serde(rename = "Snr")]
    pub snr: f64,
}

impl Signal {
    /// Create a new signal reading
    pub fn new(rssi: i32, snr: f64) -> Self {
        Self { rssi, snr }
    }
}

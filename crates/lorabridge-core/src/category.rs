//! Message categories carried between the broker and the internal bus
//!
//! Each category is bound to exactly one broker topic path. The proxy runs
//! one forwarding loop per category.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CoreError;

/// Fixed message kinds exchanged with the device network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    /// Device joined the network
    Join,
    /// Device uplink data
    Uplink,
    /// Uplink processing failed on the network server
    UplinkError,
    /// Downlink was queued for the device
    DownlinkQueued,
    /// Downlink was transmitted by a gateway
    DownlinkSent,
    /// Confirmed downlink was acknowledged by the device
    DownlinkAck,
    /// Confirmed downlink was rejected by the device
    DownlinkNack,
    /// Downlink could not be delivered
    DownlinkFailed,
}

impl Category {
    /// Every category, in declaration order
    pub const ALL: [Category; 8] = [
        Category::Join,
        Category::Uplink,
        Category::UplinkError,
        Category::DownlinkQueued,
        Category::DownlinkSent,
        Category::DownlinkAck,
        Category::DownlinkNack,
        Category::DownlinkFailed,
    ];

    /// Categories a bridge subscribes to unless configured otherwise
    pub const DEFAULT_INBOUND: [Category; 6] = [
        Category::Join,
        Category::Uplink,
        Category::UplinkError,
        Category::DownlinkQueued,
        Category::DownlinkSent,
        Category::DownlinkFailed,
    ];

    /// Topic path segment following the device selector
    pub fn path(&self) -> &'static str {
        match self {
            Category::Join => "join",
            Category::Uplink => "up",
            Category::UplinkError => "events/up/error",
            Category::DownlinkQueued => "down/queued",
            Category::DownlinkSent => "down/sent",
            Category::DownlinkAck => "down/ack",
            Category::DownlinkNack => "down/nack",
            Category::DownlinkFailed => "down/failed",
        }
    }

    /// Stable snake_case name used in configuration and logs
    pub fn name(&self) -> &'static str {
        match self {
            Category::Join => "join",
            Category::Uplink => "uplink",
            Category::UplinkError => "uplink_error",
            Category::DownlinkQueued => "downlink_queued",
            Category::DownlinkSent => "downlink_sent",
            Category::DownlinkAck => "downlink_ack",
            Category::DownlinkNack => "downlink_nack",
            Category::DownlinkFailed => "downlink_failed",
        }
    }

    /// True for the downlink lifecycle receipts
    pub fn is_downlink_event(&self) -> bool {
        matches!(
            self,
            Category::DownlinkQueued
                | Category::DownlinkSent
                | Category::DownlinkAck
                | Category::DownlinkNack
                | Category::DownlinkFailed
        )
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Category {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Category::ALL
            .iter()
            .copied()
            .find(|category| category.name() == s)
            .ok_or_else(|| CoreError::UnknownCategory(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths() {
        assert_eq!(Category::Uplink.path(), "up");
        assert_eq!(Category::UplinkError.path(), "events/up/error");
        assert_eq!(Category::DownlinkNack.path(), "down/nack");
    }

    #[test]
    fn test_from_str_matches_display() {
        for category in Category::ALL {
            let parsed: Category = category.to_string().parse().unwrap();
            assert_eq!(parsed, category);
        }
        assert!("bogus".parse::<Category>().is_err());
    }

    #[test]
    fn test_serde_snake_case() {
        let json = serde_json::to_string(&Category::DownlinkFailed).unwrap();
        assert_eq!(json, "\"downlink_failed\"");
    }

    #[test]
    fn test_downlink_events() {
        assert!(Category::DownlinkAck.is_downlink_event());
        assert!(!Category::Join.is_downlink_event());
        assert!(!Category::DEFAULT_INBOUND.contains(&Category::DownlinkAck));
    }
}

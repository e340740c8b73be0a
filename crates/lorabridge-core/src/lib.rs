//! Lorabridge Core - Protocol-neutral types for the LoRaWAN broker bridge
//!
//! This crate holds the data model exchanged between the broker-facing
//! adapters, the bridge proxy and the internal message bus.
//!
//! # Modules
//!
//! - [`message`] - Broker device identity, canonical and enriched messages
//! - [`location`] - Radio signal and gateway location metadata
//! - [`category`] - Message categories and their topic paths
//! - [`error`] - Error types
//!
//! # Example
//!
//! ```rust
//! use lorabridge_core::{BrokerDevice, SimpleMessage};
//!
//! let device = BrokerDevice::new("my-app", "sensor-01");
//! let message = SimpleMessage::new(device, vec![0x01, 0x02]);
//! let json = message.to_json().unwrap();
//! let decoded = SimpleMessage::from_json(&json).unwrap();
//! assert_eq!(decoded.payload, vec![0x01, 0x02]);
//! ```

pub mod category;
pub mod error;
pub mod location;
pub mod message;

pub use category::Category;
pub use error::{CoreError, Result};
pub use location::{Location, Signal};
pub use message::{BrokerDevice, LoraMessage, SimpleMessage};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(VERSION.contains('.'), "VERSION should be semver format");
    }
}

//! Broker address normalisation
//!
//! Addresses may be given as `host`, `host:port` or `scheme://host[:port]`.
//! Without a scheme the transport is detected from the port: 8883 or no
//! port means TLS, anything else plaintext.

use std::fmt;
use url::Url;

use crate::error::{BridgeError, Result};

/// Default plaintext MQTT port
pub const MQTT_PORT: u16 = 1883;

/// Default TLS MQTT port
pub const MQTTS_PORT: u16 = 8883;

/// Transport security of a broker connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerScheme {
    /// Plain TCP
    Plain,
    /// TLS over TCP
    Tls,
}

impl BrokerScheme {
    fn default_port(self) -> u16 {
        match self {
            BrokerScheme::Plain => MQTT_PORT,
            BrokerScheme::Tls => MQTTS_PORT,
        }
    }
}

/// A parsed broker address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    /// Transport security
    pub scheme: BrokerScheme,
    /// Host name or IP
    pub host: String,
    /// TCP port
    pub port: u16,
}

impl BrokerAddress {
    /// Parse and normalise a configured address
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        if input.is_empty() {
            return Err(BridgeError::MissingConfig("broker address".to_string()));
        }

        let invalid = |reason: String| BridgeError::InvalidAddress {
            address: input.to_string(),
            reason,
        };

        let detect = !input.contains("://");
        let url = if detect {
            Url::parse(&format!("detect://{input}"))
        } else {
            Url::parse(input)
        }
        .map_err(|e| invalid(e.to_string()))?;

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| invalid("missing host".to_string()))?
            .to_string();

        let scheme = match url.scheme() {
            "detect" => match url.port() {
                None | Some(MQTTS_PORT) => BrokerScheme::Tls,
                Some(_) => BrokerScheme::Plain,
            },
            "mqtt" | "tcp" => BrokerScheme::Plain,
            "mqtts" | "ssl" => BrokerScheme::Tls,
            other => return Err(invalid(format!("unsupported scheme {other}"))),
        };

        Ok(Self {
            scheme,
            port: url.port().unwrap_or_else(|| scheme.default_port()),
            host,
        })
    }

    /// Whether the connection is TLS secured
    pub fn is_tls(&self) -> bool {
        self.scheme == BrokerScheme::Tls
    }
}

impl fmt::Display for BrokerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = match self.scheme {
            BrokerScheme::Plain => "mqtt",
            BrokerScheme::Tls => "mqtts",
        };
        write!(f, "{}://{}:{}", scheme, self.host, self.port)
    }
}

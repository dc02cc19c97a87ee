//! Client configuration

use crate::dtc::DtcHeader;
use crate::protocol::ObdProtocol;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default adapter address for Wi-Fi ELM327 dongles
pub const DEFAULT_HOST: &str = "192.168.0.10";
/// Default adapter TCP port
pub const DEFAULT_PORT: u16 = 35000;

/// OBD client configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObdConfig {
    /// Adapter host name or IP address
    pub host: String,

    /// Adapter TCP port
    pub port: u16,

    /// TCP connect timeout (milliseconds)
    pub connect_timeout_ms: u64,

    /// Time allowed for the adapter to send its prompt (milliseconds).
    /// `None` waits forever.
    pub response_timeout_ms: Option<u64>,

    /// Pause between initialization commands (milliseconds)
    pub init_delay_ms: u64,

    /// Protocol selected after `ATSP0`
    pub protocol: ObdProtocol,

    /// DTC response header layout; inferred from `protocol` when unset
    pub dtc_header: Option<DtcHeader>,
}

impl Default for ObdConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            connect_timeout_ms: 5000,
            response_timeout_ms: Some(5000),
            init_delay_ms: 100,
            protocol: ObdProtocol::default(),
            dtc_header: None,
        }
    }
}

impl ObdConfig {
    /// Create a config for the given adapter endpoint
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn response_timeout(&self) -> Option<Duration> {
        self.response_timeout_ms.map(Duration::from_millis)
    }

    pub fn init_delay(&self) -> Duration {
        Duration::from_millis(self.init_delay_ms)
    }

    /// DTC header layout before any protocol detection
    pub fn dtc_header(&self) -> DtcHeader {
        self.dtc_header.unwrap_or_else(|| self.protocol.dtc_header())
    }

    /// Whether the header layout depends on the protocol the adapter negotiates
    pub fn detects_protocol(&self) -> bool {
        self.protocol == ObdProtocol::Auto && self.dtc_header.is_none()
    }
}

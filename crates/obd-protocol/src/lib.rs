//! OBD-II Protocol Implementation
//!
//! Async TCP communication with Wi-Fi ELM327 OBD-II adapters: adapter
//! initialization, prompt-framed command/response exchange, and decoding of
//! trouble codes and live sensor values.

mod client;
mod config;
mod dtc;
mod error;
mod framer;
mod pid;
mod protocol;
mod response;
mod transport;

pub use client::{ObdClient, INIT_COMMANDS};
pub use config::{ObdConfig, DEFAULT_HOST, DEFAULT_PORT};
pub use dtc::{
    decode as decode_dtcs, decode_pair, encode_dtc, DtcCategory, DtcHeader, TroubleCode,
    TroubleCodeSet, PADDING_CODE,
};
pub use error::ObdError;
pub use framer::{CommandFramer, PROMPT};
pub use pid::{Pid, PidResponse, SensorFrame};
pub use protocol::ObdProtocol;
pub use response::{hex_bytes, normalize, process, Processed, NO_DATA};
pub use transport::{ConnectionState, Transport};

/// OBD-II mode constants
pub mod mode {
    /// Current data
    pub const CURRENT_DATA: u8 = 0x01;
    /// Confirmed diagnostic trouble codes
    pub const READ_DTC: u8 = 0x03;
    /// Clear trouble codes
    pub const CLEAR_DTC: u8 = 0x04;
    /// Pending trouble codes
    pub const PENDING_DTC: u8 = 0x07;
    /// Permanent trouble codes
    pub const PERMANENT_DTC: u8 = 0x0A;
    /// Added to the request mode in positive responses
    pub const RESPONSE_OFFSET: u8 = 0x40;
}

/// ELM327 AT commands
pub mod at {
    /// Reset all
    pub const RESET: &str = "ATZ";
    pub const ECHO_OFF: &str = "ATE0";
    pub const SPACES_OFF: &str = "ATS0";
    pub const HEADERS_OFF: &str = "ATH0";
    /// Automatic protocol selection
    pub const PROTOCOL_AUTO: &str = "ATSP0";
    /// Describe the current protocol by number
    pub const DESCRIBE_PROTOCOL_NUMBER: &str = "ATDPN";
}

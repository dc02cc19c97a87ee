//! OBD-II PID Definitions and Response Parsing
//!
//! Mode 01 live-data PIDs and their decoding formulas.

use crate::error::ObdError;
use crate::response::hex_bytes;
use serde::{Deserialize, Serialize};

/// Supported Mode 01 (current data) PIDs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Pid {
    /// Engine coolant temperature (0x05)
    CoolantTemp = 0x05,
    /// Engine RPM (0x0C)
    Rpm = 0x0C,
    /// Vehicle speed (0x0D)
    Speed = 0x0D,
}

impl Pid {
    pub const ALL: [Pid; 3] = [Pid::Rpm, Pid::Speed, Pid::CoolantTemp];

    /// Get the PID hex value
    pub fn as_hex(&self) -> u8 {
        *self as u8
    }

    pub fn from_hex(value: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|pid| pid.as_hex() == value)
    }

    /// Get the number of response bytes for this PID
    pub fn response_bytes(&self) -> usize {
        match self {
            Pid::Rpm => 2,
            Pid::Speed | Pid::CoolantTemp => 1,
        }
    }

    /// Request command, e.g. `010C`
    pub fn command(&self) -> String {
        format!("{:02X}{:02X}", crate::mode::CURRENT_DATA, self.as_hex())
    }

    /// Unit of the decoded value
    pub fn unit(&self) -> &'static str {
        match self {
            Pid::Rpm => "rpm",
            Pid::Speed => "km/h",
            Pid::CoolantTemp => "°C",
        }
    }
}

/// Response from a PID query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PidResponse {
    /// The PID that was queried
    pub pid: Pid,
    /// Timestamp when the response was received (Unix ms)
    pub timestamp_ms: u64,
    /// Decoded value
    pub value: f64,
    /// Data bytes from the response, without the mode and PID echo
    pub raw_bytes: Vec<u8>,
}

impl PidResponse {
    /// Create a new PID response by decoding raw bytes
    pub fn decode(pid: Pid, raw_bytes: Vec<u8>, timestamp_ms: u64) -> Result<Self, ObdError> {
        let value = Self::decode_value(pid, &raw_bytes).ok_or_else(|| {
            ObdError::MalformedPayload(format!(
                "PID {:02X} needs {} data bytes, got {}",
                pid.as_hex(),
                pid.response_bytes(),
                raw_bytes.len()
            ))
        })?;
        Ok(Self {
            pid,
            timestamp_ms,
            value,
            raw_bytes,
        })
    }

    /// Parse the data lines of a mode 01 response.
    ///
    /// The first line must echo `41` and the queried PID.
    pub fn parse<S: AsRef<str>>(pid: Pid, lines: &[S], timestamp_ms: u64) -> Result<Self, ObdError> {
        let first = lines
            .first()
            .ok_or_else(|| ObdError::MalformedPayload("empty PID response".to_string()))?;
        let bytes = hex_bytes(std::slice::from_ref(first))?;

        let echo = crate::mode::CURRENT_DATA + crate::mode::RESPONSE_OFFSET;
        match bytes.as_slice() {
            [mode, echoed, data @ ..] if *mode == echo && *echoed == pid.as_hex() => {
                let data = data[..pid.response_bytes().min(data.len())].to_vec();
                Self::decode(pid, data, timestamp_ms)
            }
            _ => Err(ObdError::MalformedPayload(format!(
                "expected {:02X} {:02X} echo in {:?}",
                echo,
                pid.as_hex(),
                first.as_ref()
            ))),
        }
    }

    /// Decode the raw bytes to a value based on the PID formula
    fn decode_value(pid: Pid, bytes: &[u8]) -> Option<f64> {
        match (pid, bytes) {
            // RPM: ((A*256)+B)/4
            (Pid::Rpm, [a, b, ..]) => Some(((*a as f64 * 256.0) + *b as f64) / 4.0),
            // Speed: A (km/h)
            (Pid::Speed, [a, ..]) => Some(*a as f64),
            // Coolant Temp: A - 40 (°C)
            (Pid::CoolantTemp, [a, ..]) => Some(*a as f64 - 40.0),
            _ => None,
        }
    }
}

/// Snapshot of the live-data PIDs
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SensorFrame {
    /// Timestamp (Unix ms)
    pub timestamp_ms: u64,
    /// Engine RPM
    pub rpm: Option<u16>,
    /// Vehicle speed (km/h)
    pub speed: Option<u8>,
    /// Coolant temperature (°C)
    pub coolant_temp: Option<i16>,
}

impl SensorFrame {
    /// Create a new empty frame with the given timestamp
    pub fn new(timestamp_ms: u64) -> Self {
        Self {
            timestamp_ms,
            ..Default::default()
        }
    }

    /// Update a field from a PID response
    pub fn update_from_response(&mut self, response: &PidResponse) {
        match response.pid {
            Pid::Rpm => self.rpm = Some(response.value as u16),
            Pid::Speed => self.speed = Some(response.value as u8),
            Pid::CoolantTemp => self.coolant_temp = Some(response.value as i16),
        }
        self.timestamp_ms = self.timestamp_ms.max(response.timestamp_ms);
    }
}

/// Current Unix time in milliseconds
pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

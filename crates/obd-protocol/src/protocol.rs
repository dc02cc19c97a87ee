//! OBD-II Protocol Definitions

use crate::dtc::DtcHeader;
use serde::{Deserialize, Serialize};

/// Supported OBD-II protocols
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObdProtocol {
    /// Automatic protocol detection
    Auto,
    /// SAE J1850 PWM (41.6 kbaud)
    J1850Pwm,
    /// SAE J1850 VPW (10.4 kbaud)
    J1850Vpw,
    /// ISO 9141-2 (10.4 kbaud, 5 baud init)
    #[default]
    Iso9141_2,
    /// ISO 14230-4 KWP (slow init, 10.4 kbaud)
    Iso14230_4Kwp,
    /// ISO 14230-4 KWP (fast init, 10.4 kbaud)
    Iso14230_4KwpFast,
    /// ISO 15765-4 CAN (11 bit ID, 500 kbaud)
    Iso15765_4Can11bit500,
    /// ISO 15765-4 CAN (29 bit ID, 500 kbaud)
    Iso15765_4Can29bit500,
    /// ISO 15765-4 CAN (11 bit ID, 250 kbaud)
    Iso15765_4Can11bit250,
    /// ISO 15765-4 CAN (29 bit ID, 250 kbaud)
    Iso15765_4Can29bit250,
}

impl ObdProtocol {
    /// Get the ELM327 AT command for this protocol
    pub fn to_elm_command(&self) -> &'static str {
        match self {
            ObdProtocol::Auto => "ATSP0",
            ObdProtocol::J1850Pwm => "ATSP1",
            ObdProtocol::J1850Vpw => "ATSP2",
            ObdProtocol::Iso9141_2 => "ATSP3",
            ObdProtocol::Iso14230_4Kwp => "ATSP4",
            ObdProtocol::Iso14230_4KwpFast => "ATSP5",
            ObdProtocol::Iso15765_4Can11bit500 => "ATSP6",
            ObdProtocol::Iso15765_4Can29bit500 => "ATSP7",
            ObdProtocol::Iso15765_4Can11bit250 => "ATSP8",
            ObdProtocol::Iso15765_4Can29bit250 => "ATSP9",
        }
    }

    /// Protocol reported by `ATDPN`, e.g. `6`, or `A6` when it was auto-detected
    pub fn from_elm_number(reply: &str) -> Option<Self> {
        let reply = reply.trim();
        let number = match reply.len() {
            2 => reply.strip_prefix('A')?,
            _ => reply,
        };
        let protocol = match number {
            "0" => ObdProtocol::Auto,
            "1" => ObdProtocol::J1850Pwm,
            "2" => ObdProtocol::J1850Vpw,
            "3" => ObdProtocol::Iso9141_2,
            "4" => ObdProtocol::Iso14230_4Kwp,
            "5" => ObdProtocol::Iso14230_4KwpFast,
            "6" => ObdProtocol::Iso15765_4Can11bit500,
            "7" => ObdProtocol::Iso15765_4Can29bit500,
            "8" => ObdProtocol::Iso15765_4Can11bit250,
            "9" => ObdProtocol::Iso15765_4Can29bit250,
            _ => return None,
        };
        Some(protocol)
    }

    /// Check if this is a CAN protocol
    pub fn is_can(&self) -> bool {
        matches!(
            self,
            ObdProtocol::Iso15765_4Can11bit500
                | ObdProtocol::Iso15765_4Can29bit500
                | ObdProtocol::Iso15765_4Can11bit250
                | ObdProtocol::Iso15765_4Can29bit250
        )
    }

    /// Header layout of DTC query responses on this protocol.
    ///
    /// CAN responses carry a code count after the mode echo; legacy ones don't.
    pub fn dtc_header(&self) -> DtcHeader {
        if self.is_can() {
            DtcHeader::ModeAndCount
        } else {
            DtcHeader::ModeOnly
        }
    }
}

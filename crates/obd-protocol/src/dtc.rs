//! Diagnostic Trouble Codes
//!
//! Decodes mode 03/07/0A responses into standard five-character codes and
//! tracks scanned codes by category.

use crate::error::ObdError;
use crate::response::hex_bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Decoded value of an all-zero byte pair, used by ECUs as padding
pub const PADDING_CODE: &str = "P0000";

const CATEGORY_LETTERS: [char; 4] = ['P', 'C', 'B', 'U'];

/// Which DTC list a code was reported in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DtcCategory {
    Pending,
    Confirmed,
    Permanent,
}

impl DtcCategory {
    /// Scan order used when reading every list
    pub const ALL: [DtcCategory; 3] = [
        DtcCategory::Pending,
        DtcCategory::Confirmed,
        DtcCategory::Permanent,
    ];

    /// OBD-II request mode
    pub fn mode(&self) -> u8 {
        match self {
            DtcCategory::Confirmed => crate::mode::READ_DTC,
            DtcCategory::Pending => crate::mode::PENDING_DTC,
            DtcCategory::Permanent => crate::mode::PERMANENT_DTC,
        }
    }

    /// Request command sent to the adapter
    pub fn command(&self) -> String {
        format!("{:02X}", self.mode())
    }

    /// Mode byte echoed at the start of the response
    pub fn response_mode(&self) -> u8 {
        self.mode() + crate::mode::RESPONSE_OFFSET
    }
}

/// Bytes an adapter prepends to the code pairs of a DTC response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DtcHeader {
    /// Mode echo only (legacy buses)
    ModeOnly,
    /// Mode echo followed by a code count (CAN)
    ModeAndCount,
}

impl DtcHeader {
    pub fn byte_len(&self) -> usize {
        match self {
            DtcHeader::ModeOnly => 1,
            DtcHeader::ModeAndCount => 2,
        }
    }
}

/// A trouble code and the list it was last seen in
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TroubleCode {
    code: String,
    pub category: DtcCategory,
}

impl TroubleCode {
    pub fn new(code: impl Into<String>, category: DtcCategory) -> Self {
        Self {
            code: code.into(),
            category,
        }
    }

    /// Five-character code, e.g. `P0420`
    pub fn code(&self) -> &str {
        &self.code
    }
}

/// Decode one two-byte DTC
///
/// Bits 7-6 of the first byte select the system letter, bits 5-4 the first
/// digit (0-3); the remaining three nibbles are printed as hex digits.
pub fn decode_pair(first: u8, second: u8) -> String {
    let letter = CATEGORY_LETTERS[((first & 0xC0) >> 6) as usize];
    let digit1 = (first & 0x30) >> 4;
    let digit2 = first & 0x0F;
    let digit3 = (second & 0xF0) >> 4;
    let digit4 = second & 0x0F;
    format!("{letter}{digit1}{digit2:X}{digit3:X}{digit4:X}")
}

/// Inverse of [`decode_pair`]
pub fn encode_dtc(code: &str) -> Option<[u8; 2]> {
    let mut chars = code.chars();
    let letter = chars.next()?.to_ascii_uppercase();
    let system = CATEGORY_LETTERS.iter().position(|c| *c == letter)? as u8;

    let digits: Vec<u8> = chars
        .map(|c| c.to_digit(16).map(|d| d as u8))
        .collect::<Option<_>>()?;
    if digits.len() != 4 || digits[0] > 3 {
        return None;
    }

    Some([
        (system << 6) | (digits[0] << 4) | digits[1],
        (digits[2] << 4) | digits[3],
    ])
}

/// Decode the data lines of a DTC query into codes.
///
/// Padding pairs are discarded and a trailing odd byte is ignored. Any
/// non-hex content fails the whole decode.
pub fn decode<S: AsRef<str>>(lines: &[S], header: DtcHeader) -> Result<Vec<String>, ObdError> {
    let bytes = hex_bytes(lines)?;
    let payload = bytes.get(header.byte_len()..).unwrap_or_default();

    Ok(payload
        .chunks_exact(2)
        .map(|pair| decode_pair(pair[0], pair[1]))
        .filter(|code| code != PADDING_CODE)
        .collect())
}

/// Scanned codes keyed by code, last write wins on category
#[derive(Debug, Clone, Default, Serialize)]
pub struct TroubleCodeSet {
    codes: BTreeMap<String, TroubleCode>,
}

impl TroubleCodeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a code, or move an existing one to `category`
    pub fn upsert(&mut self, code: &str, category: DtcCategory) {
        self.codes
            .entry(code.to_string())
            .and_modify(|existing| existing.category = category)
            .or_insert_with(|| TroubleCode::new(code, category));
    }

    pub fn get(&self, code: &str) -> Option<&TroubleCode> {
        self.codes.get(code)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TroubleCode> {
        self.codes.values()
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }

    pub fn clear(&mut self) {
        self.codes.clear();
    }

    pub fn into_vec(self) -> Vec<TroubleCode> {
        self.codes.into_values().collect()
    }
}

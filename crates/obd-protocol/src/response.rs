//! Response processing
//!
//! Turns the framed adapter text into data lines, and data lines into
//! hex byte tokens.

use crate::error::ObdError;
use crate::framer::PROMPT;

/// Marker the adapter prints when the vehicle returned nothing
pub const NO_DATA: &str = "NO DATA";

/// Status line printed while automatic protocol detection runs
const SEARCHING: &str = "SEARCHING...";

/// First-line markers that mean the adapter rejected or failed the command
const ERROR_MARKERS: &[&str] = &[
    "?",
    "ERROR",
    "UNABLE TO CONNECT",
    "BUS BUSY",
    "CAN ERROR",
    "STOPPED",
];

/// Outcome of processing one framed response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Processed {
    /// Non-empty data lines, in adapter order
    Lines(Vec<String>),
    /// Adapter responded with nothing meaningful
    NoData,
    /// Adapter replied with an error marker
    AdapterError(String),
}

/// Split a raw response into data lines.
///
/// Blank lines and `SEARCHING...` are dropped, and a trailing line that
/// contains the prompt is the next-prompt echo rather than data.
pub fn process(raw: &str) -> Processed {
    let mut lines: Vec<&str> = raw
        .split(['\r', '\n'])
        .filter(|line| !line.trim().is_empty())
        .filter(|line| !line.trim().eq_ignore_ascii_case(SEARCHING))
        .collect();

    if lines.last().is_some_and(|line| line.contains(PROMPT)) {
        lines.pop();
    }

    let Some(first) = lines.first() else {
        return Processed::NoData;
    };

    let first = first.trim();
    if first.eq_ignore_ascii_case(NO_DATA) {
        return Processed::NoData;
    }
    if is_error_marker(first) {
        return Processed::AdapterError(first.to_string());
    }

    Processed::Lines(lines.into_iter().map(str::to_string).collect())
}

fn is_error_marker(line: &str) -> bool {
    let upper = line.to_ascii_uppercase();
    ERROR_MARKERS.contains(&upper.as_str())
        || (upper.starts_with("BUS INIT") && upper.ends_with("ERROR"))
}

/// Strip whitespace, line breaks and the prompt, and uppercase
pub fn normalize(line: &str) -> String {
    line.chars()
        .filter(|c| !c.is_whitespace() && *c != PROMPT)
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// Concatenate lines and parse them as a stream of hex bytes
pub fn hex_bytes<S: AsRef<str>>(lines: &[S]) -> Result<Vec<u8>, ObdError> {
    let joined: String = lines.iter().map(|line| normalize(line.as_ref())).collect();

    if joined.len() % 2 != 0 {
        return Err(ObdError::MalformedPayload(format!(
            "odd number of hex digits in {:?}",
            joined
        )));
    }

    joined
        .as_bytes()
        .chunks(2)
        .map(|pair| {
            std::str::from_utf8(pair)
                .ok()
                .and_then(|token| u8::from_str_radix(token, 16).ok())
                .ok_or_else(|| {
                    ObdError::MalformedPayload(format!(
                        "invalid hex byte {:?}",
                        String::from_utf8_lossy(pair)
                    ))
                })
        })
        .collect()
}

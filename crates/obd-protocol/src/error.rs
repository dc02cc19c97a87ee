//! OBD-II Error Types

use thiserror::Error;

/// Errors that can occur during OBD-II communication
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ObdError {
    /// Connection refused, or a read/write on the stream failed
    #[error("Transport error: {0}")]
    Transport(String),

    /// Another request is already waiting for its response
    #[error("Adapter busy: a request is already in flight")]
    ProtocolBusy,

    /// Stream closed before the adapter sent its prompt
    #[error("Incomplete response: stream closed before prompt")]
    IncompleteResponse,

    /// Timeout waiting for the prompt
    #[error("Timeout waiting for OBD response after {0}ms")]
    ResponseTimeout(u64),

    /// Response payload could not be decoded
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    /// Command attempted without an open connection
    #[error("OBD adapter is not connected")]
    NoConnection,

    /// The connection was closed while the request was pending
    #[error("Request cancelled: connection closed")]
    Cancelled,

    /// Adapter answered with an error marker such as `?` or `UNABLE TO CONNECT`
    #[error("Adapter error: {0}")]
    AdapterError(String),
}

impl ObdError {
    /// Whether the connection is unusable and must be re-established
    pub fn is_fatal(&self) -> bool {
        matches!(self, ObdError::Transport(_) | ObdError::IncompleteResponse)
    }

    /// Whether the session is gone, either broken or closed under the caller
    pub fn ends_session(&self) -> bool {
        self.is_fatal() || matches!(self, ObdError::NoConnection | ObdError::Cancelled)
    }
}

impl From<std::io::Error> for ObdError {
    fn from(err: std::io::Error) -> Self {
        ObdError::Transport(err.to_string())
    }
}

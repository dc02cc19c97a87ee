//! Command framing over the adapter stream
//!
//! Appends the carriage return to outgoing commands and buffers incoming
//! bytes until the `>` prompt. Only one request may be in flight.

use crate::error::ObdError;
use crate::transport::Transport;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{watch, Mutex};
use tracing::{debug, warn};

/// Line terminator expected by ELM327 adapters
pub const COMMAND_TERMINATOR: char = '\r';
/// Prompt emitted by the adapter once it is ready for the next command
pub const PROMPT: char = '>';

/// The request currently waiting for its prompt.
///
/// Lives for exactly one exchange, so dropping it clears the buffer.
struct PendingRequest {
    command: String,
    buffer: Vec<u8>,
}

impl PendingRequest {
    fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
            buffer: Vec::new(),
        }
    }

    async fn run<S>(&mut self, transport: &mut Transport<S>) -> Result<String, ObdError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut wire = self.command.clone();
        wire.push(COMMAND_TERMINATOR);
        transport.write(wire.as_bytes()).await?;
        debug!(peer = %transport.peer(), command = %self.command, "Command sent");

        loop {
            let chunk = transport
                .read_chunk()
                .await?
                .ok_or(ObdError::IncompleteResponse)?;
            self.buffer.extend_from_slice(&chunk);

            if let Some(response) = self.take_response() {
                debug!(command = %self.command, response = ?response, "Response received");
                return Ok(response);
            }
        }
    }

    /// Text up to and including the prompt, once the prompt has arrived
    fn take_response(&mut self) -> Option<String> {
        let text = match std::str::from_utf8(&self.buffer) {
            Ok(text) => text.to_string(),
            // Multi-byte sequence split across chunks
            Err(e) if e.error_len().is_none() => return None,
            Err(_) => String::from_utf8_lossy(&self.buffer).into_owned(),
        };

        let end = text.find(PROMPT)? + PROMPT.len_utf8();
        self.buffer.clear();
        Some(text[..end].to_string())
    }
}

/// The stream plus what the adapter still owes on it
struct Link<S> {
    transport: Transport<S>,
    /// A timed-out request whose prompt has not been read yet
    stale_prompt: bool,
}

impl<S> Link<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    async fn exchange(
        &mut self,
        command: &str,
        limit: Option<Duration>,
    ) -> Result<String, ObdError> {
        if self.stale_prompt {
            self.discard_stale_reply(limit).await?;
        }

        let mut pending = PendingRequest::new(command);
        let result = with_timeout(limit, pending.run(&mut self.transport)).await;
        if let Err(ObdError::ResponseTimeout(_)) = result {
            debug!(%command, "Late reply will be discarded before the next command");
            self.stale_prompt = true;
        }
        result
    }

    /// Read and drop everything up to the prompt of a timed-out request
    async fn discard_stale_reply(&mut self, limit: Option<Duration>) -> Result<(), ObdError> {
        self.stale_prompt = false;
        let transport = &mut self.transport;
        let drain = async {
            let mut discarded = Vec::new();
            while !discarded.contains(&(PROMPT as u8)) {
                let chunk = transport
                    .read_chunk()
                    .await?
                    .ok_or(ObdError::IncompleteResponse)?;
                discarded.extend_from_slice(&chunk);
            }
            Ok::<_, ObdError>(discarded)
        };

        match with_timeout(limit, drain).await {
            Ok(discarded) => {
                debug!(reply = %String::from_utf8_lossy(&discarded), "Discarded late reply");
                Ok(())
            }
            Err(ObdError::ResponseTimeout(ms)) => {
                warn!("No late prompt within {}ms, sending next command anyway", ms);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// Serializes command/response cycles over one transport
pub struct CommandFramer<S> {
    link: Mutex<Link<S>>,
    response_timeout: Option<Duration>,
    closed: watch::Sender<bool>,
}

impl<S> CommandFramer<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(transport: Transport<S>, response_timeout: Option<Duration>) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            link: Mutex::new(Link {
                transport,
                stale_prompt: false,
            }),
            response_timeout,
            closed,
        }
    }

    /// Send a command and wait for the prompt-terminated response text.
    ///
    /// Fails with [`ObdError::ProtocolBusy`] if another request is pending.
    /// After a timeout the late reply is discarded before the next command
    /// goes out, so responses stay matched to their requests.
    pub async fn send_and_await(&self, command: &str) -> Result<String, ObdError> {
        let mut link = self.link.try_lock().map_err(|_| ObdError::ProtocolBusy)?;

        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() || !link.transport.is_open() {
            return Err(ObdError::NoConnection);
        }

        let exchange = link.exchange(command, self.response_timeout);

        tokio::select! {
            result = exchange => result,
            _ = wait_closed(&mut closed) => {
                debug!(%command, "Pending request cancelled by close");
                Err(ObdError::Cancelled)
            }
        }
    }

    /// Whether a request is currently in flight
    pub fn is_busy(&self) -> bool {
        self.link.try_lock().is_err()
    }

    /// Resolve any pending request with [`ObdError::Cancelled`] and release the stream
    pub async fn close(&self) {
        self.closed.send_replace(true);
        self.link.lock().await.transport.close().await;
    }

    #[cfg(test)]
    pub(crate) async fn shutdown_write(&self) -> std::io::Result<()> {
        self.link.lock().await.transport.shutdown_write().await
    }
}

async fn with_timeout<T, F>(limit: Option<Duration>, work: F) -> Result<T, ObdError>
where
    F: std::future::Future<Output = Result<T, ObdError>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, work)
            .await
            .map_err(|_| ObdError::ResponseTimeout(limit.as_millis() as u64))?,
        None => work.await,
    }
}

async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    loop {
        if *closed.borrow_and_update() {
            return;
        }
        if closed.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

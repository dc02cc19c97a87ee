//! Byte-stream transport to the adapter
//!
//! Owns a single bidirectional stream. Production code uses a TCP socket;
//! any `AsyncRead + AsyncWrite` stream can be plugged in.

use crate::error::ObdError;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Maximum bytes taken from the stream per read
const READ_CHUNK_SIZE: usize = 1024;

/// Connectivity of the adapter session
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Ready,
    Failed(String),
}

impl ConnectionState {
    pub fn is_ready(&self) -> bool {
        matches!(self, ConnectionState::Ready)
    }
}

/// A single stream connection to an OBD-II adapter
pub struct Transport<S> {
    stream: Option<S>,
    peer: String,
}

impl Transport<TcpStream> {
    /// Open a TCP connection to the adapter
    pub async fn open(host: &str, port: u16, connect_timeout: Duration) -> Result<Self, ObdError> {
        let addr = format!("{}:{}", host, port);
        info!(%addr, "Opening adapter connection");

        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| {
                ObdError::Transport(format!(
                    "connect to {} timed out after {}ms",
                    addr,
                    connect_timeout.as_millis()
                ))
            })??;

        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY: {}", e);
        }

        Ok(Self {
            stream: Some(stream),
            peer: addr,
        })
    }
}

impl<S> Transport<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap an already connected stream
    pub fn from_stream(stream: S, peer: impl Into<String>) -> Self {
        Self {
            stream: Some(stream),
            peer: peer.into(),
        }
    }

    /// Peer description (host:port for TCP)
    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    /// Write all bytes and flush
    pub async fn write(&mut self, bytes: &[u8]) -> Result<(), ObdError> {
        let stream = self.stream.as_mut().ok_or(ObdError::NoConnection)?;
        stream.write_all(bytes).await?;
        stream.flush().await?;
        Ok(())
    }

    /// Next available chunk of bytes, or `None` once the peer closed the stream
    pub async fn read_chunk(&mut self) -> Result<Option<Vec<u8>>, ObdError> {
        let stream = self.stream.as_mut().ok_or(ObdError::NoConnection)?;
        let mut chunk = vec![0u8; READ_CHUNK_SIZE];
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            debug!(peer = %self.peer, "Stream closed by peer");
            return Ok(None);
        }
        chunk.truncate(n);
        Ok(Some(chunk))
    }

    /// Shut down the write half but keep the stream
    #[cfg(test)]
    pub(crate) async fn shutdown_write(&mut self) -> std::io::Result<()> {
        match self.stream.as_mut() {
            Some(stream) => stream.shutdown().await,
            None => Ok(()),
        }
    }

    /// Release the stream. Safe to call repeatedly.
    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.shutdown().await {
                debug!(peer = %self.peer, "Shutdown error ignored: {}", e);
            }
            info!(peer = %self.peer, "Adapter connection closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_and_read_chunk() {
        let (client, mut adapter) = tokio::io::duplex(64);
        let mut transport = Transport::from_stream(client, "duplex");
        assert_eq!(transport.peer(), "duplex");

        transport.write(b"ATZ\r").await.unwrap();
        let mut buf = [0u8; 4];
        adapter.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ATZ\r");

        adapter.write_all(b"OK\r>").await.unwrap();
        let chunk = transport.read_chunk().await.unwrap().unwrap();
        assert_eq!(chunk, b"OK\r>");
    }

    #[tokio::test]
    async fn test_read_after_peer_close() {
        let (client, adapter) = tokio::io::duplex(64);
        let mut transport = Transport::from_stream(client, "duplex");
        drop(adapter);
        assert_eq!(transport.read_chunk().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (client, _adapter) = tokio::io::duplex(64);
        let mut transport = Transport::from_stream(client, "duplex");
        transport.close().await;
        transport.close().await;
        assert!(!transport.is_open());
        assert_eq!(transport.write(b"01\r").await, Err(ObdError::NoConnection));
    }

    #[tokio::test]
    async fn test_open_refused() {
        // Bind then drop to get a port with no listener
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = Transport::open("127.0.0.1", port, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(ObdError::Transport(_))));
    }

    #[tokio::test]
    async fn test_open_records_peer() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let transport = Transport::open("127.0.0.1", port, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(transport.peer(), format!("127.0.0.1:{}", port));
        assert!(transport.is_open());
    }
}

//! Duplex framed-JSON transport over stream sockets.
//!
//! A transport ships complete CRLF-delimited frames in both directions and
//! knows nothing about message contents. [`StreamTransport`] works over any
//! byte stream (TCP or Unix domain socket); [`Endpoint`] selects and
//! constructs the right one.
//!
//! Errors never escape the driver tasks: a broken socket closes the
//! transport and surfaces to the owning client as a disconnect.

pub mod framing;

#[cfg(unix)]
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio_util::codec::Decoder;
use tracing::{error, trace};

use crate::transport::framing::{CrlfCodec, FRAME_TERMINATOR};

/// Read chunk size for the inbound accumulator.
const RECV_CHUNK: usize = 4096;

// ============================================================================
// Endpoints
// ============================================================================

/// Where a JSON server listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// TCP host and port, local or remote.
    Tcp { host: String, port: u16 },
    /// Unix domain stream socket path.
    #[cfg(unix)]
    Unix(PathBuf),
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tcp { host, port } => write!(f, "{host}:{port}"),
            #[cfg(unix)]
            Self::Unix(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Errors raised while establishing a connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("invalid address `{0}`")]
    InvalidAddress(String),

    #[error("connection to {endpoint} timed out after {timeout:?}")]
    Timeout { endpoint: String, timeout: Duration },

    #[error("can not connect to {endpoint}: {source}")]
    Io {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },
}

impl Endpoint {
    /// Connect and wrap the stream in a [`StreamTransport`].
    pub async fn connect(&self, timeout: Duration) -> Result<StreamTransport, ConnectError> {
        match self {
            Self::Tcp { host, port } => {
                let stream = self.establish(timeout, TcpStream::connect((host.as_str(), *port)))
                    .await?;
                stream.set_nodelay(true).map_err(|source| ConnectError::Io {
                    endpoint: self.to_string(),
                    source,
                })?;
                Ok(StreamTransport::from_stream(stream))
            }
            #[cfg(unix)]
            Self::Unix(path) => {
                let stream = self.establish(timeout, UnixStream::connect(path)).await?;
                Ok(StreamTransport::from_stream(stream))
            }
        }
    }

    /// Brief connect-then-close reachability probe.
    ///
    /// Checkers use this to decide whether an endpoint is ready before a
    /// real transport is built.
    pub async fn probe(&self, timeout: Duration) -> Result<(), ConnectError> {
        match self {
            Self::Tcp { host, port } => {
                self.establish(timeout, TcpStream::connect((host.as_str(), *port)))
                    .await?;
            }
            #[cfg(unix)]
            Self::Unix(path) => {
                self.establish(timeout, UnixStream::connect(path)).await?;
            }
        }
        Ok(())
    }

    async fn establish<S>(
        &self,
        timeout: Duration,
        connect: impl Future<Output = std::io::Result<S>>,
    ) -> Result<S, ConnectError> {
        match tokio::time::timeout(timeout, connect).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(source)) => Err(ConnectError::Io {
                endpoint: self.to_string(),
                source,
            }),
            Err(_) => Err(ConnectError::Timeout {
                endpoint: self.to_string(),
                timeout,
            }),
        }
    }
}

// ============================================================================
// Transport trait
// ============================================================================

/// Error types for the stream transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport is disconnected")]
    Disconnected,
}

/// Bidirectional exchange of complete frames.
///
/// `send` takes one frame without its terminator; `receive` yields one
/// frame without its terminator. Both fail with `Disconnected` once the
/// underlying stream is gone.
#[async_trait]
pub trait Transport: Send {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Queue one frame for delivery. Frames hit the socket in call order.
    async fn send(&mut self, frame: &str) -> Result<(), Self::Error>;

    /// Wait for the next complete frame.
    async fn receive(&mut self) -> Result<String, Self::Error>;

    /// Release the socket. Idempotent.
    async fn close(&mut self) -> Result<(), Self::Error>;

    /// Whether the underlying stream is still usable.
    fn is_connected(&self) -> bool;
}

// ============================================================================
// Stream transport
// ============================================================================

/// Transport over a connected byte stream.
///
/// The stream is split into halves driven by two background tasks: a writer
/// draining an unbounded outbound queue and a reader running [`CrlfCodec`]
/// over a receive accumulator. Either task ending marks the transport
/// disconnected.
pub struct StreamTransport {
    outbound: Option<mpsc::UnboundedSender<String>>,
    inbound: Option<mpsc::UnboundedReceiver<String>>,
    connected: Arc<AtomicBool>,
}

impl StreamTransport {
    /// Build a transport from any connected duplex stream.
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(true));

        tokio::spawn(Self::writer_task(
            write_half,
            outbound_rx,
            Arc::clone(&connected),
        ));
        tokio::spawn(Self::reader_task(
            read_half,
            inbound_tx,
            Arc::clone(&connected),
        ));

        Self {
            outbound: Some(outbound_tx),
            inbound: Some(inbound_rx),
            connected,
        }
    }

    /// Background task that drains the outbound queue onto the socket.
    async fn writer_task<W>(
        mut writer: W,
        mut outbound: mpsc::UnboundedReceiver<String>,
        connected: Arc<AtomicBool>,
    ) where
        W: AsyncWrite + Send + Unpin,
    {
        while let Some(frame) = outbound.recv().await {
            trace!(len = frame.len(), "StreamTransport: writing frame");

            let write = async {
                writer.write_all(frame.as_bytes()).await?;
                writer.write_all(FRAME_TERMINATOR).await?;
                writer.flush().await
            };

            if let Err(e) = write.await {
                // RESET / PIPE / SHUTDOWN class errors all land here; the
                // owner observes the disconnect, never the error itself.
                error!("StreamTransport: write failed: {}", e);
                break;
            }
        }

        connected.store(false, Ordering::SeqCst);
        trace!("StreamTransport: writer task finished");
    }

    /// Background task that accumulates socket bytes and emits frames.
    async fn reader_task<R>(
        mut reader: R,
        inbound: mpsc::UnboundedSender<String>,
        connected: Arc<AtomicBool>,
    ) where
        R: AsyncRead + Send + Unpin,
    {
        let mut codec = CrlfCodec::new();
        let mut accumulator = BytesMut::with_capacity(RECV_CHUNK);

        'outer: loop {
            loop {
                match codec.decode(&mut accumulator) {
                    Ok(Some(frame)) => {
                        if inbound.send(frame).is_err() {
                            trace!("StreamTransport: inbound receiver dropped");
                            break 'outer;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        error!("StreamTransport: undecodable input: {}", e);
                        break 'outer;
                    }
                }
            }

            match reader.read_buf(&mut accumulator).await {
                Ok(0) => {
                    trace!("StreamTransport: peer closed the stream");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    error!("StreamTransport: read failed: {}", e);
                    break;
                }
            }
        }

        connected.store(false, Ordering::SeqCst);
        trace!("StreamTransport: reader task finished");
    }
}

#[async_trait]
impl Transport for StreamTransport {
    type Error = TransportError;

    async fn send(&mut self, frame: &str) -> Result<(), Self::Error> {
        if !self.is_connected() {
            return Err(TransportError::Disconnected);
        }

        let outbound = self.outbound.as_ref().ok_or(TransportError::Disconnected)?;
        outbound
            .send(frame.to_string())
            .map_err(|_| TransportError::Disconnected)
    }

    async fn receive(&mut self) -> Result<String, Self::Error> {
        let inbound = self.inbound.as_mut().ok_or(TransportError::Disconnected)?;
        inbound.recv().await.ok_or(TransportError::Disconnected)
    }

    async fn close(&mut self) -> Result<(), Self::Error> {
        self.connected.store(false, Ordering::SeqCst);
        self.outbound.take();
        self.inbound.take();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && self.outbound.is_some()
    }
}

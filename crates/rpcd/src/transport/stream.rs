//! Stream binding: one envelope each way over a byte stream.
//!
//! The client opens a connection per call, writes the request frame and
//! reads exactly one reply frame. The server reads one frame, and on any
//! rejection or fault closes the connection without writing anything.
//!
//! # Frame Format
//!
//! ```text
//! ┌──────────────────┬──────────────┬────────────┬──────────────┐
//! │ eph pub (32)     │ ts i64 BE(8) │ len u16 BE │ ciphertext   │
//! └──────────────────┴──────────────┴────────────┴──────────────┘
//! ```

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use protocol::wire::{self, StreamHeader};
use protocol::{Dispatcher, ProtocolError, Server, WireMessage, STREAM_HEADER_SIZE};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::Exchange;

/// Default per-connection read/write deadline in seconds.
pub const DEFAULT_IO_TIMEOUT_SECS: u64 = 3;

/// Reads one frame from `reader`.
///
/// Stale timestamps are rejected as soon as the header is read, before the
/// ciphertext is pulled off the stream.
pub async fn read_frame<R>(
    reader: &mut R,
    now: i64,
    reject_stale: bool,
) -> protocol::Result<WireMessage>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; STREAM_HEADER_SIZE];
    reader.read_exact(&mut header).await?;
    let header = StreamHeader::decode(&header)?;

    if reject_stale && !wire::is_fresh(header.timestamp, now) {
        return Err(ProtocolError::RequestExpired {
            age_secs: wire::message_age(header.timestamp, now),
        });
    }

    let mut ciphertext = vec![0u8; header.ciphertext_len as usize];
    reader.read_exact(&mut ciphertext).await?;
    Ok(header.into_message(ciphertext))
}

/// Writes one frame to `writer` and flushes it.
pub async fn write_frame<W>(writer: &mut W, msg: &WireMessage) -> protocol::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = msg.encode_stream()?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

async fn with_deadline<F, T>(deadline: Duration, what: &str, fut: F) -> protocol::Result<T>
where
    F: Future<Output = protocol::Result<T>>,
{
    tokio::time::timeout(deadline, fut)
        .await
        .map_err(|_| ProtocolError::Timeout(format!("{} timed out", what)))?
}

/// A server that answers one envelope per accepted stream connection.
pub struct StreamServer<D> {
    listener: TcpListener,
    server: Arc<Server<D>>,
    io_timeout: Duration,
}

impl<D: Dispatcher + 'static> StreamServer<D> {
    /// Binds the listener to `addr`.
    pub async fn bind(addr: &str, server: Arc<Server<D>>) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self::from_listener(listener, server))
    }

    /// Wraps an already bound listener.
    pub fn from_listener(listener: TcpListener, server: Arc<Server<D>>) -> Self {
        Self {
            listener,
            server,
            io_timeout: Duration::from_secs(DEFAULT_IO_TIMEOUT_SECS),
        }
    }

    /// Sets the per-connection read/write deadline.
    pub fn with_io_timeout(mut self, io_timeout: Duration) -> Self {
        self.io_timeout = io_timeout;
        self
    }

    /// Returns the bound address.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until `shutdown` is cancelled.
    ///
    /// Each connection is served on its own task.
    pub async fn run(self, shutdown: CancellationToken) -> io::Result<()> {
        info!(addr = ?self.listener.local_addr().ok(), "Stream listener started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Stream listener received shutdown signal");
                    return Ok(());
                }
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!(error = %e, "Failed to accept stream connection");
                            if !accept_backoff(&shutdown).await {
                                info!("Stream listener received shutdown signal");
                                return Ok(());
                            }
                            continue;
                        }
                    };
                    let server = Arc::clone(&self.server);
                    let io_timeout = self.io_timeout;
                    tokio::spawn(async move {
                        if let Err(e) = serve_connection(stream, server, io_timeout).await {
                            log_failure(&peer, &e);
                        }
                    });
                }
            }
        }
    }
}

/// Pause after a failed `accept` such as EMFILE before trying again.
pub const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Waits [`ACCEPT_ERROR_BACKOFF`]. Returns false if `shutdown` fired first.
async fn accept_backoff(shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => false,
        _ = tokio::time::sleep(ACCEPT_ERROR_BACKOFF) => true,
    }
}

fn log_failure(peer: &SocketAddr, err: &ProtocolError) {
    if err.is_internal() {
        warn!(%peer, error = %err, "Stream request failed");
    } else {
        debug!(%peer, error = %err, "Stream request dropped");
    }
}

/// Serves a single envelope on `stream` and closes it.
pub async fn serve_connection<S, D>(
    mut stream: S,
    server: Arc<Server<D>>,
    io_timeout: Duration,
) -> protocol::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
    D: Dispatcher + 'static,
{
    let request = with_deadline(
        io_timeout,
        "request read",
        read_frame(&mut stream, wire::unix_now(), true),
    )
    .await?;

    let reply = tokio::task::spawn_blocking(move || server.handle_envelope(&request))
        .await
        .map_err(|e| ProtocolError::InternalFault(format!("handler task failed: {}", e)))??;

    with_deadline(io_timeout, "reply write", write_frame(&mut stream, &reply)).await?;
    let _ = stream.shutdown().await;
    Ok(())
}

/// Opens a fresh stream for each call.
pub trait Connector: Send + Sync {
    /// The stream type produced.
    type Stream: AsyncRead + AsyncWrite + Unpin + Send;

    /// Opens one connection.
    fn connect(&self) -> impl Future<Output = io::Result<Self::Stream>> + Send;
}

/// Connects to a TCP address.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
}

impl TcpConnector {
    /// Creates a connector for `addr` (`host:port`).
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }

    /// Returns the target address.
    pub fn addr(&self) -> &str {
        &self.addr
    }
}

impl Connector for TcpConnector {
    type Stream = TcpStream;

    async fn connect(&self) -> io::Result<TcpStream> {
        let stream = TcpStream::connect(&self.addr).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

/// Client side of the stream binding.
#[derive(Debug, Clone)]
pub struct StreamClient<C> {
    connector: C,
    io_timeout: Duration,
}

impl StreamClient<TcpConnector> {
    /// Creates a client for a TCP address.
    pub fn tcp(addr: impl Into<String>) -> Self {
        Self::new(TcpConnector::new(addr))
    }
}

impl<C: Connector> StreamClient<C> {
    /// Creates a client over `connector`.
    pub fn new(connector: C) -> Self {
        Self {
            connector,
            io_timeout: Duration::from_secs(DEFAULT_IO_TIMEOUT_SECS),
        }
    }

    /// Sets the connect/read/write deadline.
    pub fn with_io_timeout(mut self, io_timeout: Duration) -> Self {
        self.io_timeout = io_timeout;
        self
    }

    async fn round_trip(&self, request: WireMessage) -> protocol::Result<WireMessage> {
        let mut stream = with_deadline(self.io_timeout, "connect", async {
            self.connector.connect().await.map_err(ProtocolError::from)
        })
        .await?;

        with_deadline(self.io_timeout, "request write", write_frame(&mut stream, &request)).await?;

        // PendingCall checks reply freshness.
        let reply = with_deadline(
            self.io_timeout,
            "reply read",
            read_frame(&mut stream, wire::unix_now(), false),
        )
        .await?;

        Ok(reply)
    }
}

impl<C: Connector> Exchange for StreamClient<C> {
    async fn exchange(&self, request: WireMessage) -> protocol::Result<WireMessage> {
        self.round_trip(request).await
    }
}

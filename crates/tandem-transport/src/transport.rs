//! Transport trait abstraction for ordered byte-stream backends.
//!
//! This module defines the `Transport` capability that the multiplexing layer
//! runs on (TCP, WebSocket-framed TCP, in-memory duplex). Variant-specific data
//! such as WebSocket resource names is carried by typed [`Extensions`] on the
//! [`TransportInfo`] rather than by distinct transport types.

use async_trait::async_trait;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

/// Transport layer errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// I/O error from underlying transport
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Transport is closed
    #[error("Transport is closed")]
    Closed,

    /// Address binding failed
    #[error("Failed to bind to address: {0}")]
    BindFailed(String),

    /// Connection failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Peer sent a frame that violates the framing protocol
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    /// Transport-specific error
    #[error("Transport error: {0}")]
    Other(String),
}

impl TransportError {
    /// Whether the error means the peer went away rather than misbehaved
    #[must_use]
    pub fn is_connection_lost(&self) -> bool {
        match self {
            Self::Closed => true,
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Async ordered byte-stream transport.
///
/// `send` and `receive` take `&self` so that one task can block in
/// `receive` while others send; implementations serialize each direction
/// internally.
///
/// # Examples
///
/// ```no_run
/// use tandem_transport::{TcpTransport, Transport};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let transport = TcpTransport::connect("127.0.0.1:4061".parse()?).await?;
/// transport.send(&[b"hello"]).await?;
///
/// let mut buf = vec![0u8; 1024];
/// let n = transport.receive(&mut buf).await?;
/// println!("Received {} bytes from {:?}", n, transport.info().remote_addr);
/// # Ok(())
/// # }
/// ```
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send all of the given buffers, in order, as one contiguous write.
    ///
    /// # Arguments
    /// * `bufs` - The buffers to send
    ///
    /// # Errors
    /// Returns `TransportError::Closed` after `shutdown`, or the underlying
    /// I/O error
    async fn send(&self, bufs: &[&[u8]]) -> TransportResult<()>;

    /// Receive data from the transport.
    ///
    /// Fills `buf` with up to `buf.len()` bytes and returns the number of
    /// bytes received. A return value of 0 means the peer closed its side.
    ///
    /// # Errors
    /// Returns `TransportError` if the receive operation fails
    async fn receive(&self, buf: &mut [u8]) -> TransportResult<usize>;

    /// Shut down the sending side.
    ///
    /// The peer observes end-of-stream once it has read everything sent
    /// before. Calling this more than once is a no-op.
    ///
    /// # Errors
    /// Returns `TransportError` if closing fails
    async fn shutdown(&self) -> TransportResult<()>;

    /// Static information about this transport.
    fn info(&self) -> &TransportInfo;

    /// Get transport statistics.
    fn stats(&self) -> TransportStats {
        TransportStats::default()
    }
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Box<T> {
    async fn send(&self, bufs: &[&[u8]]) -> TransportResult<()> {
        (**self).send(bufs).await
    }

    async fn receive(&self, buf: &mut [u8]) -> TransportResult<usize> {
        (**self).receive(buf).await
    }

    async fn shutdown(&self) -> TransportResult<()> {
        (**self).shutdown().await
    }

    fn info(&self) -> &TransportInfo {
        (**self).info()
    }

    fn stats(&self) -> TransportStats {
        (**self).stats()
    }
}

/// Kind of transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Plain TCP
    Tcp,
    /// RFC 6455 framing over another transport
    WebSocket,
    /// In-process duplex pipe
    Memory,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::WebSocket => write!(f, "ws"),
            Self::Memory => write!(f, "memory"),
        }
    }
}

/// Typed map of variant-specific transport details
#[derive(Default)]
pub struct Extensions {
    map: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl Extensions {
    /// Create an empty map
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value, returning the previous value of the same type
    pub fn insert<T: Any + Send + Sync>(&mut self, value: T) -> Option<T> {
        self.map
            .insert(TypeId::of::<T>(), Box::new(value))
            .and_then(|old| old.downcast::<T>().ok())
            .map(|old| *old)
    }

    /// Get the value of type `T`, if present
    #[must_use]
    pub fn get<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.map
            .get(&TypeId::of::<T>())
            .and_then(|value| value.downcast_ref::<T>())
    }

    /// Whether a value of type `T` is present
    #[must_use]
    pub fn contains<T: Any + Send + Sync>(&self) -> bool {
        self.map.contains_key(&TypeId::of::<T>())
    }

    /// Number of stored values
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether the map is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl fmt::Debug for Extensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Extensions").field("len", &self.map.len()).finish()
    }
}

/// Details of an established WebSocket transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebSocketInfo {
    /// Request resource, e.g. `/tandem`
    pub resource: String,
    /// Negotiated sub-protocol
    pub protocol: Option<String>,
}

/// Information about an established transport
#[derive(Debug)]
pub struct TransportInfo {
    /// Transport kind
    pub kind: TransportKind,
    /// Local address, when the transport has one
    pub local_addr: Option<SocketAddr>,
    /// Remote address, when the transport has one
    pub remote_addr: Option<SocketAddr>,
    /// Whether the transport is encrypted
    pub is_secure: bool,
    /// Variant-specific details
    pub extensions: Extensions,
}

impl TransportInfo {
    /// Info with no addresses and no extensions
    #[must_use]
    pub fn new(kind: TransportKind) -> Self {
        Self {
            kind,
            local_addr: None,
            remote_addr: None,
            is_secure: false,
            extensions: Extensions::new(),
        }
    }

    /// Set the local and remote addresses
    #[must_use]
    pub fn with_addrs(mut self, local: Option<SocketAddr>, remote: Option<SocketAddr>) -> Self {
        self.local_addr = local;
        self.remote_addr = remote;
        self
    }

    /// Human-readable `local -> remote` description for log lines
    #[must_use]
    pub fn description(&self) -> String {
        fn addr(addr: Option<SocketAddr>) -> String {
            addr.map_or_else(|| "<none>".to_string(), |a| a.to_string())
        }
        format!(
            "{} {} -> {}",
            self.kind,
            addr(self.local_addr),
            addr(self.remote_addr)
        )
    }
}

/// Transport statistics
#[derive(Debug, Clone, Default)]
pub struct TransportStats {
    /// Total bytes sent
    pub bytes_sent: u64,
    /// Total bytes received
    pub bytes_received: u64,
    /// Completed send calls (frames for framed transports)
    pub frames_sent: u64,
    /// Completed receive calls (frames for framed transports)
    pub frames_received: u64,
    /// Send errors
    pub send_errors: u64,
    /// Receive errors
    pub recv_errors: u64,
}

impl TransportStats {
    /// Create new empty statistics
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

/// Lock-free counters behind [`TransportStats`]
#[derive(Debug, Default)]
pub struct StatsRecorder {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    send_errors: AtomicU64,
    recv_errors: AtomicU64,
}

impl StatsRecorder {
    /// Record a successful send
    pub fn record_send(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a successful receive
    pub fn record_recv(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a send error
    pub fn record_send_error(&self) {
        self.send_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a receive error
    pub fn record_recv_error(&self) {
        self.recv_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Current values
    #[must_use]
    pub fn snapshot(&self) -> TransportStats {
        TransportStats {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            recv_errors: self.recv_errors.load(Ordering::Relaxed),
        }
    }
}

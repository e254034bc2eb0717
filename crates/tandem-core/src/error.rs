//! Error types for the tandem core protocol.
//!
//! Connection teardown is described by an explicit [`CloseReason`] value that
//! is stored on the connection and cloned into every stream and waiter that
//! fails because of it.

use std::borrow::Cow;
use std::fmt;
use thiserror::Error;

/// Core protocol errors
#[derive(Debug, Error, Clone)]
pub enum Error {
    /// Slic framing error
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// Stream error
    #[error("stream error: {0}")]
    Stream(#[from] StreamError),

    /// Connection error
    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Encoding error
    #[error("codec error: {0}")]
    Codec(#[from] tandem_codec::CodecError),

    /// Transport error
    #[error("transport error: {0}")]
    Transport(Cow<'static, str>),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(Cow<'static, str>),
}

impl From<tandem_transport::TransportError> for Error {
    fn from(e: tandem_transport::TransportError) -> Self {
        Self::Transport(e.to_string().into())
    }
}

impl Error {
    /// Whether the failed operation may succeed if retried on another
    /// connection
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Stream(e) => e.is_retryable(),
            Self::Connection(e) => e.is_retryable(),
            Self::Transport(_) => true,
            _ => false,
        }
    }

    /// Whether the operation was canceled locally or by a peer reset
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        matches!(
            self,
            Self::Stream(StreamError::Canceled | StreamError::Reset(_))
        )
    }

    /// The close reason when the error comes from connection teardown
    #[must_use]
    pub fn close_reason(&self) -> Option<&CloseReason> {
        match self {
            Self::Stream(StreamError::Aborted(reason))
            | Self::Connection(ConnectionError::Closed(reason)) => Some(reason),
            _ => None,
        }
    }
}

/// Slic frame-level errors; every one of them is a protocol violation
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Unknown frame type byte
    #[error("invalid frame type: 0x{0:02X}")]
    InvalidFrameType(u8),

    /// Frame type not valid at this point of the exchange
    #[error("unexpected {0} frame")]
    UnexpectedFrame(&'static str),

    /// Declared size larger than the configured maximum
    #[error("frame size {size} exceeds maximum {max}")]
    TooLarge {
        /// Declared size
        size: usize,
        /// Configured maximum
        max: usize,
    },

    /// Declared size too small for the frame's fixed fields
    #[error("frame size {0} is too small")]
    TooSmall(usize),

    /// Malformed frame body
    #[error("malformed frame: {0}")]
    Malformed(Cow<'static, str>),

    /// Stream ID breaks the numbering rules
    #[error("invalid stream id {0}")]
    InvalidStreamId(u64),

    /// Peer opened more streams than it was allowed to
    #[error("too many incoming streams")]
    TooManyStreams,

    /// Peer tried to reset a control stream
    #[error("control stream {0} cannot be reset")]
    ControlStreamReset(u64),

    /// Stream ended in the middle of a frame
    #[error("unexpected end of stream")]
    UnexpectedEof,
}

impl From<tandem_codec::CodecError> for FrameError {
    fn from(e: tandem_codec::CodecError) -> Self {
        Self::Malformed(e.to_string().into())
    }
}

/// Stream-level errors
#[derive(Debug, Error, Clone)]
pub enum StreamError {
    /// The peer reset the stream with the given error code
    #[error("stream reset by peer (code {0})")]
    Reset(u64),

    /// The operation was canceled locally
    #[error("stream canceled")]
    Canceled,

    /// The connection went away
    #[error("stream aborted: {0}")]
    Aborted(CloseReason),

    /// The stream was already finished in this direction
    #[error("stream already finished")]
    Finished,

    /// The first frame of a new stream must carry data
    #[error("cannot start a stream with an empty frame")]
    EmptyFirstFrame,

    /// Incoming data exceeded the caller's limit
    #[error("stream data exceeds {0} bytes")]
    TooLarge(usize),
}

impl StreamError {
    /// Whether the failed operation may succeed if retried
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Aborted(reason) => reason.retryable,
            // code 1 means the peer declined the stream while closing
            Self::Reset(code) => *code == crate::slic::RESET_CLOSING,
            _ => false,
        }
    }
}

/// Connection-level errors
#[derive(Debug, Error, Clone)]
pub enum ConnectionError {
    /// The connection is closing or closed
    #[error("connection closed: {0}")]
    Closed(CloseReason),

    /// Operation not allowed in the current state
    #[error("invalid state: {0}")]
    InvalidState(Cow<'static, str>),

    /// Slic or control stream handshake failed
    #[error("handshake failed: {0}")]
    Handshake(Cow<'static, str>),

    /// The peer does not speak our application protocol
    #[error("unsupported application protocol `{0}`")]
    UnsupportedProtocol(String),

    /// Connection establishment timed out
    #[error("connect timed out")]
    ConnectTimeout,
}

impl ConnectionError {
    /// Whether the failed operation may succeed if retried
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Closed(reason) => reason.retryable,
            Self::ConnectTimeout => true,
            _ => false,
        }
    }
}

/// Why a connection closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseReasonKind {
    /// Closed gracefully by the local side
    LocalClose,
    /// Closed gracefully by the peer (GoAway)
    PeerClose,
    /// No activity for the negotiated idle timeout
    IdleTimeout,
    /// The graceful close did not finish in time
    CloseTimeout,
    /// Aborted by the local side
    Aborted,
    /// The transport failed or the peer went away
    Transport,
    /// The peer violated the protocol
    Protocol,
    /// Connection establishment failed
    Handshake,
}

impl fmt::Display for CloseReasonKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::LocalClose => "closed locally",
            Self::PeerClose => "closed by peer",
            Self::IdleTimeout => "idle timeout",
            Self::CloseTimeout => "close timeout",
            Self::Aborted => "aborted",
            Self::Transport => "transport failure",
            Self::Protocol => "protocol violation",
            Self::Handshake => "handshake failure",
        };
        f.write_str(name)
    }
}

/// Close reason attached to a connection in the Closing and Closed states
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    /// Category
    pub kind: CloseReasonKind,
    /// Human-readable detail
    pub message: Cow<'static, str>,
    /// Whether requests failed by this close may be retried elsewhere
    pub retryable: bool,
}

impl CloseReason {
    /// Create a reason
    pub fn new(kind: CloseReasonKind, message: impl Into<Cow<'static, str>>, retryable: bool) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable,
        }
    }

    /// Graceful local close
    pub fn local_close(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(CloseReasonKind::LocalClose, message, true)
    }

    /// Graceful close requested by the peer
    pub fn peer_close(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(CloseReasonKind::PeerClose, message, true)
    }

    /// Explicit local abort
    pub fn aborted(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(CloseReasonKind::Aborted, message, false)
    }

    /// Transport failure
    pub fn transport(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(CloseReasonKind::Transport, message, true)
    }

    /// Protocol violation
    pub fn protocol(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(CloseReasonKind::Protocol, message, false)
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{}: {}", self.kind, self.message)
        }
    }
}

/// Result type for core operations
pub type Result<T> = std::result::Result<T, Error>;

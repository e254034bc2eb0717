//! # Tandem Transport
//!
//! Ordered byte-stream transports for tandem connections.
//!
//! This crate provides:
//! - The `Transport` capability trait used by the multiplexing layer
//! - TCP transports and a listening acceptor
//! - In-memory duplex transports for tests and colocated peers
//! - RFC 6455 WebSocket data framing over any other transport
//! - Transport info with typed, variant-specific extensions

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod stream;
pub mod transport;
pub mod websocket;

pub use stream::{
    DEFAULT_MEMORY_BUFFER, MemoryTransport, StreamTransport, TcpAcceptor, TcpTransport,
    memory_pair,
};
pub use transport::{
    Extensions, StatsRecorder, Transport, TransportError, TransportInfo, TransportKind,
    TransportResult, TransportStats, WebSocketInfo,
};
pub use websocket::{Role, WebSocketTransport};

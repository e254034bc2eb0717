//! # Tandem Core
//!
//! Multiplexed request/response connections over a single ordered byte
//! stream.
//!
//! This crate provides:
//! - Slic framing and the Slic handshake
//! - A multiplexed socket: stream IDs, per-direction flow control and a
//!   single demultiplexing reader
//! - The connection lifecycle: control streams, idle monitoring, graceful
//!   `GoAway` close and abort
//! - Request and response frames and the dispatch seam for incoming requests
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Connection                               │
//! │   (lifecycle, control stream, idle monitor, dispatch)           │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                        SlicSocket                               │
//! │   (stream table, IDs, flow control, demultiplexing)             │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                        Slic frames                              │
//! │   (type | size | stream ID | payload)                           │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                        Transport                                │
//! │   (TCP, WebSocket, in-memory)                                   │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tandem_codec::Identity;
//! use tandem_core::{CancelSignal, Connection, ConnectionOptions, OutgoingRequest, empty_payload};
//! use tandem_transport::TcpTransport;
//!
//! # async fn run() -> tandem_core::Result<()> {
//! let transport = TcpTransport::connect("127.0.0.1:4061".parse().unwrap()).await?;
//! let connection = Connection::connect(Arc::new(transport), ConnectionOptions::default(), None).await?;
//!
//! let request = OutgoingRequest::new(Identity::new("hello"), "sayHello", empty_payload());
//! let response = connection.invoke(&request, CancelSignal::never()).await?;
//! println!("{:?}", response.map(|r| r.status));
//!
//! connection.close("done").await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cancel;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod mux;
pub mod protocol;
pub mod slic;

pub use cancel::{CancelSignal, CancelSource};
pub use config::{ConnectionOptions, SlicOptions};
pub use connection::{Connection, ConnectionState, ControlMessage, GoAway};
pub use dispatch::{DispatchContext, DispatchError, Dispatcher, ServantMap};
pub use error::{
    CloseReason, CloseReasonKind, ConnectionError, Error, FrameError, Result, StreamError,
};
pub use mux::{Side, SlicSocket, SlicStream};
pub use protocol::{
    IncomingRequest, IncomingResponse, OutgoingRequest, OutgoingResponse, RemoteException,
    ReplyStatus, empty_payload, encapsulate,
};
pub use slic::{FrameType, Negotiated, RESET_CANCELED, RESET_CLOSING};

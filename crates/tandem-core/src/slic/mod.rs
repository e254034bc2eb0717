//! Slic: framing, handshake and frame bodies for multiplexing streams over a
//! single byte-stream transport.

pub mod frame;
pub mod handshake;
pub mod params;
pub mod reader;

pub use frame::{FrameHeader, FrameType, MAX_HEADER_SIZE, decode_header, encode_header};
pub use handshake::{LocalParameters, Negotiated};
pub use params::{InitializeBody, ParameterKey, Parameters};
pub use reader::FrameReader;

/// Reset code used when a stream is dropped or canceled locally
pub const RESET_CANCELED: u64 = 0;

/// Reset code used when a stream is refused or abandoned because the
/// connection is closing; requests failed this way may be retried
pub const RESET_CLOSING: u64 = 1;

//! # Tandem Codec
//!
//! Binary encoding used by tandem requests and replies.
//!
//! This crate provides:
//! - Little-endian primitives, sizes, strings, sequences and dictionaries
//! - Encapsulations: length-prefixed, version-tagged regions that can be
//!   nested and skipped without being understood
//! - Tagged optional members (1.1 encoding only)
//! - Class instance graphs, including cycles, in both the 1.0 and 1.1
//!   encodings, with slicing and preservation of unknown derived slices
//! - User exceptions
//! - Proxies and variable-length integers
//!
//! ## Example
//!
//! ```
//! use tandem_codec::{EncodingVersion, FormatType, InputStream, OutputStream};
//!
//! let mut out = OutputStream::default();
//! out.start_encapsulation(EncodingVersion::V1_1, FormatType::Compact).unwrap();
//! out.write_string("hello");
//! out.write_i32_opt(1, Some(42)).unwrap();
//! out.end_encapsulation().unwrap();
//! let bytes = out.finish().unwrap();
//!
//! let mut input = InputStream::new(&bytes, EncodingVersion::V1_1);
//! input.start_encapsulation().unwrap();
//! assert_eq!(input.read_string().unwrap(), "hello");
//! assert_eq!(input.read_i32_opt(1).unwrap(), Some(42));
//! input.end_encapsulation().unwrap();
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

mod decoder;
mod encoder;
pub mod error;
pub mod exception;
pub mod input;
pub mod optional;
pub mod output;
pub mod proxy;
pub mod value;
pub mod varint;
pub mod version;

pub use error::{CodecError, Result};
pub use exception::{UnknownUserException, UserException};
pub use input::{DEFAULT_MAX_CLASS_DEPTH, InputStream};
pub use optional::{OPTIONAL_END_MARKER, OptionalFormat};
pub use output::{ENCAPSULATION_HEADER_SIZE, InstanceWriter, OutputStream, Placeholder};
pub use proxy::{EndpointData, Identity, InvocationMode, ProxyData};
pub use value::{
    OBJECT_TYPE_ID, SliceInfo, SlicedData, TypeRegistry, UnknownSlicedValue, Value, ValueGraph,
    ValueId,
};
pub use varint::{VARULONG_MAX, decode_varulong, encode_varulong, varulong_len};
pub use version::{EncodingVersion, FormatType, ProtocolVersion};

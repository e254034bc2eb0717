//! Error types for the tandem binary encoding.

use std::borrow::Cow;

use thiserror::Error;

use crate::version::EncodingVersion;

/// Encoding and decoding errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Attempted to read past the end of the buffer or encapsulation
    #[error("unexpected end of buffer: needed {needed} bytes, {remaining} remaining")]
    UnexpectedEnd {
        /// Bytes required by the read
        needed: usize,
        /// Bytes left in the current region
        remaining: usize,
    },

    /// A size or count field is negative or larger than the remaining data allows
    #[error("invalid size: {0}")]
    InvalidSize(i64),

    /// Malformed encapsulation header or body
    #[error("invalid encapsulation: {0}")]
    InvalidEncapsulation(Cow<'static, str>),

    /// The encapsulation uses an encoding this crate does not implement
    #[error("unsupported encoding {0}")]
    UnsupportedEncoding(EncodingVersion),

    /// Structurally invalid data
    #[error("invalid data: {0}")]
    InvalidData(Cow<'static, str>),

    /// No factory registered for any slice of a class instance
    #[error("no value factory found for type `{0}`")]
    NoValueFactory(String),

    /// A compact type ID that is not registered
    #[error("unknown compact type id {0}")]
    UnknownCompactId(i32),

    /// A class reference was never matched by an instance
    #[error("unresolved instance reference {0}")]
    UnresolvedInstance(i32),

    /// String payload is not valid UTF-8
    #[error("invalid UTF-8 string")]
    InvalidUtf8,

    /// The stream API was used out of order (unbalanced slices, encapsulations, etc.)
    #[error("codec misuse: {0}")]
    Misuse(Cow<'static, str>),
}

impl CodecError {
    /// Shorthand for [`CodecError::InvalidData`]
    pub fn invalid(message: impl Into<Cow<'static, str>>) -> Self {
        Self::InvalidData(message.into())
    }

    /// Shorthand for [`CodecError::Misuse`]
    pub fn misuse(message: impl Into<Cow<'static, str>>) -> Self {
        Self::Misuse(message.into())
    }
}

/// Result type for codec operations
pub type Result<T> = std::result::Result<T, CodecError>;

//! Encoding and protocol version tags.

use std::fmt;

/// Version of the binary encoding used inside an encapsulation.
///
/// Written on the wire as two bytes (major, minor) right after the
/// encapsulation length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EncodingVersion {
    /// Major version
    pub major: u8,
    /// Minor version
    pub minor: u8,
}

impl EncodingVersion {
    /// Legacy encoding: no optionals, negative instance indices, deferred instances
    pub const V1_0: Self = Self { major: 1, minor: 0 };

    /// Current encoding: optionals, inline instances, sliced format
    pub const V1_1: Self = Self { major: 1, minor: 1 };

    /// Create a version from its parts
    #[must_use]
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }

    /// Check whether this crate can encode and decode this version
    #[must_use]
    pub fn is_supported(self) -> bool {
        self == Self::V1_0 || self == Self::V1_1
    }

    /// Check whether tagged optional members are encoded
    #[must_use]
    pub fn supports_optionals(self) -> bool {
        self != Self::V1_0
    }
}

impl Default for EncodingVersion {
    fn default() -> Self {
        Self::V1_1
    }
}

impl fmt::Display for EncodingVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Protocol version carried by proxies (1.1 encoding only).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProtocolVersion {
    /// Major version
    pub major: u8,
    /// Minor version
    pub minor: u8,
}

impl ProtocolVersion {
    /// Legacy request/reply protocol
    pub const ICE1: Self = Self { major: 1, minor: 0 };

    /// Stream-multiplexed protocol
    pub const ICE2: Self = Self { major: 2, minor: 0 };
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::ICE2
    }
}

/// Class and exception format inside an encapsulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FormatType {
    /// No slice sizes; receivers must know every type
    #[default]
    Compact,
    /// Slices carry their size so unknown slices can be skipped and preserved
    Sliced,
}

//! Proxy (object reference) encoding.

use std::fmt;

use crate::version::{EncodingVersion, ProtocolVersion};

/// Identity of a target object
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identity {
    /// Object name; empty for a null proxy
    pub name: String,
    /// Optional category
    pub category: String,
}

impl Identity {
    /// Create an identity without category
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            category: String::new(),
        }
    }

    /// Create an identity with a category
    #[must_use]
    pub fn with_category(name: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            category: category.into(),
        }
    }

    /// Check whether this is the null identity
    #[must_use]
    pub fn is_null(&self) -> bool {
        self.name.is_empty()
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.category.is_empty() {
            f.write_str(&self.name)
        } else {
            write!(f, "{}/{}", self.category, self.name)
        }
    }
}

/// Invocation mode recorded in a proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum InvocationMode {
    /// Request and wait for the reply
    #[default]
    Twoway = 0,
    /// Fire and forget
    Oneway = 1,
    /// Oneway, batched
    BatchOneway = 2,
    /// Datagram
    Datagram = 3,
    /// Datagram, batched
    BatchDatagram = 4,
}

impl InvocationMode {
    /// Decode a mode byte
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Twoway),
            1 => Some(Self::Oneway),
            2 => Some(Self::BatchOneway),
            3 => Some(Self::Datagram),
            4 => Some(Self::BatchDatagram),
            _ => None,
        }
    }
}

/// An endpoint whose transport-specific body is kept opaque
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointData {
    /// Transport type code (1 = TCP, 2 = SSL, 4 = WS, ...)
    pub transport: i16,
    /// Encoding of the endpoint body
    pub encoding: EncodingVersion,
    /// Encoded endpoint body
    pub body: Vec<u8>,
}

/// Decoded proxy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyData {
    /// Target identity
    pub identity: Identity,
    /// Facet, empty for the default facet
    pub facet: String,
    /// Invocation mode
    pub mode: InvocationMode,
    /// Require a secure transport
    pub secure: bool,
    /// Protocol to use (written by the 1.1 encoding only)
    pub protocol: ProtocolVersion,
    /// Encoding to use for requests (written by the 1.1 encoding only)
    pub encoding: EncodingVersion,
    /// Direct endpoints; empty for an indirect proxy
    pub endpoints: Vec<EndpointData>,
    /// Object adapter ID of an indirect proxy
    pub adapter_id: String,
}

impl ProxyData {
    /// Create a well-known proxy for an identity
    #[must_use]
    pub fn new(identity: Identity) -> Self {
        Self {
            identity,
            facet: String::new(),
            mode: InvocationMode::default(),
            secure: false,
            protocol: ProtocolVersion::default(),
            encoding: EncodingVersion::default(),
            endpoints: Vec::new(),
            adapter_id: String::new(),
        }
    }
}

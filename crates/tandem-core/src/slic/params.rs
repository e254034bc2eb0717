//! Slic handshake frame bodies.
//!
//! Parameters travel as a dictionary of varulong keys to byte sequences, each
//! holding one varulong value. Unknown keys are skipped so that peers can add
//! parameters without breaking older versions.

use std::time::Duration;

use bytes::Bytes;
use tandem_codec::varint::decode_varulong;
use tandem_codec::{EncodingVersion, InputStream, OutputStream};

use crate::error::FrameError;

/// Handshake parameter keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u64)]
pub enum ParameterKey {
    /// Incoming bidirectional streams the sender accepts at once
    MaxBidirectionalStreams = 0,
    /// Incoming unidirectional streams the sender accepts at once
    MaxUnidirectionalStreams = 1,
    /// Idle timeout in milliseconds
    IdleTimeout = 2,
    /// Largest stream frame payload the sender wants to receive
    PacketMaxSize = 3,
}

/// Parameter dictionary
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Parameters {
    /// `MaxBidirectionalStreams`
    pub max_bidirectional_streams: Option<u64>,
    /// `MaxUnidirectionalStreams`
    pub max_unidirectional_streams: Option<u64>,
    /// `IdleTimeout`
    pub idle_timeout: Option<Duration>,
    /// `PacketMaxSize`
    pub packet_max_size: Option<u64>,
}

impl Parameters {
    fn entries(&self) -> Vec<(ParameterKey, u64)> {
        let mut entries = Vec::with_capacity(4);
        if let Some(v) = self.max_bidirectional_streams {
            entries.push((ParameterKey::MaxBidirectionalStreams, v));
        }
        if let Some(v) = self.max_unidirectional_streams {
            entries.push((ParameterKey::MaxUnidirectionalStreams, v));
        }
        if let Some(v) = self.idle_timeout {
            let ms = u64::try_from(v.as_millis()).unwrap_or(u64::MAX);
            entries.push((ParameterKey::IdleTimeout, ms));
        }
        if let Some(v) = self.packet_max_size {
            entries.push((ParameterKey::PacketMaxSize, v));
        }
        entries
    }

    /// Append the dictionary to `out`.
    ///
    /// # Errors
    /// Returns `FrameError::Malformed` if a value does not fit a varulong
    pub fn encode(&self, out: &mut OutputStream) -> Result<(), FrameError> {
        let entries = self.entries();
        out.write_size(entries.len());
        for (key, value) in entries {
            out.write_varulong(key as u64)?;
            let mut inner = OutputStream::new(EncodingVersion::V1_1);
            inner.write_varulong(value)?;
            out.write_byte_seq(inner.as_slice());
        }
        Ok(())
    }

    /// Read a dictionary from `input`.
    ///
    /// # Errors
    /// Returns `FrameError::Malformed` on truncated or invalid entries
    pub fn decode(input: &mut InputStream<'_>) -> Result<Self, FrameError> {
        let mut params = Self::default();
        let count = input.read_and_check_seq_size(2)?;
        for _ in 0..count {
            let key = input.read_varulong()?;
            let raw = input.read_byte_seq()?;
            let (value, used) = decode_varulong(raw)?;
            if used != raw.len() {
                return Err(FrameError::Malformed(
                    format!("trailing bytes in parameter {key}").into(),
                ));
            }
            match key {
                0 => params.max_bidirectional_streams = Some(value),
                1 => params.max_unidirectional_streams = Some(value),
                2 => params.idle_timeout = Some(Duration::from_millis(value)),
                3 => params.packet_max_size = Some(value),
                _ => {}
            }
        }
        Ok(params)
    }
}

/// `Initialize` frame body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitializeBody {
    /// Slic version the connector wants to use
    pub version: u64,
    /// Application protocol name
    pub application_protocol: String,
    /// Connector's parameters
    pub parameters: Parameters,
}

impl InitializeBody {
    /// Encode the body.
    ///
    /// # Errors
    /// Returns `FrameError::Malformed` if a value does not fit a varulong
    pub fn encode(&self) -> Result<Bytes, FrameError> {
        let mut out = OutputStream::new(EncodingVersion::V1_1);
        out.write_varulong(self.version)?;
        out.write_string(&self.application_protocol);
        self.parameters.encode(&mut out)?;
        Ok(out.finish()?)
    }

    /// Decode the version only, so that an unsupported version can be
    /// answered before the rest of the body is understood.
    ///
    /// # Errors
    /// Returns `FrameError::Malformed` on an empty body
    pub fn peek_version(payload: &[u8]) -> Result<u64, FrameError> {
        Ok(decode_varulong(payload)?.0)
    }

    /// Decode the body.
    ///
    /// # Errors
    /// Returns `FrameError::Malformed` on truncated or trailing data
    pub fn decode(payload: &[u8]) -> Result<Self, FrameError> {
        let mut input = InputStream::new(payload, EncodingVersion::V1_1);
        let version = input.read_varulong()?;
        let application_protocol = input.read_string()?;
        let parameters = Parameters::decode(&mut input)?;
        expect_end(&input)?;
        Ok(Self {
            version,
            application_protocol,
            parameters,
        })
    }
}

/// Encode an `InitializeAck` body.
///
/// # Errors
/// Returns `FrameError::Malformed` if a value does not fit a varulong
pub fn encode_initialize_ack(parameters: &Parameters) -> Result<Bytes, FrameError> {
    let mut out = OutputStream::new(EncodingVersion::V1_1);
    parameters.encode(&mut out)?;
    Ok(out.finish()?)
}

/// Decode an `InitializeAck` body.
///
/// # Errors
/// Returns `FrameError::Malformed` on truncated or trailing data
pub fn decode_initialize_ack(payload: &[u8]) -> Result<Parameters, FrameError> {
    let mut input = InputStream::new(payload, EncodingVersion::V1_1);
    let parameters = Parameters::decode(&mut input)?;
    expect_end(&input)?;
    Ok(parameters)
}

/// Encode a `Version` body listing the supported versions.
///
/// # Errors
/// Returns `FrameError::Malformed` if a version does not fit a varulong
pub fn encode_versions(versions: &[u64]) -> Result<Bytes, FrameError> {
    let mut out = OutputStream::new(EncodingVersion::V1_1);
    out.write_size(versions.len());
    for version in versions {
        out.write_varulong(*version)?;
    }
    Ok(out.finish()?)
}

/// Decode a `Version` body.
///
/// # Errors
/// Returns `FrameError::Malformed` on truncated or trailing data
pub fn decode_versions(payload: &[u8]) -> Result<Vec<u64>, FrameError> {
    let mut input = InputStream::new(payload, EncodingVersion::V1_1);
    let count = input.read_and_check_seq_size(1)?;
    let versions = (0..count)
        .map(|_| input.read_varulong())
        .collect::<Result<Vec<_>, _>>()?;
    expect_end(&input)?;
    Ok(versions)
}

/// Encode a `StreamReset` body.
///
/// # Errors
/// Returns `FrameError::Malformed` if the code does not fit a varulong
pub fn encode_reset(code: u64) -> Result<Bytes, FrameError> {
    let mut out = OutputStream::new(EncodingVersion::V1_1);
    out.write_varulong(code)?;
    Ok(out.finish()?)
}

/// Decode a `StreamReset` body.
///
/// # Errors
/// Returns `FrameError::Malformed` on truncated or trailing data
pub fn decode_reset(payload: &[u8]) -> Result<u64, FrameError> {
    let (code, used) = decode_varulong(payload)?;
    if used != payload.len() {
        return Err(FrameError::Malformed("trailing bytes in StreamReset".into()));
    }
    Ok(code)
}

fn expect_end(input: &InputStream<'_>) -> Result<(), FrameError> {
    if input.is_empty() {
        Ok(())
    } else {
        Err(FrameError::Malformed(
            format!("{} trailing bytes in frame body", input.remaining()).into(),
        ))
    }
}

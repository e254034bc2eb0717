//! Slic frame header encoding and decoding.
//!
//! ```text
//! byte      type
//! size      size       (1 byte if <= 254, else 0xFF + i32 little-endian)
//! varulong  stream id  (stream frames only, counted in size)
//! byte[]    payload
//! ```

use bytes::{BufMut, BytesMut};
use tandem_codec::varint::{decode_varulong, encode_varulong, varulong_len, varulong_len_from_prefix};

use crate::error::FrameError;

/// Largest size encoded in a single byte
const MAX_SHORT_SIZE: usize = 254;

/// Longest possible frame header: type, long size, 8-byte stream id
pub const MAX_HEADER_SIZE: usize = 1 + 5 + 8;

/// Slic frame types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    /// Connector's handshake opening
    Initialize = 0x01,
    /// Acceptor's handshake reply
    InitializeAck = 0x02,
    /// Acceptor's list of supported versions
    Version = 0x03,
    /// Keep-alive request
    Ping = 0x04,
    /// Keep-alive reply
    Pong = 0x05,
    /// Stream data, more follows
    Stream = 0x06,
    /// Final stream data
    StreamLast = 0x07,
    /// Abrupt stream termination
    StreamReset = 0x08,
    /// Receiver finished a unidirectional stream
    StreamUnidirectionalFin = 0x09,
}

impl FrameType {
    /// Whether the header carries a stream ID
    #[must_use]
    pub fn has_stream_id(self) -> bool {
        matches!(
            self,
            Self::Stream | Self::StreamLast | Self::StreamReset | Self::StreamUnidirectionalFin
        )
    }

    /// Name for error messages
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Initialize => "Initialize",
            Self::InitializeAck => "InitializeAck",
            Self::Version => "Version",
            Self::Ping => "Ping",
            Self::Pong => "Pong",
            Self::Stream => "Stream",
            Self::StreamLast => "StreamLast",
            Self::StreamReset => "StreamReset",
            Self::StreamUnidirectionalFin => "StreamUnidirectionalFin",
        }
    }
}

impl TryFrom<u8> for FrameType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Initialize),
            0x02 => Ok(Self::InitializeAck),
            0x03 => Ok(Self::Version),
            0x04 => Ok(Self::Ping),
            0x05 => Ok(Self::Pong),
            0x06 => Ok(Self::Stream),
            0x07 => Ok(Self::StreamLast),
            0x08 => Ok(Self::StreamReset),
            0x09 => Ok(Self::StreamUnidirectionalFin),
            other => Err(FrameError::InvalidFrameType(other)),
        }
    }
}

/// Decoded frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Frame type
    pub frame_type: FrameType,
    /// Stream ID, for stream frames
    pub stream_id: Option<u64>,
    /// Payload length, excluding the stream ID
    pub payload_len: usize,
}

/// Encode a frame header for a payload of `payload_len` bytes.
///
/// # Errors
/// Returns `FrameError::Malformed` if a stream frame has no stream ID (or a
/// non-stream frame has one), or the ID does not fit a varulong
pub fn encode_header(
    frame_type: FrameType,
    stream_id: Option<u64>,
    payload_len: usize,
) -> Result<BytesMut, FrameError> {
    let mut out = BytesMut::with_capacity(MAX_HEADER_SIZE);
    out.put_u8(frame_type as u8);
    match (frame_type.has_stream_id(), stream_id) {
        (true, Some(id)) => {
            let size = payload_len + varulong_len(id);
            put_size(&mut out, size)?;
            encode_varulong(id, &mut out)?;
        }
        (false, None) => put_size(&mut out, payload_len)?,
        _ => {
            return Err(FrameError::Malformed(
                format!("stream id mismatch for {} frame", frame_type.name()).into(),
            ));
        }
    }
    Ok(out)
}

fn put_size(out: &mut BytesMut, size: usize) -> Result<(), FrameError> {
    if size <= MAX_SHORT_SIZE {
        out.put_u8(size as u8);
    } else {
        let size = i32::try_from(size)
            .map_err(|_| FrameError::TooLarge { size, max: i32::MAX as usize })?;
        out.put_u8(0xFF);
        out.put_i32_le(size);
    }
    Ok(())
}

/// Decode a frame header from the front of `buf`.
///
/// Returns the header and the number of bytes it occupies, or `None` when
/// `buf` holds only part of a header.
///
/// # Errors
/// Returns a `FrameError` for unknown types, negative or oversized sizes, and
/// stream IDs that do not fit in the declared size
pub fn decode_header(
    buf: &[u8],
    max_frame_size: usize,
) -> Result<Option<(FrameHeader, usize)>, FrameError> {
    if buf.len() < 2 {
        return Ok(None);
    }
    let frame_type = FrameType::try_from(buf[0])?;

    let (size, mut pos) = if buf[1] == 0xFF {
        if buf.len() < 6 {
            return Ok(None);
        }
        let size = i32::from_le_bytes([buf[2], buf[3], buf[4], buf[5]]);
        let size = usize::try_from(size)
            .map_err(|_| FrameError::Malformed(format!("negative frame size {size}").into()))?;
        (size, 6)
    } else {
        (usize::from(buf[1]), 2)
    };
    if size > max_frame_size {
        return Err(FrameError::TooLarge {
            size,
            max: max_frame_size,
        });
    }

    if !frame_type.has_stream_id() {
        return Ok(Some((
            FrameHeader {
                frame_type,
                stream_id: None,
                payload_len: size,
            },
            pos,
        )));
    }

    if size == 0 {
        return Err(FrameError::TooSmall(size));
    }
    if buf.len() <= pos {
        return Ok(None);
    }
    let id_len = varulong_len_from_prefix(buf[pos]);
    if id_len > size {
        return Err(FrameError::TooSmall(size));
    }
    if buf.len() < pos + id_len {
        return Ok(None);
    }
    let (stream_id, used) = decode_varulong(&buf[pos..pos + id_len])?;
    pos += used;
    Ok(Some((
        FrameHeader {
            frame_type,
            stream_id: Some(stream_id),
            payload_len: size - used,
        },
        pos,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_type_conversion() {
        for byte in 1..=9u8 {
            let ty = FrameType::try_from(byte).unwrap();
            assert_eq!(ty as u8, byte);
        }
        assert_eq!(FrameType::try_from(0), Err(FrameError::InvalidFrameType(0)));
        assert_eq!(FrameType::try_from(10), Err(FrameError::InvalidFrameType(10)));
    }

    #[test]
    fn test_stream_frame_size_includes_stream_id() {
        // stream id 4 encodes as one byte (4 << 2)
        let header = encode_header(FrameType::Stream, Some(4), 100).unwrap();
        assert_eq!(&header[..], &[0x06, 101, 0x10]);

        let (decoded, used) = decode_header(&header, 1024).unwrap().unwrap();
        assert_eq!(used, 3);
        assert_eq!(decoded.frame_type, FrameType::Stream);
        assert_eq!(decoded.stream_id, Some(4));
        assert_eq!(decoded.payload_len, 100);
    }

    #[test]
    fn test_long_size_form() {
        let header = encode_header(FrameType::StreamLast, Some(1000), 300).unwrap();
        // 1000 needs a 2-byte varulong
        assert_eq!(header[1], 0xFF);
        assert_eq!(i32::from_le_bytes([header[2], header[3], header[4], header[5]]), 302);
        assert_eq!(header.len(), 8);

        let (decoded, used) = decode_header(&header, 1024).unwrap().unwrap();
        assert_eq!(used, 8);
        assert_eq!(decoded.stream_id, Some(1000));
        assert_eq!(decoded.payload_len, 300);
    }

    #[test]
    fn test_non_stream_frames_have_no_id() {
        let header = encode_header(FrameType::Ping, None, 0).unwrap();
        assert_eq!(&header[..], &[0x04, 0x00]);
        let (decoded, used) = decode_header(&header, 16).unwrap().unwrap();
        assert_eq!(used, 2);
        assert_eq!(decoded.stream_id, None);

        assert!(encode_header(FrameType::Ping, Some(1), 0).is_err());
        assert!(encode_header(FrameType::Stream, None, 1).is_err());
    }

    #[test]
    fn test_partial_headers_need_more() {
        let header = encode_header(FrameType::Stream, Some(1000), 300).unwrap();
        for cut in 0..header.len() {
            assert!(decode_header(&header[..cut], 1024).unwrap().is_none(), "cut {cut}");
        }
    }

    #[test]
    fn test_oversized_and_invalid_frames() {
        let header = encode_header(FrameType::Stream, Some(0), 2000).unwrap();
        assert!(matches!(
            decode_header(&header, 1024),
            Err(FrameError::TooLarge { size: 2001, max: 1024 })
        ));
        assert!(matches!(
            decode_header(&[0x06, 0x00], 1024),
            Err(FrameError::TooSmall(0))
        ));
        // 8-byte stream id prefix in a 2-byte frame
        assert!(matches!(
            decode_header(&[0x06, 0x02, 0x03], 1024),
            Err(FrameError::TooSmall(2))
        ));
        assert!(matches!(
            decode_header(&[0x06, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF], 1024),
            Err(FrameError::Malformed(_))
        ));
        assert!(matches!(
            decode_header(&[0x2A, 0x00], 1024),
            Err(FrameError::InvalidFrameType(0x2A))
        ));
    }
}

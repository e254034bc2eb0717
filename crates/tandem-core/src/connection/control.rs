//! Control stream messages.
//!
//! ```text
//! kind (byte) | body size (size) | body
//! ```
//!
//! Each side opens one unidirectional control stream right after the Slic
//! handshake and sends `Initialize` on it. The stream stays open for the life
//! of the connection and later carries the side's single `GoAway`.

use bytes::{Buf, Bytes, BytesMut};
use tandem_codec::{CodecError, EncodingVersion, InputStream, OutputStream};

use crate::error::{FrameError, Result};
use crate::mux::SlicStream;

const KIND_INITIALIZE: u8 = 0;
const KIND_GO_AWAY: u8 = 1;

/// GoAway contents
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GoAway {
    /// Highest bidirectional stream ID of ours the sender still honors
    pub last_bidirectional: Option<u64>,
    /// Highest unidirectional stream ID of ours the sender still honors
    pub last_unidirectional: Option<u64>,
    /// Close message
    pub message: String,
}

impl GoAway {
    /// Whether the sender honors the stream with `id`
    #[must_use]
    pub fn honors(&self, id: u64) -> bool {
        let last = if crate::mux::is_bidirectional(id) {
            self.last_bidirectional
        } else {
            self.last_unidirectional
        };
        last.is_some_and(|last| id <= last)
    }
}

/// Message carried on a control stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// First message on every control stream
    Initialize,
    /// The sender is closing the connection
    GoAway(GoAway),
}

fn write_optional_id(out: &mut OutputStream, id: Option<u64>) -> std::result::Result<(), CodecError> {
    match id {
        Some(id) => {
            out.write_bool(true);
            out.write_varulong(id)
        }
        None => {
            out.write_bool(false);
            Ok(())
        }
    }
}

fn read_optional_id(input: &mut InputStream<'_>) -> std::result::Result<Option<u64>, CodecError> {
    if input.read_bool()? {
        input.read_varulong().map(Some)
    } else {
        Ok(None)
    }
}

impl ControlMessage {
    /// Encode the message.
    ///
    /// # Errors
    /// Returns a `CodecError` for stream IDs beyond the varulong range
    pub fn encode(&self) -> std::result::Result<Bytes, CodecError> {
        let mut body = OutputStream::new(EncodingVersion::V1_1);
        let kind = match self {
            Self::Initialize => KIND_INITIALIZE,
            Self::GoAway(go_away) => {
                write_optional_id(&mut body, go_away.last_bidirectional)?;
                write_optional_id(&mut body, go_away.last_unidirectional)?;
                body.write_string(&go_away.message);
                KIND_GO_AWAY
            }
        };
        let mut out = OutputStream::new(EncodingVersion::V1_1);
        out.write_u8(kind);
        out.write_size(body.len());
        out.write_raw(body.as_slice());
        out.finish()
    }

    /// Decode one message from the front of `buf`, consuming it. Returns
    /// `None` while the message is incomplete.
    ///
    /// # Errors
    /// Returns `FrameError::Malformed` for unknown kinds or bodies that do not
    /// match their declared size
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>> {
        let mut input = InputStream::new(&buf[..], EncodingVersion::V1_1);
        let header = input.read_u8().and_then(|kind| Ok((kind, input.read_size()?)));
        let (kind, size) = match header {
            Ok(header) => header,
            Err(CodecError::UnexpectedEnd { .. }) => return Ok(None),
            Err(e) => return Err(FrameError::from(e).into()),
        };
        let start = input.position();
        if input.remaining() < size {
            return Ok(None);
        }
        let mut body = InputStream::new(&buf[start..start + size], EncodingVersion::V1_1);
        let message = match kind {
            KIND_INITIALIZE => Self::Initialize,
            KIND_GO_AWAY => Self::GoAway(GoAway {
                last_bidirectional: read_optional_id(&mut body).map_err(FrameError::from)?,
                last_unidirectional: read_optional_id(&mut body).map_err(FrameError::from)?,
                message: body.read_string().map_err(FrameError::from)?,
            }),
            other => {
                return Err(FrameError::Malformed(format!("unknown control message {other}").into()).into());
            }
        };
        if !body.is_empty() {
            return Err(FrameError::Malformed("trailing bytes in control message".into()).into());
        }
        buf.advance(start + size);
        Ok(Some(message))
    }
}

/// Reads messages from the peer's control stream
#[derive(Debug)]
pub(crate) struct ControlReader {
    stream: SlicStream,
    buf: BytesMut,
}

impl ControlReader {
    pub(crate) fn new(stream: SlicStream) -> Self {
        Self {
            stream,
            buf: BytesMut::new(),
        }
    }

    /// Next message; `None` if the peer ended its control stream
    pub(crate) async fn next(&mut self) -> Result<Option<ControlMessage>> {
        loop {
            if let Some(message) = ControlMessage::decode(&mut self.buf)? {
                return Ok(Some(message));
            }
            match self.stream.receive().await? {
                Some(data) => self.buf.extend_from_slice(&data),
                None if self.buf.is_empty() => return Ok(None),
                None => {
                    return Err(FrameError::Malformed("truncated control message".into()).into());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initialize_encoding() {
        let encoded = ControlMessage::Initialize.encode().unwrap();
        assert_eq!(&encoded[..], &[0, 0]);
        let mut buf = BytesMut::from(&encoded[..]);
        assert_eq!(ControlMessage::decode(&mut buf).unwrap(), Some(ControlMessage::Initialize));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_go_away_decoded_incrementally() {
        let go_away = ControlMessage::GoAway(GoAway {
            last_bidirectional: Some(8),
            last_unidirectional: None,
            message: "shutting down".to_string(),
        });
        let mut encoded = ControlMessage::Initialize.encode().unwrap().to_vec();
        encoded.extend_from_slice(&go_away.encode().unwrap());

        let mut buf = BytesMut::new();
        let mut decoded = Vec::new();
        for byte in encoded {
            buf.extend_from_slice(&[byte]);
            if let Some(message) = ControlMessage::decode(&mut buf).unwrap() {
                decoded.push(message);
            }
        }
        assert_eq!(decoded, vec![ControlMessage::Initialize, go_away]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_go_away_honors() {
        let go_away = GoAway {
            last_bidirectional: Some(8),
            last_unidirectional: None,
            message: String::new(),
        };
        assert!(go_away.honors(0));
        assert!(go_away.honors(8));
        assert!(!go_away.honors(12));
        assert!(!go_away.honors(6));
    }

    #[test]
    fn test_malformed_control_messages() {
        let mut buf = BytesMut::from(&[9u8, 0][..]);
        assert!(ControlMessage::decode(&mut buf).is_err());

        let mut buf = BytesMut::from(&[0u8, 1, 0][..]);
        assert!(ControlMessage::decode(&mut buf).is_err());
    }
}

//! Buffered frame reader.
//!
//! Headers are decoded from whatever the transport has delivered so far; when
//! the buffered bytes hold only part of a header the reader fetches more and
//! decodes again, so a short stream ID never consumes bytes of the payload.

use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use tandem_transport::Transport;

use crate::error::{FrameError, Result};
use crate::slic::frame::{FrameHeader, decode_header};

const READ_CHUNK: usize = 16 * 1024;

/// Reads Slic frames from a transport
pub struct FrameReader {
    transport: Arc<dyn Transport>,
    buf: BytesMut,
    max_frame_size: usize,
}

impl FrameReader {
    /// Create a reader
    pub fn new(transport: Arc<dyn Transport>, max_frame_size: usize) -> Self {
        Self {
            transport,
            buf: BytesMut::with_capacity(READ_CHUNK),
            max_frame_size,
        }
    }

    /// Bytes read from the transport but not yet consumed
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Read until at least `need` bytes are buffered. Returns false on
    /// end-of-stream.
    async fn fill(&mut self, need: usize) -> Result<bool> {
        while self.buf.len() < need {
            let start = self.buf.len();
            let want = (need - start).max(READ_CHUNK);
            self.buf.resize(start + want, 0);
            let result = self.transport.receive(&mut self.buf[start..]).await;
            let n = match result {
                Ok(n) => n,
                Err(e) => {
                    self.buf.truncate(start);
                    return Err(e.into());
                }
            };
            self.buf.truncate(start + n);
            if n == 0 {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Read the next frame header.
    ///
    /// Returns `None` when the peer closed the transport between frames.
    ///
    /// # Errors
    /// Returns `FrameError` on malformed headers or end-of-stream inside a
    /// header, and transport errors as they occur
    pub async fn read_header(&mut self) -> Result<Option<FrameHeader>> {
        loop {
            if let Some((header, used)) = decode_header(&self.buf, self.max_frame_size)? {
                self.buf.advance(used);
                return Ok(Some(header));
            }
            let need = self.buf.len() + 1;
            if !self.fill(need).await? {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(FrameError::UnexpectedEof.into());
            }
        }
    }

    /// Read a payload of `len` bytes.
    ///
    /// # Errors
    /// Returns `FrameError::UnexpectedEof` if the transport closes first
    pub async fn read_payload(&mut self, len: usize) -> Result<Bytes> {
        if !self.fill(len).await? {
            return Err(FrameError::UnexpectedEof.into());
        }
        Ok(self.buf.split_to(len).freeze())
    }

    /// Discard a payload of `len` bytes.
    ///
    /// # Errors
    /// Returns `FrameError::UnexpectedEof` if the transport closes first
    pub async fn skip(&mut self, len: usize) -> Result<()> {
        let mut left = len;
        while left > 0 {
            if self.buf.is_empty() && !self.fill(1).await? {
                return Err(FrameError::UnexpectedEof.into());
            }
            let n = left.min(self.buf.len());
            self.buf.advance(n);
            left -= n;
        }
        Ok(())
    }
}

//! WebSocket data framing (RFC 6455) over another transport.
//!
//! Only the framing layer is implemented: the HTTP upgrade is expected to have
//! completed before [`WebSocketTransport::new`] is called. Every `send` becomes
//! one binary frame; `receive` yields the payload bytes of binary and
//! continuation frames, answers pings, and reports a close frame as
//! end-of-stream.

use crate::transport::{
    StatsRecorder, Transport, TransportError, TransportInfo, TransportKind, TransportResult,
    TransportStats, WebSocketInfo,
};
use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, trace};

const FIN: u8 = 0x80;
const RSV_MASK: u8 = 0x70;
const OPCODE_MASK: u8 = 0x0F;
const MASK_BIT: u8 = 0x80;

const OP_CONTINUATION: u8 = 0x0;
const OP_TEXT: u8 = 0x1;
const OP_BINARY: u8 = 0x2;
const OP_CLOSE: u8 = 0x8;
const OP_PING: u8 = 0x9;
const OP_PONG: u8 = 0xA;

const MAX_CONTROL_PAYLOAD: u64 = 125;
const CLOSE_NORMAL: u16 = 1000;
const READ_CHUNK: usize = 16 * 1024;

/// Which end of the WebSocket this is; clients mask, servers do not
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Initiated the upgrade
    Client,
    /// Accepted the upgrade
    Server,
}

/// Decoded frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Final fragment flag
    pub fin: bool,
    /// Frame opcode
    pub opcode: u8,
    /// Payload length
    pub len: u64,
    /// Masking key, when the frame is masked
    pub mask: Option<[u8; 4]>,
}

/// Encode a frame header.
#[must_use]
pub fn encode_header(opcode: u8, len: u64, mask: Option<[u8; 4]>) -> BytesMut {
    let mut out = BytesMut::with_capacity(14);
    out.put_u8(FIN | opcode);
    let mask_bit = if mask.is_some() { MASK_BIT } else { 0 };
    if len < 126 {
        out.put_u8(mask_bit | len as u8);
    } else if len <= u64::from(u16::MAX) {
        out.put_u8(mask_bit | 126);
        out.put_u16(len as u16);
    } else {
        out.put_u8(mask_bit | 127);
        out.put_u64(len);
    }
    if let Some(key) = mask {
        out.put_slice(&key);
    }
    out
}

/// Decode a frame header from the front of `buf`.
///
/// Returns the header and its encoded length, or `None` if more bytes are
/// needed.
///
/// # Errors
/// Returns `TransportError::InvalidFrame` if reserved bits are set or the
/// length is not minimally encoded
pub fn decode_header(buf: &[u8]) -> TransportResult<Option<(FrameHeader, usize)>> {
    if buf.len() < 2 {
        return Ok(None);
    }
    let b0 = buf[0];
    let b1 = buf[1];
    if b0 & RSV_MASK != 0 {
        return Err(TransportError::InvalidFrame("reserved bits set".to_string()));
    }
    let masked = b1 & MASK_BIT != 0;
    let (len, mut used) = match b1 & !MASK_BIT {
        126 => {
            if buf.len() < 4 {
                return Ok(None);
            }
            let len = u64::from(u16::from_be_bytes([buf[2], buf[3]]));
            if len < 126 {
                return Err(TransportError::InvalidFrame("non-minimal length".to_string()));
            }
            (len, 4)
        }
        127 => {
            if buf.len() < 10 {
                return Ok(None);
            }
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&buf[2..10]);
            let len = u64::from_be_bytes(raw);
            if len <= u64::from(u16::MAX) || len >> 63 != 0 {
                return Err(TransportError::InvalidFrame("non-minimal length".to_string()));
            }
            (len, 10)
        }
        short => (u64::from(short), 2),
    };
    let mask = if masked {
        if buf.len() < used + 4 {
            return Ok(None);
        }
        let mut key = [0u8; 4];
        key.copy_from_slice(&buf[used..used + 4]);
        used += 4;
        Some(key)
    } else {
        None
    };
    Ok(Some((
        FrameHeader {
            fin: b0 & FIN != 0,
            opcode: b0 & OPCODE_MASK,
            len,
            mask,
        },
        used,
    )))
}

/// XOR `data` with `key`, starting `offset` bytes into the payload
pub fn apply_mask(data: &mut [u8], key: [u8; 4], offset: usize) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= key[(offset + i) % 4];
    }
}

#[derive(Debug, Default)]
struct ReadState {
    buffered: BytesMut,
    remaining: u64,
    mask: Option<[u8; 4]>,
    mask_offset: usize,
    closed: bool,
}

/// WebSocket framing over an inner transport
pub struct WebSocketTransport<T> {
    inner: T,
    role: Role,
    info: TransportInfo,
    read: Mutex<ReadState>,
    close_sent: AtomicBool,
    stats: StatsRecorder,
}

impl<T: Transport> WebSocketTransport<T> {
    /// Wrap an upgraded transport
    pub fn new(inner: T, role: Role, ws: WebSocketInfo) -> Self {
        let inner_info = inner.info();
        let mut info = TransportInfo::new(TransportKind::WebSocket)
            .with_addrs(inner_info.local_addr, inner_info.remote_addr);
        info.is_secure = inner_info.is_secure;
        info.extensions.insert(ws);
        Self {
            inner,
            role,
            info,
            read: Mutex::new(ReadState::default()),
            close_sent: AtomicBool::new(false),
            stats: StatsRecorder::default(),
        }
    }

    /// Role of this end
    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// The wrapped transport
    #[must_use]
    pub fn inner(&self) -> &T {
        &self.inner
    }

    async fn send_frame(&self, opcode: u8, bufs: &[&[u8]]) -> TransportResult<()> {
        let len: usize = bufs.iter().map(|b| b.len()).sum();
        match self.role {
            Role::Client => {
                let key: [u8; 4] = rand::random();
                let mut frame = encode_header(opcode, len as u64, Some(key));
                let header_len = frame.len();
                frame.reserve(len);
                for buf in bufs {
                    frame.put_slice(buf);
                }
                apply_mask(&mut frame[header_len..], key, 0);
                self.inner.send(&[&frame[..]]).await
            }
            Role::Server => {
                let header = encode_header(opcode, len as u64, None);
                let mut parts: Vec<&[u8]> = Vec::with_capacity(bufs.len() + 1);
                parts.push(&header[..]);
                parts.extend_from_slice(bufs);
                self.inner.send(&parts).await
            }
        }
    }

    /// Read from the inner transport until `need` bytes are buffered; false
    /// on end-of-stream
    async fn fill(&self, state: &mut ReadState, need: usize) -> TransportResult<bool> {
        while state.buffered.len() < need {
            let start = state.buffered.len();
            state.buffered.resize(start + READ_CHUNK, 0);
            let result = self.inner.receive(&mut state.buffered[start..]).await;
            let n = match result {
                Ok(n) => n,
                Err(e) => {
                    state.buffered.truncate(start);
                    return Err(e);
                }
            };
            state.buffered.truncate(start + n);
            if n == 0 {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn check_header(&self, header: &FrameHeader) -> TransportResult<()> {
        match (self.role, header.mask.is_some()) {
            (Role::Server, false) => {
                return Err(TransportError::InvalidFrame("unmasked client frame".to_string()));
            }
            (Role::Client, true) => {
                return Err(TransportError::InvalidFrame("masked server frame".to_string()));
            }
            _ => {}
        }
        if header.opcode & 0x8 != 0 && (!header.fin || header.len > MAX_CONTROL_PAYLOAD) {
            return Err(TransportError::InvalidFrame(format!(
                "invalid control frame {:#x}",
                header.opcode
            )));
        }
        Ok(())
    }

    async fn read_header(&self, state: &mut ReadState) -> TransportResult<Option<FrameHeader>> {
        loop {
            if let Some((header, used)) = decode_header(&state.buffered)? {
                state.buffered.advance(used);
                return Ok(Some(header));
            }
            let need = state.buffered.len() + 1;
            if !self.fill(state, need).await? {
                if state.buffered.is_empty() {
                    return Ok(None);
                }
                return Err(TransportError::InvalidFrame("truncated frame header".to_string()));
            }
        }
    }

    async fn send_close(&self, code: u16) {
        if self.close_sent.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.send_frame(OP_CLOSE, &[&code.to_be_bytes()[..]]).await {
            debug!(error = %e, "failed to send websocket close frame");
        }
    }
}

#[async_trait]
impl<T: Transport> Transport for WebSocketTransport<T> {
    async fn send(&self, bufs: &[&[u8]]) -> TransportResult<()> {
        if self.close_sent.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let len: usize = bufs.iter().map(|b| b.len()).sum();
        match self.send_frame(OP_BINARY, bufs).await {
            Ok(()) => {
                self.stats.record_send(len);
                Ok(())
            }
            Err(e) => {
                self.stats.record_send_error();
                Err(e)
            }
        }
    }

    async fn receive(&self, buf: &mut [u8]) -> TransportResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut state = self.read.lock().await;
        loop {
            if state.closed {
                return Ok(0);
            }

            if state.remaining > 0 {
                if state.buffered.is_empty() && !self.fill(&mut state, 1).await? {
                    self.stats.record_recv_error();
                    return Err(TransportError::InvalidFrame("truncated frame payload".to_string()));
                }
                let n = buf
                    .len()
                    .min(state.buffered.len())
                    .min(usize::try_from(state.remaining).unwrap_or(usize::MAX));
                buf[..n].copy_from_slice(&state.buffered[..n]);
                state.buffered.advance(n);
                if let Some(key) = state.mask {
                    apply_mask(&mut buf[..n], key, state.mask_offset);
                    state.mask_offset += n;
                }
                state.remaining -= n as u64;
                self.stats.record_recv(n);
                return Ok(n);
            }

            let Some(header) = self.read_header(&mut state).await? else {
                // peer went away without a close frame
                state.closed = true;
                return Ok(0);
            };
            if let Err(e) = self.check_header(&header) {
                self.stats.record_recv_error();
                return Err(e);
            }

            match header.opcode {
                OP_BINARY | OP_CONTINUATION => {
                    state.remaining = header.len;
                    state.mask = header.mask;
                    state.mask_offset = 0;
                }
                OP_PING | OP_PONG | OP_CLOSE => {
                    let len = header.len as usize;
                    if !self.fill(&mut state, len).await? {
                        return Err(TransportError::InvalidFrame(
                            "truncated control frame".to_string(),
                        ));
                    }
                    let mut payload = state.buffered.split_to(len);
                    if let Some(key) = header.mask {
                        apply_mask(&mut payload, key, 0);
                    }
                    match header.opcode {
                        OP_PING => {
                            trace!(len, "websocket ping");
                            if !self.close_sent.load(Ordering::Acquire) {
                                self.send_frame(OP_PONG, &[&payload[..]]).await?;
                            }
                        }
                        OP_PONG => trace!(len, "websocket pong"),
                        _ => {
                            let code = if payload.len() >= 2 {
                                u16::from_be_bytes([payload[0], payload[1]])
                            } else {
                                CLOSE_NORMAL
                            };
                            debug!(code, "websocket close frame received");
                            self.send_close(code).await;
                            state.closed = true;
                        }
                    }
                }
                OP_TEXT => {
                    self.stats.record_recv_error();
                    return Err(TransportError::InvalidFrame("text frames are not supported".to_string()));
                }
                op => {
                    self.stats.record_recv_error();
                    return Err(TransportError::InvalidFrame(format!("unknown opcode {op:#x}")));
                }
            }
        }
    }

    async fn shutdown(&self) -> TransportResult<()> {
        self.send_close(CLOSE_NORMAL).await;
        self.inner.shutdown().await
    }

    fn info(&self) -> &TransportInfo {
        &self.info
    }

    fn stats(&self) -> TransportStats {
        self.stats.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{DEFAULT_MEMORY_BUFFER, MemoryTransport, memory_pair};

    fn ws_info() -> WebSocketInfo {
        WebSocketInfo {
            resource: "/tandem".to_string(),
            protocol: None,
        }
    }

    fn ws_pair() -> (WebSocketTransport<MemoryTransport>, WebSocketTransport<MemoryTransport>) {
        let (a, b) = memory_pair(DEFAULT_MEMORY_BUFFER);
        (
            WebSocketTransport::new(a, Role::Client, ws_info()),
            WebSocketTransport::new(b, Role::Server, ws_info()),
        )
    }

    async fn read_exact(transport: &impl Transport, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            let n = transport.receive(&mut out[filled..]).await.unwrap();
            assert_ne!(n, 0, "unexpected end of stream");
            filled += n;
        }
        out
    }

    #[test]
    fn test_header_length_forms() {
        assert_eq!(&encode_header(OP_BINARY, 5, None)[..], &[0x82, 5]);
        assert_eq!(&encode_header(OP_BINARY, 300, None)[..], &[0x82, 126, 0x01, 0x2C]);
        let long = encode_header(OP_BINARY, 70_000, Some([1, 2, 3, 4]));
        assert_eq!(long[1], MASK_BIT | 127);
        assert_eq!(long.len(), 14);

        let (header, used) = decode_header(&long).unwrap().unwrap();
        assert_eq!(used, 14);
        assert_eq!(header.len, 70_000);
        assert_eq!(header.mask, Some([1, 2, 3, 4]));
        assert!(header.fin);
        assert!(decode_header(&long[..9]).unwrap().is_none());
    }

    #[test]
    fn test_decode_rejects_non_minimal_and_reserved() {
        assert!(decode_header(&[0x82, 126, 0, 10]).is_err());
        assert!(decode_header(&[0xC2, 1]).is_err());
    }

    #[test]
    fn test_mask_with_offset() {
        let key = [0xA, 0xB, 0xC, 0xD];
        let mut whole = *b"abcdefgh";
        apply_mask(&mut whole, key, 0);

        let mut split = *b"abcdefgh";
        apply_mask(&mut split[..3], key, 0);
        apply_mask(&mut split[3..], key, 3);
        assert_eq!(whole, split);
    }

    #[tokio::test]
    async fn test_client_server_exchange() {
        let (client, server) = ws_pair();
        client.send(&[b"hello ", b"server"]).await.unwrap();
        assert_eq!(read_exact(&server, 12).await, b"hello server");

        // Larger than the memory pipe; the reader has to drain concurrently
        let big = vec![7u8; 70_000];
        let bufs = [&big[..]];
        let (sent, received) = tokio::join!(server.send(&bufs), read_exact(&client, big.len()));
        sent.unwrap();
        assert_eq!(received, big);

        assert_eq!(client.info().kind, TransportKind::WebSocket);
        assert_eq!(
            client.info().extensions.get::<WebSocketInfo>().map(|i| i.resource.as_str()),
            Some("/tandem")
        );
    }

    #[tokio::test]
    async fn test_client_frames_are_masked() {
        let (a, b) = memory_pair(DEFAULT_MEMORY_BUFFER);
        let client = WebSocketTransport::new(a, Role::Client, ws_info());
        client.send(&[b"abc"]).await.unwrap();

        let raw = read_exact(&b, 9).await;
        assert_eq!(raw[0], 0x82);
        assert_eq!(raw[1], MASK_BIT | 3);
        let mut payload = raw[6..].to_vec();
        apply_mask(&mut payload, [raw[2], raw[3], raw[4], raw[5]], 0);
        assert_eq!(payload, b"abc");
    }

    #[tokio::test]
    async fn test_ping_is_answered() {
        let (a, b) = memory_pair(DEFAULT_MEMORY_BUFFER);
        let server = WebSocketTransport::new(b, Role::Server, ws_info());

        let key = [9, 8, 7, 6];
        let mut ping = encode_header(OP_PING, 2, Some(key));
        let mut body = *b"hi";
        apply_mask(&mut body, key, 0);
        ping.put_slice(&body);
        let mut data = encode_header(OP_BINARY, 1, Some(key));
        let mut x = *b"x";
        apply_mask(&mut x, key, 0);
        data.put_slice(&x);
        a.send(&[&ping[..], &data[..]]).await.unwrap();

        assert_eq!(read_exact(&server, 1).await, b"x");
        assert_eq!(read_exact(&a, 4).await, vec![0x8A, 2, b'h', b'i']);
    }

    #[tokio::test]
    async fn test_close_frame_is_eof() {
        let (client, server) = ws_pair();
        client.send(&[b"last"]).await.unwrap();
        client.shutdown().await.unwrap();

        assert_eq!(read_exact(&server, 4).await, b"last");
        let mut buf = [0u8; 16];
        assert_eq!(server.receive(&mut buf).await.unwrap(), 0);
        assert!(matches!(client.send(&[b"x"]).await, Err(TransportError::Closed)));
        assert!(matches!(server.send(&[b"x"]).await, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn test_server_rejects_unmasked_frame() {
        let (a, b) = memory_pair(DEFAULT_MEMORY_BUFFER);
        let server = WebSocketTransport::new(b, Role::Server, ws_info());
        a.send(&[&[0x82u8, 1, b'x'][..]]).await.unwrap();

        let mut buf = [0u8; 4];
        let err = server.receive(&mut buf).await.unwrap_err();
        assert!(matches!(err, TransportError::InvalidFrame(_)));
    }

    proptest::proptest! {
        #[test]
        fn prop_header_roundtrip(len in 0u64..(1 << 40), masked in proptest::prelude::any::<bool>()) {
            let mask = masked.then_some([9, 8, 7, 6]);
            let encoded = encode_header(OP_BINARY, len, mask);
            let (header, used) = decode_header(&encoded).unwrap().unwrap();
            proptest::prop_assert_eq!(used, encoded.len());
            proptest::prop_assert_eq!(header.len, len);
            proptest::prop_assert_eq!(header.mask, mask);
        }

        #[test]
        fn prop_mask_is_involution(data in proptest::collection::vec(proptest::prelude::any::<u8>(), 0..64), offset in 0usize..8) {
            let key = [0x12, 0x34, 0x56, 0x78];
            let mut masked = data.clone();
            apply_mask(&mut masked, key, offset);
            apply_mask(&mut masked, key, offset);
            proptest::prop_assert_eq!(masked, data);
        }
    }
}

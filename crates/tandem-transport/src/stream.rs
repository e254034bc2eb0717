//! Transports over tokio byte streams.
//!
//! [`StreamTransport`] adapts anything implementing `AsyncRead + AsyncWrite`.
//! TCP and the in-memory duplex pipe used by tests are both built on it.

use crate::transport::{
    StatsRecorder, Transport, TransportError, TransportInfo, TransportKind, TransportResult,
    TransportStats,
};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tracing::debug;

/// Default buffer size of each direction of a [`memory_pair`]
pub const DEFAULT_MEMORY_BUFFER: usize = 64 * 1024;

/// Transport over a tokio byte stream.
///
/// The read and write halves sit behind independent locks, so a pending
/// `receive` never blocks a `send`.
pub struct StreamTransport<S> {
    reader: Mutex<ReadHalf<S>>,
    writer: Mutex<WriteHalf<S>>,
    info: TransportInfo,
    shut_down: AtomicBool,
    stats: StatsRecorder,
}

impl<S> StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Wrap a stream
    pub fn new(stream: S, info: TransportInfo) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            info,
            shut_down: AtomicBool::new(false),
            stats: StatsRecorder::default(),
        }
    }
}

#[async_trait]
impl<S> Transport for StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn send(&self, bufs: &[&[u8]]) -> TransportResult<()> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }

        let mut writer = self.writer.lock().await;
        let mut total = 0;
        for buf in bufs {
            if let Err(e) = writer.write_all(buf).await {
                self.stats.record_send_error();
                return Err(TransportError::Io(e));
            }
            total += buf.len();
        }
        if let Err(e) = writer.flush().await {
            self.stats.record_send_error();
            return Err(TransportError::Io(e));
        }
        self.stats.record_send(total);
        Ok(())
    }

    async fn receive(&self, buf: &mut [u8]) -> TransportResult<usize> {
        let mut reader = self.reader.lock().await;
        match reader.read(buf).await {
            Ok(n) => {
                self.stats.record_recv(n);
                Ok(n)
            }
            Err(e) => {
                self.stats.record_recv_error();
                Err(TransportError::Io(e))
            }
        }
    }

    async fn shutdown(&self) -> TransportResult<()> {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        debug!(transport = %self.info.description(), "shutting down transport");
        let mut writer = self.writer.lock().await;
        match writer.shutdown().await {
            Ok(()) => Ok(()),
            // the peer may already be gone
            Err(e) if e.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(TransportError::Io(e)),
        }
    }

    fn info(&self) -> &TransportInfo {
        &self.info
    }

    fn stats(&self) -> TransportStats {
        self.stats.snapshot()
    }
}

/// TCP transport
pub type TcpTransport = StreamTransport<TcpStream>;

impl StreamTransport<TcpStream> {
    /// Connect to a remote address.
    ///
    /// # Errors
    /// Returns `TransportError::ConnectionFailed` if the connection cannot be
    /// established
    pub async fn connect(addr: SocketAddr) -> TransportResult<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| TransportError::ConnectionFailed(format!("{addr}: {e}")))?;
        Self::from_tcp(stream)
    }

    /// Wrap an already-connected TCP stream.
    ///
    /// # Errors
    /// Returns `TransportError::Io` if socket options cannot be set
    pub fn from_tcp(stream: TcpStream) -> TransportResult<Self> {
        stream.set_nodelay(true)?;
        let info = TransportInfo::new(TransportKind::Tcp)
            .with_addrs(stream.local_addr().ok(), stream.peer_addr().ok());
        debug!(transport = %info.description(), "tcp transport established");
        Ok(Self::new(stream, info))
    }
}

/// Listening TCP socket producing [`TcpTransport`]s
#[derive(Debug)]
pub struct TcpAcceptor {
    listener: TcpListener,
}

impl TcpAcceptor {
    /// Bind to the given address. Use port 0 for automatic port selection.
    ///
    /// # Errors
    /// Returns `TransportError::BindFailed` if binding fails
    pub async fn bind(addr: SocketAddr) -> TransportResult<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| TransportError::BindFailed(format!("{addr}: {e}")))?;
        Ok(Self { listener })
    }

    /// Wait for the next incoming connection.
    ///
    /// # Errors
    /// Returns `TransportError::Io` if accepting fails
    pub async fn accept(&self) -> TransportResult<TcpTransport> {
        let (stream, _) = self.listener.accept().await?;
        TcpTransport::from_tcp(stream)
    }

    /// The bound local address.
    ///
    /// # Errors
    /// Returns `TransportError::Io` if the address cannot be determined
    pub fn local_addr(&self) -> TransportResult<SocketAddr> {
        self.listener.local_addr().map_err(TransportError::Io)
    }
}

/// In-memory transport
pub type MemoryTransport = StreamTransport<DuplexStream>;

/// Create two connected in-memory transports.
///
/// Each direction buffers up to `max_buf_size` bytes before `send` waits for
/// the peer to read.
#[must_use]
pub fn memory_pair(max_buf_size: usize) -> (MemoryTransport, MemoryTransport) {
    let (a, b) = tokio::io::duplex(max_buf_size);
    (
        StreamTransport::new(a, TransportInfo::new(TransportKind::Memory)),
        StreamTransport::new(b, TransportInfo::new(TransportKind::Memory)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

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

    #[tokio::test]
    async fn test_memory_pair_send_receive() {
        let (a, b) = memory_pair(DEFAULT_MEMORY_BUFFER);
        a.send(&[b"hello ", b"world"]).await.unwrap();
        assert_eq!(read_exact(&b, 11).await, b"hello world");

        let stats = a.stats();
        assert_eq!(stats.bytes_sent, 11);
        assert_eq!(stats.frames_sent, 1);
        assert_eq!(a.info().kind, TransportKind::Memory);
    }

    #[tokio::test]
    async fn test_shutdown_gives_eof_and_blocks_send() {
        let (a, b) = memory_pair(DEFAULT_MEMORY_BUFFER);
        a.send(&[b"bye"]).await.unwrap();
        a.shutdown().await.unwrap();
        a.shutdown().await.unwrap();

        assert_eq!(read_exact(&b, 3).await, b"bye");
        let mut buf = [0u8; 8];
        assert_eq!(b.receive(&mut buf).await.unwrap(), 0);
        assert!(matches!(a.send(&[b"x"]).await, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn test_receive_does_not_block_send() {
        let (a, b) = memory_pair(DEFAULT_MEMORY_BUFFER);
        let a = std::sync::Arc::new(a);
        let reader = {
            let a = a.clone();
            tokio::spawn(async move { read_exact(&*a, 4).await })
        };
        tokio::task::yield_now().await;

        a.send(&[b"ping"]).await.unwrap();
        assert_eq!(read_exact(&b, 4).await, b"ping");
        b.send(&[b"pong"]).await.unwrap();
        assert_eq!(reader.await.unwrap(), b"pong");
    }

    #[tokio::test]
    async fn test_tcp_connect_accept() {
        let acceptor = TcpAcceptor::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = acceptor.local_addr().unwrap();
        assert_ne!(addr.port(), 0);

        let (client, server) = tokio::join!(TcpTransport::connect(addr), acceptor.accept());
        let client = client.unwrap();
        let server = server.unwrap();

        assert_eq!(client.info().kind, TransportKind::Tcp);
        assert_eq!(client.info().remote_addr, Some(addr));
        assert_eq!(server.info().local_addr, Some(addr));

        client.send(&[b"Hello, tandem!"]).await.unwrap();
        let received = timeout(Duration::from_secs(1), read_exact(&server, 14))
            .await
            .expect("Timeout");
        assert_eq!(received, b"Hello, tandem!");
    }

    #[tokio::test]
    async fn test_tcp_connect_refused() {
        // bind then drop to get a port nobody listens on
        let acceptor = TcpAcceptor::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = acceptor.local_addr().unwrap();
        drop(acceptor);

        let err = TcpTransport::connect(addr).await.err().unwrap();
        assert!(matches!(err, TransportError::ConnectionFailed(_)));
    }
}

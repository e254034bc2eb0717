//! Stream handles.

use std::fmt;
use std::sync::{Arc, Mutex, OnceLock};

use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;

use super::flow_control::Credit;
use super::lock;
use super::socket::SocketInner;
use crate::cancel::{CancelSignal, CancelSource};
use crate::error::{ConnectionError, Result, StreamError};
use crate::slic::RESET_CANCELED;

/// Data handed from the demultiplexer to a stream
pub(crate) struct Chunk {
    pub(crate) data: Bytes,
    pub(crate) last: bool,
}

pub(crate) struct StreamState {
    pub(crate) read_done: bool,
    pub(crate) write_done: bool,
    pub(crate) finished: bool,
    pub(crate) error: Option<StreamError>,
    pub(crate) credit: Option<Credit>,
}

/// State shared between a stream handle and the socket's stream table
pub(crate) struct StreamShared {
    pub(crate) id: OnceLock<u64>,
    pub(crate) bidirectional: bool,
    pub(crate) local: bool,
    pub(crate) control: bool,
    pub(crate) cancel: CancelSource,
    pub(crate) state: Mutex<StreamState>,
}

impl StreamShared {
    pub(crate) fn new(id: Option<u64>, bidirectional: bool, local: bool, control: bool) -> Arc<Self> {
        let cell = OnceLock::new();
        if let Some(id) = id {
            let _ = cell.set(id);
        }
        Arc::new(Self {
            id: cell,
            bidirectional,
            local,
            control,
            cancel: CancelSource::new(),
            state: Mutex::new(StreamState {
                // a unidirectional stream only ever moves data one way
                read_done: local && !bidirectional,
                write_done: !local && !bidirectional,
                finished: false,
                error: None,
                credit: None,
            }),
        })
    }

    pub(crate) fn id(&self) -> Option<u64> {
        self.id.get().copied()
    }

    pub(crate) fn error(&self) -> Option<StreamError> {
        lock(&self.state).error.clone()
    }

    fn failure(&self) -> StreamError {
        self.error().unwrap_or(StreamError::Canceled)
    }
}

/// One logical stream of a [`SlicSocket`](super::SlicSocket).
///
/// Outgoing streams get their ID with their first frame. Dropping a handle
/// before the stream completed resets it.
pub struct SlicStream {
    socket: Arc<SocketInner>,
    shared: Arc<StreamShared>,
    rx: Option<mpsc::Receiver<Chunk>>,
    pending_tx: Option<mpsc::Sender<Chunk>>,
}

impl SlicStream {
    pub(crate) fn new(
        socket: Arc<SocketInner>,
        shared: Arc<StreamShared>,
        rx: Option<mpsc::Receiver<Chunk>>,
        pending_tx: Option<mpsc::Sender<Chunk>>,
    ) -> Self {
        Self {
            socket,
            shared,
            rx,
            pending_tx,
        }
    }

    /// Stream ID, once assigned
    #[must_use]
    pub fn id(&self) -> Option<u64> {
        self.shared.id()
    }

    /// Whether the stream carries data both ways
    #[must_use]
    pub fn is_bidirectional(&self) -> bool {
        self.shared.bidirectional
    }

    /// Whether this side opened the stream
    #[must_use]
    pub fn is_local(&self) -> bool {
        self.shared.local
    }

    /// Whether this is a connection control stream
    #[must_use]
    pub fn is_control(&self) -> bool {
        self.shared.control
    }

    /// Whether the stream completed or failed
    #[must_use]
    pub fn is_finished(&self) -> bool {
        lock(&self.shared.state).finished
    }

    /// Signal fired when the stream is reset by either side or aborted with
    /// its connection
    #[must_use]
    pub fn cancel_signal(&self) -> CancelSignal {
        self.shared.cancel.signal()
    }

    /// Send `data`, split into frames no larger than the peer accepts. With
    /// `last` the final frame ends this direction of the stream.
    ///
    /// The first send of an outgoing stream waits for flow-control credit.
    ///
    /// # Errors
    /// Returns `StreamError::EmptyFirstFrame` for an empty first send,
    /// `StreamError::Finished` after the final frame, the stream's failure
    /// after a reset, and `StreamError::Aborted` when the connection goes away
    pub async fn send(&mut self, data: Bytes, last: bool) -> Result<()> {
        if let Some(error) = self.shared.error() {
            return Err(error.into());
        }
        if lock(&self.shared.state).write_done {
            return Err(StreamError::Finished.into());
        }

        if self.shared.id().is_none() {
            if data.is_empty() {
                return Err(StreamError::EmptyFirstFrame.into());
            }
            let needs_credit = !self.shared.control && lock(&self.shared.state).credit.is_none();
            if needs_credit {
                let flow = self.socket.flow(self.shared.bidirectional);
                let signal = self.shared.cancel.signal();
                let credit = tokio::select! {
                    biased;
                    () = signal.cancelled() => return Err(self.shared.failure().into()),
                    credit = flow.acquire() => credit?,
                };
                lock(&self.shared.state).credit = Some(credit);
            }
        }

        let max = self.socket.packet_max_size();
        let mut data = data;
        loop {
            let chunk = data.split_to(data.len().min(max));
            let fin = last && data.is_empty();
            self.socket
                .send_stream_frame(&self.shared, &mut self.pending_tx, chunk, fin)
                .await?;
            if data.is_empty() {
                return Ok(());
            }
        }
    }

    /// Receive the next chunk of data; `None` once the peer's final frame
    /// was consumed.
    ///
    /// # Errors
    /// Returns `StreamError::Reset` if the peer reset the stream,
    /// `StreamError::Canceled` after a local reset and
    /// `StreamError::Aborted` when the connection goes away
    pub async fn receive(&mut self) -> Result<Option<Bytes>> {
        if let Some(error) = self.shared.error() {
            return Err(error.into());
        }
        if self.shared.local && self.rx.is_some() && self.shared.id().is_none() {
            return Err(ConnectionError::InvalidState("stream has not been started".into()).into());
        }
        let Some(rx) = self.rx.as_mut() else {
            return Ok(None);
        };

        let signal = self.shared.cancel.signal();
        let received = tokio::select! {
            biased;
            () = signal.cancelled() => None,
            chunk = rx.recv() => Some(chunk),
        };
        match received {
            Some(Some(Chunk { data, last })) => {
                if last {
                    self.rx = None;
                }
                Ok(Some(data))
            }
            Some(None) => {
                self.rx = None;
                match self.shared.error() {
                    Some(error) => Err(error.into()),
                    None => Ok(None),
                }
            }
            None => Err(self.shared.failure().into()),
        }
    }

    /// Receive everything up to the peer's final frame.
    ///
    /// # Errors
    /// Returns `StreamError::TooLarge` (and resets the stream) if more than
    /// `max` bytes arrive, or any error from [`receive`](Self::receive)
    pub async fn read_to_end(&mut self, max: usize) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.receive().await? {
            if buf.len() + chunk.len() > max {
                self.reset(RESET_CANCELED);
                return Err(StreamError::TooLarge(max).into());
            }
            buf.extend_from_slice(&chunk);
        }
        Ok(buf.freeze())
    }

    /// Abort both directions of the stream and tell the peer with `code`.
    /// Control streams are closed without a frame.
    pub fn reset(&mut self, code: u64) {
        self.socket
            .fail_stream(&self.shared, StreamError::Canceled, Some(code));
    }
}

impl Drop for SlicStream {
    fn drop(&mut self) {
        if lock(&self.shared.state).finished {
            return;
        }
        let code = self.shared.id().map(|_| RESET_CANCELED);
        self.socket
            .fail_stream(&self.shared, StreamError::Canceled, code);
    }
}

impl fmt::Debug for SlicStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlicStream")
            .field("id", &self.shared.id())
            .field("bidirectional", &self.shared.bidirectional)
            .field("local", &self.shared.local)
            .field("control", &self.shared.control)
            .finish_non_exhaustive()
    }
}

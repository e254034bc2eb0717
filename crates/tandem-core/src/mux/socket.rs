//! The multiplexed socket.
//!
//! A single task reads frames and routes them to streams. Stream data is
//! handed over through a one-slot channel, so the reader waits for a stream
//! to take its data before it reads the next frame. Writers share the
//! transport through an async gate; a frame's bytes are written as one unit.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use tandem_transport::{Transport, TransportInfo};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::flow_control::{Credit, FlowControl};
use super::stream::{Chunk, SlicStream, StreamShared};
use super::{is_bidirectional, is_client_initiated, lock};
use crate::cancel::CancelSource;
use crate::error::{CloseReason, ConnectionError, Error, FrameError, Result, StreamError};
use crate::slic::params::{decode_reset, encode_reset};
use crate::slic::{FrameReader, FrameType, Negotiated, RESET_CLOSING, encode_header};

/// Which end of the connection this socket is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    /// The connector
    Client,
    /// The acceptor
    Server,
}

impl Side {
    /// ID of this side's control stream
    #[must_use]
    pub fn control_stream_id(self) -> u64 {
        match self {
            Self::Client => 2,
            Self::Server => 3,
        }
    }

    /// The other side
    #[must_use]
    pub fn peer(self) -> Self {
        match self {
            Self::Client => Self::Server,
            Self::Server => Self::Client,
        }
    }

    /// Whether this side opens streams with `id`
    #[must_use]
    pub fn initiates(self, id: u64) -> bool {
        is_client_initiated(id) == (self == Self::Client)
    }

    fn first_bidirectional_id(self) -> u64 {
        match self {
            Self::Client => 0,
            Self::Server => 1,
        }
    }
}

enum Outcome {
    Completed,
    Failed {
        error: StreamError,
        reset: Option<u64>,
    },
}

/// Frame owed to the peer after a stream finished
enum FollowUp {
    None,
    Reset {
        id: u64,
        code: u64,
        credit: Option<Credit>,
    },
    UnidirectionalFin(u64),
}

struct Entry {
    tx: Option<mpsc::Sender<Chunk>>,
    shared: Arc<StreamShared>,
}

struct SocketState {
    next_bidirectional: u64,
    next_unidirectional: u64,
    last_bidirectional: Option<u64>,
    last_unidirectional: Option<u64>,
    incoming_bidirectional: u64,
    incoming_unidirectional: u64,
    max_bidirectional: u64,
    max_unidirectional: u64,
    peer_control_seen: bool,
    streams: HashMap<u64, Entry>,
    awaiting_fin: HashMap<u64, Credit>,
    refuse_outgoing: Option<CloseReason>,
    refuse_incoming: bool,
    refused_bidirectional: Option<u64>,
    refused_unidirectional: Option<u64>,
}

impl SocketState {
    fn release_incoming(&mut self, shared: &StreamShared) {
        if shared.control {
            return;
        }
        if shared.bidirectional {
            self.incoming_bidirectional = self.incoming_bidirectional.saturating_sub(1);
        } else {
            self.incoming_unidirectional = self.incoming_unidirectional.saturating_sub(1);
        }
    }

    fn live(&self) -> usize {
        self.streams.values().filter(|e| !e.shared.control).count() + self.awaiting_fin.len()
    }
}

pub(crate) struct SocketInner {
    transport: Arc<dyn Transport>,
    side: Side,
    negotiated: Negotiated,
    gate: tokio::sync::Mutex<()>,
    state: Mutex<SocketState>,
    bidirectional_flow: Arc<FlowControl>,
    unidirectional_flow: Arc<FlowControl>,
    accept_tx: Mutex<Option<mpsc::UnboundedSender<SlicStream>>>,
    accept_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<SlicStream>>,
    control_tx: Mutex<Option<oneshot::Sender<SlicStream>>>,
    control_rx: tokio::sync::Mutex<Option<oneshot::Receiver<SlicStream>>>,
    live: watch::Sender<usize>,
    last_activity: Mutex<Instant>,
    abort: CancelSource,
    close_reason: OnceLock<CloseReason>,
}

impl SocketInner {
    pub(crate) fn flow(&self, bidirectional: bool) -> Arc<FlowControl> {
        if bidirectional {
            self.bidirectional_flow.clone()
        } else {
            self.unidirectional_flow.clone()
        }
    }

    pub(crate) fn packet_max_size(&self) -> usize {
        usize::try_from(self.negotiated.peer_packet_max_size)
            .unwrap_or(usize::MAX)
            .max(1)
    }

    fn is_control_id(&self, id: u64) -> bool {
        id == self.side.control_stream_id() || id == self.side.peer().control_stream_id()
    }

    fn closed_error(&self) -> Error {
        let reason = self
            .close_reason
            .get()
            .cloned()
            .unwrap_or_else(|| CloseReason::aborted("socket closed"));
        ConnectionError::Closed(reason).into()
    }

    fn update_live(&self, state: &SocketState) {
        let live = state.live();
        self.live.send_if_modified(|current| {
            let changed = *current != live;
            *current = live;
            changed
        });
    }

    /// Mark a stream finished and settle its accounting. Must be called with
    /// the socket state locked.
    fn finish_stream(
        &self,
        state: &mut SocketState,
        shared: &Arc<StreamShared>,
        outcome: Outcome,
    ) -> FollowUp {
        let mut stream = lock(&shared.state);
        if stream.finished {
            return FollowUp::None;
        }
        stream.finished = true;
        let credit = stream.credit.take();
        let id = shared.id();
        if let Some(id) = id {
            state.streams.remove(&id);
        }

        let (follow_up, failed) = match outcome {
            Outcome::Completed => {
                let follow_up = if shared.local {
                    // unidirectional credit waits for the peer's fin
                    if let (Some(id), Some(credit), false) = (id, credit, shared.bidirectional) {
                        state.awaiting_fin.insert(id, credit);
                    }
                    FollowUp::None
                } else {
                    state.release_incoming(shared);
                    match id {
                        Some(id) if !shared.bidirectional && !shared.control => {
                            FollowUp::UnidirectionalFin(id)
                        }
                        _ => FollowUp::None,
                    }
                };
                (follow_up, false)
            }
            Outcome::Failed { error, reset } => {
                stream.error = Some(error);
                if !shared.local {
                    state.release_incoming(shared);
                }
                let follow_up = match (id, reset) {
                    (Some(id), Some(code)) if !shared.control => FollowUp::Reset { id, code, credit },
                    _ => FollowUp::None,
                };
                (follow_up, true)
            }
        };
        drop(stream);

        if failed {
            shared.cancel.cancel();
        }
        self.update_live(state);
        follow_up
    }

    fn follow_up(self: &Arc<Self>, follow_up: FollowUp) {
        let (frame_type, id, payload, credit) = match follow_up {
            FollowUp::None => return,
            FollowUp::Reset { id, code, credit } => match encode_reset(code) {
                Ok(payload) => (FrameType::StreamReset, id, payload, credit),
                Err(_) => return,
            },
            FollowUp::UnidirectionalFin(id) => {
                (FrameType::StreamUnidirectionalFin, id, Bytes::new(), None)
            }
        };
        let Ok(handle) = Handle::try_current() else {
            return;
        };
        let inner = self.clone();
        handle.spawn(async move {
            if let Err(e) = inner.write_frame(frame_type, Some(id), &payload).await {
                trace!(stream = id, frame = frame_type.name(), error = %e, "frame not sent");
            }
            // the peer stops counting the stream once it reads the reset
            drop(credit);
        });
    }

    pub(crate) fn fail_stream(
        self: &Arc<Self>,
        shared: &Arc<StreamShared>,
        error: StreamError,
        reset: Option<u64>,
    ) {
        let follow_up = {
            let mut state = lock(&self.state);
            self.finish_stream(&mut state, shared, Outcome::Failed { error, reset })
        };
        self.follow_up(follow_up);
    }

    async fn send_raw(self: &Arc<Self>, bufs: &[&[u8]]) -> Result<()> {
        if let Err(e) = self.transport.send(bufs).await {
            self.abort(CloseReason::transport(e.to_string()));
            return Err(e.into());
        }
        Ok(())
    }

    async fn write_frame(
        self: &Arc<Self>,
        frame_type: FrameType,
        stream_id: Option<u64>,
        payload: &[u8],
    ) -> Result<()> {
        let _gate = self.gate.lock().await;
        if self.close_reason.get().is_some() {
            return Err(self.closed_error());
        }
        let header = encode_header(frame_type, stream_id, payload.len())?;
        self.send_raw(&[&header[..], payload]).await
    }

    /// Assign the next ID to an outgoing stream and add it to the table.
    fn register(
        &self,
        state: &mut SocketState,
        shared: &Arc<StreamShared>,
        pending_tx: &mut Option<mpsc::Sender<Chunk>>,
    ) -> Result<u64> {
        let id = if shared.control {
            self.side.control_stream_id()
        } else {
            if let Some(reason) = &state.refuse_outgoing {
                return Err(StreamError::Aborted(reason.clone()).into());
            }
            let next = if shared.bidirectional {
                &mut state.next_bidirectional
            } else {
                &mut state.next_unidirectional
            };
            let id = *next;
            *next += 4;
            id
        };
        let _ = shared.id.set(id);
        state.streams.insert(
            id,
            Entry {
                tx: pending_tx.take(),
                shared: shared.clone(),
            },
        );
        self.update_live(state);
        Ok(id)
    }

    pub(crate) async fn send_stream_frame(
        self: &Arc<Self>,
        shared: &Arc<StreamShared>,
        pending_tx: &mut Option<mpsc::Sender<Chunk>>,
        data: Bytes,
        last: bool,
    ) -> Result<()> {
        let _gate = self.gate.lock().await;
        if self.close_reason.get().is_some() {
            return Err(self.closed_error());
        }

        let (id, follow_up) = {
            let mut state = lock(&self.state);
            let id = match shared.id() {
                Some(id) => id,
                None => self.register(&mut state, shared, pending_tx)?,
            };
            let complete = {
                let mut stream = lock(&shared.state);
                if let Some(error) = stream.error.clone() {
                    return Err(error.into());
                }
                if stream.finished || stream.write_done {
                    return Err(StreamError::Finished.into());
                }
                if last {
                    stream.write_done = true;
                }
                last && stream.read_done
            };
            // settled before the frame is written: the peer may reuse the
            // credit as soon as it reads this frame
            let follow_up = if complete {
                self.finish_stream(&mut state, shared, Outcome::Completed)
            } else {
                FollowUp::None
            };
            (id, follow_up)
        };
        self.follow_up(follow_up);

        let frame_type = if last {
            FrameType::StreamLast
        } else {
            FrameType::Stream
        };
        let header = encode_header(frame_type, Some(id), data.len())?;
        self.send_raw(&[&header[..], &data[..]]).await
    }

    fn new_incoming(
        self: &Arc<Self>,
        id: u64,
        control: bool,
    ) -> (SlicStream, mpsc::Sender<Chunk>, Arc<StreamShared>) {
        let shared = StreamShared::new(Some(id), is_bidirectional(id), false, control);
        let (tx, rx) = mpsc::channel(1);
        let stream = SlicStream::new(self.clone(), shared.clone(), Some(rx), None);
        (stream, tx, shared)
    }

    /// Find or create the stream a data frame belongs to. Returns `None` for
    /// frames to discard, and a newly accepted stream to hand out once the
    /// state lock is released.
    #[allow(clippy::type_complexity)]
    fn route(
        self: &Arc<Self>,
        state: &mut SocketState,
        id: u64,
        data: &Bytes,
        last: bool,
    ) -> Result<Option<(mpsc::Sender<Chunk>, Arc<StreamShared>, Option<SlicStream>)>> {
        let bidirectional = is_bidirectional(id);
        let local = self.side.initiates(id);
        if local && !bidirectional {
            return Err(FrameError::InvalidStreamId(id).into());
        }

        if let Some(entry) = state.streams.get_mut(&id) {
            let tx = if last { entry.tx.take() } else { entry.tx.clone() };
            return Ok(tx.map(|tx| (tx, entry.shared.clone(), None)));
        }

        if local {
            // a bidirectional stream we never opened
            if id >= state.next_bidirectional {
                return Err(FrameError::InvalidStreamId(id).into());
            }
            return Ok(None);
        }

        if id == self.side.peer().control_stream_id() {
            if state.peer_control_seen {
                return Ok(None);
            }
            state.peer_control_seen = true;
            let (stream, tx, shared) = self.new_incoming(id, true);
            state.streams.insert(
                id,
                Entry {
                    tx: (!last).then(|| tx.clone()),
                    shared: shared.clone(),
                },
            );
            return Ok(Some((tx, shared, Some(stream))));
        }

        let (last_accepted, count, max) = if bidirectional {
            (
                state.last_bidirectional,
                state.incoming_bidirectional,
                state.max_bidirectional,
            )
        } else {
            (
                state.last_unidirectional,
                state.incoming_unidirectional,
                state.max_unidirectional,
            )
        };
        if last_accepted.is_some_and(|l| id <= l) {
            return Ok(None);
        }
        if state.refuse_incoming {
            let refused = if bidirectional {
                &mut state.refused_bidirectional
            } else {
                &mut state.refused_unidirectional
            };
            // reset once, on the frame that opened the stream
            if refused.is_some_and(|r| id <= r) {
                return Ok(None);
            }
            *refused = Some(id);
            debug!(stream = id, "refusing stream opened after GoAway");
            self.follow_up(FollowUp::Reset {
                id,
                code: RESET_CLOSING,
                credit: None,
            });
            return Ok(None);
        }
        if data.is_empty() {
            return Err(FrameError::Malformed(
                format!("stream {id} started with an empty frame").into(),
            )
            .into());
        }
        if count >= max {
            return Err(FrameError::TooManyStreams.into());
        }
        if bidirectional {
            state.last_bidirectional = Some(id);
            state.incoming_bidirectional += 1;
        } else {
            state.last_unidirectional = Some(id);
            state.incoming_unidirectional += 1;
        }

        let (stream, tx, shared) = self.new_incoming(id, false);
        state.streams.insert(
            id,
            Entry {
                tx: (!last).then(|| tx.clone()),
                shared: shared.clone(),
            },
        );
        self.update_live(state);
        trace!(stream = id, "accepted incoming stream");
        Ok(Some((tx, shared, Some(stream))))
    }

    async fn on_stream_frame(self: &Arc<Self>, id: u64, data: Bytes, last: bool) -> Result<()> {
        let routed = {
            let mut state = lock(&self.state);
            self.route(&mut state, id, &data, last)?
        };
        let Some((tx, shared, accepted)) = routed else {
            trace!(stream = id, len = data.len(), "discarding frame for unknown stream");
            return Ok(());
        };

        if let Some(stream) = accepted {
            if stream.is_control() {
                let sender = lock(&self.control_tx).take();
                if let Some(sender) = sender {
                    let _ = sender.send(stream);
                }
            } else {
                let sender = lock(&self.accept_tx).clone();
                if let Some(sender) = sender {
                    let _ = sender.send(stream);
                }
            }
        }

        let signal = shared.cancel.signal();
        tokio::select! {
            biased;
            () = signal.cancelled() => {}
            _ = tx.send(Chunk { data, last }) => {}
        }
        if last {
            self.mark_read_done(&shared);
        }
        Ok(())
    }

    fn mark_read_done(self: &Arc<Self>, shared: &Arc<StreamShared>) {
        let follow_up = {
            let mut state = lock(&self.state);
            let complete = {
                let mut stream = lock(&shared.state);
                stream.read_done = true;
                stream.write_done && !stream.finished
            };
            if complete {
                self.finish_stream(&mut state, shared, Outcome::Completed)
            } else {
                FollowUp::None
            }
        };
        self.follow_up(follow_up);
    }

    fn on_stream_reset(&self, id: u64, code: u64) -> Result<()> {
        if self.is_control_id(id) {
            return Err(FrameError::ControlStreamReset(id).into());
        }
        let mut state = lock(&self.state);
        let shared = state.streams.get(&id).map(|entry| entry.shared.clone());
        match shared {
            Some(shared) => {
                trace!(stream = id, code, "stream reset by peer");
                // the peer already settled its side; nothing owed back
                let _ = self.finish_stream(
                    &mut state,
                    &shared,
                    Outcome::Failed {
                        error: StreamError::Reset(code),
                        reset: None,
                    },
                );
            }
            None => {
                if state.awaiting_fin.remove(&id).is_some() {
                    self.update_live(&state);
                }
            }
        }
        Ok(())
    }

    fn on_unidirectional_fin(&self, id: u64) {
        let mut state = lock(&self.state);
        if state.awaiting_fin.remove(&id).is_some() {
            self.update_live(&state);
        } else {
            trace!(stream = id, "fin for unknown stream");
        }
    }

    async fn demux(self: &Arc<Self>, reader: &mut FrameReader) -> Result<()> {
        loop {
            let Some(header) = reader.read_header().await? else {
                return Ok(());
            };
            *lock(&self.last_activity) = Instant::now();

            match (header.frame_type, header.stream_id) {
                (FrameType::Ping, _) => {
                    reader.skip(header.payload_len).await?;
                    let inner = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = inner.write_frame(FrameType::Pong, None, &[]).await {
                            trace!(error = %e, "pong not sent");
                        }
                    });
                }
                (FrameType::Pong, _) => reader.skip(header.payload_len).await?,
                (FrameType::Stream | FrameType::StreamLast, Some(id)) => {
                    let data = reader.read_payload(header.payload_len).await?;
                    let last = header.frame_type == FrameType::StreamLast;
                    self.on_stream_frame(id, data, last).await?;
                }
                (FrameType::StreamReset, Some(id)) => {
                    let payload = reader.read_payload(header.payload_len).await?;
                    let code = decode_reset(&payload)?;
                    self.on_stream_reset(id, code)?;
                }
                (FrameType::StreamUnidirectionalFin, Some(id)) => {
                    reader.skip(header.payload_len).await?;
                    self.on_unidirectional_fin(id);
                }
                (other, _) => return Err(FrameError::UnexpectedFrame(other.name()).into()),
            }
        }
    }

    pub(crate) fn abort(self: &Arc<Self>, reason: CloseReason) {
        if self.close_reason.set(reason.clone()).is_err() {
            return;
        }
        debug!(side = ?self.side, %reason, "slic socket aborted");
        self.abort.cancel();
        self.bidirectional_flow.close(reason.clone());
        self.unidirectional_flow.close(reason.clone());

        {
            let mut state = lock(&self.state);
            let streams: Vec<_> = state.streams.values().map(|e| e.shared.clone()).collect();
            for shared in streams {
                let _ = self.finish_stream(
                    &mut state,
                    &shared,
                    Outcome::Failed {
                        error: StreamError::Aborted(reason.clone()),
                        reset: None,
                    },
                );
            }
            state.awaiting_fin.clear();
            state.refuse_outgoing.get_or_insert(reason);
            self.update_live(&state);
        }

        drop(lock(&self.accept_tx).take());
        drop(lock(&self.control_tx).take());
        // queued streams hold a reference to this socket
        if let Ok(mut rx) = self.accept_rx.try_lock() {
            while let Ok(stream) = rx.try_recv() {
                drop(stream);
            }
        }

        if let Ok(handle) = Handle::try_current() {
            let transport = self.transport.clone();
            handle.spawn(async move {
                if let Err(e) = transport.shutdown().await {
                    trace!(error = %e, "transport shutdown failed");
                }
            });
        }
    }
}

async fn receive_loop(inner: Arc<SocketInner>, mut reader: FrameReader) {
    let aborted = inner.abort.signal();
    let result = tokio::select! {
        () = aborted.cancelled() => return,
        result = inner.demux(&mut reader) => result,
    };
    let reason = match result {
        Ok(()) => CloseReason::transport("peer closed the connection"),
        Err(Error::Transport(message)) => CloseReason::transport(message),
        Err(e) => {
            warn!(side = ?inner.side, error = %e, "closing connection after protocol error");
            CloseReason::protocol(e.to_string())
        }
    };
    inner.abort(reason);
}

/// Multiplexed Slic socket. Cheap to clone.
#[derive(Clone)]
pub struct SlicSocket {
    inner: Arc<SocketInner>,
}

impl SlicSocket {
    /// Start demultiplexing frames from `reader` after a successful
    /// handshake. `local_limits` are the incoming (bidirectional,
    /// unidirectional) stream limits advertised to the peer.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        transport: Arc<dyn Transport>,
        reader: FrameReader,
        negotiated: Negotiated,
        side: Side,
        local_limits: (u64, u64),
    ) -> Self {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = oneshot::channel();
        let (live, _) = watch::channel(0);
        let inner = Arc::new(SocketInner {
            transport,
            side,
            negotiated,
            gate: tokio::sync::Mutex::new(()),
            state: Mutex::new(SocketState {
                next_bidirectional: side.first_bidirectional_id(),
                next_unidirectional: side.control_stream_id() + 4,
                last_bidirectional: None,
                last_unidirectional: None,
                incoming_bidirectional: 0,
                incoming_unidirectional: 0,
                max_bidirectional: local_limits.0,
                max_unidirectional: local_limits.1,
                peer_control_seen: false,
                streams: HashMap::new(),
                awaiting_fin: HashMap::new(),
                refuse_outgoing: None,
                refuse_incoming: false,
                refused_bidirectional: None,
                refused_unidirectional: None,
            }),
            bidirectional_flow: FlowControl::new(negotiated.peer_max_bidirectional_streams),
            unidirectional_flow: FlowControl::new(negotiated.peer_max_unidirectional_streams),
            accept_tx: Mutex::new(Some(accept_tx)),
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            control_tx: Mutex::new(Some(control_tx)),
            control_rx: tokio::sync::Mutex::new(Some(control_rx)),
            live,
            last_activity: Mutex::new(Instant::now()),
            abort: CancelSource::new(),
            close_reason: OnceLock::new(),
        });
        tokio::spawn(receive_loop(inner.clone(), reader));
        Self { inner }
    }

    /// Create an outgoing stream. Its ID and flow-control credit are taken
    /// with the first send.
    #[must_use]
    pub fn open_stream(&self, bidirectional: bool) -> SlicStream {
        let shared = StreamShared::new(None, bidirectional, true, false);
        if bidirectional {
            let (tx, rx) = mpsc::channel(1);
            SlicStream::new(self.inner.clone(), shared, Some(rx), Some(tx))
        } else {
            SlicStream::new(self.inner.clone(), shared, None, None)
        }
    }

    /// Create this side's control stream
    #[must_use]
    pub fn open_control_stream(&self) -> SlicStream {
        let shared = StreamShared::new(None, false, true, true);
        SlicStream::new(self.inner.clone(), shared, None, None)
    }

    /// Wait for the peer's control stream.
    ///
    /// # Errors
    /// Returns `ConnectionError::Closed` if the socket closes first and
    /// `ConnectionError::InvalidState` if it was already accepted
    pub async fn accept_control_stream(&self) -> Result<SlicStream> {
        let rx = self.inner.control_rx.lock().await.take();
        match rx {
            Some(rx) => rx.await.map_err(|_| self.inner.closed_error()),
            None => Err(ConnectionError::InvalidState(
                "control stream already accepted".into(),
            )
            .into()),
        }
    }

    /// Wait for the next stream opened by the peer.
    ///
    /// # Errors
    /// Returns `ConnectionError::Closed` once the socket is closed
    pub async fn accept_stream(&self) -> Result<SlicStream> {
        let mut rx = self.inner.accept_rx.lock().await;
        rx.recv().await.ok_or_else(|| self.inner.closed_error())
    }

    /// Send a keep-alive ping.
    ///
    /// # Errors
    /// Returns `ConnectionError::Closed` after an abort and transport errors
    pub async fn ping(&self) -> Result<()> {
        self.inner.write_frame(FrameType::Ping, None, &[]).await
    }

    /// Fail every stream and waiter with `reason` and shut the transport
    /// down in the background. Only the first call has an effect.
    pub fn abort(&self, reason: CloseReason) {
        self.inner.abort(reason);
    }

    /// Abort with `reason` and wait for the transport to shut down
    pub async fn shutdown(&self, reason: CloseReason) {
        self.inner.abort(reason);
        if let Err(e) = self.inner.transport.shutdown().await {
            trace!(error = %e, "transport shutdown failed");
        }
    }

    /// Wait until the socket is aborted
    pub async fn aborted(&self) {
        self.inner.abort.signal().cancelled().await;
    }

    /// Why the socket was aborted, once it was
    #[must_use]
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.inner.close_reason.get().cloned()
    }

    /// Make new outgoing streams fail with `reason`; streams that already
    /// sent a frame are unaffected
    pub fn refuse_outgoing(&self, reason: CloseReason) {
        lock(&self.inner.state).refuse_outgoing.get_or_insert(reason);
    }

    /// Abort outgoing streams for which `keep` returns false, resetting them
    /// with [`RESET_CLOSING`]
    pub fn abort_outgoing(&self, reason: &CloseReason, keep: impl Fn(u64) -> bool) {
        let follow_ups: Vec<FollowUp> = {
            let mut state = lock(&self.inner.state);
            let targets: Vec<_> = state
                .streams
                .iter()
                .filter(|(id, e)| e.shared.local && !e.shared.control && !keep(**id))
                .map(|(_, e)| e.shared.clone())
                .collect();
            targets
                .into_iter()
                .map(|shared| {
                    self.inner.finish_stream(
                        &mut state,
                        &shared,
                        Outcome::Failed {
                            error: StreamError::Aborted(reason.clone()),
                            reset: Some(RESET_CLOSING),
                        },
                    )
                })
                .collect()
        };
        for follow_up in follow_ups {
            self.inner.follow_up(follow_up);
        }
    }

    /// Wait until no stream is open and every unidirectional fin arrived
    pub async fn drained(&self) {
        let mut rx = self.inner.live.subscribe();
        let _ = rx.wait_for(|live| *live == 0).await;
    }

    /// Whether any outgoing stream is still waiting on the peer
    #[must_use]
    pub fn has_pending_outgoing(&self) -> bool {
        lock(&self.inner.state)
            .streams
            .values()
            .any(|e| e.shared.local && !e.shared.control)
    }

    /// Stop accepting streams from the peer and return the highest
    /// (bidirectional, unidirectional) IDs accepted so far. Streams the peer
    /// opens afterwards are reset with [`RESET_CLOSING`].
    pub fn refuse_incoming(&self) -> (Option<u64>, Option<u64>) {
        let mut state = lock(&self.inner.state);
        state.refuse_incoming = true;
        (state.last_bidirectional, state.last_unidirectional)
    }

    /// Highest (bidirectional, unidirectional) stream IDs accepted from the
    /// peer so far
    #[must_use]
    pub fn last_incoming_ids(&self) -> (Option<u64>, Option<u64>) {
        let state = lock(&self.inner.state);
        (state.last_bidirectional, state.last_unidirectional)
    }

    /// Incoming (bidirectional, unidirectional) streams currently open
    #[must_use]
    pub fn incoming_counts(&self) -> (u64, u64) {
        let state = lock(&self.inner.state);
        (state.incoming_bidirectional, state.incoming_unidirectional)
    }

    /// Outgoing (bidirectional, unidirectional) credit currently available
    #[must_use]
    pub fn available_credit(&self) -> (usize, usize) {
        (
            self.inner.bidirectional_flow.available(),
            self.inner.unidirectional_flow.available(),
        )
    }

    /// Time the last frame was read
    #[must_use]
    pub fn last_activity(&self) -> Instant {
        *lock(&self.inner.last_activity)
    }

    /// Negotiated idle timeout
    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        self.inner.negotiated.idle_timeout
    }

    /// Handshake outcome
    #[must_use]
    pub fn negotiated(&self) -> &Negotiated {
        &self.inner.negotiated
    }

    /// Which end this socket is
    #[must_use]
    pub fn side(&self) -> Side {
        self.inner.side
    }

    /// Transport details
    #[must_use]
    pub fn transport_info(&self) -> &TransportInfo {
        self.inner.transport.info()
    }
}

impl std::fmt::Debug for SlicSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlicSocket")
            .field("side", &self.inner.side)
            .field("transport", &self.inner.transport.info().description())
            .field("close_reason", &self.inner.close_reason.get())
            .finish_non_exhaustive()
    }
}

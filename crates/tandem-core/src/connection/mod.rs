//! Connection lifecycle.
//!
//! ```text
//! Initializing ──► Active ──► Closing ──► Closed
//!      │             │                      ▲
//!      └─────────────┴──────── abort ───────┘
//! ```
//!
//! A connection runs the Slic handshake and the control stream `Initialize`
//! exchange before it becomes `Active`. It then runs four background tasks:
//! the accept loop dispatching incoming requests, the idle monitor, a reader
//! for the peer's control stream watching for `GoAway`, and a watcher turning
//! a socket failure into a connection abort.
//!
//! States never move backwards. The first close reason recorded is the one
//! the connection reports, except that a graceful close which runs past
//! `close_timeout` reports `CloseTimeout`.

mod accept;
mod close;
pub mod control;
mod idle;

use std::borrow::Cow;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tandem_transport::Transport;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use crate::cancel::CancelSignal;
use crate::config::ConnectionOptions;
use crate::dispatch::Dispatcher;
use crate::error::{CloseReason, ConnectionError, Error, Result, StreamError};
use crate::mux::{Side, SlicSocket, SlicStream, lock};
use crate::protocol::{IncomingResponse, OutgoingRequest};
use crate::slic::{FrameReader, LocalParameters, handshake};
pub use control::{ControlMessage, GoAway};
use control::ControlReader;

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConnectionState {
    /// Handshake in progress
    Initializing,
    /// Requests flow both ways
    Active,
    /// GoAway exchange in progress; no new outgoing requests
    Closing,
    /// Terminal
    Closed,
}

#[derive(Debug, Clone)]
struct Status {
    state: ConnectionState,
    reason: Option<CloseReason>,
}

type ClosedCallback = Box<dyn FnOnce(&CloseReason) + Send>;
type RemoveCallback = Box<dyn FnOnce() + Send>;

struct ConnectionInner {
    socket: SlicSocket,
    options: ConnectionOptions,
    description: Arc<str>,
    status: watch::Sender<Status>,
    control: tokio::sync::Mutex<SlicStream>,
    dispatcher: Mutex<Option<Arc<dyn Dispatcher>>>,
    dispatches: AtomicUsize,
    peer_go_away: watch::Sender<Option<GoAway>>,
    closed_callbacks: Mutex<Vec<ClosedCallback>>,
    remove_callback: Mutex<Option<RemoveCallback>>,
}

impl ConnectionInner {
    fn state(&self) -> ConnectionState {
        self.status.borrow().state
    }

    fn close_reason(&self) -> Option<CloseReason> {
        self.status.borrow().reason.clone()
    }

    /// Move forward to `to`, recording `reason` unless one is already set
    /// (or unconditionally with `replace`).
    /// Returns false if the connection was already at or past `to`.
    fn transition(&self, to: ConnectionState, reason: Option<CloseReason>, replace: bool) -> bool {
        let changed = self.status.send_if_modified(|status| {
            if to <= status.state {
                return false;
            }
            status.state = to;
            if replace || status.reason.is_none() {
                status.reason = reason;
            }
            true
        });
        if changed {
            debug!(connection = %self.description, state = ?to, "connection state changed");
        }
        changed
    }

    async fn reached(&self, state: ConnectionState) {
        let mut rx = self.status.subscribe();
        let _ = rx.wait_for(|status| status.state >= state).await;
    }

    fn closed_error(&self) -> Error {
        let reason = self
            .close_reason()
            .unwrap_or_else(|| CloseReason::aborted("connection closed"));
        ConnectionError::Closed(reason).into()
    }

    fn check_active(&self) -> Result<()> {
        match self.state() {
            ConnectionState::Active => Ok(()),
            ConnectionState::Initializing => {
                Err(ConnectionError::InvalidState("connection is not established".into()).into())
            }
            ConnectionState::Closing | ConnectionState::Closed => Err(self.closed_error()),
        }
    }

    fn dispatcher(&self) -> Option<Arc<dyn Dispatcher>> {
        lock(&self.dispatcher).clone()
    }

    /// Start a graceful close unless the connection is already closing
    fn begin_close(self: &Arc<Self>, reason: CloseReason) -> bool {
        if !self.transition(ConnectionState::Closing, Some(reason.clone()), false) {
            return false;
        }
        tokio::spawn(close::run(self.clone(), reason));
        true
    }

    /// Close immediately. Only the first call has an effect.
    fn abort(self: &Arc<Self>, reason: CloseReason) {
        self.finish(reason, false);
    }

    /// Abort a graceful close that ran out of time, reporting `reason`
    /// instead of the reason the close started with
    fn close_timed_out(self: &Arc<Self>, reason: CloseReason) {
        self.finish(reason, true);
    }

    fn finish(self: &Arc<Self>, reason: CloseReason, replace: bool) {
        if !self.transition(ConnectionState::Closed, Some(reason.clone()), replace) {
            return;
        }
        self.socket.abort(reason.clone());

        let reason = self.close_reason().unwrap_or(reason);
        info!(connection = %self.description, %reason, "connection closed");
        let callbacks = std::mem::take(&mut *lock(&self.closed_callbacks));
        for callback in callbacks {
            callback(&reason);
        }
        self.try_remove();
    }

    fn try_remove(&self) {
        if self.state() != ConnectionState::Closed || self.dispatches.load(Ordering::SeqCst) != 0 {
            return;
        }
        let callback = lock(&self.remove_callback).take();
        if let Some(callback) = callback {
            callback();
        }
    }

    async fn send_control(&self, message: ControlMessage) -> Result<()> {
        let bytes = message.encode()?;
        self.control.lock().await.send(bytes, false).await
    }
}

/// Closes the socket if establishment fails or times out
struct AbortOnDrop(Option<SlicSocket>);

impl AbortOnDrop {
    fn disarm(mut self) {
        self.0 = None;
    }
}

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        if let Some(socket) = self.0.take() {
            socket.abort(CloseReason::new(
                crate::error::CloseReasonKind::Handshake,
                "connection establishment failed",
                true,
            ));
        }
    }
}

/// Multiplexed connection to a peer. Cheap to clone.
///
/// Dropping the last handle does not close the connection; its background
/// tasks keep serving the peer until [`close`](Self::close),
/// [`abort`](Self::abort) or a failure.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Establish a connection as the connecting side.
    ///
    /// # Errors
    /// Returns `Error::InvalidConfig` for invalid options,
    /// `ConnectionError::ConnectTimeout` if establishment does not finish
    /// within `connect_timeout`, and handshake, frame or transport errors
    pub async fn connect(
        transport: Arc<dyn Transport>,
        options: ConnectionOptions,
        dispatcher: Option<Arc<dyn Dispatcher>>,
    ) -> Result<Self> {
        Self::establish(transport, options, dispatcher, Side::Client).await
    }

    /// Establish a connection as the accepting side.
    ///
    /// # Errors
    /// Same as [`connect`](Self::connect)
    pub async fn accept(
        transport: Arc<dyn Transport>,
        options: ConnectionOptions,
        dispatcher: Option<Arc<dyn Dispatcher>>,
    ) -> Result<Self> {
        Self::establish(transport, options, dispatcher, Side::Server).await
    }

    async fn establish(
        transport: Arc<dyn Transport>,
        options: ConnectionOptions,
        dispatcher: Option<Arc<dyn Dispatcher>>,
        side: Side,
    ) -> Result<Self> {
        options.validate()?;
        let description: Arc<str> = Arc::from(transport.info().description());
        let connect_timeout = options.connect_timeout;
        debug!(connection = %description, ?side, "establishing connection");

        let result = tokio::time::timeout(
            connect_timeout,
            Self::initialize(transport.clone(), options, dispatcher, side, description.clone()),
        )
        .await
        .unwrap_or_else(|_| Err(ConnectionError::ConnectTimeout.into()));

        if let Err(e) = &result {
            warn!(connection = %description, error = %e, "connection establishment failed");
            if let Err(e) = transport.shutdown().await {
                trace!(error = %e, "transport shutdown failed");
            }
        }
        result
    }

    async fn initialize(
        transport: Arc<dyn Transport>,
        options: ConnectionOptions,
        dispatcher: Option<Arc<dyn Dispatcher>>,
        side: Side,
        description: Arc<str>,
    ) -> Result<Self> {
        let mut reader = FrameReader::new(transport.clone(), options.slic.max_frame_size);
        let limits = options.incoming_limits();
        let local = LocalParameters {
            max_bidirectional_streams: limits.0,
            max_unidirectional_streams: limits.1,
            idle_timeout: options.idle_timeout,
            packet_max_size: options.slic.packet_max_size,
        };
        let negotiated = match side {
            Side::Client => {
                handshake::connect(transport.as_ref(), &mut reader, &options.slic, &local).await?
            }
            Side::Server => {
                handshake::accept(transport.as_ref(), &mut reader, &options.slic, &local).await?
            }
        };
        debug!(
            connection = %description,
            version = negotiated.version,
            idle_timeout = ?negotiated.idle_timeout,
            "slic handshake complete"
        );

        let socket = SlicSocket::start(transport, reader, negotiated, side, limits);
        let guard = AbortOnDrop(Some(socket.clone()));

        let mut control = socket.open_control_stream();
        control.send(ControlMessage::Initialize.encode()?, false).await?;
        let mut peer_control = ControlReader::new(socket.accept_control_stream().await?);
        match peer_control.next().await? {
            Some(ControlMessage::Initialize) => {}
            Some(other) => {
                return Err(ConnectionError::Handshake(
                    format!("expected Initialize, got {other:?}").into(),
                )
                .into());
            }
            None => {
                return Err(ConnectionError::Handshake(
                    "peer closed its control stream".into(),
                )
                .into());
            }
        }
        guard.disarm();

        let (status, _) = watch::channel(Status {
            state: ConnectionState::Initializing,
            reason: None,
        });
        let (peer_go_away, _) = watch::channel(None);
        let inner = Arc::new(ConnectionInner {
            socket,
            options,
            description,
            status,
            control: tokio::sync::Mutex::new(control),
            dispatcher: Mutex::new(dispatcher),
            dispatches: AtomicUsize::new(0),
            peer_go_away,
            closed_callbacks: Mutex::new(Vec::new()),
            remove_callback: Mutex::new(None),
        });
        inner.transition(ConnectionState::Active, None, false);

        tokio::spawn(accept::run(inner.clone()));
        tokio::spawn(idle::monitor(inner.clone()));
        tokio::spawn(close::read_peer_control(inner.clone(), peer_control));
        tokio::spawn(watch_socket(inner.clone()));

        info!(connection = %inner.description, ?side, "connection established");
        Ok(Self { inner })
    }

    /// Send `request` on a new stream and wait for its response; oneway
    /// requests return `None` once sent.
    ///
    /// Firing `cancel` resets the stream and returns `StreamError::Canceled`.
    ///
    /// # Errors
    /// Returns `ConnectionError::Closed` unless the connection is active,
    /// `StreamError::Aborted` if it closes while the request is pending, and
    /// codec errors for malformed requests or responses
    pub async fn invoke(
        &self,
        request: &OutgoingRequest,
        cancel: CancelSignal,
    ) -> Result<Option<IncomingResponse>> {
        self.inner.check_active()?;
        let frame = request.encode()?;
        let max = self.inner.options.max_message_size;
        let mut stream = self.inner.socket.open_stream(!request.oneway);

        let exchange = async {
            stream.send(frame, true).await?;
            if request.oneway {
                return Ok(None);
            }
            let response = stream.read_to_end(max).await?;
            Ok::<_, Error>(Some(IncomingResponse::decode(&response)?))
        };
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(StreamError::Canceled.into()),
            result = exchange => result,
        }
    }

    /// Close gracefully and wait until the connection is closed. Concurrent
    /// callers wait for the same close and get the same reason.
    pub async fn close(&self, message: impl Into<Cow<'static, str>>) -> CloseReason {
        self.inner.begin_close(CloseReason::local_close(message));
        self.closed().await
    }

    /// Close immediately, failing every pending request with `reason`
    pub fn abort(&self, reason: CloseReason) {
        self.inner.abort(reason);
    }

    /// Wait until the connection is closed
    pub async fn closed(&self) -> CloseReason {
        self.inner.reached(ConnectionState::Closed).await;
        self.inner
            .close_reason()
            .unwrap_or_else(|| CloseReason::aborted("connection closed"))
    }

    /// Why the connection is closing or closed
    #[must_use]
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.inner.close_reason()
    }

    /// Run `callback` once the connection is closed, immediately if it
    /// already is
    pub fn on_closed(&self, callback: impl FnOnce(&CloseReason) + Send + 'static) {
        {
            let mut callbacks = lock(&self.inner.closed_callbacks);
            if self.inner.state() != ConnectionState::Closed {
                callbacks.push(Box::new(callback));
                return;
            }
        }
        if let Some(reason) = self.inner.close_reason() {
            callback(&reason);
        }
    }

    /// Run `callback` once the connection is closed and its last dispatch
    /// finished. Replaces any previous callback.
    pub fn set_remove_callback(&self, callback: impl FnOnce() + Send + 'static) {
        *lock(&self.inner.remove_callback) = Some(Box::new(callback));
        self.inner.try_remove();
    }

    /// Dispatch incoming requests to `dispatcher`
    pub fn set_dispatcher(&self, dispatcher: Arc<dyn Dispatcher>) {
        *lock(&self.inner.dispatcher) = Some(dispatcher);
    }

    /// Answer further incoming requests with `ObjectNotExist`
    pub fn clear_dispatcher(&self) {
        *lock(&self.inner.dispatcher) = None;
    }

    /// Send a Slic ping.
    ///
    /// # Errors
    /// Returns `ConnectionError::Closed` once the connection is closed
    pub async fn ping(&self) -> Result<()> {
        if self.inner.state() == ConnectionState::Closed {
            return Err(self.inner.closed_error());
        }
        self.inner.socket.ping().await
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// Description of the underlying transport
    #[must_use]
    pub fn description(&self) -> &str {
        &self.inner.description
    }

    /// Idle timeout agreed with the peer
    #[must_use]
    pub fn negotiated_idle_timeout(&self) -> Duration {
        self.inner.socket.idle_timeout()
    }

    /// Requests currently being dispatched
    #[must_use]
    pub fn dispatch_count(&self) -> usize {
        self.inner.dispatches.load(Ordering::SeqCst)
    }

    /// Underlying socket
    #[must_use]
    pub fn socket(&self) -> &SlicSocket {
        &self.inner.socket
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("description", &self.inner.description)
            .field("state", &self.inner.state())
            .field("close_reason", &self.inner.close_reason())
            .finish_non_exhaustive()
    }
}

async fn watch_socket(inner: Arc<ConnectionInner>) {
    inner.socket.aborted().await;
    let reason = inner
        .socket
        .close_reason()
        .unwrap_or_else(|| CloseReason::aborted("socket closed"));
    inner.abort(reason);
}

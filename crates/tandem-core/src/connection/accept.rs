//! Accept loop and request dispatch.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use tracing::{debug, error, trace, warn};

use super::ConnectionInner;
use crate::dispatch::{DispatchContext, DispatchError};
use crate::error::CloseReason;
use crate::mux::SlicStream;
use crate::protocol::{IncomingRequest, OutgoingResponse, RemoteException};

/// Counts a running dispatch for the idle monitor and the remove callback
struct DispatchGuard {
    inner: Arc<ConnectionInner>,
}

impl DispatchGuard {
    fn new(inner: Arc<ConnectionInner>) -> Self {
        inner.dispatches.fetch_add(1, Ordering::SeqCst);
        Self { inner }
    }
}

impl Drop for DispatchGuard {
    fn drop(&mut self) {
        if self.inner.dispatches.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.try_remove();
        }
    }
}

pub(super) async fn run(inner: Arc<ConnectionInner>) {
    loop {
        let Ok(stream) = inner.socket.accept_stream().await else {
            trace!(connection = %inner.description, "accept loop finished");
            return;
        };
        let Some(id) = stream.id() else {
            continue;
        };

        let task = dispatch(inner.clone(), stream, DispatchGuard::new(inner.clone()));
        let handle = match &inner.options.dispatch_runtime {
            Some(runtime) => runtime.spawn(task),
            None => tokio::spawn(task),
        };
        let supervisor = inner.clone();
        tokio::spawn(async move {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    error!(connection = %supervisor.description, stream_id = id, "dispatch panicked");
                    supervisor.abort(CloseReason::aborted(format!("dispatch of stream {id} panicked")));
                }
            }
        });
    }
}

async fn dispatch(inner: Arc<ConnectionInner>, mut stream: SlicStream, _guard: DispatchGuard) {
    let stream_id = stream.id().unwrap_or_default();
    let oneway = !stream.is_bidirectional();
    let cancel = stream.cancel_signal();

    let frame = match stream.read_to_end(inner.options.max_message_size).await {
        Ok(frame) => frame,
        Err(e) => {
            debug!(connection = %inner.description, stream_id, error = %e, "request not received");
            return;
        }
    };
    let request = match IncomingRequest::decode(&frame, oneway) {
        Ok(request) => request,
        Err(e) => {
            warn!(connection = %inner.description, stream_id, error = %e, "malformed request");
            inner.abort(CloseReason::protocol(format!(
                "malformed request on stream {stream_id}: {e}"
            )));
            return;
        }
    };
    trace!(
        connection = %inner.description,
        stream_id,
        identity = %request.identity,
        operation = %request.operation,
        oneway,
        "dispatching request"
    );

    let response = match inner.dispatcher() {
        None if oneway => return,
        None => OutgoingResponse::from(RemoteException::object_not_exist(&request)),
        Some(dispatcher) => {
            let context = DispatchContext {
                connection: inner.description.clone(),
                stream_id,
                cancel: cancel.clone(),
            };
            let result = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    debug!(connection = %inner.description, stream_id, "dispatch canceled");
                    return;
                }
                result = dispatcher.dispatch(request, context) => result,
            };
            result.unwrap_or_else(DispatchError::into_response)
        }
    };
    if oneway {
        return;
    }

    let frame = match response.encode() {
        Ok(frame) => frame,
        Err(e) => {
            warn!(connection = %inner.description, stream_id, error = %e, "response could not be encoded");
            match OutgoingResponse::from(RemoteException::UnknownLocal(e.to_string())).encode() {
                Ok(frame) => frame,
                Err(e) => {
                    inner.abort(CloseReason::aborted(format!("response encoding failed: {e}")));
                    return;
                }
            }
        }
    };
    if let Err(e) = stream.send(frame, true).await {
        debug!(connection = %inner.description, stream_id, error = %e, "response not sent");
    }
}

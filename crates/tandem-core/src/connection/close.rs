//! Graceful close.
//!
//! Both sides send exactly one `GoAway` carrying the highest incoming stream
//! IDs they still honor. The close completes once both `GoAway`s were
//! exchanged and every honored stream finished, or fails over to an abort
//! when `close_timeout` elapses first.

use std::sync::Arc;

use tracing::{debug, warn};

use super::control::{ControlMessage, ControlReader, GoAway};
use super::{ConnectionInner, ConnectionState};
use crate::error::{CloseReason, CloseReasonKind};

pub(super) async fn run(inner: Arc<ConnectionInner>, reason: CloseReason) {
    debug!(connection = %inner.description, %reason, "closing connection");
    let socket = &inner.socket;

    socket.refuse_outgoing(reason.clone());
    let peer = inner.peer_go_away.borrow().clone();
    match &peer {
        Some(go_away) => socket.abort_outgoing(&reason, |id| go_away.honors(id)),
        None => socket.abort_outgoing(&reason, |_| false),
    }

    // streams the peer opens from here on are not covered by our GoAway
    let (last_bidirectional, last_unidirectional) = socket.refuse_incoming();
    let go_away = GoAway {
        last_bidirectional,
        last_unidirectional,
        message: reason.message.to_string(),
    };
    if let Err(e) = inner.send_control(ControlMessage::GoAway(go_away)).await {
        debug!(connection = %inner.description, error = %e, "failed to send GoAway");
        let reason = socket
            .close_reason()
            .unwrap_or_else(|| CloseReason::aborted(e.to_string()));
        inner.abort(reason);
        return;
    }

    let completed = async {
        let mut peer = inner.peer_go_away.subscribe();
        let _ = peer.wait_for(Option::is_some).await;
        socket.drained().await;
    };
    let outcome = tokio::time::timeout(inner.options.close_timeout, async {
        tokio::select! {
            () = completed => true,
            () = socket.aborted() => false,
        }
    })
    .await;

    match outcome {
        Ok(true) => {
            debug!(connection = %inner.description, "graceful close complete");
            socket.shutdown(reason.clone()).await;
            inner.abort(reason);
        }
        Ok(false) => {
            let reason = socket.close_reason().unwrap_or(reason);
            inner.abort(reason);
        }
        Err(_) => {
            warn!(
                connection = %inner.description,
                timeout = ?inner.options.close_timeout,
                "graceful close timed out, aborting"
            );
            inner.close_timed_out(CloseReason::new(
                CloseReasonKind::CloseTimeout,
                "graceful close did not complete in time",
                true,
            ));
        }
    }
}

/// Watch the peer's control stream for its `GoAway`
pub(super) async fn read_peer_control(inner: Arc<ConnectionInner>, mut reader: ControlReader) {
    loop {
        let violation = match reader.next().await {
            Ok(Some(ControlMessage::GoAway(go_away))) => {
                if inner.peer_go_away.borrow().is_some() {
                    "second GoAway on control stream".to_string()
                } else {
                    debug!(
                        connection = %inner.description,
                        last_bidirectional = ?go_away.last_bidirectional,
                        last_unidirectional = ?go_away.last_unidirectional,
                        "received GoAway"
                    );
                    let reason = CloseReason::peer_close(go_away.message.clone());
                    inner.peer_go_away.send_replace(Some(go_away));
                    inner.begin_close(reason);
                    continue;
                }
            }
            Ok(Some(ControlMessage::Initialize)) => "Initialize after connection establishment".to_string(),
            Ok(None) if inner.state() >= ConnectionState::Closing => return,
            Ok(None) => "peer ended its control stream".to_string(),
            // the connection is going away; the watcher reports why
            Err(e) if e.close_reason().is_some() => return,
            Err(e) => e.to_string(),
        };
        warn!(connection = %inner.description, %violation, "control stream violation");
        inner.abort(CloseReason::protocol(violation));
        return;
    }
}

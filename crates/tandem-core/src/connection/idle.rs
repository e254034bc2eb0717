//! Idle monitoring.
//!
//! Ticks every half idle timeout. Past a quarter of the timeout a ping is
//! sent when keep-alive is on or requests are being dispatched. Past the full
//! timeout the connection closes gracefully, or aborts if requests of ours
//! are still waiting for a response.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use super::{ConnectionInner, ConnectionState};
use crate::error::{CloseReason, CloseReasonKind};

pub(super) async fn monitor(inner: Arc<ConnectionInner>) {
    let timeout = inner.socket.idle_timeout();
    let period = timeout / 2;
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = inner.reached(ConnectionState::Closing) => return,
            _ = ticker.tick() => {}
        }

        let idle = inner.socket.last_activity().elapsed();
        if idle > timeout {
            if inner.socket.has_pending_outgoing() {
                warn!(
                    connection = %inner.description,
                    ?idle,
                    "idle timeout with requests pending, aborting"
                );
                inner.abort(CloseReason::new(
                    CloseReasonKind::IdleTimeout,
                    format!("no data received for {idle:?} with requests pending"),
                    false,
                ));
            } else {
                debug!(connection = %inner.description, ?idle, "idle timeout, closing");
                inner.begin_close(CloseReason::new(
                    CloseReasonKind::IdleTimeout,
                    format!("idle for {idle:?}"),
                    true,
                ));
            }
            return;
        }

        let busy = inner.dispatches.load(Ordering::SeqCst) > 0;
        if idle > timeout / 4 && (inner.options.keep_alive || busy) {
            let socket = inner.socket.clone();
            let description = inner.description.clone();
            tokio::spawn(async move {
                if let Err(e) = socket.ping().await {
                    debug!(connection = %description, error = %e, "keep-alive ping failed");
                }
            });
        }
    }
}

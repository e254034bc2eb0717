//! Credit for opening outgoing streams.
//!
//! The peer advertises how many streams of each direction it accepts at
//! once; one permit is taken before a stream's first frame and returned once
//! the peer can no longer count that stream against its limit.

use std::sync::{Arc, Mutex};

use tokio::sync::Semaphore;

use super::lock;
use crate::error::{CloseReason, StreamError};

/// Closable counting semaphore for one stream direction
#[derive(Debug)]
pub struct FlowControl {
    semaphore: Semaphore,
    reason: Mutex<Option<CloseReason>>,
}

impl FlowControl {
    /// Create a flow controller with `permits` credits
    #[must_use]
    pub fn new(permits: u64) -> Arc<Self> {
        let permits = usize::try_from(permits)
            .unwrap_or(usize::MAX)
            .min(Semaphore::MAX_PERMITS);
        Arc::new(Self {
            semaphore: Semaphore::new(permits),
            reason: Mutex::new(None),
        })
    }

    /// Wait for one credit.
    ///
    /// # Errors
    /// Returns `StreamError::Aborted` once the controller is closed, including
    /// for callers already waiting
    pub async fn acquire(self: &Arc<Self>) -> Result<Credit, StreamError> {
        match self.semaphore.acquire().await {
            Ok(permit) => {
                permit.forget();
                Ok(Credit { flow: self.clone() })
            }
            Err(_) => Err(StreamError::Aborted(self.reason())),
        }
    }

    /// Credits currently available
    #[must_use]
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Fail all current and future waiters with `reason`
    pub fn close(&self, reason: CloseReason) {
        {
            let mut slot = lock(&self.reason);
            if slot.is_none() {
                *slot = Some(reason);
            }
        }
        self.semaphore.close();
    }

    /// Whether `close` was called
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }

    fn reason(&self) -> CloseReason {
        lock(&self.reason)
            .clone()
            .unwrap_or_else(|| CloseReason::aborted("flow control closed"))
    }
}

/// One unit of credit; returned to its controller on drop
#[derive(Debug)]
pub struct Credit {
    flow: Arc<FlowControl>,
}

impl Drop for Credit {
    fn drop(&mut self) {
        self.flow.semaphore.add_permits(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CloseReasonKind;
    use std::time::Duration;

    #[tokio::test]
    async fn test_credit_returned_on_drop() {
        let flow = FlowControl::new(2);
        let a = flow.acquire().await.unwrap();
        let _b = flow.acquire().await.unwrap();
        assert_eq!(flow.available(), 0);
        drop(a);
        assert_eq!(flow.available(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits_for_release() {
        let flow = FlowControl::new(1);
        let held = flow.acquire().await.unwrap();

        let waiter = {
            let flow = flow.clone();
            tokio::spawn(async move { flow.acquire().await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(!waiter.is_finished());

        drop(held);
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_close_wakes_waiters() {
        let flow = FlowControl::new(1);
        let _held = flow.acquire().await.unwrap();

        let waiter = {
            let flow = flow.clone();
            tokio::spawn(async move { flow.acquire().await.map(|_| ()) })
        };
        tokio::task::yield_now().await;

        flow.close(CloseReason::transport("reset by peer"));
        flow.close(CloseReason::aborted("second reason ignored"));
        match waiter.await.unwrap() {
            Err(StreamError::Aborted(reason)) => {
                assert_eq!(reason.kind, CloseReasonKind::Transport);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(flow.is_closed());
        assert!(flow.acquire().await.is_err());
    }
}

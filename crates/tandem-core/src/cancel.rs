//! Cancellation signals.
//!
//! A [`CancelSource`] is owned by whoever may cancel an operation; the
//! operation holds a [`CancelSignal`]. Streams own one source each, fired by a
//! peer `StreamReset` or by connection abort, so a dispatch observes a single
//! signal whatever the cause.

use tokio::sync::watch;

/// Owner side of a cancellation signal
#[derive(Debug)]
pub struct CancelSource {
    tx: watch::Sender<bool>,
}

impl CancelSource {
    /// Create an untriggered source
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    /// Trigger the signal. Returns false if it was already triggered.
    pub fn cancel(&self) -> bool {
        self.tx.send_if_modified(|canceled| !std::mem::replace(canceled, true))
    }

    /// Whether `cancel` was called
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        *self.tx.borrow()
    }

    /// A signal observing this source
    #[must_use]
    pub fn signal(&self) -> CancelSignal {
        CancelSignal {
            rx: Some(self.tx.subscribe()),
        }
    }
}

impl Default for CancelSource {
    fn default() -> Self {
        Self::new()
    }
}

/// Observer side of a cancellation signal
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: Option<watch::Receiver<bool>>,
}

impl CancelSignal {
    /// A signal that never fires
    #[must_use]
    pub fn never() -> Self {
        Self { rx: None }
    }

    /// Whether the signal has fired
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        self.rx.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Wait until the signal fires. Pends forever if the source is dropped
    /// without firing.
    pub async fn cancelled(&self) {
        if let Some(rx) = &self.rx {
            let mut rx = rx.clone();
            if rx.wait_for(|canceled| *canceled).await.is_ok() {
                return;
            }
        }
        std::future::pending::<()>().await;
    }
}

//! Cancellation plumbing for in-flight transfers
//!
//! Every submitted URB gets a `(CancelHandle, CancelToken)` pair. The
//! handle stays in the URB table; the token travels into the backend call.
//! Firing the handle is sticky and idempotent.

use tokio::sync::watch;

/// Create a linked handle/token pair
pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelToken { rx })
}

/// Table-side end: fires cancellation
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    /// Signal cancellation. Safe to call more than once.
    pub fn cancel(&self) {
        // send_replace never fails; receivers may already be gone if the
        // backend call finished first, which is fine.
        self.tx.send_replace(true);
    }

    /// A fresh token observing this handle
    pub fn token(&self) -> CancelToken {
        CancelToken {
            rx: self.tx.subscribe(),
        }
    }
}

/// Backend-side end: observes cancellation
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    /// Whether cancellation has been requested
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve when cancellation is requested. If the handle is dropped
    /// without firing (the transfer won), this pends forever; callers race
    /// it against the actual I/O with `select!`.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

//! Cooperative cancellation.
//!
//! A batch owns one [`CancelHandle`]; every request holds a cloned
//! [`CancelSignal`] and races it against inference and backoff sleeps.
//! Cancellation is observed at await points only; an attempt that has
//! already produced a result keeps it.

use tokio::sync::watch;

pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelSignal { rx })
}

/// Owner side. Dropping the handle without calling `cancel` leaves the
/// signal permanently un-cancelled.
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// Observer side, cheap to clone.
#[derive(Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    /// Signal that never fires, for callers running without a batch.
    pub fn none() -> Self {
        let (_handle, signal) = cancel_pair();
        signal
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves when cancellation fires. Pends forever if the handle is
    /// gone and never cancelled, so it is safe to race in a select.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

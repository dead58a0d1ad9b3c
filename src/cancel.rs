// cancel.rs
//
// One cancellation signal per job, observed at every suspension point.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Clonable cancellation signal. Cancelling is sticky and wakes every
/// waiter; observers poll [`is_cancelled`] at suspension points or await
/// [`cancelled`] in a `select!`.
#[derive(Clone)]
pub struct CancelSignal {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Resolves once the signal fires. Already-cancelled signals resolve
    /// immediately.
    pub async fn cancelled(&self) {
        while !self.is_cancelled() {
            self.notify.notified().await;
        }
    }
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancel_is_sticky_and_wakes_waiters() {
        let signal = CancelSignal::new();
        assert!(!signal.is_cancelled());

        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move {
                signal.cancelled().await;
                true
            })
        };

        signal.cancel();
        assert!(signal.is_cancelled());
        assert!(waiter.await.unwrap());

        // A late waiter resolves immediately.
        signal.cancelled().await;
    }
}

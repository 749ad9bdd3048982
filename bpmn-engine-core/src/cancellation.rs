//! Cooperative cancellation handles (§4.9, §5).
//!
//! A thin wrapper over `tokio_util`-style cancellation, built directly on
//! `tokio::sync::watch` rather than pulling in `tokio-util`'s
//! `CancellationToken`: the engine only ever needs a one-shot
//! not-cancelled→cancelled transition observed at suspension points, which a
//! `watch<bool>` already gives us without an extra dependency the teacher's
//! stack doesn't otherwise pull in.

use tokio::sync::watch;

#[derive(Clone)]
pub struct CancellationHandle {
    tx: watch::Sender<Option<String>>,
}

#[derive(Clone)]
pub struct CancellationToken {
    rx: watch::Receiver<Option<String>>,
}

impl CancellationHandle {
    pub fn new() -> (Self, CancellationToken) {
        let (tx, rx) = watch::channel(None);
        (Self { tx }, CancellationToken { rx })
    }

    /// Idempotent: already-cancelled handles ignore further cancels (§4.9:
    /// "cancellation is idempotent").
    pub fn cancel(&self, reason: impl Into<String>) {
        let _ = self.tx.send_if_modified(|current| {
            if current.is_some() {
                false
            } else {
                *current = Some(reason.into());
                true
            }
        });
    }
}

impl CancellationToken {
    pub fn is_cancelled(&self) -> bool {
        self.rx.borrow().is_some()
    }

    pub fn reason(&self) -> Option<String> {
        self.rx.borrow().clone()
    }

    /// Suspend until cancelled. Task runners await this alongside their own
    /// work at suspension points (§5 "Suspension points").
    pub async fn cancelled(&mut self) -> String {
        loop {
            if let Some(reason) = self.rx.borrow().clone() {
                return reason;
            }
            if self.rx.changed().await.is_err() {
                return "cancellation signal closed".to_string();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancel_is_observed_and_idempotent() {
        let (handle, mut token) = CancellationHandle::new();
        assert!(!token.is_cancelled());
        handle.cancel("timeout");
        handle.cancel("second reason, ignored");
        assert_eq!(token.reason(), Some("timeout".to_string()));
        let reason = token.cancelled().await;
        assert_eq!(reason, "timeout");
    }
}

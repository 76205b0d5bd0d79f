//! A single cancel-token primitive, propagated through function arguments,
//! with a timeout helper composed from it, in place of `Promise.race` plus
//! ad-hoc abort signals.

use std::time::Duration;

use tokio::sync::watch;

/// A cheaply `Clone`-able cancellation handle. Cancelling a token cancels
/// every clone and every child derived from it; children never cancel
/// their parent.
#[derive(Clone, Debug)]
pub struct CancelToken {
    tx: watch::Sender<bool>,
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx, rx }
    }

    /// Cancel this token and every clone/child of it.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait until this token is cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if *rx.borrow() {
            return;
        }
        // `changed()` only errors if the sender is dropped, which can't
        // happen while `self` keeps it alive.
        let _ = rx.changed().await;
    }

    /// Derive an independent child token: cancelling the child does not
    /// affect the parent, but cancelling the parent cancels the child.
    pub fn child(&self) -> Self {
        let child = CancelToken::new();
        if self.is_cancelled() {
            child.cancel();
            return child;
        }
        let mut parent_rx = self.rx.clone();
        let child_tx = child.tx.clone();
        tokio::spawn(async move {
            if parent_rx.changed().await.is_ok() && *parent_rx.borrow() {
                let _ = child_tx.send(true);
            }
        });
        child
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Race `fut` against `token` being cancelled or `duration` elapsing,
/// whichever comes first. Returns `None` on timeout/cancellation, `Some`
/// with the future's output otherwise.
pub async fn with_timeout<F, T>(duration: Duration, token: &CancelToken, fut: F) -> Option<T>
where
    F: std::future::Future<Output = T>,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => None,
        result = tokio::time::timeout(duration, fut) => result.ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn cancelling_parent_cancels_clone() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[tokio::test]
    async fn cancelling_parent_cancels_child() {
        let parent = CancelToken::new();
        let child = parent.child();
        assert!(!child.is_cancelled());
        parent.cancel();
        child.cancelled().await;
        assert!(child.is_cancelled());
    }

    #[tokio::test]
    async fn cancelling_child_does_not_cancel_parent() {
        let parent = CancelToken::new();
        let child = parent.child();
        child.cancel();
        assert!(!parent.is_cancelled());
    }

    #[tokio::test]
    async fn with_timeout_returns_value_when_fast_enough() {
        let token = CancelToken::new();
        let result = with_timeout(Duration::from_millis(50), &token, async { 42 }).await;
        assert_eq!(result, Some(42));
    }

    #[tokio::test]
    async fn with_timeout_returns_none_on_timeout() {
        let token = CancelToken::new();
        let result = with_timeout(Duration::from_millis(10), &token, async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            42
        })
        .await;
        assert_eq!(result, None);
    }

    #[tokio::test]
    async fn with_timeout_returns_none_on_cancel() {
        let token = CancelToken::new();
        let inner = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            inner.cancel();
        });
        let result = with_timeout(Duration::from_secs(5), &token, async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            42
        })
        .await;
        assert_eq!(result, None);
    }
}

//! Cancellation for device tasks.
//!
//! Tasks carry a [`tokio_util::sync::CancellationToken`]. The task manager
//! holds a root token and hands each task a child, so shutting the manager
//! down cancels every task while stopping one task leaves its siblings alone.
//! Long-running calls check the token at their safe points (poll iterations,
//! navigation steps, interval sleeps) rather than being interrupted.

use std::future::Future;
use std::time::Duration;

pub use tokio_util::sync::CancellationToken;

/// Cancellable sleeps on a token.
pub trait CancelExt {
    /// Sleep for `duration` unless cancelled first. Returns `false` if cancelled.
    fn sleep(&self, duration: Duration) -> impl Future<Output = bool> + Send;
}

impl CancelExt for CancellationToken {
    async fn sleep(&self, duration: Duration) -> bool {
        if self.is_cancelled() {
            return false;
        }
        tokio::select! {
            biased;
            () = self.cancelled() => false,
            () = tokio::time::sleep(duration) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn sleep_is_cut_short_by_cancel() {
        let token = CancellationToken::new();
        let sleeper = {
            let token = token.clone();
            tokio::spawn(async move { token.sleep(Duration::from_secs(60)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();
        assert!(!sleeper.await.unwrap());
        assert!(!token.sleep(Duration::from_millis(1)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_completes_when_not_cancelled() {
        let token = CancellationToken::new();
        assert!(token.sleep(Duration::from_millis(200)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn parent_cancel_reaches_child_sleep() {
        let root = CancellationToken::new();
        let child = root.child_token();
        let sibling = root.child_token();
        sibling.cancel();
        assert!(!root.is_cancelled());
        assert!(child.sleep(Duration::from_millis(5)).await);

        let sleeper = {
            let child = child.clone();
            tokio::spawn(async move { child.sleep(Duration::from_secs(60)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        root.cancel();
        assert!(!sleeper.await.unwrap());
    }
}

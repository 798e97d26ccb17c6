//! Live-mode boundary: at most one active invocation per strategy.
//!
//! An external scheduler may fire the same strategy again while a previous
//! invocation is still running. Such overlapping fires are skipped and
//! reported rather than run concurrently.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::warn;

/// Outcome of a guarded invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invocation<T> {
    Completed(T),
    SkippedOverlap,
}

/// Serializes invocations of one strategy. Cheap to clone; clones share
/// the same guard.
#[derive(Debug, Clone)]
pub struct InvocationGuard {
    strategy: Arc<str>,
    active: Arc<Mutex<()>>,
    skipped: Arc<AtomicU64>,
}

impl InvocationGuard {
    pub fn new(strategy: &str) -> Self {
        Self {
            strategy: Arc::from(strategy),
            active: Arc::new(Mutex::new(())),
            skipped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Run `f` unless another invocation is still in flight.
    pub async fn invoke<F, Fut, T>(&self, f: F) -> Invocation<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let Ok(_active) = self.active.try_lock() else {
            let skipped = self.skipped.fetch_add(1, Ordering::SeqCst) + 1;
            warn!(strategy = %self.strategy, skipped, "Invocation still running, fire skipped");
            return Invocation::SkippedOverlap;
        };

        Invocation::Completed(f().await)
    }

    pub fn is_running(&self) -> bool {
        self.active.try_lock().is_err()
    }

    /// Fires skipped so far because of overlap.
    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::oneshot;

    #[test]
    fn test_sequential_invocations_both_run() {
        let guard = InvocationGuard::new("macd-SPY");
        tokio_test::block_on(async {
            assert_eq!(guard.invoke(|| async { 1 }).await, Invocation::Completed(1));
            assert_eq!(guard.invoke(|| async { 2 }).await, Invocation::Completed(2));
        });
        assert_eq!(guard.skipped(), 0);
        assert!(!guard.is_running());
    }

    #[tokio::test]
    async fn test_overlapping_fire_is_skipped() {
        let guard = InvocationGuard::new("macd-SPY");
        let (started_tx, started_rx) = oneshot::channel();
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let first = {
            let guard = guard.clone();
            tokio::spawn(async move {
                guard
                    .invoke(|| async move {
                        let _ = started_tx.send(());
                        let _ = release_rx.await;
                        "first"
                    })
                    .await
            })
        };

        started_rx.await.unwrap();
        assert!(guard.is_running());

        let second = guard.invoke(|| async { "second" }).await;
        assert_eq!(second, Invocation::SkippedOverlap);
        assert_eq!(guard.skipped(), 1);

        release_tx.send(()).unwrap();
        assert_eq!(first.await.unwrap(), Invocation::Completed("first"));
        assert!(!guard.is_running());
    }

    #[tokio::test]
    async fn test_guards_are_per_strategy() {
        let a = InvocationGuard::new("a");
        let b = InvocationGuard::new("b");

        let result = a
            .invoke(|| async {
                b.invoke(|| async {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    "inner"
                })
                .await
            })
            .await;
        assert_eq!(result, Invocation::Completed(Invocation::Completed("inner")));
    }
}

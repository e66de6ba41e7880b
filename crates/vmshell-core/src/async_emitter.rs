//! Deadline-bounded broadcast to asynchronous listeners.

use std::{
    future::Future,
    sync::{Arc, Mutex},
    time::Duration,
};

use futures::future::{BoxFuture, join_all};
use thiserror::Error;

use crate::{
    dispose::{Disposable, lock},
    event::{Emitter, Event, Subscription},
};

/// Broadcast error.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BroadcastError {
    #[error("Broadcast timed out after {0:?}")]
    Timeout(Duration),
    #[error("{failed} of {total} listeners failed: {message}")]
    ListenerFailed {
        failed: usize,
        total: usize,
        /// Message of the first failure.
        message: String,
    },
}

struct Firing<T> {
    value: T,
    pending: Mutex<Vec<BoxFuture<'static, anyhow::Result<()>>>>,
}

/// Fan-out broadcast whose listeners all run to completion under one deadline.
///
/// Every listener is started on each `fire`, even if a sibling fails. The
/// broadcast fails if any listener fails or if the whole set has not settled
/// within the configured timeout. Listeners still running at the deadline
/// keep running; only the caller stops waiting for them.
pub struct AsyncEmitter<T> {
    inner: Emitter<Arc<Firing<T>>>,
    timeout: Duration,
}

impl<T> AsyncEmitter<T> {
    /// Create an emitter with the given broadcast deadline.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            inner: Emitter::new(),
            timeout,
        }
    }

    /// Registration handle for consumers.
    #[must_use]
    pub fn event(&self) -> AsyncEvent<T> {
        AsyncEvent {
            inner: self.inner.event(),
        }
    }

    /// The broadcast deadline.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Number of registered listeners.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.inner.listener_count()
    }
}

impl<T: Send + Sync + 'static> AsyncEmitter<T> {
    /// Start every listener and wait for all of them to settle.
    ///
    /// # Errors
    /// Returns [`BroadcastError::Timeout`] if the deadline passes first, or
    /// [`BroadcastError::ListenerFailed`] once all listeners settled and at
    /// least one of them failed.
    pub async fn fire(&self, value: T) -> Result<(), BroadcastError> {
        let firing = Arc::new(Firing {
            value,
            pending: Mutex::new(Vec::new()),
        });
        self.inner.fire(Arc::clone(&firing));
        let pending = std::mem::take(&mut *lock(&firing.pending));
        drop(firing);
        let total = pending.len();

        // Spawned so that abandoning the wait at the deadline does not cancel them.
        let tasks = pending.into_iter().map(tokio::spawn).collect::<Vec<_>>();
        let settled = tokio::time::timeout(self.timeout, join_all(tasks))
            .await
            .map_err(|_| BroadcastError::Timeout(self.timeout))?;

        let failures: Vec<String> = settled
            .into_iter()
            .filter_map(|joined| match joined {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(format!("{e:#}")),
                Err(e) => Some(format!("listener task failed: {e}")),
            })
            .collect();

        let failed = failures.len();
        match failures.into_iter().next() {
            None => Ok(()),
            Some(message) => {
                tracing::debug!(failed, total, %message, "Async broadcast failed");
                Err(BroadcastError::ListenerFailed {
                    failed,
                    total,
                    message,
                })
            }
        }
    }
}

impl<T> Disposable for AsyncEmitter<T> {
    fn dispose(&self) {
        self.inner.dispose();
    }
}

/// Registration side of an [`AsyncEmitter`].
pub struct AsyncEvent<T> {
    inner: Event<Arc<Firing<T>>>,
}

impl<T> Clone for AsyncEvent<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> AsyncEvent<T> {
    /// Register an async listener.
    pub fn listen<F, Fut>(&self, listener: F) -> Subscription
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.inner.listen(move |firing: &Arc<Firing<T>>| {
            let work = listener(firing.value.clone());
            lock(&firing.pending).push(Box::pin(work));
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::time::Instant;

    use super::*;

    #[tokio::test]
    async fn test_fire_without_listeners_succeeds() {
        let emitter: AsyncEmitter<u32> = AsyncEmitter::new(Duration::from_secs(1));
        assert_eq!(emitter.fire(1).await, Ok(()));
    }

    #[tokio::test]
    async fn test_all_listeners_attempted_before_failure() {
        let emitter = AsyncEmitter::new(Duration::from_secs(5));
        let completed = Arc::new(AtomicUsize::new(0));

        let _fails = emitter
            .event()
            .listen(|_: u32| async { Err::<(), _>(anyhow::anyhow!("listener B failed")) });
        let _slow = emitter.event().listen({
            let completed = Arc::clone(&completed);
            move |value: u32| {
                let completed = Arc::clone(&completed);
                async move {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    completed.fetch_add(value as usize, Ordering::SeqCst);
                    Ok::<(), anyhow::Error>(())
                }
            }
        });

        let result = emitter.fire(3).await;

        assert_eq!(
            result,
            Err(BroadcastError::ListenerFailed {
                failed: 1,
                total: 2,
                message: "listener B failed".to_string(),
            })
        );
        assert_eq!(completed.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_applies_to_whole_broadcast() {
        let timeout = Duration::from_secs(5);
        let emitter = AsyncEmitter::new(timeout);
        let _stuck = emitter
            .event()
            .listen(|(): ()| futures::future::pending::<anyhow::Result<()>>());
        let _quick = emitter.event().listen(|(): ()| async { Ok::<(), anyhow::Error>(()) });

        let start = Instant::now();
        let result = emitter.fire(()).await;
        let elapsed = start.elapsed();

        assert_eq!(result, Err(BroadcastError::Timeout(timeout)));
        assert!(elapsed >= timeout);
        assert!(elapsed < timeout + Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn test_listeners_keep_running_after_deadline() {
        let emitter = AsyncEmitter::new(Duration::from_millis(10));
        let finished = Arc::new(AtomicUsize::new(0));
        let _late = emitter.event().listen({
            let finished = Arc::clone(&finished);
            move |(): ()| {
                let finished = Arc::clone(&finished);
                async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    finished.fetch_add(1, Ordering::SeqCst);
                    Ok::<(), anyhow::Error>(())
                }
            }
        });

        assert!(matches!(emitter.fire(()).await, Err(BroadcastError::Timeout(_))));
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_disposed_emitter_drops_listeners() {
        let emitter = AsyncEmitter::new(Duration::from_secs(1));
        let calls = Arc::new(AtomicUsize::new(0));
        let _sub = emitter.event().listen({
            let calls = Arc::clone(&calls);
            move |(): ()| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<(), anyhow::Error>(()) }
            }
        });

        emitter.dispose();
        assert_eq!(emitter.fire(()).await, Ok(()));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(emitter.listener_count(), 0);
    }
}

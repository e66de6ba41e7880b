//! On-demand resource metrics.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use vmshell_core::{Barrier, BarrierResult, Disposable, DisposeGuard, SystemClient, SystemMetrics};

use crate::error::NotifyError;

/// Pending fetches; `None` once disposed.
type Pending = Option<Vec<Barrier<SystemMetrics>>>;

fn lock(pending: &Mutex<Pending>) -> MutexGuard<'_, Pending> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Fetches VM resource usage.
///
/// The remote publishes metrics as a notification rather than a response,
/// so each fetch asks for a snapshot and waits on a gate that the next
/// update opens.
pub struct Metrics {
    client: Arc<dyn SystemClient>,
    pending: Mutex<Pending>,
}

impl Metrics {
    #[must_use]
    pub fn new(client: Arc<dyn SystemClient>) -> Self {
        Self {
            client,
            pending: Mutex::new(Some(Vec::new())),
        }
    }

    /// Request and wait for a fresh snapshot.
    ///
    /// # Errors
    /// Returns error if the request fails, or [`NotifyError::Disposed`] if
    /// this fetcher is disposed before a snapshot arrives.
    pub async fn get(&self) -> Result<SystemMetrics, NotifyError> {
        let gate = Barrier::new();
        {
            let mut pending = lock(&self.pending);
            let Some(pending) = pending.as_mut() else {
                return Err(NotifyError::Disposed);
            };
            pending.retain(|gate| !gate.is_settled());
            pending.push(gate.clone());
        }

        let _update = DisposeGuard::new(self.client.on_metrics_update().once({
            let gate = gate.clone();
            move |metrics: &SystemMetrics| {
                gate.open(*metrics);
            }
        }));
        if let Err(e) = self.client.request_metrics().await {
            gate.dispose();
            return Err(e.into());
        }

        match gate.wait().await {
            BarrierResult::Opened(metrics) => Ok(metrics),
            BarrierResult::Disposed => Err(NotifyError::Disposed),
        }
    }
}

impl Disposable for Metrics {
    fn dispose(&self) {
        let Some(pending) = lock(&self.pending).take() else {
            return;
        };
        tracing::debug!(pending = pending.len(), "Releasing pending metrics fetches");
        for gate in pending {
            gate.dispose();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tokio_test::{assert_pending, assert_ready, task};
    use vmshell_core::{Emitter, Event, RemoteError, Usage};

    use super::*;

    #[derive(Default)]
    struct FakeSystem {
        updates: Emitter<SystemMetrics>,
        requests: AtomicUsize,
        /// Publish synchronously from inside the request.
        eager: AtomicBool,
        fail: AtomicBool,
    }

    #[async_trait]
    impl SystemClient for FakeSystem {
        async fn request_metrics(&self) -> Result<(), RemoteError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(RemoteError::Disconnected);
            }
            let n = self.requests.fetch_add(1, Ordering::SeqCst) + 1;
            if self.eager.load(Ordering::SeqCst) {
                self.updates.fire(sample(f64::from(u32::try_from(n).unwrap())));
            }
            Ok(())
        }

        fn on_metrics_update(&self) -> Event<SystemMetrics> {
            self.updates.event()
        }
    }

    fn sample(cpu: f64) -> SystemMetrics {
        let usage = |used| Usage { used, total: 100.0 };
        SystemMetrics {
            cpu: usage(cpu),
            memory: usage(50.0),
            storage: usage(10.0),
        }
    }

    #[tokio::test]
    async fn test_get_resolves_with_next_update() {
        let client = Arc::new(FakeSystem::default());
        client.eager.store(true, Ordering::SeqCst);
        let metrics = Metrics::new(client.clone());

        assert_eq!(metrics.get().await.unwrap().cpu.used, 1.0);
        assert_eq!(metrics.get().await.unwrap().cpu.used, 2.0);
        assert_eq!(client.updates.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_get_waits_for_notification() {
        let client = Arc::new(FakeSystem::default());
        let metrics = Metrics::new(client.clone());
        let mut fetch = task::spawn(metrics.get());
        assert_pending!(fetch.poll());
        assert_eq!(client.requests.load(Ordering::SeqCst), 1);

        client.updates.fire(sample(42.0));

        assert_eq!(assert_ready!(fetch.poll()), Ok(sample(42.0)));
    }

    #[tokio::test]
    async fn test_dispose_resolves_pending_fetch() {
        let client = Arc::new(FakeSystem::default());
        let metrics = Metrics::new(client.clone());
        let mut fetch = task::spawn(metrics.get());
        assert_pending!(fetch.poll());

        metrics.dispose();

        assert_eq!(assert_ready!(fetch.poll()), Err(NotifyError::Disposed));
        drop(fetch);
        assert_eq!(metrics.get().await, Err(NotifyError::Disposed));
        assert_eq!(client.updates.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_request_failure_is_surfaced() {
        let client = Arc::new(FakeSystem::default());
        client.fail.store(true, Ordering::SeqCst);
        let metrics = Metrics::new(client.clone());

        assert_eq!(
            metrics.get().await,
            Err(NotifyError::Remote(RemoteError::Disconnected))
        );
        assert_eq!(client.updates.listener_count(), 0);
    }
}

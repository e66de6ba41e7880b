//! Single-resolution gate.

use std::sync::Arc;

use tokio::sync::watch;

use crate::dispose::Disposable;

/// Outcome observed by a barrier waiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BarrierResult<T> {
    /// The barrier was opened with this value.
    Opened(T),
    /// The barrier was disposed without ever opening.
    Disposed,
}

#[derive(Debug, Clone)]
enum State<T> {
    Pending,
    Opened(T),
    Disposed,
}

/// Gate that resolves exactly once, either opened with a value or disposed.
///
/// Waiters registered before and after the transition all observe the same
/// outcome. Later `open`/`dispose` calls are ignored.
pub struct Barrier<T> {
    state: Arc<watch::Sender<State<T>>>,
}

impl<T> Clone for Barrier<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<T> Default for Barrier<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Barrier<T> {
    /// Create a pending barrier.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = watch::channel(State::Pending);
        Self {
            state: Arc::new(tx),
        }
    }

    /// Open the barrier. Returns `false` if it had already resolved.
    pub fn open(&self, value: T) -> bool {
        self.state.send_if_modified(|state| {
            if matches!(state, State::Pending) {
                *state = State::Opened(value);
                true
            } else {
                false
            }
        })
    }

    /// Whether the barrier has resolved either way.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        !matches!(*self.state.borrow(), State::Pending)
    }
}

impl<T: Clone> Barrier<T> {
    /// Wait for the barrier to resolve.
    pub async fn wait(&self) -> BarrierResult<T> {
        let mut rx = self.state.subscribe();
        let settled = rx.wait_for(|state| !matches!(state, State::Pending)).await;
        match settled.as_deref() {
            Ok(State::Opened(value)) => BarrierResult::Opened(value.clone()),
            _ => BarrierResult::Disposed,
        }
    }

    /// Current outcome, if resolved.
    #[must_use]
    pub fn peek(&self) -> Option<BarrierResult<T>> {
        match &*self.state.borrow() {
            State::Pending => None,
            State::Opened(value) => Some(BarrierResult::Opened(value.clone())),
            State::Disposed => Some(BarrierResult::Disposed),
        }
    }
}

impl<T: Send + Sync> Disposable for Barrier<T> {
    fn dispose(&self) {
        self.state.send_if_modified(|state| {
            if matches!(state, State::Pending) {
                *state = State::Disposed;
                true
            } else {
                false
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use tokio_test::{assert_pending, assert_ready_eq, task};

    use super::*;

    #[tokio::test]
    async fn test_first_open_wins_for_all_waiters() {
        let barrier = Barrier::new();
        let early = barrier.clone();
        let mut early = task::spawn(async move { early.wait().await });
        assert_pending!(early.poll());

        assert!(barrier.open("v1"));
        assert!(!barrier.open("v2"));

        assert_ready_eq!(early.poll(), BarrierResult::Opened("v1"));
        assert_eq!(barrier.wait().await, BarrierResult::Opened("v1"));
    }

    #[tokio::test]
    async fn test_dispose_resolves_waiters() {
        let barrier: Barrier<u32> = Barrier::new();
        let pending = barrier.clone();
        let mut pending = task::spawn(async move { pending.wait().await });
        assert_pending!(pending.poll());

        barrier.dispose();

        assert_ready_eq!(pending.poll(), BarrierResult::Disposed);
        assert_eq!(barrier.wait().await, BarrierResult::Disposed);
        assert!(!barrier.open(1));
        assert_eq!(barrier.peek(), Some(BarrierResult::Disposed));
    }

    #[tokio::test]
    async fn test_dispose_after_open_is_ignored() {
        let barrier = Barrier::new();
        barrier.open(5);
        barrier.dispose();

        assert_eq!(barrier.wait().await, BarrierResult::Opened(5));
    }

    #[test]
    fn test_pending_state() {
        let barrier: Barrier<()> = Barrier::new();
        assert!(!barrier.is_settled());
        assert_eq!(barrier.peek(), None);
    }
}

//! Synchronous fan-out events with disposal-based unsubscription.
//!
//! An [`Emitter`] owns the listener set and fires values; the matching
//! [`Event`] is the registration side handed out to consumers. Every
//! registration returns a [`Subscription`] that removes exactly that
//! listener when disposed.

use std::{
    collections::BTreeMap,
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicBool, Ordering},
    },
};

use thiserror::Error;
use tokio::sync::oneshot;

use crate::dispose::{Disposable, DisposeFn, DisposeGuard, lock};

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Event error.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum EventError {
    #[error("Event source was disposed")]
    Disposed,
}

struct Registry<T> {
    next_id: u64,
    listeners: BTreeMap<u64, Listener<T>>,
    disposed: bool,
}

struct Shared<T> {
    registry: Mutex<Registry<T>>,
}

/// Firing side of an event.
pub struct Emitter<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Default for Emitter<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Emitter<T> {
    /// Create an emitter with no listeners.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                registry: Mutex::new(Registry {
                    next_id: 0,
                    listeners: BTreeMap::new(),
                    disposed: false,
                }),
            }),
        }
    }

    /// Registration handle for consumers.
    #[must_use]
    pub fn event(&self) -> Event<T> {
        Event {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Invoke every listener registered at the time of the call.
    ///
    /// The listener set is snapshotted first, so listeners added or removed
    /// while firing do not change who receives this value. Listener panics
    /// are not caught.
    pub fn fire(&self, value: T) {
        let snapshot: Vec<Listener<T>> = lock(&self.shared.registry)
            .listeners
            .values()
            .cloned()
            .collect();
        for listener in snapshot {
            listener(&value);
        }
    }

    /// Number of registered listeners.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        lock(&self.shared.registry).listeners.len()
    }

    /// Whether any listener is registered.
    #[must_use]
    pub fn has_listeners(&self) -> bool {
        self.listener_count() > 0
    }
}

impl<T> Disposable for Emitter<T> {
    fn dispose(&self) {
        let removed = {
            let mut registry = lock(&self.shared.registry);
            registry.disposed = true;
            std::mem::take(&mut registry.listeners)
        };
        // Listener captures are dropped outside the lock.
        drop(removed);
    }
}

/// Registration side of an event.
pub struct Event<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Event<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: 'static> Event<T> {
    /// Register a listener.
    pub fn listen(&self, listener: impl Fn(&T) + Send + Sync + 'static) -> Subscription {
        self.register(Arc::new(listener))
    }

    /// Register a listener that unsubscribes itself after its first invocation.
    pub fn once(&self, listener: impl FnOnce(&T) + Send + 'static) -> Subscription {
        let listener = Mutex::new(Some(listener));
        self.listen_until(move |value| {
            let listener = lock(&listener).take();
            if let Some(listener) = listener {
                listener(value);
            }
            true
        })
    }

    /// Register a listener that unsubscribes itself once it returns `true`.
    fn listen_until(&self, listener: impl Fn(&T) -> bool + Send + Sync + 'static) -> Subscription {
        let Some(id) = self.reserve_id() else {
            return Subscription::noop();
        };
        let weak = Arc::downgrade(&self.shared);
        let done = AtomicBool::new(false);
        self.insert(
            id,
            Arc::new(move |value: &T| {
                if done.load(Ordering::Acquire) {
                    return;
                }
                if listener(value) {
                    done.store(true, Ordering::Release);
                    remove(&weak, id);
                }
            }),
        )
    }

    fn register(&self, listener: Listener<T>) -> Subscription {
        match self.reserve_id() {
            Some(id) => self.insert(id, listener),
            None => Subscription::noop(),
        }
    }

    fn reserve_id(&self) -> Option<u64> {
        let mut registry = lock(&self.shared.registry);
        if registry.disposed {
            return None;
        }
        let id = registry.next_id;
        registry.next_id += 1;
        Some(id)
    }

    fn insert(&self, id: u64, listener: Listener<T>) -> Subscription {
        let mut registry = lock(&self.shared.registry);
        if registry.disposed {
            return Subscription::noop();
        }
        registry.listeners.insert(id, listener);
        drop(registry);

        let weak = Arc::downgrade(&self.shared);
        Subscription {
            remove: DisposeFn::new(move || remove(&weak, id)),
        }
    }
}

fn remove<T>(shared: &Weak<Shared<T>>, id: u64) {
    if let Some(shared) = shared.upgrade() {
        let removed = lock(&shared.registry).listeners.remove(&id);
        drop(removed);
    }
}

/// Handle that removes one listener when disposed.
///
/// Dropping a subscription leaves the listener registered.
#[must_use = "dropping a Subscription keeps the listener registered; call dispose() to remove it"]
pub struct Subscription {
    remove: DisposeFn,
}

impl Subscription {
    fn noop() -> Self {
        Self {
            remove: DisposeFn::new(|| {}),
        }
    }
}

impl Disposable for Subscription {
    fn dispose(&self) {
        self.remove.dispose();
    }
}

/// Wait for the first value satisfying `predicate`, then unsubscribe.
///
/// This is the bridge from push-style notifications to a single awaited
/// value. The listener is removed as soon as it matches, and also if the
/// returned future is dropped before a match.
///
/// # Errors
/// Returns [`EventError::Disposed`] if the emitter is torn down first.
pub async fn listen_once<T, P>(event: &Event<T>, predicate: P) -> Result<T, EventError>
where
    T: Clone + Send + 'static,
    P: Fn(&T) -> bool + Send + Sync + 'static,
{
    let (tx, rx) = oneshot::channel();
    let tx = Mutex::new(Some(tx));
    let _guard = DisposeGuard::new(event.listen_until(move |value| {
        if !predicate(value) {
            return false;
        }
        if let Some(tx) = lock(&tx).take() {
            let _ = tx.send(value.clone());
        }
        true
    }));
    rx.await.map_err(|_| EventError::Disposed)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use tokio_test::{assert_pending, assert_ready_eq, task};

    use super::*;

    fn recorder() -> (Arc<Mutex<Vec<i32>>>, impl Fn(&i32) + Send + Sync + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, move |v: &i32| sink.lock().unwrap().push(*v))
    }

    #[test]
    fn test_fire_reaches_every_listener() {
        let emitter: Emitter<i32> = Emitter::new();
        let (a, listen_a) = recorder();
        let (b, listen_b) = recorder();
        let _sa = emitter.event().listen(listen_a);
        let _sb = emitter.event().listen(listen_b);

        emitter.fire(7);

        assert_eq!(*a.lock().unwrap(), vec![7]);
        assert_eq!(*b.lock().unwrap(), vec![7]);
    }

    #[test]
    fn test_dispose_subscription_removes_only_that_listener() {
        let emitter: Emitter<i32> = Emitter::new();
        let (a, listen_a) = recorder();
        let (b, listen_b) = recorder();
        let sa = emitter.event().listen(listen_a);
        let _sb = emitter.event().listen(listen_b);

        sa.dispose();
        sa.dispose();
        emitter.fire(1);

        assert!(a.lock().unwrap().is_empty());
        assert_eq!(*b.lock().unwrap(), vec![1]);
        assert_eq!(emitter.listener_count(), 1);
    }

    #[test]
    fn test_self_removal_during_fire_keeps_pass_intact() {
        let emitter: Emitter<i32> = Emitter::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let own: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

        let sub = emitter.event().listen({
            let own = Arc::clone(&own);
            let calls = Arc::clone(&calls);
            move |_: &i32| {
                calls.fetch_add(1, Ordering::SeqCst);
                if let Some(sub) = own.lock().unwrap().take() {
                    sub.dispose();
                }
            }
        });
        *own.lock().unwrap() = Some(sub);

        let (others, listen_others) = recorder();
        let _s = emitter.event().listen(listen_others);

        emitter.fire(1);
        emitter.fire(2);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(*others.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_removing_sibling_mid_pass_still_delivers_this_pass() {
        let emitter: Emitter<i32> = Emitter::new();
        let victim: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

        let _killer = emitter.event().listen({
            let victim = Arc::clone(&victim);
            move |_: &i32| {
                if let Some(sub) = victim.lock().unwrap().take() {
                    sub.dispose();
                }
            }
        });
        let (seen, listen_victim) = recorder();
        *victim.lock().unwrap() = Some(emitter.event().listen(listen_victim));

        emitter.fire(1);
        emitter.fire(2);

        assert_eq!(*seen.lock().unwrap(), vec![1]);
    }

    #[test]
    fn test_once_unsubscribes_after_first_value() {
        let emitter: Emitter<i32> = Emitter::new();
        let (seen, listen) = recorder();
        let _sub = emitter.event().once(move |v| listen(v));

        emitter.fire(1);
        emitter.fire(2);

        assert_eq!(*seen.lock().unwrap(), vec![1]);
        assert!(!emitter.has_listeners());
    }

    #[test]
    fn test_listen_after_dispose_is_noop() {
        let emitter: Emitter<i32> = Emitter::new();
        emitter.dispose();

        let (seen, listen) = recorder();
        let sub = emitter.event().listen(listen);
        emitter.fire(1);
        sub.dispose();

        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(emitter.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_listen_once_matches_predicate() {
        let emitter: Emitter<i32> = Emitter::new();
        let event = emitter.event();
        let mut waiter = task::spawn(async move { listen_once(&event, |v: &i32| *v > 2).await });

        assert_pending!(waiter.poll());
        emitter.fire(1);
        assert_pending!(waiter.poll());
        emitter.fire(3);
        emitter.fire(4);

        assert_ready_eq!(waiter.poll(), Ok(3));
        assert!(!emitter.has_listeners());
    }

    #[tokio::test]
    async fn test_listen_once_reports_disposal() {
        let emitter: Emitter<i32> = Emitter::new();
        let event = emitter.event();
        let mut waiter = task::spawn(async move { listen_once(&event, |_| true).await });

        assert_pending!(waiter.poll());
        emitter.dispose();

        assert_ready_eq!(waiter.poll(), Err(EventError::Disposed));
    }

    #[tokio::test]
    async fn test_dropped_listen_once_unsubscribes() {
        let emitter: Emitter<i32> = Emitter::new();
        let event = emitter.event();
        let mut waiter = task::spawn(async move { listen_once(&event, |_| true).await });

        assert_pending!(waiter.poll());
        assert_eq!(emitter.listener_count(), 1);
        drop(waiter);

        assert_eq!(emitter.listener_count(), 0);
    }
}

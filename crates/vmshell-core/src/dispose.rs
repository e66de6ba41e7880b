//! Scoped resource ownership with idempotent, cascading release.

use std::{
    ops::Deref,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

/// A resource with explicit release.
///
/// Implementations must tolerate `dispose` being called more than once;
/// only the first call has an effect.
pub trait Disposable: Send + Sync {
    /// Release the resource.
    fn dispose(&self);
}

impl<D: Disposable + ?Sized> Disposable for Arc<D> {
    fn dispose(&self) {
        (**self).dispose();
    }
}

impl<D: Disposable + ?Sized> Disposable for Box<D> {
    fn dispose(&self) {
        (**self).dispose();
    }
}

/// Lock a std mutex, recovering the data if a panicking holder poisoned it.
///
/// Teardown isolates panics, so a poisoned lock only means a listener or
/// hook panicked while the state was consistent.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

type Hook = Box<dyn FnOnce() + Send>;

/// A teardown closure that runs on the first `dispose` only.
pub struct DisposeFn {
    hook: Mutex<Option<Hook>>,
}

impl DisposeFn {
    /// Wrap a teardown closure.
    #[must_use]
    pub fn new(hook: impl FnOnce() + Send + 'static) -> Self {
        Self {
            hook: Mutex::new(Some(Box::new(hook))),
        }
    }
}

impl Disposable for DisposeFn {
    fn dispose(&self) {
        // Take before running so a re-entrant dispose from inside the hook is a no-op.
        let hook = lock(&self.hook).take();
        if let Some(hook) = hook {
            hook();
        }
    }
}

/// Disposes the wrapped resource when dropped.
///
/// Ties a resource to a scope, including futures that are cancelled while
/// suspended.
pub struct DisposeGuard<D: Disposable>(D);

impl<D: Disposable> DisposeGuard<D> {
    /// Guard `inner` until the end of the current scope.
    pub const fn new(inner: D) -> Self {
        Self(inner)
    }
}

impl<D: Disposable> Deref for DisposeGuard<D> {
    type Target = D;

    fn deref(&self) -> &D {
        &self.0
    }
}

impl<D: Disposable> Drop for DisposeGuard<D> {
    fn drop(&mut self) {
        self.0.dispose();
    }
}

#[derive(Default)]
struct StoreState {
    disposed: bool,
    children: Vec<Box<dyn Disposable>>,
}

/// Owns zero or more child resources and releases each of them exactly once.
///
/// Once disposed, the store stays disposed: children registered afterwards
/// are released immediately instead of being retained.
#[derive(Default)]
pub struct DisposableStore {
    state: Mutex<StoreState>,
}

impl DisposableStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a shared child and hand it back for chaining.
    pub fn add<D>(&self, child: Arc<D>) -> Arc<D>
    where
        D: Disposable + ?Sized + 'static,
    {
        self.push(Arc::clone(&child));
        child
    }

    /// Register an owned child.
    pub fn push(&self, child: impl Disposable + 'static) {
        let mut state = lock(&self.state);
        if state.disposed {
            drop(state);
            tracing::warn!("Registering on a disposed store, releasing child immediately");
            child.dispose();
            return;
        }
        state.children.push(Box::new(child));
    }

    /// Register a teardown closure.
    pub fn on_dispose(&self, hook: impl FnOnce() + Send + 'static) {
        self.push(DisposeFn::new(hook));
    }

    /// Release the current children but keep the store usable.
    pub fn clear(&self) {
        let children = std::mem::take(&mut lock(&self.state).children);
        release_all(children);
    }

    /// Whether `dispose` has been called.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        lock(&self.state).disposed
    }

    /// Number of children currently owned.
    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.state).children.len()
    }

    /// Whether the store owns no children.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Disposable for DisposableStore {
    fn dispose(&self) {
        let children = {
            let mut state = lock(&self.state);
            if state.disposed {
                return;
            }
            state.disposed = true;
            std::mem::take(&mut state.children)
        };
        release_all(children);
    }
}

impl Drop for DisposableStore {
    fn drop(&mut self) {
        // A second panic while unwinding would abort, so teardown panics stop here.
        if panic::catch_unwind(AssertUnwindSafe(|| self.dispose())).is_err() {
            tracing::debug!("Child teardown panicked while dropping store");
        }
    }
}

/// Release every child even if some of them panic, then re-raise the first panic.
fn release_all(children: Vec<Box<dyn Disposable>>) {
    let mut first_panic = None;
    for child in children {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| child.dispose())) {
            first_panic.get_or_insert(payload);
        }
    }
    if let Some(payload) = first_panic {
        panic::resume_unwind(payload);
    }
}

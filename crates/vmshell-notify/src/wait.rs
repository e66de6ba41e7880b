//! Race-free wait for a matching notification.

use vmshell_core::{Barrier, BarrierResult, DisposeGuard, Event};

use crate::error::NotifyError;

/// Wait until `current` reports a value or `event` fires one matching
/// `predicate`.
///
/// The listener is registered before `current` is consulted, so a value that
/// arrives in between is not missed. If the event source is torn down while
/// waiting, resolves with [`NotifyError::Disposed`].
pub(crate) async fn wait_for<T, P>(
    event: &Event<T>,
    current: impl FnOnce() -> Option<T>,
    predicate: P,
) -> Result<T, NotifyError>
where
    T: Clone + Send + Sync + 'static,
    P: Fn(&T) -> bool + Send + Sync + 'static,
{
    let gate = Barrier::new();
    // The listener owns a guard on the gate: when the source drops the
    // listener, pending waiters observe the disposal.
    let opener = DisposeGuard::new(gate.clone());
    let _subscription = DisposeGuard::new(event.listen(move |value: &T| {
        if predicate(value) {
            opener.open(value.clone());
        }
    }));

    if let Some(value) = current() {
        return Ok(value);
    }
    match gate.wait().await {
        BarrierResult::Opened(value) => Ok(value),
        BarrierResult::Disposed => Err(NotifyError::Disposed),
    }
}

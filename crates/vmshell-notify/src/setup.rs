//! Setup progress tracking.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use vmshell_core::{
    Disposable, DisposableStore, Emitter, Event, SetupClient, SetupProgress, SetupState, SetupStep,
};

use crate::{error::NotifyError, wait::wait_for};

fn lock(progress: &Mutex<SetupProgress>) -> MutexGuard<'_, SetupProgress> {
    progress.lock().unwrap_or_else(PoisonError::into_inner)
}

const fn is_complete(state: SetupState) -> bool {
    matches!(state, SetupState::Finished | SetupState::Stopped)
}

/// Latest progress of the VM's setup tasks.
pub struct Setup {
    progress: Arc<Mutex<SetupProgress>>,
    emitter: Arc<Emitter<SetupProgress>>,
    store: DisposableStore,
}

impl Setup {
    /// Fetch the current progress and start following updates.
    ///
    /// # Errors
    /// Returns error if the initial progress cannot be fetched.
    pub async fn connect(client: Arc<dyn SetupClient>) -> Result<Self, NotifyError> {
        let initial = client.get_progress().await?;
        tracing::debug!(
            state = ?initial.state,
            steps = initial.steps.len(),
            "Setup progress loaded"
        );

        let setup = Self {
            progress: Arc::new(Mutex::new(initial)),
            emitter: Arc::new(Emitter::new()),
            store: DisposableStore::new(),
        };
        setup.store.add(Arc::clone(&setup.emitter));

        let progress = Arc::clone(&setup.progress);
        let emitter = Arc::clone(&setup.emitter);
        setup.store.push(client.on_progress().listen(move |update: &SetupProgress| {
            let previous = std::mem::replace(&mut *lock(&progress), update.clone());
            if previous.state != update.state {
                tracing::info!(from = ?previous.state, to = ?update.state, "Setup state changed");
            }
            emitter.fire(update.clone());
        }));
        Ok(setup)
    }

    /// Latest known progress.
    #[must_use]
    pub fn progress(&self) -> SetupProgress {
        lock(&self.progress).clone()
    }

    /// The step currently being worked on, if any.
    #[must_use]
    pub fn current_step(&self) -> Option<SetupStep> {
        let progress = lock(&self.progress);
        progress.steps.get(progress.current_step_index).cloned()
    }

    /// Progress updates.
    #[must_use]
    pub fn on_progress(&self) -> Event<SetupProgress> {
        self.emitter.event()
    }

    /// Wait until setup has finished or been stopped.
    ///
    /// # Errors
    /// Returns [`NotifyError::Disposed`] if this tracker is disposed first.
    pub async fn wait_until_complete(&self) -> Result<SetupProgress, NotifyError> {
        let event = self.emitter.event();
        wait_for(
            &event,
            || {
                let progress = self.progress();
                is_complete(progress.state).then_some(progress)
            },
            |progress: &SetupProgress| is_complete(progress.state),
        )
        .await
    }
}

impl Disposable for Setup {
    fn dispose(&self) {
        self.store.dispose();
    }
}

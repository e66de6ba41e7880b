//! Handle for one remote shell.

use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError,
    atomic::{AtomicBool, Ordering},
};

use futures::stream::BoxStream;
use vmshell_core::{
    Disposable, DisposableStore, Emitter, Event, OutputBuffer, RemoteError, ShellClient,
    ShellDescriptor, ShellId, ShellSize, ShellStatus,
};

use crate::error::ShellError;

/// Mutable per-shell state. Only notification handlers keyed to this
/// shell's id and the handle's own methods mutate it.
#[derive(Debug, Clone)]
struct ShellState {
    name: String,
    status: ShellStatus,
    exit_code: Option<i32>,
}

impl ShellState {
    /// Apply a status transition, returning the new status if it changed.
    fn transition(&mut self, status: ShellStatus, exit_code: Option<i32>) -> Option<ShellStatus> {
        if status == ShellStatus::Restarting {
            self.exit_code = None;
        } else if exit_code.is_some() {
            self.exit_code = exit_code;
        }
        (self.status != status).then(|| {
            self.status = status;
            status
        })
    }
}

fn lock(state: &Mutex<ShellState>) -> MutexGuard<'_, ShellState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Owned, disposable handle around one remote shell.
///
/// Tracks status and exit code, keeps a bounded display buffer of recent
/// output, and exposes write/kill/rename/restart. Disposing the handle
/// releases its subscriptions and detaches from the remote shell on a
/// best-effort basis; the remote process keeps running.
pub struct ShellInstance {
    id: ShellId,
    command: String,
    size: ShellSize,
    client: Arc<dyn ShellClient>,
    state: Arc<Mutex<ShellState>>,
    output: Arc<OutputBuffer>,
    output_emitter: Arc<Emitter<String>>,
    status_emitter: Arc<Emitter<ShellStatus>>,
    /// Set once the remote shell is known to be deleted, so disposal skips detaching.
    remote_gone: Arc<AtomicBool>,
    store: DisposableStore,
}

impl ShellInstance {
    /// Wrap a descriptor returned by the remote.
    ///
    /// A shell that is already terminal gets no subscriptions: no further
    /// events are expected for it.
    pub(crate) fn attach(
        client: Arc<dyn ShellClient>,
        descriptor: ShellDescriptor,
        size: ShellSize,
        output_capacity: usize,
    ) -> Arc<Self> {
        let ShellDescriptor {
            id,
            name,
            command,
            status,
            exit_code,
            buffer,
        } = descriptor;

        let instance = Arc::new(Self {
            state: Arc::new(Mutex::new(ShellState {
                name,
                status,
                exit_code,
            })),
            output: Arc::new(OutputBuffer::with_history(output_capacity, buffer)),
            output_emitter: Arc::new(Emitter::new()),
            status_emitter: Arc::new(Emitter::new()),
            remote_gone: Arc::new(AtomicBool::new(false)),
            store: DisposableStore::new(),
            id,
            command,
            size,
            client,
        });

        instance.store.add(Arc::clone(&instance.output_emitter));
        instance.store.add(Arc::clone(&instance.status_emitter));
        instance.register_close_on_dispose();
        if !status.is_terminal() {
            instance.subscribe();
        }
        instance
    }

    fn register_close_on_dispose(&self) {
        let client = Arc::clone(&self.client);
        let id = self.id.clone();
        let remote_gone = Arc::clone(&self.remote_gone);
        self.store.on_dispose(move || {
            if remote_gone.load(Ordering::Acquire) {
                return;
            }
            // Best-effort: closing a shell the remote already dropped is not an error.
            let Ok(handle) = tokio::runtime::Handle::try_current() else {
                tracing::debug!(shell_id = %id, "No runtime available, skipping remote close");
                return;
            };
            handle.spawn(async move {
                if let Err(e) = client.close(&id).await {
                    tracing::debug!(shell_id = %id, error = %e, "Ignoring remote close failure");
                }
            });
        });
    }

    fn subscribe(&self) {
        let id = self.id.clone();
        let output = Arc::clone(&self.output);
        let output_emitter = Arc::clone(&self.output_emitter);
        self.store.push(self.client.on_output().listen(move |event| {
            if event.id != id {
                return;
            }
            output.push(event.chunk.clone());
            output_emitter.fire(event.chunk.clone());
        }));

        let id = self.id.clone();
        let state = Arc::clone(&self.state);
        let status_emitter = Arc::clone(&self.status_emitter);
        self.store.push(self.client.on_exited().listen(move |event| {
            if event.id != id {
                return;
            }
            let changed = lock(&state).transition(ShellStatus::Finished, Some(event.exit_code));
            if let Some(status) = changed {
                status_emitter.fire(status);
            }
        }));

        let id = self.id.clone();
        let state = Arc::clone(&self.state);
        let status_emitter = Arc::clone(&self.status_emitter);
        self.store.push(self.client.on_terminated().listen(move |event| {
            if event.id != id {
                return;
            }
            let changed = lock(&state).transition(ShellStatus::Killed, None);
            if let Some(status) = changed {
                status_emitter.fire(status);
            }
        }));

        let id = self.id.clone();
        let state = Arc::clone(&self.state);
        let status_emitter = Arc::clone(&self.status_emitter);
        self.store.push(self.client.on_shells_updated().listen(move |shells| {
            let Some(update) = shells.iter().find(|shell| shell.id == id) else {
                return;
            };
            let changed = {
                let mut state = lock(&state);
                state.name.clone_from(&update.name);
                state.transition(update.status, update.exit_code)
            };
            if let Some(status) = changed {
                status_emitter.fire(status);
            }
        }));
    }

    /// Remote shell id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Command the shell was started with.
    #[must_use]
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Current display name.
    #[must_use]
    pub fn name(&self) -> String {
        lock(&self.state).name.clone()
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> ShellStatus {
        lock(&self.state).status
    }

    /// Exit code, once the process exited normally.
    #[must_use]
    pub fn exit_code(&self) -> Option<i32> {
        lock(&self.state).exit_code
    }

    /// Retained output chunks joined by newlines.
    #[must_use]
    pub fn get_output(&self) -> String {
        self.output.joined()
    }

    /// Retained output chunks, oldest first.
    #[must_use]
    pub fn output_chunks(&self) -> Vec<String> {
        self.output.chunks()
    }

    /// Retained output followed by live chunks.
    #[must_use]
    pub fn output_stream(&self) -> BoxStream<'static, String> {
        self.output.history_plus_stream()
    }

    /// Live output chunks.
    #[must_use]
    pub fn on_output(&self) -> Event<String> {
        self.output_emitter.event()
    }

    /// Status changes.
    #[must_use]
    pub fn on_status_change(&self) -> Event<ShellStatus> {
        self.status_emitter.event()
    }

    /// Whether the handle has been disposed.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.store.is_disposed()
    }

    fn ensure_live(&self) -> Result<(), ShellError> {
        if self.is_disposed() {
            return Err(ShellError::Disposed(self.id.clone()));
        }
        Ok(())
    }

    /// Send input to the shell.
    ///
    /// # Errors
    /// Returns error if the handle is disposed or the remote rejects the input.
    pub async fn write(&self, input: &str) -> Result<(), ShellError> {
        self.ensure_live()?;
        self.client.send(&self.id, input, self.size).await?;
        Ok(())
    }

    /// Rename the shell remotely and locally.
    ///
    /// # Errors
    /// Returns error if the handle is disposed or the remote rename fails.
    pub async fn rename(&self, name: &str) -> Result<(), ShellError> {
        self.ensure_live()?;
        self.client.rename(&self.id, name).await?;
        name.clone_into(&mut lock(&self.state).name);
        Ok(())
    }

    /// Restart the process under the same id.
    ///
    /// The exit code is cleared; the display buffer is kept.
    ///
    /// # Errors
    /// Returns error if the handle is disposed or the remote restart fails.
    pub async fn restart(&self) -> Result<(), ShellError> {
        self.ensure_live()?;
        // Transition first: the remote may report the new process while the request is in flight.
        let previous = lock(&self.state).clone();
        let changed = lock(&self.state).transition(ShellStatus::Restarting, None);
        if let Some(status) = changed {
            self.status_emitter.fire(status);
        }

        if let Err(e) = self.client.restart(&self.id).await {
            let reverted = {
                let mut state = lock(&self.state);
                let reverted = (state.status != previous.status).then_some(previous.status);
                state.status = previous.status;
                state.exit_code = previous.exit_code;
                reverted
            };
            if let Some(status) = reverted {
                self.status_emitter.fire(status);
            }
            return Err(e.into());
        }
        Ok(())
    }

    /// Stop the remote process and dispose the handle.
    ///
    /// A shell the remote no longer knows about counts as already killed.
    ///
    /// # Errors
    /// Returns error if the remote delete fails for any other reason.
    pub async fn kill(&self) -> Result<(), ShellError> {
        self.ensure_live()?;
        match self.client.delete(&self.id).await {
            Ok(()) | Err(RemoteError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        self.remote_gone.store(true, Ordering::Release);
        tracing::info!(shell_id = %self.id, "Killed shell");

        let changed = lock(&self.state).transition(ShellStatus::Killed, None);
        if let Some(status) = changed {
            self.status_emitter.fire(status);
        }
        self.dispose();
        Ok(())
    }
}

impl Disposable for ShellInstance {
    fn dispose(&self) {
        self.store.dispose();
    }
}

//! Shell manager for orchestrating remote shells.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use vmshell_core::{
    AsyncEmitter, AsyncEvent, Disposable, DisposableStore, RemoteError, ShellClient,
    ShellDescriptor, ShellId, ShellKind, ShellSize,
};

use crate::{
    command::{RunningCommand, Teardown},
    command_line::CommandLine,
    config::ShellConfig,
    error::ShellError,
    instance::ShellInstance,
};

/// Options for an interactive shell.
#[derive(Debug, Clone, Default)]
pub struct ShellOptions {
    /// Working directory, defaults to the configured one.
    pub cwd: Option<String>,
    /// Display name set right after creation.
    pub name: Option<String>,
    /// Terminal size, defaults to the configured one.
    pub size: Option<ShellSize>,
}

/// Options for a command run.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Environment assignments, applied over the configured defaults.
    pub env: BTreeMap<String, String>,
    /// Working directory, defaults to the configured one.
    pub cwd: Option<String>,
    /// Display name set right after creation.
    pub name: Option<String>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Registry of shell handles created through one protocol client.
///
/// Handles are looked up by id rather than holding a reference back to the
/// manager. Disposing the manager disposes every handle and cancels every
/// command run still in flight.
pub struct ShellManager {
    client: Arc<dyn ShellClient>,
    config: ShellConfig,
    active_shells: Mutex<HashMap<ShellId, Arc<ShellInstance>>>,
    running_commands: Mutex<Vec<Teardown>>,
    will_shutdown: Arc<AsyncEmitter<()>>,
    store: DisposableStore,
}

impl ShellManager {
    /// Create a new shell manager.
    #[must_use]
    pub fn new(client: Arc<dyn ShellClient>, config: ShellConfig) -> Self {
        let will_shutdown = Arc::new(AsyncEmitter::new(config.shutdown_timeout()));
        let store = DisposableStore::new();
        store.add(Arc::clone(&will_shutdown));
        Self {
            client,
            config,
            active_shells: Mutex::new(HashMap::new()),
            running_commands: Mutex::new(Vec::new()),
            will_shutdown,
            store,
        }
    }

    /// Configuration shared by every shell.
    #[must_use]
    pub const fn config(&self) -> &ShellConfig {
        &self.config
    }

    /// Whether the manager has been disposed.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.store.is_disposed()
    }

    fn ensure_live(&self) -> Result<(), ShellError> {
        if self.is_disposed() {
            return Err(ShellError::ManagerDisposed);
        }
        Ok(())
    }

    fn register(&self, instance: &Arc<ShellInstance>) {
        let previous = lock(&self.active_shells)
            .insert(instance.id().to_string(), Arc::clone(instance));
        if let Some(previous) = previous {
            if !Arc::ptr_eq(&previous, instance) {
                previous.dispose();
            }
        }
        // Manager disposal raced with the remote call.
        if self.is_disposed() {
            instance.dispose();
        }
    }

    /// Start a new interactive shell.
    ///
    /// # Errors
    /// Returns error if the manager is disposed or the remote create or
    /// rename fails.
    pub async fn create(
        &self,
        command: &str,
        options: ShellOptions,
    ) -> Result<Arc<ShellInstance>, ShellError> {
        self.ensure_live()?;
        let cwd = options.cwd.as_deref().unwrap_or(&self.config.working_dir);
        let size = options.size.unwrap_or(self.config.size);

        let descriptor = self
            .client
            .create(cwd, size, command, ShellKind::Terminal, true)
            .await?;

        tracing::info!(shell_id = %descriptor.id, command, "Created shell");
        // Attach before any further remote call so no notification is missed.
        let instance = ShellInstance::attach(
            Arc::clone(&self.client),
            descriptor,
            size,
            self.config.output_capacity,
        );
        if let Some(name) = options.name {
            if let Err(e) = instance.rename(&name).await {
                if let Err(cleanup) = instance.kill().await {
                    tracing::debug!(
                        shell_id = %instance.id(),
                        error = %cleanup,
                        "Ignoring remote delete failure"
                    );
                    instance.dispose();
                }
                return Err(e);
            }
        }
        self.register(&instance);
        Ok(instance)
    }

    /// Attach to an existing remote shell.
    ///
    /// A live handle already registered for `id` is returned as is. A shell
    /// the remote reports as finished is reflected immediately.
    ///
    /// # Errors
    /// Returns [`ShellError::NotFound`] if the remote does not know `id`.
    pub async fn open(&self, id: &str) -> Result<Arc<ShellInstance>, ShellError> {
        self.ensure_live()?;
        if let Some(instance) = self.get(id) {
            return Ok(instance);
        }

        let descriptor = self
            .client
            .open(id, self.config.size)
            .await
            .map_err(|e| not_found(id, e))?;

        tracing::info!(shell_id = %id, status = ?descriptor.status, "Opened shell");
        let instance = ShellInstance::attach(
            Arc::clone(&self.client),
            descriptor,
            self.config.size,
            self.config.output_capacity,
        );
        self.register(&instance);
        Ok(instance)
    }

    /// Run a command in a dedicated, non-interactive remote shell.
    ///
    /// Configured environment defaults are applied first and `options.env`
    /// overrides them. The returned handle is cancelled if the manager is
    /// disposed before the run settles.
    ///
    /// # Errors
    /// Returns error if the command line cannot be built or the remote
    /// create or rename fails.
    pub async fn run(
        &self,
        command: &str,
        options: RunOptions,
    ) -> Result<RunningCommand, ShellError> {
        self.ensure_live()?;
        let line = CommandLine::new(command)
            .envs(self.config.env.clone())
            .envs(options.env)
            .build()?;
        let cwd = options.cwd.as_deref().unwrap_or(&self.config.working_dir);

        let descriptor = self
            .client
            .create(cwd, self.config.size, &line, ShellKind::Command, false)
            .await?;

        tracing::info!(shell_id = %descriptor.id, command = %line, "Running command");
        // Subscribe before any further remote call so an early exit is not missed.
        let running = RunningCommand::start(Arc::clone(&self.client), descriptor);
        if let Some(name) = &options.name {
            if let Err(e) = self.client.rename(running.id(), name).await {
                running.kill().await;
                return Err(e.into());
            }
        }
        if !running.is_settled() {
            let teardown = running.teardown();
            {
                let mut commands = lock(&self.running_commands);
                commands.retain(|command| !command.is_settled());
                commands.push(teardown);
            }
            if self.is_disposed() {
                self.dispose_commands();
            }
        }
        Ok(running)
    }

    /// All shells known to the remote.
    ///
    /// # Errors
    /// Returns error if the remote list fails.
    pub async fn list(&self) -> Result<Vec<ShellDescriptor>, ShellError> {
        Ok(self.client.list().await?)
    }

    /// Live handle registered for `id`.
    ///
    /// Disposed handles are pruned on lookup.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<ShellInstance>> {
        let mut shells = lock(&self.active_shells);
        match shells.get(id) {
            Some(instance) if instance.is_disposed() => {
                shells.remove(id);
                None
            }
            found => found.cloned(),
        }
    }

    /// Live handles, in no particular order.
    #[must_use]
    pub fn instances(&self) -> Vec<Arc<ShellInstance>> {
        let mut shells = lock(&self.active_shells);
        shells.retain(|_, instance| !instance.is_disposed());
        shells.values().cloned().collect()
    }

    /// Rename a shell by id.
    ///
    /// The registered handle is updated too, if there is one.
    ///
    /// # Errors
    /// Returns [`ShellError::NotFound`] if the remote does not know `id`.
    pub async fn rename(&self, id: &str, name: &str) -> Result<(), ShellError> {
        self.ensure_live()?;
        match self.get(id) {
            Some(instance) => instance.rename(name).await.map_err(|e| match e {
                ShellError::Remote(e) => not_found(id, e),
                other => other,
            }),
            None => self
                .client
                .rename(id, name)
                .await
                .map_err(|e| not_found(id, e)),
        }
    }

    /// Async listeners run by [`shutdown`](Self::shutdown) before handles
    /// are disposed. They share one deadline of `shutdown_timeout`.
    #[must_use]
    pub fn on_will_shutdown(&self) -> AsyncEvent<()> {
        self.will_shutdown.event()
    }

    /// Notify shutdown listeners, then dispose every handle.
    ///
    /// Disposal happens even if the broadcast fails.
    ///
    /// # Errors
    /// Returns [`ShellError::Shutdown`] if a listener failed or the deadline
    /// elapsed.
    pub async fn shutdown(&self) -> Result<(), ShellError> {
        if self.is_disposed() {
            return Ok(());
        }
        tracing::info!(listeners = self.will_shutdown.listener_count(), "Shutting down shells");
        let notified = self.will_shutdown.fire(()).await;
        if let Err(e) = &notified {
            tracing::warn!(error = %e, "Shutdown listeners did not all complete");
        }
        self.dispose();
        notified.map_err(Into::into)
    }

    fn dispose_commands(&self) {
        let commands = std::mem::take(&mut *lock(&self.running_commands));
        let teardown = DisposableStore::new();
        for command in commands {
            teardown.push(command);
        }
        teardown.dispose();
    }
}

/// Map a remote "not found" into the caller-facing error for `id`.
fn not_found(id: &str, error: RemoteError) -> ShellError {
    match error {
        RemoteError::NotFound(_) => ShellError::NotFound(id.to_string()),
        other => ShellError::Remote(other),
    }
}

impl Disposable for ShellManager {
    fn dispose(&self) {
        if self.store.is_disposed() {
            return;
        }
        self.store.dispose();

        let shells: Vec<_> = lock(&self.active_shells).drain().map(|(_, shell)| shell).collect();
        tracing::debug!(shells = shells.len(), "Disposing shell handles");
        let teardown = DisposableStore::new();
        for shell in shells {
            teardown.push(shell);
        }
        teardown.dispose();
        self.dispose_commands();
    }
}

//! In-memory protocol collaborator.

use std::sync::{
    Mutex, MutexGuard, PoisonError, RwLock,
    atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use uuid::Uuid;
use vmshell_core::{
    Emitter, Event, RemoteError, ShellClient, ShellDescriptor, ShellExited, ShellId, ShellKind,
    ShellOutput, ShellSize, ShellStatus, ShellTerminated,
};

/// Create request as seen by the collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateRequest {
    pub working_dir: String,
    pub command: String,
    pub kind: ShellKind,
    pub interactive: bool,
}

/// Scripted outcome for commands containing `pattern`.
struct Script {
    pattern: String,
    output: Vec<String>,
    exit_code: i32,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-memory [`ShellClient`] implementation.
///
/// Useful for development, tests and the demo. Shells never run anything:
/// output, exits and terminations are injected through the helper methods,
/// which fire the matching notification after all internal locks are
/// released. Shells are listed in creation order.
pub struct MemoryShellClient {
    shells: RwLock<Vec<ShellDescriptor>>,
    scripts: Mutex<Vec<Script>>,
    created: Mutex<Vec<CreateRequest>>,
    sent: Mutex<Vec<(ShellId, String)>>,
    closed: Mutex<Vec<ShellId>>,
    deleted: Mutex<Vec<ShellId>>,
    fail_deletes: AtomicBool,
    fail_closes: AtomicBool,
    output: Emitter<ShellOutput>,
    exited: Emitter<ShellExited>,
    terminated: Emitter<ShellTerminated>,
    shells_updated: Emitter<Vec<ShellDescriptor>>,
}

impl MemoryShellClient {
    /// Create an empty collaborator.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shells: RwLock::new(Vec::new()),
            scripts: Mutex::new(Vec::new()),
            created: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
            closed: Mutex::new(Vec::new()),
            deleted: Mutex::new(Vec::new()),
            fail_deletes: AtomicBool::new(false),
            fail_closes: AtomicBool::new(false),
            output: Emitter::new(),
            exited: Emitter::new(),
            terminated: Emitter::new(),
            shells_updated: Emitter::new(),
        }
    }

    /// Make commands containing `pattern` report `FINISHED` at creation,
    /// with `output` already buffered.
    pub fn finish_on_create<I>(&self, pattern: &str, output: I, exit_code: i32)
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        lock(&self.scripts).push(Script {
            pattern: pattern.to_string(),
            output: output.into_iter().map(Into::into).collect(),
            exit_code,
        });
    }

    /// Register an existing remote shell.
    pub fn insert(&self, descriptor: ShellDescriptor) {
        self.write_shells().push(descriptor);
    }

    /// Deliver an output chunk.
    pub fn push_output(&self, id: &str, chunk: &str) {
        self.update(id, |shell| shell.buffer.push(chunk.to_string()));
        self.output.fire(ShellOutput {
            id: id.to_string(),
            chunk: chunk.to_string(),
        });
    }

    /// Deliver a normal exit.
    pub fn exit(&self, id: &str, exit_code: i32) {
        self.update(id, |shell| {
            shell.status = ShellStatus::Finished;
            shell.exit_code = Some(exit_code);
        });
        self.exited.fire(ShellExited {
            id: id.to_string(),
            exit_code,
        });
    }

    /// Deliver an abrupt termination.
    pub fn terminate(&self, id: &str) {
        self.update(id, |shell| shell.status = ShellStatus::Killed);
        self.terminated.fire(ShellTerminated { id: id.to_string() });
    }

    /// Change a shell's status and publish the updated list.
    pub fn set_status(&self, id: &str, status: ShellStatus) {
        self.update(id, |shell| shell.status = status);
        self.publish();
    }

    /// Make `delete` fail with a rejection.
    pub fn fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::Release);
    }

    /// Make `close` fail with a rejection.
    pub fn fail_closes(&self, fail: bool) {
        self.fail_closes.store(fail, Ordering::Release);
    }

    /// Current status of a shell, if it exists.
    #[must_use]
    pub fn status(&self, id: &str) -> Option<ShellStatus> {
        self.find(id).map(|shell| shell.status)
    }

    /// Current descriptor of a shell, if it exists.
    #[must_use]
    pub fn find(&self, id: &str) -> Option<ShellDescriptor> {
        self.read_shells().iter().find(|shell| shell.id == id).cloned()
    }

    /// Create requests received, oldest first.
    #[must_use]
    pub fn created(&self) -> Vec<CreateRequest> {
        lock(&self.created).clone()
    }

    /// Input received as `(id, input)` pairs.
    #[must_use]
    pub fn sent(&self) -> Vec<(ShellId, String)> {
        lock(&self.sent).clone()
    }

    /// Ids detached through `close`.
    #[must_use]
    pub fn closed(&self) -> Vec<ShellId> {
        lock(&self.closed).clone()
    }

    /// Ids stopped through `delete`.
    #[must_use]
    pub fn deleted(&self) -> Vec<ShellId> {
        lock(&self.deleted).clone()
    }

    /// Listeners registered across all notification streams.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.output.listener_count()
            + self.exited.listener_count()
            + self.terminated.listener_count()
            + self.shells_updated.listener_count()
    }

    fn read_shells(&self) -> std::sync::RwLockReadGuard<'_, Vec<ShellDescriptor>> {
        self.shells.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_shells(&self) -> std::sync::RwLockWriteGuard<'_, Vec<ShellDescriptor>> {
        self.shells.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn update(&self, id: &str, apply: impl FnOnce(&mut ShellDescriptor)) -> bool {
        let mut shells = self.write_shells();
        shells
            .iter_mut()
            .find(|shell| shell.id == id)
            .map(apply)
            .is_some()
    }

    fn publish(&self) {
        let snapshot = self.read_shells().clone();
        self.shells_updated.fire(snapshot);
    }

    fn scripted(&self, command: &str) -> Option<(Vec<String>, i32)> {
        lock(&self.scripts)
            .iter()
            .find(|script| command.contains(&script.pattern))
            .map(|script| (script.output.clone(), script.exit_code))
    }
}

impl Default for MemoryShellClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ShellClient for MemoryShellClient {
    async fn create(
        &self,
        working_dir: &str,
        _size: ShellSize,
        command: &str,
        kind: ShellKind,
        interactive: bool,
    ) -> Result<ShellDescriptor, RemoteError> {
        lock(&self.created).push(CreateRequest {
            working_dir: working_dir.to_string(),
            command: command.to_string(),
            kind,
            interactive,
        });

        let (status, exit_code, buffer) = match self.scripted(command) {
            Some((output, code)) => (ShellStatus::Finished, Some(code), output),
            None => (ShellStatus::Running, None, Vec::new()),
        };
        let descriptor = ShellDescriptor {
            id: Uuid::new_v4().to_string(),
            name: command.to_string(),
            command: command.to_string(),
            status,
            exit_code,
            buffer,
        };
        self.write_shells().push(descriptor.clone());
        Ok(descriptor)
    }

    async fn open(&self, id: &str, _size: ShellSize) -> Result<ShellDescriptor, RemoteError> {
        self.find(id)
            .ok_or_else(|| RemoteError::NotFound(id.to_string()))
    }

    async fn send(&self, id: &str, input: &str, _size: ShellSize) -> Result<(), RemoteError> {
        if self.find(id).is_none() {
            return Err(RemoteError::NotFound(id.to_string()));
        }
        lock(&self.sent).push((id.to_string(), input.to_string()));
        Ok(())
    }

    async fn rename(&self, id: &str, name: &str) -> Result<(), RemoteError> {
        if !self.update(id, |shell| name.clone_into(&mut shell.name)) {
            return Err(RemoteError::NotFound(id.to_string()));
        }
        self.publish();
        Ok(())
    }

    async fn restart(&self, id: &str) -> Result<(), RemoteError> {
        if !self.update(id, |shell| {
            shell.status = ShellStatus::Restarting;
            shell.exit_code = None;
        }) {
            return Err(RemoteError::NotFound(id.to_string()));
        }
        self.publish();
        self.update(id, |shell| shell.status = ShellStatus::Running);
        self.publish();
        Ok(())
    }

    async fn close(&self, id: &str) -> Result<(), RemoteError> {
        if self.fail_closes.load(Ordering::Acquire) {
            return Err(RemoteError::Rejected {
                code: 500,
                message: "close failed".into(),
            });
        }
        if self.find(id).is_none() {
            return Err(RemoteError::NotFound(id.to_string()));
        }
        lock(&self.closed).push(id.to_string());
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), RemoteError> {
        if self.fail_deletes.load(Ordering::Acquire) {
            return Err(RemoteError::Rejected {
                code: 500,
                message: "delete failed".into(),
            });
        }
        let removed = {
            let mut shells = self.write_shells();
            let before = shells.len();
            shells.retain(|shell| shell.id != id);
            shells.len() != before
        };
        if !removed {
            return Err(RemoteError::NotFound(id.to_string()));
        }
        lock(&self.deleted).push(id.to_string());
        self.terminated.fire(ShellTerminated { id: id.to_string() });
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ShellDescriptor>, RemoteError> {
        Ok(self.read_shells().clone())
    }

    fn on_output(&self) -> Event<ShellOutput> {
        self.output.event()
    }

    fn on_exited(&self) -> Event<ShellExited> {
        self.exited.event()
    }

    fn on_terminated(&self) -> Event<ShellTerminated> {
        self.terminated.event()
    }

    fn on_shells_updated(&self) -> Event<Vec<ShellDescriptor>> {
        self.shells_updated.event()
    }
}

//! Execution handle for a single command run.

use std::{
    future::IntoFuture,
    sync::{Arc, Mutex, PoisonError},
};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use vmshell_core::{
    Barrier, BarrierResult, Disposable, DisposableStore, Emitter, Event, ShellClient,
    ShellDescriptor, ShellId,
};

/// Settled outcome of a command run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResult {
    /// Combined output, trimmed of surrounding whitespace.
    pub output: String,
    /// `None` means the process ended through disconnect or forced
    /// termination, never a normal exit.
    pub exit_code: Option<i32>,
}

impl CommandResult {
    /// Whether the process exited normally with code 0.
    #[must_use]
    pub const fn success(&self) -> bool {
        matches!(self.exit_code, Some(0))
    }
}

/// Per-run concatenation of every output chunk.
#[derive(Default)]
struct Accumulator(Mutex<String>);

impl Accumulator {
    fn append(&self, chunk: &str) {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).push_str(chunk);
    }

    fn snapshot(&self) -> String {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn settle(&self, exit_code: Option<i32>) -> CommandResult {
        CommandResult {
            output: self.snapshot().trim().to_string(),
            exit_code,
        }
    }
}

/// Teardown shared by `kill` and owner disposal.
struct Execution {
    id: ShellId,
    client: Arc<dyn ShellClient>,
    combined: Arc<Accumulator>,
    gate: Barrier<CommandResult>,
    subscriptions: Arc<DisposableStore>,
    output: Arc<Emitter<String>>,
}

impl Execution {
    /// Drop subscriptions and settle waiters as killed.
    /// Returns `true` if the run was still in flight.
    fn cancel(&self) -> bool {
        let in_flight = !self.gate.is_settled();
        self.subscriptions.dispose();
        self.gate.dispose();
        self.output.dispose();
        in_flight
    }
}

impl Disposable for Execution {
    fn dispose(&self) {
        if !self.cancel() {
            return;
        }
        // Best-effort: the remote may already have reaped the process.
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::debug!(shell_id = %self.id, "No runtime available, skipping remote delete");
            return;
        };
        let client = Arc::clone(&self.client);
        let id = self.id.clone();
        handle.spawn(async move {
            if let Err(e) = client.delete(&id).await {
                tracing::debug!(shell_id = %id, error = %e, "Ignoring remote delete failure");
            }
        });
    }
}

/// A command running in a dedicated remote shell.
///
/// Three separate capabilities: [`wait`](Self::wait) (or `.await`) yields the
/// settled [`CommandResult`], [`on_output`](Self::on_output) streams chunks
/// as they arrive, and [`kill`](Self::kill) cancels the run.
///
/// Only the first of {exit, termination} for this shell settles the run;
/// output and exit notifications may reach the client in either order, and
/// later notifications are ignored.
pub struct RunningCommand {
    execution: Arc<Execution>,
}

impl RunningCommand {
    /// Track a shell created for this run.
    ///
    /// Output the remote buffered before creation returned is captured
    /// first. If the remote already reports a terminal status, the run
    /// settles immediately without subscribing.
    pub(crate) fn start(client: Arc<dyn ShellClient>, descriptor: ShellDescriptor) -> Self {
        let combined = Arc::new(Accumulator::default());
        combined.append(&descriptor.buffer.concat());

        let execution = Arc::new(Execution {
            id: descriptor.id,
            client,
            combined,
            gate: Barrier::new(),
            subscriptions: Arc::new(DisposableStore::new()),
            output: Arc::new(Emitter::new()),
        });

        if descriptor.status.is_terminal() {
            tracing::debug!(
                shell_id = %execution.id,
                status = ?descriptor.status,
                "Command finished before subscribing"
            );
            execution
                .gate
                .open(execution.combined.settle(descriptor.exit_code));
            return Self { execution };
        }

        Self::subscribe(&execution);
        Self { execution }
    }

    fn subscribe(execution: &Arc<Execution>) {
        let client = &execution.client;
        let subscriptions = &execution.subscriptions;

        let id = execution.id.clone();
        let combined = Arc::clone(&execution.combined);
        let output = Arc::clone(&execution.output);
        subscriptions.push(client.on_output().listen(move |event| {
            if event.id != id {
                return;
            }
            combined.append(&event.chunk);
            output.fire(event.chunk.clone());
        }));

        let id = execution.id.clone();
        let combined = Arc::clone(&execution.combined);
        let gate = execution.gate.clone();
        let done = Arc::clone(subscriptions);
        subscriptions.push(client.on_exited().listen(move |event| {
            if event.id != id {
                return;
            }
            if gate.open(combined.settle(Some(event.exit_code))) {
                done.dispose();
            }
        }));

        let id = execution.id.clone();
        let combined = Arc::clone(&execution.combined);
        let gate = execution.gate.clone();
        let done = Arc::clone(subscriptions);
        subscriptions.push(client.on_terminated().listen(move |event| {
            if event.id != id {
                return;
            }
            if gate.open(combined.settle(None)) {
                done.dispose();
            }
        }));
    }

    /// Remote shell id of this run.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.execution.id
    }

    /// Live output chunks.
    #[must_use]
    pub fn on_output(&self) -> Event<String> {
        self.execution.output.event()
    }

    /// Output received so far, untrimmed.
    #[must_use]
    pub fn output_so_far(&self) -> String {
        self.execution.combined.snapshot()
    }

    /// Whether the run has settled.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.execution.gate.is_settled()
    }

    /// Wait for the run to settle.
    ///
    /// A killed run settles with the output seen so far and no exit code.
    pub async fn wait(&self) -> CommandResult {
        match self.execution.gate.wait().await {
            BarrierResult::Opened(result) => result,
            BarrierResult::Disposed => self.execution.combined.settle(None),
        }
    }

    /// Cancel the run.
    ///
    /// Tears down the notification subscriptions, settles waiters as killed
    /// and asks the remote to delete the shell. Delete failures are logged
    /// and ignored. A run that already settled keeps its result.
    pub async fn kill(&self) {
        if !self.execution.cancel() {
            return;
        }
        tracing::info!(shell_id = %self.execution.id, "Killing command");
        if let Err(e) = self.execution.client.delete(&self.execution.id).await {
            tracing::debug!(
                shell_id = %self.execution.id,
                error = %e,
                "Ignoring remote delete failure"
            );
        }
    }

    /// Disposable that cancels this run, for registration with an owner.
    pub(crate) fn teardown(&self) -> Teardown {
        Teardown(Arc::clone(&self.execution))
    }
}

/// Owner-side cancellation handle of a [`RunningCommand`].
pub(crate) struct Teardown(Arc<Execution>);

impl Teardown {
    /// Whether the run already settled and needs no teardown.
    pub(crate) fn is_settled(&self) -> bool {
        self.0.gate.is_settled()
    }
}

impl Disposable for Teardown {
    fn dispose(&self) {
        self.0.dispose();
    }
}

impl IntoFuture for RunningCommand {
    type Output = CommandResult;
    type IntoFuture = BoxFuture<'static, CommandResult>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move { self.wait().await })
    }
}

#[cfg(all(test, feature = "memory"))]
mod tests {
    use std::sync::Mutex;

    use tokio_test::{assert_pending, assert_ready_eq, task};
    use vmshell_core::{ShellKind, ShellSize, ShellStatus};

    use super::*;
    use crate::memory::MemoryShellClient;

    async fn start(client: &Arc<MemoryShellClient>, command: &str) -> RunningCommand {
        let descriptor = client
            .create("/project", ShellSize::default(), command, ShellKind::Command, false)
            .await
            .unwrap();
        RunningCommand::start(client.clone(), descriptor)
    }

    #[tokio::test]
    async fn test_echo_settles_with_trimmed_output() {
        let client = Arc::new(MemoryShellClient::new());
        let command = start(&client, "echo hi").await;

        client.push_output(command.id(), "hi\n");
        client.exit(command.id(), 0);

        let result = command.await;
        assert_eq!(
            result,
            CommandResult {
                output: "hi".into(),
                exit_code: Some(0)
            }
        );
        assert!(result.success());
    }

    #[tokio::test]
    async fn test_chunks_are_concatenated_not_joined() {
        let client = Arc::new(MemoryShellClient::new());
        let command = start(&client, "printf").await;

        for chunk in ["  a", "b", "\nc  "] {
            client.push_output(command.id(), chunk);
        }
        client.exit(command.id(), 1);

        let result = command.wait().await;
        assert_eq!(result.output, "ab\nc");
        assert_eq!(result.exit_code, Some(1));
    }

    #[tokio::test]
    async fn test_already_finished_settles_without_subscribing() {
        let client = Arc::new(MemoryShellClient::new());
        client.finish_on_create("make", ["built\n", "ok\n"], 0);

        let command = start(&client, "make all").await;

        assert!(command.is_settled());
        assert_eq!(client.listener_count(), 0);
        assert_eq!(
            command.wait().await,
            CommandResult {
                output: "built\nok".into(),
                exit_code: Some(0)
            }
        );
    }

    #[tokio::test]
    async fn test_terminated_settles_without_exit_code() {
        let client = Arc::new(MemoryShellClient::new());
        let command = start(&client, "sleep 100").await;

        client.push_output(command.id(), "partial");
        client.terminate(command.id());

        let result = command.wait().await;
        assert_eq!(result.exit_code, None);
        assert_eq!(result.output, "partial");
        assert!(!result.success());
    }

    #[tokio::test]
    async fn test_first_terminal_notification_wins() {
        let client = Arc::new(MemoryShellClient::new());
        let command = start(&client, "job").await;

        client.exit(command.id(), 3);
        client.terminate(command.id());
        client.push_output(command.id(), "late");

        let result = command.wait().await;
        assert_eq!(result.exit_code, Some(3));
        assert_eq!(result.output, "");
        assert_eq!(client.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_ignores_other_shells() {
        let client = Arc::new(MemoryShellClient::new());
        let command = start(&client, "mine").await;
        let other = start(&client, "other").await;

        client.push_output(other.id(), "noise");
        client.exit(other.id(), 9);

        let mut waiter = task::spawn(command.wait());
        assert_pending!(waiter.poll());
        drop(waiter);

        client.exit(command.id(), 0);
        assert_eq!(command.wait().await.exit_code, Some(0));
        assert_eq!(command.output_so_far(), "");
    }

    #[tokio::test]
    async fn test_live_output_stream() {
        let client = Arc::new(MemoryShellClient::new());
        let command = start(&client, "tail").await;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let _sub = command.on_output().listen({
            let seen = Arc::clone(&seen);
            move |chunk: &String| seen.lock().unwrap().push(chunk.clone())
        });

        client.push_output(command.id(), "one");
        client.push_output(command.id(), "two");

        assert_eq!(*seen.lock().unwrap(), vec!["one".to_string(), "two".to_string()]);
    }

    #[tokio::test]
    async fn test_kill_settles_and_deletes() {
        let client = Arc::new(MemoryShellClient::new());
        let command = start(&client, "server").await;
        client.push_output(command.id(), "listening ");

        let mut waiter = task::spawn(command.wait());
        assert_pending!(waiter.poll());

        command.kill().await;

        assert!(waiter.is_woken());
        assert_ready_eq!(
            waiter.poll(),
            CommandResult {
                output: "listening".into(),
                exit_code: None
            }
        );
        drop(waiter);
        assert_eq!(client.deleted(), vec![command.id().to_string()]);
        assert_eq!(client.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_kill_after_exit_keeps_result() {
        let client = Arc::new(MemoryShellClient::new());
        let command = start(&client, "true").await;
        client.exit(command.id(), 0);

        command.kill().await;

        assert_eq!(command.wait().await.exit_code, Some(0));
        assert!(client.deleted().is_empty());
    }

    #[tokio::test]
    async fn test_kill_swallows_delete_failure() {
        let client = Arc::new(MemoryShellClient::new());
        let command = start(&client, "stuck").await;
        client.fail_deletes(true);

        command.kill().await;

        assert_eq!(command.wait().await.exit_code, None);
        assert_eq!(client.status(command.id()), Some(ShellStatus::Running));
    }

    #[tokio::test]
    async fn test_owner_teardown_cancels_run() {
        let client = Arc::new(MemoryShellClient::new());
        let command = start(&client, "watch").await;

        command.teardown().dispose();
        tokio::task::yield_now().await;

        assert!(command.is_settled());
        assert_eq!(command.wait().await.exit_code, None);
        assert_eq!(client.deleted(), vec![command.id().to_string()]);
    }
}

//! Protocol collaborator traits and the descriptors they exchange.
//!
//! The live connection to the VM is owned by an external protocol client.
//! These traits are the seam: request/response operations are async, and
//! notifications are exposed as [`Event`]s that any number of listeners can
//! register against. Every notification carries the id of the resource it
//! belongs to, and consumers filter on it before acting.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{Disposable, Event};

/// Remote shell identifier.
pub type ShellId = String;

/// Shell status as reported by the remote side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ShellStatus {
    /// Process is running.
    Running,
    /// Process exited normally.
    Finished,
    /// Process failed to start or crashed.
    Error,
    /// Process was killed.
    Killed,
    /// Remote is recreating the process under the same id.
    Restarting,
}

impl ShellStatus {
    /// Whether no further events are expected for this shell.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Error | Self::Killed)
    }
}

/// Kind of remote shell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShellKind {
    /// Interactive terminal.
    #[default]
    Terminal,
    /// One-off command.
    Command,
}

/// Terminal dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShellSize {
    pub cols: u16,
    pub rows: u16,
}

impl Default for ShellSize {
    fn default() -> Self {
        Self { cols: 200, rows: 80 }
    }
}

/// Snapshot of a remote shell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShellDescriptor {
    pub id: ShellId,
    pub name: String,
    pub command: String,
    pub status: ShellStatus,
    /// Set once the process exited normally.
    #[serde(default)]
    pub exit_code: Option<i32>,
    /// Output the remote buffered before this snapshot was taken.
    #[serde(default)]
    pub buffer: Vec<String>,
}

/// Output chunk notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShellOutput {
    pub id: ShellId,
    pub chunk: String,
}

/// Normal exit notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShellExited {
    pub id: ShellId,
    pub exit_code: i32,
}

/// Abrupt termination notification (disconnect or forced kill).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShellTerminated {
    pub id: ShellId,
}

/// Error result reported by the protocol collaborator.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("Remote resource not found: {0}")]
    NotFound(String),
    #[error("Remote rejected request ({code}): {message}")]
    Rejected { code: i32, message: String },
    #[error("Remote connection lost")]
    Disconnected,
}

/// Shell operations and notifications of the protocol collaborator.
#[async_trait]
pub trait ShellClient: Send + Sync {
    /// Start a new remote shell.
    async fn create(
        &self,
        working_dir: &str,
        size: ShellSize,
        command: &str,
        kind: ShellKind,
        interactive: bool,
    ) -> Result<ShellDescriptor, RemoteError>;

    /// Attach to an existing shell.
    async fn open(&self, id: &str, size: ShellSize) -> Result<ShellDescriptor, RemoteError>;

    /// Send input to a shell.
    async fn send(&self, id: &str, input: &str, size: ShellSize) -> Result<(), RemoteError>;

    /// Rename a shell.
    async fn rename(&self, id: &str, name: &str) -> Result<(), RemoteError>;

    /// Restart the process under the same id.
    async fn restart(&self, id: &str) -> Result<(), RemoteError>;

    /// Detach this client from a shell without stopping it.
    async fn close(&self, id: &str) -> Result<(), RemoteError>;

    /// Stop a shell. Deleting an already-gone shell may fail and callers
    /// on cleanup paths tolerate that.
    async fn delete(&self, id: &str) -> Result<(), RemoteError>;

    /// All shells known to the remote.
    async fn list(&self) -> Result<Vec<ShellDescriptor>, RemoteError>;

    /// Output chunks for every shell.
    fn on_output(&self) -> Event<ShellOutput>;

    /// Normal exits for every shell.
    fn on_exited(&self) -> Event<ShellExited>;

    /// Abrupt terminations for every shell.
    fn on_terminated(&self) -> Event<ShellTerminated>;

    /// Full shell list whenever the remote's view changes.
    fn on_shells_updated(&self) -> Event<Vec<ShellDescriptor>>;
}

/// Kind of filesystem change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FsEventKind {
    Add,
    Change,
    Remove,
}

/// Batch of filesystem changes of one kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsWatchEvent {
    #[serde(rename = "type")]
    pub kind: FsEventKind,
    pub paths: Vec<String>,
}

/// Filesystem watch options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchOptions {
    /// Watch subdirectories too.
    #[serde(default)]
    pub recursive: bool,
    /// Glob patterns to ignore.
    #[serde(default)]
    pub excludes: Vec<String>,
}

/// Callback receiving filesystem change batches.
pub type FsWatchListener = Box<dyn Fn(FsWatchEvent) + Send + Sync>;

/// Filesystem operations of the protocol collaborator.
#[async_trait]
pub trait FsClient: Send + Sync {
    /// Start watching `path`. Disposing the returned handle stops the watch.
    async fn watch(
        &self,
        path: &str,
        options: &WatchOptions,
        listener: FsWatchListener,
    ) -> Result<Box<dyn Disposable>, RemoteError>;
}

/// An open port inside the VM.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortInfo {
    pub port: u16,
    pub hostname: String,
}

/// Port operations of the protocol collaborator.
#[async_trait]
pub trait PortClient: Send + Sync {
    /// Currently open ports.
    async fn get_ports(&self) -> Result<Vec<PortInfo>, RemoteError>;

    /// Full open-port list whenever it changes.
    fn on_ports_updated(&self) -> Event<Vec<PortInfo>>;
}

/// Overall setup state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SetupState {
    Idle,
    InProgress,
    Finished,
    Stopped,
}

/// State of one setup step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Idle,
    Running,
    Finished,
    Failed,
    Skipped,
}

/// One setup step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupStep {
    pub name: String,
    pub command: String,
    pub status: StepStatus,
    #[serde(default)]
    pub shell_id: Option<ShellId>,
}

/// Progress of the VM's setup tasks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupProgress {
    pub state: SetupState,
    pub steps: Vec<SetupStep>,
    pub current_step_index: usize,
}

/// Setup operations of the protocol collaborator.
#[async_trait]
pub trait SetupClient: Send + Sync {
    /// Latest setup progress.
    async fn get_progress(&self) -> Result<SetupProgress, RemoteError>;

    /// Progress whenever it changes.
    fn on_progress(&self) -> Event<SetupProgress>;
}

/// Used/total pair of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub used: f64,
    pub total: f64,
}

/// Resource usage snapshot of the VM.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SystemMetrics {
    pub cpu: Usage,
    pub memory: Usage,
    pub storage: Usage,
}

/// Metrics operations of the protocol collaborator.
#[async_trait]
pub trait SystemClient: Send + Sync {
    /// Ask the remote to publish a fresh metrics snapshot.
    async fn request_metrics(&self) -> Result<(), RemoteError>;

    /// Metrics snapshots as they are published.
    fn on_metrics_update(&self) -> Event<SystemMetrics>;
}

//! Shell error types.

use thiserror::Error;
use vmshell_core::{BroadcastError, RemoteError, ShellId};

use crate::command_line::CommandBuildError;

/// Shell operation error.
#[derive(Debug, Error)]
pub enum ShellError {
    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),
    #[error("Shell not found: {0}")]
    NotFound(ShellId),
    #[error("Shell handle disposed: {0}")]
    Disposed(ShellId),
    #[error("Shell manager disposed")]
    ManagerDisposed,
    #[error("Command build error: {0}")]
    Command(#[from] CommandBuildError),
    #[error("Shutdown broadcast failed: {0}")]
    Shutdown(#[from] BroadcastError),
    #[error("Invalid configuration: {0}")]
    Config(String),
}

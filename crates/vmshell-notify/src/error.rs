//! Notification error types.

use std::time::Duration;

use thiserror::Error;
use vmshell_core::RemoteError;

/// Notification error.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NotifyError {
    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),
    #[error("Timed out after {0:?}")]
    Timeout(Duration),
    #[error("Notification source was disposed")]
    Disposed,
}

//! Lightweight notification streams for remote VMs.
//!
//! Provides:
//! - `FileSystem` / `Watcher` - Disposable filesystem watches
//! - `Ports` - Port open/close detection from snapshot deltas
//! - `Setup` - Setup progress tracking
//! - `Metrics` - On-demand resource usage

pub mod error;
pub mod fs;
pub mod metrics;
pub mod ports;
pub mod setup;
mod wait;

pub use error::NotifyError;
pub use fs::{FileSystem, Watcher};
pub use metrics::Metrics;
pub use ports::Ports;
pub use setup::Setup;

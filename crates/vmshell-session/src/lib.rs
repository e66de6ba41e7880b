//! Remote shell handles and command execution.
//!
//! Provides:
//! - `ShellManager` - Create, open, run and tear down remote shells
//! - `ShellInstance` - Disposable handle tracking one shell's status and output
//! - `RunningCommand` - Awaitable command run with live output and cancellation
//! - `ShellConfig` - Shared defaults, loadable from the environment
//! - `MemoryShellClient` - In-memory protocol collaborator (feature `memory`)

pub mod command;
pub mod command_line;
pub mod config;
pub mod error;
pub mod instance;
pub mod manager;
#[cfg(feature = "memory")]
pub mod memory;

pub use command::{CommandResult, RunningCommand};
pub use command_line::{CommandBuildError, CommandLine};
pub use config::{ShellConfig, ShellConfigBuilder};
pub use error::ShellError;
pub use instance::ShellInstance;
pub use manager::{RunOptions, ShellManager, ShellOptions};
#[cfg(feature = "memory")]
pub use memory::MemoryShellClient;

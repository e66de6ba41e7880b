//! Core abstractions for remote VM shell clients.
//!
//! This crate provides the fundamental building blocks:
//! - `Disposable` / `DisposableStore` - Idempotent, cascading release
//! - `Emitter` / `Event` - Synchronous fan-out with disposal-based unsubscription
//! - `AsyncEmitter` - Deadline-bounded broadcast to async listeners
//! - `Barrier` - Single-resolution gate bridging notifications to awaited values
//! - `OutputBuffer` - Bounded display history plus live updates
//! - Protocol collaborator traits (`ShellClient`, `FsClient`, `PortClient`, ...)

pub mod async_emitter;
pub mod barrier;
pub mod dispose;
pub mod event;
pub mod output;
pub mod traits;

pub use async_emitter::{AsyncEmitter, AsyncEvent, BroadcastError};
pub use barrier::{Barrier, BarrierResult};
pub use dispose::{Disposable, DisposableStore, DisposeFn, DisposeGuard};
pub use event::{Emitter, Event, EventError, Subscription, listen_once};
pub use output::OutputBuffer;
pub use traits::{
    FsClient, FsEventKind, FsWatchEvent, FsWatchListener, PortClient, PortInfo, RemoteError,
    SetupClient, SetupProgress, SetupState, SetupStep, ShellClient, ShellDescriptor, ShellExited,
    ShellId, ShellKind, ShellOutput, ShellSize, ShellStatus, ShellTerminated, StepStatus,
    SystemClient, SystemMetrics, Usage, WatchOptions,
};

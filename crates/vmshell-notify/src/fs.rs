//! Filesystem watches.

use std::sync::Arc;

use vmshell_core::{
    Disposable, DisposableStore, Emitter, Event, FsClient, FsWatchEvent, WatchOptions,
};

use crate::error::NotifyError;

/// Entry point for filesystem watches.
pub struct FileSystem {
    client: Arc<dyn FsClient>,
}

impl FileSystem {
    #[must_use]
    pub fn new(client: Arc<dyn FsClient>) -> Self {
        Self { client }
    }

    /// Start watching `path`.
    ///
    /// # Errors
    /// Returns error if the remote refuses the watch.
    pub async fn watch(&self, path: &str, options: WatchOptions) -> Result<Watcher, NotifyError> {
        let emitter = Arc::new(Emitter::new());
        let forward = Arc::clone(&emitter);
        let handle = self
            .client
            .watch(path, &options, Box::new(move |event| forward.fire(event)))
            .await?;

        tracing::info!(path, recursive = options.recursive, "Watching path");
        let store = DisposableStore::new();
        store.add(Arc::clone(&emitter));
        store.push(handle);
        let released = path.to_string();
        store.on_dispose(move || tracing::debug!(path = %released, "Stopped watching path"));

        Ok(Watcher {
            path: path.to_string(),
            options,
            emitter,
            store,
        })
    }
}

/// An active filesystem watch.
///
/// Disposing it stops the remote watch and drops all listeners.
pub struct Watcher {
    path: String,
    options: WatchOptions,
    emitter: Arc<Emitter<FsWatchEvent>>,
    store: DisposableStore,
}

impl Watcher {
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[must_use]
    pub const fn options(&self) -> &WatchOptions {
        &self.options
    }

    /// Batches of changes under the watched path.
    #[must_use]
    pub fn on_event(&self) -> Event<FsWatchEvent> {
        self.emitter.event()
    }

    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.store.is_disposed()
    }
}

impl Disposable for Watcher {
    fn dispose(&self) {
        self.store.dispose();
    }
}

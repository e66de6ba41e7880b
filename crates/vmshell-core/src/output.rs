//! Bounded display history plus live updates for shell output.

use std::{
    collections::VecDeque,
    sync::{PoisonError, RwLock},
};

use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

/// Default number of chunks retained per shell.
pub const DEFAULT_CAPACITY: usize = 1000;

/// Live channel depth; slow receivers skip ahead rather than block producers.
const LIVE_CHANNEL_DEPTH: usize = 1024;

/// Ring buffer of recent output chunks with broadcast support.
///
/// New subscribers can replay the retained history and then follow live
/// chunks. The oldest chunk is evicted once `capacity` is reached.
pub struct OutputBuffer {
    history: RwLock<VecDeque<String>>,
    capacity: usize,
    sender: broadcast::Sender<String>,
}

impl Default for OutputBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl OutputBuffer {
    /// Create a buffer retaining at most `capacity` chunks.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(LIVE_CHANNEL_DEPTH);
        Self {
            history: RwLock::new(VecDeque::with_capacity(capacity.min(64))),
            capacity,
            sender,
        }
    }

    /// Create a buffer pre-filled with chunks the remote already buffered.
    #[must_use]
    pub fn with_history<I>(capacity: usize, chunks: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        let buffer = Self::new(capacity);
        for chunk in chunks {
            buffer.push(chunk);
        }
        buffer
    }

    /// Append a chunk to history and live listeners.
    pub fn push(&self, chunk: impl Into<String>) {
        let chunk = chunk.into();
        let _ = self.sender.send(chunk.clone()); // live listeners

        if self.capacity == 0 {
            return;
        }
        let mut history = self.history.write().unwrap_or_else(PoisonError::into_inner);
        while history.len() >= self.capacity {
            history.pop_front();
        }
        history.push_back(chunk);
    }

    /// Retained chunks, oldest first.
    #[must_use]
    pub fn chunks(&self) -> Vec<String> {
        self.history
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Retained chunks joined by newlines.
    #[must_use]
    pub fn joined(&self) -> String {
        self.chunks().join("\n")
    }

    /// Number of retained chunks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.history.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether no chunk is retained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of retained chunks.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Get a receiver for live chunks.
    #[must_use]
    pub fn get_receiver(&self) -> broadcast::Receiver<String> {
        self.sender.subscribe()
    }

    /// Stream that yields retained history first, then live chunks.
    #[must_use]
    pub fn history_plus_stream(&self) -> futures::stream::BoxStream<'static, String> {
        // Subscribe before snapshotting so nothing pushed in between is lost.
        let rx = self.get_receiver();
        let history = self.chunks();

        let hist = futures::stream::iter(history);
        let live = BroadcastStream::new(rx).filter_map(|res| async move {
            match res {
                Ok(chunk) => Some(chunk),
                Err(e) => {
                    tracing::debug!("Output subscriber lagged: {e}");
                    None
                }
            }
        });

        Box::pin(hist.chain(live))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evicts_oldest_chunk() {
        let buffer = OutputBuffer::new(DEFAULT_CAPACITY);
        for i in 0..=DEFAULT_CAPACITY {
            buffer.push(format!("chunk-{i}"));
        }

        let chunks = buffer.chunks();
        assert_eq!(chunks.len(), DEFAULT_CAPACITY);
        assert_eq!(chunks.first().map(String::as_str), Some("chunk-1"));
        assert_eq!(
            chunks.last().map(String::as_str),
            Some(format!("chunk-{DEFAULT_CAPACITY}").as_str())
        );
        assert!(!chunks.contains(&"chunk-0".to_string()));
    }

    #[test]
    fn test_joined_uses_newlines() {
        let buffer = OutputBuffer::with_history(10, ["a", "b", "c"]);
        assert_eq!(buffer.joined(), "a\nb\nc");
    }

    #[test]
    fn test_zero_capacity_retains_nothing() {
        let buffer = OutputBuffer::new(0);
        buffer.push("dropped");
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn test_history_then_live() {
        let buffer = OutputBuffer::with_history(10, ["old"]);
        let mut stream = buffer.history_plus_stream();
        buffer.push("new");

        assert_eq!(stream.next().await.as_deref(), Some("old"));
        assert_eq!(stream.next().await.as_deref(), Some("new"));
    }
}

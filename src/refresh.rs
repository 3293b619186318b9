//! The "refresh needed" signal read by the presentation layer.

use crate::model::MessageId;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;

/// What the presentation layer should redraw
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshRequest {
    /// Reload the whole list
    All,
    /// Redraw a single message row
    Row(MessageId),
}

/// Set by any component that mutated conversation state.
///
/// Pollers read [`should_reload_data`](Self::should_reload_data) and clear it
/// with [`take`](Self::take); subscribers receive each request as it happens.
#[derive(Debug, Clone)]
pub struct RefreshSignal {
    should_reload_data: Arc<AtomicBool>,
    tx: broadcast::Sender<RefreshRequest>,
}

impl RefreshSignal {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self {
            should_reload_data: Arc::new(AtomicBool::new(false)),
            tx,
        }
    }

    pub fn signal(&self, request: RefreshRequest) {
        self.should_reload_data.store(true, Ordering::SeqCst);
        // No subscribers is fine; pollers still see the flag.
        let _ = self.tx.send(request);
    }

    pub fn should_reload_data(&self) -> bool {
        self.should_reload_data.load(Ordering::SeqCst)
    }

    /// Read and clear the flag
    pub fn take(&self) -> bool {
        self.should_reload_data.swap(false, Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RefreshRequest> {
        self.tx.subscribe()
    }
}

impl Default for RefreshSignal {
    fn default() -> Self {
        Self::new()
    }
}

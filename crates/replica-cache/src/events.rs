use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::RwLock;

/// A subscriber callback. Receives the resolved key of the file involved.
pub type EventCallback = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FileEvent {
    /// A `get_file` call resolved a local path.
    Requested,
    /// An upload completed and the remote assigned a version.
    Uploaded,
}

/// Ordered callback lists for file events.
///
/// Callbacks run synchronously on the firing thread, in registration order. A panicking
/// callback is logged and skipped; the remaining callbacks still run and the panic never reaches
/// the file operation that fired the event.
#[derive(Default)]
pub struct EventBus {
    requested: RwLock<Vec<EventCallback>>,
    uploaded: RwLock<Vec<EventCallback>>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("requested", &self.requested.read().len())
            .field("uploaded", &self.uploaded.read().len())
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn list(&self, event: FileEvent) -> &RwLock<Vec<EventCallback>> {
        match event {
            FileEvent::Requested => &self.requested,
            FileEvent::Uploaded => &self.uploaded,
        }
    }

    /// Append `callback` unless the same `Arc` is already registered. Returns whether it was added.
    pub fn subscribe(&self, event: FileEvent, callback: EventCallback) -> bool {
        let mut list = self.list(event).write();
        if list.iter().any(|existing| Arc::ptr_eq(existing, &callback)) {
            return false;
        }
        list.push(callback);
        true
    }

    /// Remove `callback` if registered. Returns whether it was present.
    pub fn unsubscribe(&self, event: FileEvent, callback: &EventCallback) -> bool {
        let mut list = self.list(event).write();
        let before = list.len();
        list.retain(|existing| !Arc::ptr_eq(existing, callback));
        list.len() != before
    }

    pub fn subscriber_count(&self, event: FileEvent) -> usize {
        self.list(event).read().len()
    }

    /// Invoke every callback registered for `event` with `key`.
    pub fn fire(&self, event: FileEvent, key: &str) {
        // Snapshot so callbacks may (un)subscribe without deadlocking.
        let callbacks: Vec<EventCallback> = self.list(event).read().clone();
        for (idx, callback) in callbacks.iter().enumerate() {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| callback(key))) {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "<non-string panic payload>".to_string());
                tracing::warn!(
                    target = "replica.cache",
                    ?event,
                    key,
                    callback = idx,
                    panic = %message,
                    "file event callback panicked; continuing with remaining callbacks"
                );
            }
        }
    }
}

//! Application state.

use std::sync::Arc;

use depot_queue::QueueStore;
use depot_scheduler::CallbackDispatcher;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn QueueStore>,
    /// Reports jobs cancelled straight out of the queue.
    pub dispatcher: Arc<CallbackDispatcher>,
    pub internal_api_key: Option<Arc<str>>,
}

impl AppState {
    pub fn new(store: Arc<dyn QueueStore>, dispatcher: Arc<CallbackDispatcher>) -> Self {
        Self {
            store,
            dispatcher,
            internal_api_key: None,
        }
    }

    pub fn with_internal_api_key(mut self, key: Option<String>) -> Self {
        self.internal_api_key = key.map(Arc::from);
        self
    }
}

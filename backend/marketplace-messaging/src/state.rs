use crate::backends::{IdentityProvider, MemoryBackend, MessagingStore, ObjectStore};
use crate::config::DEFAULT_ATTACHMENT_MAX_BYTES;
use crate::realtime::ChangeFeed;
use std::sync::Arc;

/// Adapters shared by every messaging view.
#[derive(Clone)]
pub struct AppState {
    pub identity: Arc<dyn IdentityProvider>,
    pub store: Arc<dyn MessagingStore>,
    pub objects: Arc<dyn ObjectStore>,
    pub feed: Arc<dyn ChangeFeed>,
    pub attachment_max_bytes: u64,
}

impl AppState {
    /// Everything backed by one [`MemoryBackend`].
    pub fn in_memory(backend: MemoryBackend, identity: Arc<dyn IdentityProvider>) -> Self {
        let backend = Arc::new(backend);
        Self {
            identity,
            store: backend.clone(),
            objects: backend.clone(),
            feed: backend,
            attachment_max_bytes: DEFAULT_ATTACHMENT_MAX_BYTES,
        }
    }
}

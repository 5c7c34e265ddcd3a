use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use colloquy_core::domain::event::Event;
use colloquy_core::domain::tracker::ConversationId;
use colloquy_core::errors::StoreError;
use colloquy_core::session::SessionConfig;
use colloquy_core::store::{CachedState, StoredConversation, TrackerStore};

/// Bounds every call to the wrapped store. A call that does not finish in
/// time fails with [`StoreError::Unavailable`]; for an append the outcome is
/// then unknown and the caller has to reload before retrying.
pub struct TimeoutTrackerStore {
    inner: Arc<dyn TrackerStore>,
    timeout: Duration,
}

impl TimeoutTrackerStore {
    pub fn new(inner: Arc<dyn TrackerStore>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    async fn bounded<T: Send>(
        &self,
        operation: &'static str,
        call: impl Future<Output = Result<T, StoreError>> + Send,
    ) -> Result<T, StoreError> {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                let waited_ms = self.timeout.as_millis() as u64;
                warn!(
                    event_name = "store.call.timed_out",
                    backend = self.inner.backend(),
                    operation,
                    waited_ms,
                    "tracker store call timed out"
                );
                Err(StoreError::unavailable(
                    self.inner.backend(),
                    format!("{operation} timed out after {waited_ms}ms"),
                ))
            }
        }
    }
}

#[async_trait]
impl TrackerStore for TimeoutTrackerStore {
    fn backend(&self) -> &'static str {
        self.inner.backend()
    }

    fn session_config(&self) -> &SessionConfig {
        self.inner.session_config()
    }

    async fn load_events(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Option<StoredConversation>, StoreError> {
        self.bounded("load_events", self.inner.load_events(conversation_id)).await
    }

    async fn append_all(
        &self,
        conversation_id: &ConversationId,
        events: Vec<Event>,
        expected_version: u64,
    ) -> Result<u64, StoreError> {
        self.bounded("append", self.inner.append_all(conversation_id, events, expected_version))
            .await
    }

    async fn list_conversation_ids_page(
        &self,
        after: Option<&ConversationId>,
        limit: usize,
    ) -> Result<Vec<ConversationId>, StoreError> {
        self.bounded("list_conversation_ids", self.inner.list_conversation_ids_page(after, limit))
            .await
    }

    async fn keys(&self) -> Result<BTreeSet<String>, StoreError> {
        self.bounded("keys", self.inner.keys()).await
    }

    async fn cached_state(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Option<CachedState>, StoreError> {
        self.bounded("cached_state", self.inner.cached_state(conversation_id)).await
    }

    async fn store_cached_state(
        &self,
        conversation_id: &ConversationId,
        state: CachedState,
    ) -> Result<(), StoreError> {
        self.bounded("store_cached_state", self.inner.store_cached_state(conversation_id, state))
            .await
    }
}

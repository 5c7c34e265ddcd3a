use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use colloquy_core::domain::event::Event;
use colloquy_core::domain::tracker::ConversationId;
use colloquy_core::errors::StoreError;
use colloquy_core::session::SessionConfig;
use colloquy_core::store::{CachedState, StoredConversation, TrackerStore};

#[derive(Default)]
struct MemoryRecord {
    events: Vec<Event>,
    cached: Option<CachedState>,
}

/// Process-local store; contents are lost on restart.
#[derive(Default)]
pub struct InMemoryTrackerStore {
    session: SessionConfig,
    records: RwLock<HashMap<ConversationId, MemoryRecord>>,
}

impl InMemoryTrackerStore {
    pub fn new(session: SessionConfig) -> Self {
        Self { session, records: RwLock::default() }
    }
}

#[async_trait]
impl TrackerStore for InMemoryTrackerStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    fn session_config(&self) -> &SessionConfig {
        &self.session
    }

    async fn load_events(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Option<StoredConversation>, StoreError> {
        let records = self.records.read().await;
        Ok(records.get(conversation_id).filter(|record| !record.events.is_empty()).map(|record| {
            StoredConversation {
                conversation_id: conversation_id.clone(),
                events: record.events.clone(),
            }
        }))
    }

    async fn append_all(
        &self,
        conversation_id: &ConversationId,
        events: Vec<Event>,
        expected_version: u64,
    ) -> Result<u64, StoreError> {
        let mut records = self.records.write().await;
        let record = records.entry(conversation_id.clone()).or_default();

        let actual = record.events.len() as u64;
        if actual != expected_version {
            return Err(StoreError::Conflict {
                conversation_id: conversation_id.clone(),
                expected: expected_version,
                actual,
            });
        }

        record.events.extend(events);
        Ok(record.events.len() as u64)
    }

    async fn list_conversation_ids_page(
        &self,
        after: Option<&ConversationId>,
        limit: usize,
    ) -> Result<Vec<ConversationId>, StoreError> {
        let records = self.records.read().await;
        let mut ids: Vec<ConversationId> = records
            .iter()
            .filter(|(id, record)| {
                !record.events.is_empty() && after.map_or(true, |after| *id > after)
            })
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids.truncate(limit);
        Ok(ids)
    }

    async fn cached_state(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Option<CachedState>, StoreError> {
        let records = self.records.read().await;
        Ok(records.get(conversation_id).and_then(|record| record.cached.clone()))
    }

    async fn store_cached_state(
        &self,
        conversation_id: &ConversationId,
        state: CachedState,
    ) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        let Some(record) = records.get_mut(conversation_id) else {
            return Ok(());
        };

        let newer = record.cached.as_ref().map_or(true, |cached| state.version >= cached.version);
        if newer && state.version <= record.events.len() as u64 {
            record.cached = Some(state);
        }
        Ok(())
    }
}

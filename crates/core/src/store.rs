//! The tracker store contract.
//!
//! Every backend persists, per conversation, the ordered list of serialized
//! events. The list length is the record's version; appends carry the
//! version the caller loaded and fail with [`StoreError::Conflict`] when
//! someone else appended first. A backend may additionally keep a cached
//! [`TrackerState`], which must always equal a full replay of the events at
//! the cached version.

use std::collections::{BTreeSet, VecDeque};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::event::Event;
use crate::domain::tracker::{ConversationId, Tracker, TrackerState};
use crate::errors::StoreError;
use crate::session::SessionConfig;

pub const DEFAULT_PAGE_SIZE: usize = 100;

#[derive(Clone, Debug, PartialEq)]
pub struct StoredConversation {
    pub conversation_id: ConversationId,
    pub events: Vec<Event>,
}

impl StoredConversation {
    pub fn version(&self) -> u64 {
        self.events.len() as u64
    }
}

/// Snapshot of a tracker's derived state at a given version.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CachedState {
    pub version: u64,
    pub state: TrackerState,
}

impl CachedState {
    pub fn of(tracker: &Tracker) -> Self {
        Self { version: tracker.version(), state: tracker.state().clone() }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum CacheConsistency {
    /// The backend keeps no snapshot for this conversation.
    Missing,
    Consistent,
    /// The snapshot is older than the event list; not an error.
    Stale { cached_version: u64, current_version: u64 },
    /// The snapshot disagrees with a replay of the same events.
    Diverged { version: u64 },
}

#[async_trait]
pub trait TrackerStore: Send + Sync {
    /// Short backend name used in logs and errors.
    fn backend(&self) -> &'static str;

    fn session_config(&self) -> &SessionConfig;

    async fn load_events(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Option<StoredConversation>, StoreError>;

    /// Appends `events` atomically at versions `expected_version + 1 ..`.
    /// Returns the new version.
    async fn append_all(
        &self,
        conversation_id: &ConversationId,
        events: Vec<Event>,
        expected_version: u64,
    ) -> Result<u64, StoreError>;

    /// Conversation ids strictly greater than `after`, ascending, at most
    /// `limit` of them.
    async fn list_conversation_ids_page(
        &self,
        after: Option<&ConversationId>,
        limit: usize,
    ) -> Result<Vec<ConversationId>, StoreError>;

    async fn append(
        &self,
        conversation_id: &ConversationId,
        event: Event,
        expected_version: u64,
    ) -> Result<u64, StoreError> {
        self.append_all(conversation_id, vec![event], expected_version).await
    }

    /// Raw metadata keys held by the backend. Backends without such a
    /// notion return an empty set.
    async fn keys(&self) -> Result<BTreeSet<String>, StoreError> {
        Ok(BTreeSet::new())
    }

    async fn cached_state(
        &self,
        _conversation_id: &ConversationId,
    ) -> Result<Option<CachedState>, StoreError> {
        Ok(None)
    }

    async fn store_cached_state(
        &self,
        _conversation_id: &ConversationId,
        _state: CachedState,
    ) -> Result<(), StoreError> {
        Ok(())
    }

    /// Loads and replays a conversation without creating it.
    async fn retrieve(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Option<Tracker>, StoreError> {
        let stored = self.load_events(conversation_id).await?;
        Ok(stored.filter(|stored| !stored.events.is_empty()).map(|stored| {
            Tracker::replay(stored.conversation_id, stored.events, self.session_config().clone())
        }))
    }

    /// Loads a conversation, creating it with an initial `SessionStarted`
    /// when it has no events yet.
    async fn get_or_create(&self, conversation_id: &ConversationId) -> Result<Tracker, StoreError> {
        if let Some(tracker) = self.retrieve(conversation_id).await? {
            return Ok(tracker);
        }

        let seed = self.session_config().session_start_events(Utc::now());
        match self.append_all(conversation_id, seed.clone(), 0).await {
            Ok(_) => {
                debug!(
                    event_name = "store.conversation.created",
                    backend = self.backend(),
                    conversation_id = %conversation_id,
                    "created conversation with initial session"
                );
                Ok(Tracker::replay(conversation_id.clone(), seed, self.session_config().clone()))
            }
            Err(StoreError::Conflict { .. }) => {
                let tracker = self.retrieve(conversation_id).await?;
                tracker.ok_or_else(|| {
                    StoreError::corrupt(conversation_id, "conversation vanished after a conflict")
                })
            }
            Err(error) => Err(error),
        }
    }
}

impl<'s> dyn TrackerStore + 's {
    /// Lazily pages through every known conversation id.
    pub fn list_conversation_ids(&self) -> ConversationIds<'_> {
        ConversationIds::new(self)
    }

    /// Compares the backend's cached snapshot with a full replay.
    pub async fn verify_cached_state(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<CacheConsistency, StoreError> {
        let Some(cached) = self.cached_state(conversation_id).await? else {
            return Ok(CacheConsistency::Missing);
        };
        let Some(stored) = self.load_events(conversation_id).await? else {
            return Ok(CacheConsistency::Diverged { version: cached.version });
        };

        let current_version = stored.version();
        if cached.version > current_version {
            return Ok(CacheConsistency::Diverged { version: cached.version });
        }

        let prefix = stored.events.into_iter().take(cached.version as usize);
        let replayed =
            Tracker::replay(conversation_id.clone(), prefix, self.session_config().clone());
        if replayed.state() != &cached.state {
            return Ok(CacheConsistency::Diverged { version: cached.version });
        }
        if cached.version < current_version {
            return Ok(CacheConsistency::Stale { cached_version: cached.version, current_version });
        }
        Ok(CacheConsistency::Consistent)
    }
}

/// Cursor over a store's conversation ids, fetched one page at a time.
pub struct ConversationIds<'a> {
    store: &'a (dyn TrackerStore + 'a),
    page_size: usize,
    buffer: VecDeque<ConversationId>,
    cursor: Option<ConversationId>,
    exhausted: bool,
}

impl<'a> ConversationIds<'a> {
    pub fn new(store: &'a (dyn TrackerStore + 'a)) -> Self {
        Self {
            store,
            page_size: DEFAULT_PAGE_SIZE,
            buffer: VecDeque::new(),
            cursor: None,
            exhausted: false,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub async fn next(&mut self) -> Result<Option<ConversationId>, StoreError> {
        if self.buffer.is_empty() && !self.exhausted {
            let page =
                self.store.list_conversation_ids_page(self.cursor.as_ref(), self.page_size).await?;
            self.exhausted = page.len() < self.page_size;
            if let Some(last) = page.last() {
                self.cursor = Some(last.clone());
            }
            self.buffer.extend(page);
        }
        Ok(self.buffer.pop_front())
    }

    pub async fn collect_all(mut self) -> Result<Vec<ConversationId>, StoreError> {
        let mut ids = Vec::new();
        while let Some(id) = self.next().await? {
            ids.push(id);
        }
        Ok(ids)
    }
}

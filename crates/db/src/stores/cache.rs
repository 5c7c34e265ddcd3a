//! Keyed-cache backend: one JSON record per conversation.
//!
//! The backend only relies on the [`KeyValueCache`] operations below, which
//! map one-to-one onto a remote key/value protocol (GET, SET, SCAN and a
//! compare-and-swap script). [`LocalKeyValueCache`] is the in-process client.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use colloquy_core::config::CacheStoreConfig;
use colloquy_core::domain::event::Event;
use colloquy_core::domain::tracker::ConversationId;
use colloquy_core::errors::StoreError;
use colloquy_core::session::SessionConfig;
use colloquy_core::store::{CachedState, StoredConversation, TrackerStore};

const BACKEND: &str = "cache";
const CACHED_STATE_ATTEMPTS: usize = 3;

#[async_trait]
pub trait KeyValueCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Writes `value` only if the current value equals `expected` (`None`
    /// meaning absent). Returns whether the write happened.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        value: String,
    ) -> Result<bool, StoreError>;

    async fn keys(&self) -> Result<Vec<String>, StoreError>;
}

/// moka-backed cache with optional record expiry.
pub struct LocalKeyValueCache {
    entries: Cache<String, String>,
    writes: Mutex<()>,
}

impl LocalKeyValueCache {
    pub fn new(max_capacity: u64, ttl: Option<Duration>) -> Self {
        let mut builder = Cache::builder().max_capacity(max_capacity);
        if let Some(ttl) = ttl {
            builder = builder.time_to_live(ttl);
        }
        Self { entries: builder.build(), writes: Mutex::new(()) }
    }
}

#[async_trait]
impl KeyValueCache for LocalKeyValueCache {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.entries.get(key).await)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        value: String,
    ) -> Result<bool, StoreError> {
        let _guard = self.writes.lock().await;
        let current = self.entries.get(key).await;
        if current.as_deref() != expected {
            return Ok(false);
        }
        self.entries.insert(key.to_string(), value).await;
        Ok(true)
    }

    async fn keys(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.entries.iter().map(|(key, _)| (*key).clone()).collect())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheRecord {
    events: Vec<Event>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cached: Option<CachedState>,
}

pub struct KeyedCacheTrackerStore<C = LocalKeyValueCache> {
    cache: C,
    key_prefix: String,
    session: SessionConfig,
}

impl KeyedCacheTrackerStore<LocalKeyValueCache> {
    pub fn from_config(config: &CacheStoreConfig, session: SessionConfig) -> Self {
        Self::new(
            LocalKeyValueCache::new(config.max_capacity, config.ttl()),
            config.key_prefix.clone(),
            session,
        )
    }
}

impl<C: KeyValueCache> KeyedCacheTrackerStore<C> {
    pub fn new(cache: C, key_prefix: impl Into<String>, session: SessionConfig) -> Self {
        Self { cache, key_prefix: key_prefix.into(), session }
    }

    fn key(&self, conversation_id: &ConversationId) -> String {
        format!("{}{}", self.key_prefix, conversation_id)
    }

    async fn read_record(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Option<(String, CacheRecord)>, StoreError> {
        let Some(raw) = self.cache.get(&self.key(conversation_id)).await? else {
            return Ok(None);
        };
        let record = serde_json::from_str::<CacheRecord>(&raw)
            .map_err(|error| StoreError::corrupt(conversation_id, error.to_string()))?;
        Ok(Some((raw, record)))
    }

    fn encode(
        conversation_id: &ConversationId,
        record: &CacheRecord,
    ) -> Result<String, StoreError> {
        serde_json::to_string(record)
            .map_err(|error| StoreError::corrupt(conversation_id, error.to_string()))
    }
}

#[async_trait]
impl<C: KeyValueCache> TrackerStore for KeyedCacheTrackerStore<C> {
    fn backend(&self) -> &'static str {
        BACKEND
    }

    fn session_config(&self) -> &SessionConfig {
        &self.session
    }

    async fn load_events(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Option<StoredConversation>, StoreError> {
        let record = self.read_record(conversation_id).await?;
        Ok(record.filter(|(_, record)| !record.events.is_empty()).map(|(_, record)| {
            StoredConversation { conversation_id: conversation_id.clone(), events: record.events }
        }))
    }

    async fn append_all(
        &self,
        conversation_id: &ConversationId,
        events: Vec<Event>,
        expected_version: u64,
    ) -> Result<u64, StoreError> {
        let current = self.read_record(conversation_id).await?;
        let (raw, mut record) = match current {
            Some((raw, record)) => (Some(raw), record),
            None => (None, CacheRecord::default()),
        };

        let actual = record.events.len() as u64;
        if actual != expected_version {
            return Err(StoreError::Conflict {
                conversation_id: conversation_id.clone(),
                expected: expected_version,
                actual,
            });
        }

        record.events.extend(events);
        let version = record.events.len() as u64;
        let encoded = Self::encode(conversation_id, &record)?;

        let swapped =
            self.cache.compare_and_swap(&self.key(conversation_id), raw.as_deref(), encoded).await?;
        if !swapped {
            let actual = self
                .read_record(conversation_id)
                .await?
                .map_or(0, |(_, record)| record.events.len() as u64);
            debug!(
                event_name = "store.cache.cas_lost",
                conversation_id = %conversation_id,
                expected_version,
                actual,
                "compare-and-swap lost to a concurrent writer"
            );
            return Err(StoreError::Conflict {
                conversation_id: conversation_id.clone(),
                expected: expected_version,
                actual: actual.max(expected_version + 1),
            });
        }

        Ok(version)
    }

    async fn list_conversation_ids_page(
        &self,
        after: Option<&ConversationId>,
        limit: usize,
    ) -> Result<Vec<ConversationId>, StoreError> {
        let mut ids: Vec<ConversationId> = self
            .cache
            .keys()
            .await?
            .into_iter()
            .filter_map(|key| key.strip_prefix(&self.key_prefix).map(ConversationId::new))
            .filter(|id| after.map_or(true, |after| id > after))
            .collect();
        ids.sort();
        ids.dedup();
        ids.truncate(limit);
        Ok(ids)
    }

    async fn keys(&self) -> Result<BTreeSet<String>, StoreError> {
        Ok(self
            .cache
            .keys()
            .await?
            .into_iter()
            .filter(|key| key.starts_with(&self.key_prefix))
            .collect())
    }

    async fn cached_state(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Option<CachedState>, StoreError> {
        Ok(self.read_record(conversation_id).await?.and_then(|(_, record)| record.cached))
    }

    async fn store_cached_state(
        &self,
        conversation_id: &ConversationId,
        state: CachedState,
    ) -> Result<(), StoreError> {
        for _ in 0..CACHED_STATE_ATTEMPTS {
            let Some((raw, mut record)) = self.read_record(conversation_id).await? else {
                return Ok(());
            };

            let newer = record.cached.as_ref().map_or(true, |cached| state.version >= cached.version);
            if !newer || state.version > record.events.len() as u64 {
                return Ok(());
            }

            record.cached = Some(state.clone());
            let encoded = Self::encode(conversation_id, &record)?;
            if self.cache.compare_and_swap(&self.key(conversation_id), Some(&raw), encoded).await? {
                return Ok(());
            }
        }

        // The snapshot is an optimization; a busy record simply keeps the old one.
        debug!(
            event_name = "store.cache.snapshot_skipped",
            conversation_id = %conversation_id,
            version = state.version,
            "cached state not written after repeated concurrent updates"
        );
        Ok(())
    }
}

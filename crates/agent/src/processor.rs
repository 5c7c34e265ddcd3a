use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use colloquy_core::domain::event::Event;
use colloquy_core::domain::message::UserMessage;
use colloquy_core::domain::tracker::{ConversationId, Tracker, TrackerSnapshot};
use colloquy_core::errors::ProcessingError;
use colloquy_core::store::{CachedState, TrackerStore};

use crate::locks::LockManager;
use crate::model::{LoadedModel, ModelServer};

/// Decides how the assistant reacts to the latest user message.
///
/// The tracker passed in already contains the user message. The returned
/// events are appended after it, in order.
#[async_trait]
pub trait DialogueEngine: Send + Sync {
    async fn respond(
        &self,
        tracker: &Tracker,
        model: &LoadedModel,
        message: &UserMessage,
    ) -> Result<Vec<Event>, ProcessingError>;
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ProcessedMessage {
    pub conversation_id: ConversationId,
    pub version: u64,
    /// Events produced by the dialogue engine for this message.
    pub responses: Vec<Event>,
    pub state: TrackerSnapshot,
}

/// Drives one inbound message through lock, load, engine and append.
pub struct MessageProcessor {
    store: Arc<dyn TrackerStore>,
    locks: Arc<LockManager>,
    models: ModelServer,
    engine: Arc<dyn DialogueEngine>,
    lock_timeout: Duration,
}

impl MessageProcessor {
    pub fn new(
        store: Arc<dyn TrackerStore>,
        locks: Arc<LockManager>,
        models: ModelServer,
        engine: Arc<dyn DialogueEngine>,
        lock_timeout: Duration,
    ) -> Self {
        Self { store, locks, models, engine, lock_timeout }
    }

    pub async fn handle_message(
        &self,
        message: UserMessage,
    ) -> Result<ProcessedMessage, ProcessingError> {
        let has_text = message.text.as_deref().is_some_and(|text| !text.is_empty());
        if !has_text && message.parse_data.is_null() {
            return Err(ProcessingError::InvalidRequest(
                "message carries neither text nor parse data".to_string(),
            ));
        }
        let model = self.models.current().ok_or(ProcessingError::ModelUnavailable)?;

        let conversation_id = message.sender_id.clone();
        let _lock =
            self.locks.acquire(&conversation_id, &message.message_id, self.lock_timeout).await?;

        let tracker = self.store.get_or_create(&conversation_id).await?;
        let loaded_version = tracker.version();
        let now = Utc::now();

        let mut pending = Vec::new();
        let session = self.store.session_config();
        if session.needs_new_session(&tracker, now) {
            pending.extend(session.session_start_events(now));
        }
        pending.push(message.to_event(now));

        let mut working = tracker;
        for event in &pending {
            working.apply(event.clone());
        }

        let responses = if working.is_paused() {
            Vec::new()
        } else {
            self.engine.respond(&working, &model, &message).await?
        };
        for event in &responses {
            working.apply(event.clone());
        }
        pending.extend(responses.iter().cloned());

        let version = self.store.append_all(&conversation_id, pending, loaded_version).await?;
        self.refresh_cached_state(&working).await;

        info!(
            event_name = "processor.message.handled",
            correlation_id = %message.message_id,
            conversation_id = %conversation_id,
            version,
            responses = responses.len(),
            "message processed"
        );
        Ok(ProcessedMessage {
            conversation_id,
            version,
            responses,
            state: working.current_state(),
        })
    }

    /// Appends externally supplied events, such as interactive-learning
    /// corrections, under the same lock and version discipline as messages.
    pub async fn append_events(
        &self,
        conversation_id: &ConversationId,
        events: Vec<Event>,
    ) -> Result<TrackerSnapshot, ProcessingError> {
        if events.is_empty() {
            return Err(ProcessingError::InvalidRequest("no events to append".to_string()));
        }

        let _lock = self.locks.acquire(conversation_id, "append_events", self.lock_timeout).await?;
        let mut tracker = self.store.get_or_create(conversation_id).await?;
        let loaded_version = tracker.version();
        for event in &events {
            tracker.apply(event.clone());
        }

        let version = self.store.append_all(conversation_id, events, loaded_version).await?;
        self.refresh_cached_state(&tracker).await;

        info!(
            event_name = "processor.events.appended",
            conversation_id = %conversation_id,
            version,
            "external events appended"
        );
        Ok(tracker.current_state())
    }

    /// Current state without taking the lock; `None` for unknown ids.
    pub async fn tracker_state(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Option<TrackerSnapshot>, ProcessingError> {
        let tracker = self.store.retrieve(conversation_id).await?;
        Ok(tracker.map(|tracker| tracker.current_state()))
    }

    async fn refresh_cached_state(&self, tracker: &Tracker) {
        let conversation_id = tracker.conversation_id();
        if let Err(error) =
            self.store.store_cached_state(conversation_id, CachedState::of(tracker)).await
        {
            warn!(
                event_name = "processor.cached_state.failed",
                conversation_id = %conversation_id,
                error = %error,
                "cached state not refreshed"
            );
        }
    }
}

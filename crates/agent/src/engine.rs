//! Dialogue engines used by the message processor.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use colloquy_core::config::EngineConfig;
use colloquy_core::domain::event::Event;
use colloquy_core::domain::message::UserMessage;
use colloquy_core::domain::tracker::{ConversationId, Tracker, TrackerSnapshot};
use colloquy_core::errors::ProcessingError;

use crate::model::{LoadedModel, ModelInfo};
use crate::processor::DialogueEngine;

/// Records the message and produces nothing; replies arrive later as
/// appended events.
#[derive(Clone, Copy, Debug, Default)]
pub struct RecordOnlyEngine;

#[async_trait]
impl DialogueEngine for RecordOnlyEngine {
    async fn respond(
        &self,
        _tracker: &Tracker,
        _model: &LoadedModel,
        _message: &UserMessage,
    ) -> Result<Vec<Event>, ProcessingError> {
        Ok(Vec::new())
    }
}

#[derive(Serialize)]
struct RespondRequest<'a> {
    conversation_id: &'a ConversationId,
    model: ModelInfo,
    message: &'a UserMessage,
    tracker: TrackerSnapshot,
    events: &'a [Event],
}

#[derive(Deserialize)]
struct RespondResponse {
    #[serde(default)]
    events: Vec<Event>,
}

/// Posts the tracker to an HTTP endpoint and appends the events it answers with.
pub struct RemoteDialogueEngine {
    http: reqwest::Client,
    url: String,
}

impl RemoteDialogueEngine {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, ProcessingError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| ProcessingError::Engine(error.to_string()))?;
        Ok(Self { http, url: url.into() })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl DialogueEngine for RemoteDialogueEngine {
    async fn respond(
        &self,
        tracker: &Tracker,
        model: &LoadedModel,
        message: &UserMessage,
    ) -> Result<Vec<Event>, ProcessingError> {
        let engine = |detail: String| ProcessingError::Engine(detail);
        let body = RespondRequest {
            conversation_id: tracker.conversation_id(),
            model: model.info(),
            message,
            tracker: tracker.current_state(),
            events: tracker.events(),
        };

        let response = self
            .http
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|error| engine(error.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(engine(format!("dialogue engine answered {status}")));
        }

        let decoded: RespondResponse =
            response.json().await.map_err(|error| engine(error.to_string()))?;
        debug!(
            event_name = "engine.remote.responded",
            correlation_id = %message.message_id,
            conversation_id = %tracker.conversation_id(),
            events = decoded.events.len(),
            "dialogue engine responded"
        );
        Ok(decoded.events)
    }
}

/// Remote engine when `url` is set, otherwise [`RecordOnlyEngine`].
pub fn from_config(config: &EngineConfig) -> Result<Arc<dyn DialogueEngine>, ProcessingError> {
    match config.url.as_deref() {
        Some(url) => Ok(Arc::new(RemoteDialogueEngine::new(url, config.timeout())?)),
        None => Ok(Arc::new(RecordOnlyEngine)),
    }
}

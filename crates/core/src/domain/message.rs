use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::domain::event::{Event, EventKind};
use crate::domain::tracker::ConversationId;

pub const DEFAULT_SENDER_ID: &str = "default";

/// An inbound message as handed over by an input channel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UserMessage {
    pub text: Option<String>,
    pub sender_id: ConversationId,
    pub message_id: String,
    pub input_channel: Option<String>,
    pub parse_data: Value,
}

impl UserMessage {
    /// Normalizes the raw channel payload: text is trimmed, a missing sender
    /// falls back to [`DEFAULT_SENDER_ID`] and a missing message id is
    /// generated.
    pub fn new(
        text: Option<&str>,
        sender_id: Option<&str>,
        message_id: Option<&str>,
        input_channel: Option<&str>,
    ) -> Self {
        Self {
            text: text.map(|value| value.trim().to_string()),
            sender_id: ConversationId::new(sender_id.unwrap_or(DEFAULT_SENDER_ID)),
            message_id: message_id
                .map(str::to_string)
                .unwrap_or_else(|| Uuid::new_v4().simple().to_string()),
            input_channel: input_channel.map(str::to_string),
            parse_data: Value::Null,
        }
    }

    pub fn with_parse_data(mut self, parse_data: Value) -> Self {
        self.parse_data = parse_data;
        self
    }

    pub fn to_event(&self, timestamp: DateTime<Utc>) -> Event {
        Event::new(
            EventKind::UserUttered {
                text: self.text.clone(),
                parse_data: self.parse_data.clone(),
                input_channel: self.input_channel.clone(),
                message_id: Some(self.message_id.clone()),
            },
            timestamp,
        )
    }
}

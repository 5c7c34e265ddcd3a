//! Versioned dump of a tracker store, used as training input and for moving
//! conversations between backends.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::domain::event::Event;
use crate::domain::tracker::{ConversationId, Tracker};
use crate::errors::StoreError;
use crate::session::SessionConfig;
use crate::store::TrackerStore;

pub const EXPORT_SCHEMA_VERSION: u32 = 1;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExportedConversation {
    pub conversation_id: ConversationId,
    pub events: Vec<Event>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConversationExport {
    pub schema_version: u32,
    pub exported_at: DateTime<Utc>,
    pub conversations: Vec<ExportedConversation>,
}

#[derive(Debug, Error)]
pub enum ExportError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("export schema version {found} is not supported (newest known is {supported})")]
    UnsupportedSchema { found: u32, supported: u32 },
    #[error("malformed export: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl ConversationExport {
    pub fn new(exported_at: DateTime<Utc>) -> Self {
        Self { schema_version: EXPORT_SCHEMA_VERSION, exported_at, conversations: Vec::new() }
    }

    pub fn to_json(&self) -> Result<String, ExportError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parses an export, checking the schema version before decoding the
    /// conversations so that newer layouts fail with a clear error.
    pub fn from_json(raw: &str) -> Result<Self, ExportError> {
        #[derive(Deserialize)]
        struct Header {
            schema_version: u32,
        }

        let header: Header = serde_json::from_str(raw)?;
        if header.schema_version > EXPORT_SCHEMA_VERSION || header.schema_version == 0 {
            return Err(ExportError::UnsupportedSchema {
                found: header.schema_version,
                supported: EXPORT_SCHEMA_VERSION,
            });
        }
        Ok(serde_json::from_str(raw)?)
    }

    pub fn event_count(&self) -> usize {
        self.conversations.iter().map(|conversation| conversation.events.len()).sum()
    }

    /// Rebuilds every exported conversation.
    pub fn replay_all(&self, session_config: &SessionConfig) -> Vec<Tracker> {
        self.conversations
            .iter()
            .map(|conversation| {
                Tracker::replay(
                    conversation.conversation_id.clone(),
                    conversation.events.iter().cloned(),
                    session_config.clone(),
                )
            })
            .collect()
    }

    /// Writes every conversation into an empty slot of `store` and returns
    /// how many were written; conversations without events are skipped. A
    /// conversation that already has events fails with [`StoreError::Conflict`].
    pub async fn import_into(&self, store: &dyn TrackerStore) -> Result<usize, ExportError> {
        let mut imported = 0;
        for conversation in self.conversations.iter().filter(|c| !c.events.is_empty()) {
            store.append_all(&conversation.conversation_id, conversation.events.clone(), 0).await?;
            imported += 1;
        }
        info!(
            event_name = "export.imported",
            backend = store.backend(),
            conversations = imported,
            "imported conversations into tracker store"
        );
        Ok(imported)
    }
}

/// Reads every conversation of `store` into an export.
pub async fn export_conversations(
    store: &dyn TrackerStore,
    exported_at: DateTime<Utc>,
) -> Result<ConversationExport, ExportError> {
    let mut export = ConversationExport::new(exported_at);
    let mut ids = store.list_conversation_ids();

    while let Some(conversation_id) = ids.next().await? {
        let Some(stored) = store.load_events(&conversation_id).await? else {
            continue;
        };
        export.conversations.push(ExportedConversation {
            conversation_id: stored.conversation_id,
            events: stored.events,
        });
    }

    info!(
        event_name = "export.completed",
        backend = store.backend(),
        conversations = export.conversations.len(),
        events = export.event_count(),
        "exported tracker store"
    );
    Ok(export)
}

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sqlx::{sqlite::SqliteRow, Row, Sqlite, Transaction};
use tracing::warn;

use colloquy_core::domain::event::Event;
use colloquy_core::domain::tracker::{ConversationId, TrackerState};
use colloquy_core::errors::StoreError;
use colloquy_core::session::SessionConfig;
use colloquy_core::store::{CachedState, StoredConversation, TrackerStore};

use crate::DbPool;

const BACKEND: &str = "sql";

pub struct SqlTrackerStore {
    pool: DbPool,
    session: SessionConfig,
}

impl SqlTrackerStore {
    pub fn new(pool: DbPool, session: SessionConfig) -> Self {
        Self { pool, session }
    }
}

fn unavailable(error: sqlx::Error) -> StoreError {
    StoreError::unavailable(BACKEND, error.to_string())
}

fn is_unique_violation(error: &sqlx::Error) -> bool {
    matches!(error, sqlx::Error::Database(db) if db.is_unique_violation())
}

#[async_trait]
impl TrackerStore for SqlTrackerStore {
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
        let rows = sqlx::query(
            "SELECT sequence_number, payload_json
             FROM tracker_events
             WHERE conversation_id = ?
             ORDER BY sequence_number ASC",
        )
        .bind(conversation_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable)?;

        if rows.is_empty() {
            return Ok(None);
        }

        let events = rows
            .into_iter()
            .enumerate()
            .map(|(index, row)| event_from_row(conversation_id, index, row))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Some(StoredConversation { conversation_id: conversation_id.clone(), events }))
    }

    async fn append_all(
        &self,
        conversation_id: &ConversationId,
        events: Vec<Event>,
        expected_version: u64,
    ) -> Result<u64, StoreError> {
        if events.is_empty() {
            let actual = event_count(&self.pool, conversation_id).await?;
            return conflict_unless(conversation_id, expected_version, actual).map(|_| actual);
        }

        // The first insert carries the version check, so it takes the write
        // lock before reading the count and a racing writer finds zero rows.
        let mut tx = self.pool.begin().await.map_err(unavailable)?;
        let mut version = expected_version;
        for event in &events {
            version += 1;
            let guard = (version == expected_version + 1).then_some(expected_version);
            let inserted = insert_event(&mut tx, conversation_id, version, event, guard).await;

            match inserted {
                Ok(0) => {
                    let actual = event_count(&mut *tx, conversation_id).await?;
                    conflict_unless(conversation_id, expected_version, actual)?;
                    return Err(unavailable_write(conversation_id));
                }
                Ok(_) => {}
                Err(InsertError::Database(error)) if is_unique_violation(&error) => {
                    return Err(StoreError::Conflict {
                        conversation_id: conversation_id.clone(),
                        expected: expected_version,
                        actual: version,
                    });
                }
                Err(error) => return Err(map_insert_error(conversation_id, error)),
            }
        }

        tx.commit().await.map_err(|error| {
            if is_unique_violation(&error) {
                StoreError::Conflict {
                    conversation_id: conversation_id.clone(),
                    expected: expected_version,
                    actual: expected_version + 1,
                }
            } else {
                unavailable(error)
            }
        })?;

        Ok(version)
    }

    async fn list_conversation_ids_page(
        &self,
        after: Option<&ConversationId>,
        limit: usize,
    ) -> Result<Vec<ConversationId>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let fetched = if let Some(after) = after {
            sqlx::query(
                "SELECT DISTINCT conversation_id
                 FROM tracker_events
                 WHERE conversation_id > ?
                 ORDER BY conversation_id ASC
                 LIMIT ?",
            )
            .bind(after.as_str())
            .bind(limit)
            .fetch_all(&self.pool)
            .await
        } else {
            sqlx::query(
                "SELECT DISTINCT conversation_id
                 FROM tracker_events
                 ORDER BY conversation_id ASC
                 LIMIT ?",
            )
            .bind(limit)
            .fetch_all(&self.pool)
            .await
        };

        fetched
            .map_err(unavailable)?
            .into_iter()
            .map(|row| row.try_get::<String, _>("conversation_id").map(ConversationId::new))
            .collect::<Result<Vec<_>, _>>()
            .map_err(unavailable)
    }

    async fn cached_state(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Option<CachedState>, StoreError> {
        let row = sqlx::query(
            "SELECT version, state_json FROM tracker_snapshots WHERE conversation_id = ?",
        )
        .bind(conversation_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(unavailable)?;

        row.map(|row| snapshot_from_row(conversation_id, row)).transpose()
    }

    async fn store_cached_state(
        &self,
        conversation_id: &ConversationId,
        state: CachedState,
    ) -> Result<(), StoreError> {
        if state.version == 0 {
            return Ok(());
        }
        let state_json = serde_json::to_string(&state.state)
            .map_err(|error| StoreError::corrupt(conversation_id, error.to_string()))?;

        let written = sqlx::query(
            "INSERT INTO tracker_snapshots (conversation_id, version, state_json, updated_at)
             SELECT ?, ?, ?, ?
             WHERE ? <= (SELECT COUNT(*) FROM tracker_events WHERE conversation_id = ?)
             ON CONFLICT(conversation_id) DO UPDATE SET
                version = excluded.version,
                state_json = excluded.state_json,
                updated_at = excluded.updated_at
             WHERE excluded.version >= tracker_snapshots.version",
        )
        .bind(conversation_id.as_str())
        .bind(state.version as i64)
        .bind(state_json)
        .bind(Utc::now().to_rfc3339())
        .bind(state.version as i64)
        .bind(conversation_id.as_str())
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;

        if written.rows_affected() == 0 {
            warn!(
                event_name = "store.sql.snapshot_skipped",
                conversation_id = %conversation_id,
                version = state.version,
                "snapshot not written: newer snapshot present or version ahead of events"
            );
        }
        Ok(())
    }
}

enum InsertError {
    Encode(String),
    Database(sqlx::Error),
}

impl From<sqlx::Error> for InsertError {
    fn from(error: sqlx::Error) -> Self {
        Self::Database(error)
    }
}

fn map_insert_error(conversation_id: &ConversationId, error: InsertError) -> StoreError {
    match error {
        InsertError::Encode(message) => StoreError::corrupt(conversation_id, message),
        InsertError::Database(error) => unavailable(error),
    }
}

fn unavailable_write(conversation_id: &ConversationId) -> StoreError {
    StoreError::unavailable(
        BACKEND,
        format!("append to `{conversation_id}` wrote no rows at a matching version"),
    )
}

fn conflict_unless(
    conversation_id: &ConversationId,
    expected: u64,
    actual: u64,
) -> Result<(), StoreError> {
    if actual == expected {
        Ok(())
    } else {
        Err(StoreError::Conflict { conversation_id: conversation_id.clone(), expected, actual })
    }
}

async fn event_count<'e, E>(executor: E, conversation_id: &ConversationId) -> Result<u64, StoreError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let count = sqlx::query("SELECT COUNT(*) AS count FROM tracker_events WHERE conversation_id = ?")
        .bind(conversation_id.as_str())
        .fetch_one(executor)
        .await
        .map_err(unavailable)?
        .try_get::<i64, _>("count")
        .map_err(unavailable)?;
    parse_version(conversation_id, count)
}

/// Inserts one event row. With `guard` set, the row is written only while
/// the conversation holds exactly that many events; the result is the
/// number of rows written.
async fn insert_event(
    tx: &mut Transaction<'_, Sqlite>,
    conversation_id: &ConversationId,
    version: u64,
    event: &Event,
    guard: Option<u64>,
) -> Result<u64, InsertError> {
    let payload = event
        .to_value()
        .and_then(|value| serde_json::to_string(&value))
        .map_err(|error| InsertError::Encode(error.to_string()))?;

    let query = match guard {
        Some(_) => sqlx::query(
            "INSERT INTO tracker_events (
                conversation_id,
                sequence_number,
                event_type,
                timestamp,
                payload_json
             )
             SELECT ?, ?, ?, ?, ?
             WHERE (SELECT COUNT(*) FROM tracker_events WHERE conversation_id = ?) = ?",
        ),
        None => sqlx::query(
            "INSERT INTO tracker_events (
                conversation_id,
                sequence_number,
                event_type,
                timestamp,
                payload_json
             ) VALUES (?, ?, ?, ?, ?)",
        ),
    };
    let mut query = query
        .bind(conversation_id.as_str())
        .bind(version as i64)
        .bind(event.tag())
        .bind(event.timestamp.to_rfc3339())
        .bind(payload);
    if let Some(expected) = guard {
        query = query.bind(conversation_id.as_str()).bind(expected as i64);
    }

    Ok(query.execute(&mut **tx).await?.rows_affected())
}

fn event_from_row(
    conversation_id: &ConversationId,
    index: usize,
    row: SqliteRow,
) -> Result<Event, StoreError> {
    let sequence_number = row.try_get::<i64, _>("sequence_number").map_err(unavailable)?;
    if sequence_number != index as i64 + 1 {
        return Err(StoreError::corrupt(
            conversation_id,
            format!("gap in event sequence: expected {}, found {sequence_number}", index + 1),
        ));
    }

    let payload = row.try_get::<String, _>("payload_json").map_err(unavailable)?;
    let value = serde_json::from_str::<Value>(&payload).map_err(|error| {
        StoreError::corrupt(conversation_id, format!("event {sequence_number}: {error}"))
    })?;
    Event::from_value(value).map_err(|error| {
        StoreError::corrupt(conversation_id, format!("event {sequence_number}: {error}"))
    })
}

fn snapshot_from_row(
    conversation_id: &ConversationId,
    row: SqliteRow,
) -> Result<CachedState, StoreError> {
    let version = parse_version(conversation_id, row.try_get("version").map_err(unavailable)?)?;
    let state_json = row.try_get::<String, _>("state_json").map_err(unavailable)?;
    let state = serde_json::from_str::<TrackerState>(&state_json)
        .map_err(|error| StoreError::corrupt(conversation_id, format!("snapshot: {error}")))?;
    Ok(CachedState { version, state })
}

fn parse_version(conversation_id: &ConversationId, value: i64) -> Result<u64, StoreError> {
    u64::try_from(value).map_err(|_| {
        StoreError::corrupt(conversation_id, format!("negative version in store: {value}"))
    })
}

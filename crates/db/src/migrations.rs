use sqlx::migrate::{MigrateError, Migrator};

use crate::DbPool;

pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

pub async fn run_pending(pool: &DbPool) -> Result<(), MigrateError> {
    MIGRATOR.run(pool).await
}

#[cfg(test)]
mod tests {
    use sqlx::Row;

    use super::run_pending;
    use crate::{connect_with_settings, migrations::MIGRATOR};

    const TRACKER_SCHEMA: &[&str] =
        &["idx_tracker_events_event_type", "tracker_events", "tracker_snapshots"];

    async fn table_count(pool: &sqlx::SqlitePool, name: &str) -> i64 {
        sqlx::query(
            "SELECT COUNT(*) AS count FROM sqlite_master WHERE type = 'table' AND name = ?",
        )
        .bind(name)
        .fetch_one(pool)
        .await
        .expect("check table")
        .get::<i64, _>("count")
    }

    #[tokio::test]
    async fn migrations_create_tracker_tables() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        run_pending(&pool).await.expect("run migrations");

        assert_eq!(table_count(&pool, "tracker_events").await, 1);
        assert_eq!(table_count(&pool, "tracker_snapshots").await, 1);
    }

    #[tokio::test]
    async fn duplicate_sequence_numbers_are_rejected() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        run_pending(&pool).await.expect("run migrations");

        let insert = "INSERT INTO tracker_events
            (conversation_id, sequence_number, event_type, timestamp, payload_json)
            VALUES ('c1', 1, 'session_started', '2026-03-01T09:00:00Z', '{}')";
        sqlx::query(insert).execute(&pool).await.expect("first insert");
        let error = sqlx::query(insert).execute(&pool).await.expect_err("duplicate must fail");

        let unique = matches!(&error, sqlx::Error::Database(db) if db.is_unique_violation());
        assert!(unique, "expected a unique violation, got {error}");
    }

    #[tokio::test]
    async fn undo_then_rerun_restores_the_same_schema() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        run_pending(&pool).await.expect("run migrations");
        let before = tracker_schema(&pool).await;
        assert_eq!(before.len(), TRACKER_SCHEMA.len());

        MIGRATOR.undo(&pool, 0).await.expect("undo");
        assert!(tracker_schema(&pool).await.is_empty());

        run_pending(&pool).await.expect("rerun migrations");
        assert_eq!(tracker_schema(&pool).await, before);
    }

    async fn tracker_schema(pool: &sqlx::SqlitePool) -> Vec<(String, String)> {
        let rows = sqlx::query("SELECT name, IFNULL(sql, '') AS sql FROM sqlite_master ORDER BY name")
            .fetch_all(pool)
            .await
            .expect("read sqlite_master");
        rows.into_iter()
            .map(|row| (row.get::<String, _>("name"), row.get::<String, _>("sql")))
            .filter(|(name, _)| TRACKER_SCHEMA.contains(&name.as_str()))
            .collect()
    }
}

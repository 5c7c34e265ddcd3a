use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::Utc;
use colloquy_agent::{LockManager, TrainingCoordinator};
use colloquy_core::store::TrackerStore;
use serde::Serialize;

#[derive(Clone)]
pub struct HealthState {
    store: Arc<dyn TrackerStore>,
    locks: Arc<LockManager>,
    training: Arc<TrainingCoordinator>,
}

impl HealthState {
    pub fn new(
        store: Arc<dyn TrackerStore>,
        locks: Arc<LockManager>,
        training: Arc<TrainingCoordinator>,
    ) -> Self {
        Self { store, locks, training }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthCheck {
    pub status: &'static str,
    pub detail: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: HealthCheck,
    pub tracker_store: HealthCheck,
    pub conversation_locks: HealthCheck,
    pub training: HealthCheck,
    pub checked_at: String,
}

pub fn router(state: HealthState) -> Router {
    Router::new().route("/health", get(health)).with_state(state)
}

pub async fn health(State(state): State<HealthState>) -> (StatusCode, Json<HealthResponse>) {
    let tracker_store = store_check(state.store.as_ref()).await;
    let training = training_check(&state.training);
    let ready = tracker_store.status == "ready" && training.status == "ready";

    let payload = HealthResponse {
        status: if ready { "ready" } else { "degraded" },
        service: HealthCheck {
            status: "ready",
            detail: "colloquy-server runtime initialized".to_string(),
        },
        tracker_store,
        conversation_locks: HealthCheck {
            status: "ready",
            detail: format!(
                "{} conversations locked or awaited",
                state.locks.tracked_conversations()
            ),
        },
        training,
        checked_at: Utc::now().to_rfc3339(),
    };

    let status_code = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status_code, Json(payload))
}

async fn store_check(store: &dyn TrackerStore) -> HealthCheck {
    match store.list_conversation_ids_page(None, 1).await {
        Ok(_) => HealthCheck {
            status: "ready",
            detail: format!("tracker store `{}` reachable", store.backend()),
        },
        Err(error) => HealthCheck {
            status: "degraded",
            detail: format!("tracker store `{}` unreachable: {error}", store.backend()),
        },
    }
}

fn training_check(training: &TrainingCoordinator) -> HealthCheck {
    if training.is_worker_alive() {
        HealthCheck { status: "ready", detail: "training worker running".to_string() }
    } else {
        HealthCheck { status: "degraded", detail: "training worker stopped".to_string() }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::{extract::State, http::StatusCode, Json};
    use colloquy_agent::{
        CommandTrainer, CoordinatorSettings, LockManager, ModelServer, PlatformModelLoader,
        TrainingCoordinator,
    };
    use colloquy_core::domain::tracker::ConversationId;
    use colloquy_core::session::SessionConfig;
    use colloquy_core::store::TrackerStore;
    use colloquy_db::{connect_with_settings, migrations, InMemoryTrackerStore, SqlTrackerStore};

    use crate::health::{health, HealthState};

    fn coordinator(store: Arc<dyn TrackerStore>) -> Arc<TrainingCoordinator> {
        let loader = PlatformModelLoader::new(Duration::from_secs(1), None).expect("loader");
        Arc::new(TrainingCoordinator::spawn(
            CoordinatorSettings {
                heartbeat_interval: Duration::from_secs(1),
                liveness_timeout: Duration::from_secs(30),
            },
            Arc::new(CommandTrainer::new("true", Vec::new(), std::env::temp_dir())),
            store,
            ModelServer::new(Arc::new(loader)),
        ))
    }

    #[tokio::test]
    async fn health_returns_ready_when_store_is_reachable() {
        let store: Arc<dyn TrackerStore> = Arc::new(InMemoryTrackerStore::default());
        let locks = Arc::new(LockManager::new());
        let state = HealthState::new(
            Arc::clone(&store),
            Arc::clone(&locks),
            coordinator(Arc::clone(&store)),
        );
        let _held = locks
            .acquire(&ConversationId::new("c1"), "test", Duration::from_secs(1))
            .await
            .expect("hold");

        let (status, Json(payload)) = health(State(state)).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(payload.conversation_locks.detail, "1 conversations locked or awaited");
        assert_eq!(payload.status, "ready");
        assert_eq!(payload.tracker_store.status, "ready");
        assert_eq!(payload.training.status, "ready");
        assert_eq!(payload.service.status, "ready");
    }

    #[tokio::test]
    async fn health_returns_service_unavailable_when_store_is_unreachable() {
        let pool = connect_with_settings("sqlite::memory:", 1, 5).await.expect("pool");
        migrations::run_pending(&pool).await.expect("migrations");
        let store: Arc<dyn TrackerStore> =
            Arc::new(SqlTrackerStore::new(pool.clone(), SessionConfig::default()));
        pool.close().await;

        let state = HealthState::new(
            Arc::clone(&store),
            Arc::new(LockManager::new()),
            coordinator(Arc::clone(&store)),
        );
        let (status, Json(payload)) = health(State(state)).await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(payload.status, "degraded");
        assert_eq!(payload.tracker_store.status, "degraded");
        assert_eq!(payload.service.status, "ready");
    }
}

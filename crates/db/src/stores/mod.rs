//! Tracker store backends and their selection from configuration.

use std::sync::Arc;

use colloquy_core::config::{StoreBackend, TrackerStoreConfig};
use colloquy_core::session::SessionConfig;
use colloquy_core::store::TrackerStore;
use sqlx::migrate::MigrateError;
use thiserror::Error;
use tracing::info;

use crate::{connection, migrations};

pub mod cache;
pub mod memory;
pub mod sql;
pub mod timeout;

pub use cache::{KeyValueCache, KeyedCacheTrackerStore, LocalKeyValueCache};
pub use memory::InMemoryTrackerStore;
pub use sql::SqlTrackerStore;
pub use timeout::TimeoutTrackerStore;

#[derive(Debug, Error)]
pub enum StoreInitError {
    #[error("could not connect to tracker database: {0}")]
    Connect(#[from] sqlx::Error),
    #[error("could not migrate tracker database: {0}")]
    Migrate(#[from] MigrateError),
}

/// Builds the configured backend once, wrapped in the store-call timeout.
pub async fn from_config(
    config: &TrackerStoreConfig,
    session: SessionConfig,
) -> Result<Arc<dyn TrackerStore>, StoreInitError> {
    let inner: Arc<dyn TrackerStore> = match config.backend {
        StoreBackend::Memory => Arc::new(InMemoryTrackerStore::new(session)),
        StoreBackend::Cache => Arc::new(KeyedCacheTrackerStore::from_config(&config.cache, session)),
        StoreBackend::Sql => {
            let pool = connection::connect_for_store(&config.sql).await?;
            migrations::run_pending(&pool).await?;
            Arc::new(SqlTrackerStore::new(pool, session))
        }
    };

    info!(
        event_name = "store.initialized",
        backend = inner.backend(),
        timeout_ms = config.timeout_ms,
        "tracker store ready"
    );
    Ok(Arc::new(TimeoutTrackerStore::new(inner, config.timeout())))
}

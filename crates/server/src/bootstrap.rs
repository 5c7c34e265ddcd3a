use std::sync::Arc;

use colloquy_agent::{
    engine, CommandTrainer, CoordinatorSettings, LockManager, MessageProcessor, ModelServer,
    PlatformModelLoader, TrainingCoordinator,
};
use colloquy_core::config::{AppConfig, ConfigError, LoadOptions};
use colloquy_core::errors::{ModelLoadError, ProcessingError};
use colloquy_core::store::TrackerStore;
use colloquy_db::StoreInitError;
use thiserror::Error;
use tracing::{info, warn};

pub struct Application {
    pub config: AppConfig,
    pub store: Arc<dyn TrackerStore>,
    pub models: ModelServer,
    pub locks: Arc<LockManager>,
    /// Channel connectors running in this process hand messages to this.
    pub processor: Arc<MessageProcessor>,
    pub training: Arc<TrainingCoordinator>,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("tracker store initialization failed: {0}")]
    Store(#[source] StoreInitError),
    #[error("model loader initialization failed: {0}")]
    ModelLoader(#[source] ModelLoadError),
    #[error("dialogue engine initialization failed: {0}")]
    Engine(#[source] ProcessingError),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting application bootstrap"
    );

    let store =
        colloquy_db::from_config(&config.tracker_store, config.session.to_session_config())
            .await
            .map_err(BootstrapError::Store)?;
    info!(
        event_name = "system.bootstrap.store_ready",
        correlation_id = "bootstrap",
        backend = store.backend(),
        "tracker store initialized"
    );

    let loader = PlatformModelLoader::from_config(&config.model)
        .map_err(BootstrapError::ModelLoader)?;
    let models = ModelServer::new(Arc::new(loader));
    if let Some(reference) = config.model.initial_reference.as_deref() {
        match models.load_from(reference).await {
            Ok(model) => info!(
                event_name = "system.bootstrap.model_loaded",
                correlation_id = "bootstrap",
                reference = %model.reference,
                fingerprint = %model.fingerprint,
                "initial model loaded"
            ),
            // Serving starts without a model; training or PUT /model can supply one.
            Err(error) => warn!(
                event_name = "system.bootstrap.model_missing",
                correlation_id = "bootstrap",
                reference,
                error = %error,
                "initial model could not be loaded"
            ),
        }
    }

    let engine = engine::from_config(&config.engine).map_err(BootstrapError::Engine)?;
    let locks = Arc::new(LockManager::new());
    let processor = Arc::new(MessageProcessor::new(
        Arc::clone(&store),
        Arc::clone(&locks),
        models.clone(),
        engine,
        config.lock.acquire_timeout(),
    ));
    info!(
        event_name = "system.bootstrap.processor_ready",
        correlation_id = "bootstrap",
        engine = config.engine.url.as_deref().unwrap_or("record-only"),
        lock_timeout_ms = config.lock.acquire_timeout_ms,
        "message processor ready"
    );

    let training = Arc::new(TrainingCoordinator::spawn(
        CoordinatorSettings::from_config(&config.training),
        Arc::new(CommandTrainer::from_config(&config.training)),
        Arc::clone(&store),
        models.clone(),
    ));
    info!(
        event_name = "system.bootstrap.training_ready",
        correlation_id = "bootstrap",
        command = %config.training.command,
        "training coordinator started"
    );

    Ok(Application { config, store, models, locks, processor, training })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use colloquy_core::config::{AppConfig, ConfigOverrides, LoadOptions, StoreBackend};
    use colloquy_core::domain::message::UserMessage;
    use colloquy_core::domain::tracker::ConversationId;
    use colloquy_core::errors::ProcessingError;

    use crate::bootstrap::{bootstrap, bootstrap_with_config, BootstrapError};

    fn options(overrides: ConfigOverrides) -> LoadOptions {
        LoadOptions { overrides, ..LoadOptions::default() }
    }

    #[tokio::test]
    async fn bootstrap_wires_the_configured_store() {
        let app = bootstrap(options(ConfigOverrides {
            store_backend: Some(StoreBackend::Sql),
            database_url: Some("sqlite::memory:".to_string()),
            ..ConfigOverrides::default()
        }))
        .await
        .expect("bootstrap should succeed");

        assert_eq!(app.store.backend(), "sql");
        let tracker = app.store.get_or_create(&ConversationId::new("c1")).await.expect("create");
        assert_eq!(tracker.version(), 1);
        assert!(app.models.current().is_none());
        assert!(app.training.jobs().is_empty());
    }

    #[tokio::test]
    async fn missing_initial_model_does_not_stop_startup() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = dir.path().join("missing.model").display().to_string();

        let app = bootstrap(options(ConfigOverrides {
            store_backend: Some(StoreBackend::Memory),
            model_reference: Some(missing),
            ..ConfigOverrides::default()
        }))
        .await
        .expect("bootstrap should succeed");

        assert!(app.models.current().is_none());
        assert!(app.models.last_error().is_some());
    }

    #[tokio::test]
    async fn invalid_database_url_fails_fast() {
        let result = bootstrap(options(ConfigOverrides {
            store_backend: Some(StoreBackend::Sql),
            database_url: Some("postgres://localhost/colloquy".to_string()),
            ..ConfigOverrides::default()
        }))
        .await;

        assert!(matches!(result, Err(BootstrapError::Config(_))));
    }

    #[tokio::test]
    async fn configured_lock_timeout_bounds_message_handling() {
        let dir = tempfile::tempdir().expect("tempdir");
        let model = dir.path().join("m1.model");
        std::fs::write(&model, b"weights").expect("write model");

        let mut config = AppConfig::default();
        config.lock.acquire_timeout_ms = 50;
        config.model.initial_reference = Some(model.display().to_string());
        let app = bootstrap_with_config(config).await.expect("bootstrap should succeed");

        let id = ConversationId::new("c1");
        let held = app.locks.acquire(&id, "other", Duration::from_secs(1)).await.expect("hold");
        let message = UserMessage::new(Some("hi"), Some("c1"), None, Some("rest"));
        let error = app.processor.handle_message(message.clone()).await.expect_err("busy");
        assert!(matches!(error, ProcessingError::Lock(_)));

        drop(held);
        let processed = app.processor.handle_message(message).await.expect("handled");
        assert!(processed.responses.is_empty(), "no engine url records the message only");
        assert_eq!(processed.version, 2);
    }
}

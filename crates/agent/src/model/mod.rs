//! The process-wide active model.
//!
//! The current model lives in a watch channel as an `Arc`. Readers clone the
//! pointer and keep using it for as long as they like; publishing replaces
//! the pointer in one step, so nobody ever observes a half-loaded model.

mod loader;

use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};

use colloquy_core::errors::ModelLoadError;

pub use loader::{ModelLoader, ModelReference, PlatformModelLoader};

#[derive(Debug, PartialEq)]
pub struct LoadedModel {
    pub reference: ModelReference,
    pub fingerprint: String,
    pub loaded_at: DateTime<Utc>,
    artifact: Vec<u8>,
}

impl LoadedModel {
    pub fn new(
        reference: ModelReference,
        artifact: Vec<u8>,
        loaded_at: DateTime<Utc>,
    ) -> Result<Self, ModelLoadError> {
        if artifact.is_empty() {
            return Err(ModelLoadError::Invalid {
                reference: reference.to_string(),
                message: "model artifact is empty".to_string(),
            });
        }

        let fingerprint = blake3::hash(&artifact).to_hex().to_string();
        Ok(Self { reference, fingerprint, loaded_at, artifact })
    }

    pub fn artifact(&self) -> &[u8] {
        &self.artifact
    }

    pub fn info(&self) -> ModelInfo {
        ModelInfo {
            reference: self.reference.to_string(),
            fingerprint: self.fingerprint.clone(),
            size_bytes: self.artifact.len() as u64,
            loaded_at: self.loaded_at,
        }
    }
}

/// What callers outside the process get to see of a model.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ModelInfo {
    pub reference: String,
    pub fingerprint: String,
    pub size_bytes: u64,
    pub loaded_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct ModelServer {
    inner: Arc<Inner>,
}

struct Inner {
    current: watch::Sender<Option<Arc<LoadedModel>>>,
    loader: Arc<dyn ModelLoader>,
    last_error: Mutex<Option<ModelLoadError>>,
}

impl ModelServer {
    pub fn new(loader: Arc<dyn ModelLoader>) -> Self {
        let (current, _) = watch::channel(None);
        Self { inner: Arc::new(Inner { current, loader, last_error: Mutex::new(None) }) }
    }

    pub fn current(&self) -> Option<Arc<LoadedModel>> {
        self.inner.current.borrow().clone()
    }

    /// Notified after every swap.
    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<LoadedModel>>> {
        self.inner.current.subscribe()
    }

    pub fn last_error(&self) -> Option<ModelLoadError> {
        self.inner.last_error.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Loads `reference` and makes it the active model. On failure the
    /// previous model stays active and the error is kept for [`Self::last_error`].
    pub async fn load_from(&self, reference: &str) -> Result<Arc<LoadedModel>, ModelLoadError> {
        let model = self.materialize(reference).await?;
        Ok(self.publish(model))
    }

    /// Loads `reference` without activating it.
    pub async fn materialize(&self, reference: &str) -> Result<LoadedModel, ModelLoadError> {
        let loaded = match ModelReference::parse(reference) {
            Ok(parsed) => self.inner.loader.load(&parsed).await,
            Err(error) => Err(error),
        };

        if let Err(error) = &loaded {
            warn!(
                event_name = "model.load.failed",
                reference,
                error = %error,
                "model load failed; active model unchanged"
            );
            self.record_error(Some(error.clone()));
        }
        loaded
    }

    pub fn publish(&self, model: LoadedModel) -> Arc<LoadedModel> {
        let model = Arc::new(model);
        let previous = self
            .inner
            .current
            .send_replace(Some(Arc::clone(&model)))
            .map(|old| old.reference.to_string());
        self.record_error(None);

        info!(
            event_name = "model.swapped",
            reference = %model.reference,
            fingerprint = %model.fingerprint,
            previous = ?previous,
            "active model replaced"
        );
        model
    }

    fn record_error(&self, error: Option<ModelLoadError>) {
        *self.inner.last_error.lock().unwrap_or_else(PoisonError::into_inner) = error;
    }
}

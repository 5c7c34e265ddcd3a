use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use tracing::debug;

use colloquy_core::config::ModelConfig;
use colloquy_core::errors::ModelLoadError;

use super::LoadedModel;

/// Where a model artifact lives.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ModelReference {
    Local(PathBuf),
    Remote(String),
}

impl ModelReference {
    pub fn parse(raw: &str) -> Result<Self, ModelLoadError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(ModelLoadError::Invalid {
                reference: raw.to_string(),
                message: "model reference is empty".to_string(),
            });
        }

        if raw.starts_with("http://") || raw.starts_with("https://") {
            Ok(Self::Remote(raw.to_string()))
        } else {
            Ok(Self::Local(PathBuf::from(raw.strip_prefix("file://").unwrap_or(raw))))
        }
    }
}

impl fmt::Display for ModelReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local(path) => write!(f, "{}", path.display()),
            Self::Remote(url) => f.write_str(url),
        }
    }
}

#[async_trait]
pub trait ModelLoader: Send + Sync {
    /// Materializes the artifact completely before returning it.
    async fn load(&self, reference: &ModelReference) -> Result<LoadedModel, ModelLoadError>;
}

/// Reads local artifacts from disk and fetches remote ones over HTTP.
pub struct PlatformModelLoader {
    http: reqwest::Client,
    auth_token: Option<SecretString>,
}

impl PlatformModelLoader {
    pub fn new(
        remote_timeout: Duration,
        auth_token: Option<SecretString>,
    ) -> Result<Self, ModelLoadError> {
        let http = reqwest::Client::builder().timeout(remote_timeout).build().map_err(|error| {
            ModelLoadError::Remote { reference: "<client>".to_string(), message: error.to_string() }
        })?;
        Ok(Self { http, auth_token })
    }

    pub fn from_config(config: &ModelConfig) -> Result<Self, ModelLoadError> {
        Self::new(Duration::from_secs(config.remote_timeout_secs), config.remote_auth_token.clone())
    }

    async fn read_local(&self, reference: &str, path: &Path) -> Result<Vec<u8>, ModelLoadError> {
        tokio::fs::read(path).await.map_err(|error| match error.kind() {
            ErrorKind::NotFound => ModelLoadError::NotFound(reference.to_string()),
            _ => ModelLoadError::Io { reference: reference.to_string(), message: error.to_string() },
        })
    }

    async fn fetch_remote(&self, reference: &str, url: &str) -> Result<Vec<u8>, ModelLoadError> {
        let remote = |message: String| ModelLoadError::Remote {
            reference: reference.to_string(),
            message,
        };

        let mut request = self.http.get(url);
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token.expose_secret());
        }

        let response = request.send().await.map_err(|error| remote(error.to_string()))?;
        match response.status() {
            StatusCode::NOT_FOUND => Err(ModelLoadError::NotFound(reference.to_string())),
            status if !status.is_success() => Err(remote(format!("model store answered {status}"))),
            _ => {
                let body = response.bytes().await.map_err(|error| remote(error.to_string()))?;
                Ok(body.to_vec())
            }
        }
    }
}

#[async_trait]
impl ModelLoader for PlatformModelLoader {
    async fn load(&self, reference: &ModelReference) -> Result<LoadedModel, ModelLoadError> {
        let reference_display = reference.to_string();
        let artifact = match reference {
            ModelReference::Local(path) => self.read_local(&reference_display, path).await?,
            ModelReference::Remote(url) => self.fetch_remote(&reference_display, url).await?,
        };

        debug!(
            event_name = "model.artifact.read",
            reference = %reference_display,
            size_bytes = artifact.len() as u64,
            "model artifact materialized"
        );
        LoadedModel::new(reference.clone(), artifact, Utc::now())
    }
}

//! Fakes shared by the unit tests of this crate.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Notify;

use colloquy_core::errors::{ModelLoadError, TrainingError};

use crate::model::{LoadedModel, ModelLoader, ModelReference};
use crate::training::{Trainer, TrainingRun};

/// Serves artifacts from memory, keyed by reference.
#[derive(Default)]
pub struct MapLoader {
    artifacts: HashMap<String, Vec<u8>>,
}

impl MapLoader {
    pub fn with(mut self, reference: &str, artifact: &[u8]) -> Self {
        self.artifacts.insert(reference.to_string(), artifact.to_vec());
        self
    }
}

#[async_trait]
impl ModelLoader for MapLoader {
    async fn load(&self, reference: &ModelReference) -> Result<LoadedModel, ModelLoadError> {
        let key = reference.to_string();
        let artifact =
            self.artifacts.get(&key).cloned().ok_or_else(|| ModelLoadError::NotFound(key))?;
        LoadedModel::new(reference.clone(), artifact, Utc::now())
    }
}

enum Script {
    Succeed,
    Gated,
    Fail(String),
    ReadFiles,
    PanicOn(String),
}

/// Trains instantly into `models/<data>.model` unless scripted otherwise.
pub struct ScriptedTrainer {
    script: Script,
    pub started: Notify,
    pub release: Notify,
    runs: Mutex<Vec<String>>,
    files: Mutex<Vec<String>>,
}

impl Default for ScriptedTrainer {
    fn default() -> Self {
        Self::scripted(Script::Succeed)
    }
}

impl ScriptedTrainer {
    fn scripted(script: Script) -> Self {
        Self {
            script,
            started: Notify::new(),
            release: Notify::new(),
            runs: Mutex::new(Vec::new()),
            files: Mutex::new(Vec::new()),
        }
    }

    /// Signals `started` and waits for `release` on every run.
    pub fn gated() -> Self {
        Self::scripted(Script::Gated)
    }

    pub fn failing(reason: &str) -> Self {
        Self::scripted(Script::Fail(reason.to_string()))
    }

    /// Reads the data file of each run and yields `models/d1.model`.
    pub fn reading_files() -> Self {
        Self::scripted(Script::ReadFiles)
    }

    /// Panics when given `data`, trains normally otherwise.
    pub fn panicking_on(data: &str) -> Self {
        Self::scripted(Script::PanicOn(data.to_string()))
    }

    pub fn runs(&self) -> Vec<String> {
        self.runs.lock().expect("runs").clone()
    }

    pub fn file_contents(&self) -> Vec<String> {
        self.files.lock().expect("files").clone()
    }
}

#[async_trait]
impl Trainer for ScriptedTrainer {
    async fn train(&self, run: &TrainingRun) -> Result<String, TrainingError> {
        self.runs.lock().expect("runs").push(run.data.clone());
        match &self.script {
            Script::Succeed => Ok(format!("models/{}.model", run.data)),
            Script::Gated => {
                self.started.notify_one();
                self.release.notified().await;
                Ok(format!("models/{}.model", run.data))
            }
            Script::Fail(reason) => Err(TrainingError::Trainer(reason.clone())),
            Script::ReadFiles => {
                let contents = tokio::fs::read_to_string(&run.data)
                    .await
                    .map_err(|error| TrainingError::Trainer(error.to_string()))?;
                self.files.lock().expect("files").push(contents);
                Ok("models/d1.model".to_string())
            }
            Script::PanicOn(data) if *data == run.data => panic!("trainer blew up on {data}"),
            Script::PanicOn(_) => Ok(format!("models/{}.model", run.data)),
        }
    }
}

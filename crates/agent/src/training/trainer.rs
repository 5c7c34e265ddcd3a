use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::info;

use colloquy_core::config::TrainingConfig;
use colloquy_core::errors::TrainingError;

use super::registry::JobId;

/// One resolved training run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrainingRun {
    pub job_id: JobId,
    /// Path or opaque reference to the training data.
    pub data: String,
}

#[async_trait]
pub trait Trainer: Send + Sync {
    /// Trains a model and returns the reference the model server can load.
    async fn train(&self, run: &TrainingRun) -> Result<String, TrainingError>;
}

/// Runs an external training command per job.
///
/// The command is invoked as `<command> <args..> --data <data> --out <path>`
/// and must write the model artifact to `<path>`, which lives in the output
/// directory and is named after the job.
pub struct CommandTrainer {
    command: String,
    args: Vec<String>,
    output_dir: PathBuf,
}

impl CommandTrainer {
    pub fn new(command: impl Into<String>, args: Vec<String>, output_dir: impl Into<PathBuf>) -> Self {
        Self { command: command.into(), args, output_dir: output_dir.into() }
    }

    pub fn from_config(config: &TrainingConfig) -> Self {
        Self::new(config.command.clone(), config.args.clone(), config.output_dir.clone())
    }
}

#[async_trait]
impl Trainer for CommandTrainer {
    async fn train(&self, run: &TrainingRun) -> Result<String, TrainingError> {
        tokio::fs::create_dir_all(&self.output_dir).await.map_err(|error| {
            TrainingError::Trainer(format!(
                "cannot create output directory {}: {error}",
                self.output_dir.display()
            ))
        })?;
        let output = self.output_dir.join(format!("{}.model", run.job_id));

        info!(
            event_name = "training.command.started",
            job_id = %run.job_id,
            command = %self.command,
            "starting training command"
        );
        let finished = Command::new(&self.command)
            .args(&self.args)
            .arg("--data")
            .arg(&run.data)
            .arg("--out")
            .arg(&output)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|error| {
                TrainingError::Trainer(format!("cannot start `{}`: {error}", self.command))
            })?;

        if !finished.status.success() {
            let stderr = String::from_utf8_lossy(&finished.stderr);
            return Err(TrainingError::Trainer(format!(
                "`{}` exited with {}: {}",
                self.command,
                finished.status,
                stderr.trim()
            )));
        }

        Ok(output.display().to_string())
    }
}

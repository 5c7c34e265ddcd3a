use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tempfile::NamedTempFile;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{error, info, warn};

use colloquy_core::config::TrainingConfig;
use colloquy_core::errors::{TrainingError, WORKER_LOST};
use colloquy_core::export::export_conversations;
use colloquy_core::store::TrackerStore;

use super::registry::{JobId, JobRecord, JobRegistry, TrainingData};
use super::trainer::{Trainer, TrainingRun};
use crate::model::ModelServer;

const MIN_REAP_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CoordinatorSettings {
    pub heartbeat_interval: Duration,
    pub liveness_timeout: Duration,
}

impl CoordinatorSettings {
    pub fn from_config(config: &TrainingConfig) -> Self {
        Self {
            heartbeat_interval: config.heartbeat_interval(),
            liveness_timeout: config.liveness_timeout(),
        }
    }
}

/// Accepts training jobs and runs them one at a time, in submission order,
/// against the single model slot held by the [`ModelServer`].
pub struct TrainingCoordinator {
    registry: Arc<JobRegistry>,
    queue: mpsc::UnboundedSender<JobId>,
    worker: JoinHandle<()>,
    reaper: JoinHandle<()>,
}

impl TrainingCoordinator {
    /// Spawns the worker and reaper tasks on the current runtime.
    pub fn spawn(
        settings: CoordinatorSettings,
        trainer: Arc<dyn Trainer>,
        store: Arc<dyn TrackerStore>,
        models: ModelServer,
    ) -> Self {
        let registry = Arc::new(JobRegistry::default());
        let (queue, jobs) = mpsc::unbounded_channel();

        let worker = Arc::new(Worker {
            registry: Arc::clone(&registry),
            trainer,
            store,
            models,
            heartbeat_interval: settings.heartbeat_interval,
        });
        let worker = tokio::spawn(worker.run(jobs));
        let reaper =
            tokio::spawn(reap(Arc::clone(&registry), queue.clone(), settings.liveness_timeout));

        Self { registry, queue, worker, reaper }
    }

    /// Queues a job and returns at once.
    pub fn submit(&self, training_data: TrainingData) -> JobId {
        let record = self.registry.enqueue(training_data, Utc::now());
        let job_id = record.job_id;

        if self.queue.send(job_id.clone()).is_err() {
            error!(
                event_name = "training.job.rejected",
                job_id = %job_id,
                "training worker is gone; failing job"
            );
            let _ = self.registry.fail(&job_id, WORKER_LOST, Utc::now());
        } else {
            info!(event_name = "training.job.queued", job_id = %job_id, "training job queued");
        }
        job_id
    }

    pub fn get_status(&self, job_id: &JobId) -> Option<JobRecord> {
        self.registry.get(job_id)
    }

    pub fn jobs(&self) -> Vec<JobRecord> {
        self.registry.list()
    }

    pub fn is_worker_alive(&self) -> bool {
        !self.worker.is_finished()
    }
}

impl Drop for TrainingCoordinator {
    fn drop(&mut self) {
        self.worker.abort();
        self.reaper.abort();
    }
}

struct Worker {
    registry: Arc<JobRegistry>,
    trainer: Arc<dyn Trainer>,
    store: Arc<dyn TrackerStore>,
    models: ModelServer,
    heartbeat_interval: Duration,
}

impl Worker {
    async fn run(self: Arc<Self>, mut jobs: mpsc::UnboundedReceiver<JobId>) {
        while let Some(job_id) = jobs.recv().await {
            // Each job runs in its own task so a panicking trainer fails
            // that job only. Dropping the set aborts the job with the worker.
            let mut running = JoinSet::new();
            let worker = Arc::clone(&self);
            let job = job_id.clone();
            running.spawn(async move { worker.process(job).await });

            if let Some(Err(crashed)) = running.join_next().await {
                self.record_crash(&job_id, &crashed);
            }
        }
    }

    fn record_crash(&self, job_id: &JobId, crashed: &JoinError) {
        error!(
            event_name = "training.job.crashed",
            job_id = %job_id,
            error = %crashed,
            "training task ended abnormally"
        );
        let reason = TrainingError::Trainer(crashed.to_string()).to_string();
        if let Err(transition) = self.registry.fail(job_id, reason, Utc::now()) {
            warn!(
                event_name = "training.job.late_failure",
                job_id = %job_id,
                error = %transition,
                "failure not recorded"
            );
        }
    }

    async fn process(&self, job_id: JobId) {
        let Some(record) = self.registry.get(&job_id) else {
            return;
        };
        if let Err(transition) = self.registry.start(&job_id, Utc::now()) {
            warn!(
                event_name = "training.job.skipped",
                job_id = %job_id,
                error = %transition,
                "job not startable"
            );
            return;
        }
        info!(event_name = "training.job.started", job_id = %job_id, "training job started");

        let outcome = match self.train(&job_id, &record.training_data).await {
            Ok(Some(reference)) => self.materialize_and_publish(&job_id, reference).await,
            Ok(None) => {
                warn!(
                    event_name = "training.job.abandoned",
                    job_id = %job_id,
                    "job was reaped while training; trainer stopped"
                );
                return;
            }
            Err(error) => Err(error),
        };

        if let Err(error) = outcome {
            warn!(
                event_name = "training.job.failed",
                job_id = %job_id,
                error = %error,
                "training job failed; active model unchanged"
            );
            if let Err(transition) = self.registry.fail(&job_id, error.to_string(), Utc::now()) {
                warn!(
                    event_name = "training.job.late_failure",
                    job_id = %job_id,
                    error = %transition,
                    "failure not recorded"
                );
            }
        }
    }

    /// Runs the trainer while heartbeating. Yields `None` once the job has
    /// been failed by the reaper; the trainer future is dropped then.
    async fn train(
        &self,
        job_id: &JobId,
        data: &TrainingData,
    ) -> Result<Option<String>, TrainingError> {
        // The scratch file must outlive the run.
        let (data, _scratch) = self.resolve(data).await?;
        let run = TrainingRun { job_id: job_id.clone(), data };

        let training = self.trainer.train(&run);
        tokio::pin!(training);
        let mut heartbeats = tokio::time::interval(self.heartbeat_interval);
        heartbeats.tick().await;

        loop {
            tokio::select! {
                outcome = &mut training => return outcome.map(Some),
                _ = heartbeats.tick() => {
                    if !self.registry.heartbeat(job_id, Utc::now()) {
                        return Ok(None);
                    }
                }
            }
        }
    }

    /// Turns training data into something the trainer can read.
    async fn resolve(
        &self,
        data: &TrainingData,
    ) -> Result<(String, Option<NamedTempFile>), TrainingError> {
        match data {
            TrainingData::Reference(reference) if reference.trim().is_empty() => {
                Err(TrainingError::InvalidData("training data reference is empty".to_string()))
            }
            TrainingData::Reference(reference) => Ok((reference.clone(), None)),
            TrainingData::Inline(payload) if !(payload.is_object() || payload.is_array()) => {
                Err(TrainingError::InvalidData(
                    "inline training data must be a JSON object or array".to_string(),
                ))
            }
            TrainingData::Inline(payload) => {
                let body = serde_json::to_vec(payload)
                    .map_err(|error| TrainingError::InvalidData(error.to_string()))?;
                scratch_file(&body)
            }
            TrainingData::TrackerStore => {
                let export =
                    export_conversations(self.store.as_ref(), Utc::now()).await.map_err(|error| {
                        TrainingError::InvalidData(format!("tracker store export failed: {error}"))
                    })?;
                if export.conversations.is_empty() {
                    return Err(TrainingError::InvalidData(
                        "tracker store holds no conversations".to_string(),
                    ));
                }
                let body =
                    export.to_json().map_err(|error| TrainingError::InvalidData(error.to_string()))?;
                scratch_file(body.as_bytes())
            }
        }
    }

    async fn materialize_and_publish(
        &self,
        job_id: &JobId,
        reference: String,
    ) -> Result<(), TrainingError> {
        let model = self.models.materialize(&reference).await?;

        // A reaped job must not replace the active model.
        match self.registry.succeed(job_id, reference.clone(), Utc::now()) {
            Ok(()) => {
                self.models.publish(model);
                info!(
                    event_name = "training.job.succeeded",
                    job_id = %job_id,
                    model_reference = %reference,
                    "training job published a new model"
                );
            }
            Err(transition) => {
                warn!(
                    event_name = "training.job.discarded",
                    job_id = %job_id,
                    error = %transition,
                    "trained model discarded"
                );
            }
        }
        Ok(())
    }
}

fn scratch_file(body: &[u8]) -> Result<(String, Option<NamedTempFile>), TrainingError> {
    let scratch = |error: std::io::Error| {
        TrainingError::Trainer(format!("cannot write training data to a scratch file: {error}"))
    };
    let mut file = tempfile::Builder::new()
        .prefix("colloquy-training-")
        .suffix(".json")
        .tempfile()
        .map_err(scratch)?;
    file.write_all(body).map_err(scratch)?;
    file.flush().map_err(scratch)?;
    Ok((file.path().display().to_string(), Some(file)))
}

/// Fails running jobs that stopped heartbeating, and queued jobs once the
/// worker's end of the queue is gone.
async fn reap(registry: Arc<JobRegistry>, queue: mpsc::UnboundedSender<JobId>, liveness: Duration) {
    let liveness_window = chrono::Duration::from_std(liveness).unwrap_or(chrono::Duration::MAX);
    let mut ticks = tokio::time::interval((liveness / 2).max(MIN_REAP_INTERVAL));
    loop {
        ticks.tick().await;
        for job_id in registry.reap_stale(Utc::now(), liveness_window) {
            warn!(
                event_name = "training.job.worker_lost",
                job_id = %job_id,
                "running job stopped heartbeating; marked failed"
            );
        }
        if queue.is_closed() {
            for job_id in registry.abandon_queued(Utc::now()) {
                warn!(
                    event_name = "training.job.worker_lost",
                    job_id = %job_id,
                    "training worker is gone; queued job failed"
                );
            }
        }
    }
}

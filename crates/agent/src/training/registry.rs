use std::collections::HashMap;
use std::fmt;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use colloquy_core::errors::WORKER_LOST;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a training run learns from.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainingData {
    /// A location the trainer understands, passed through untouched.
    Reference(String),
    /// A JSON payload, written to a scratch file before the run.
    Inline(Value),
    /// Every conversation currently held by the tracker store.
    TrackerStore,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    fn can_become(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::Running)
                | (Self::Queued, Self::Failed)
                | (Self::Running, Self::Succeeded)
                | (Self::Running, Self::Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        };
        f.write_str(label)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct JobRecord {
    pub job_id: JobId,
    pub requested_at: DateTime<Utc>,
    pub training_data: TrainingData,
    pub status: JobStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub result_model_reference: Option<String>,
    pub failure_reason: Option<String>,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum JobTransitionError {
    #[error("unknown training job `{0}`")]
    UnknownJob(JobId),
    #[error("training job `{job_id}` cannot move from {from} to {to}")]
    Invalid { job_id: JobId, from: JobStatus, to: JobStatus },
}

/// Shared record of every submitted job. Each status change happens at most
/// once and terminal records are never touched again.
#[derive(Default)]
pub struct JobRegistry {
    jobs: RwLock<HashMap<JobId, JobRecord>>,
}

impl JobRegistry {
    pub fn enqueue(&self, training_data: TrainingData, now: DateTime<Utc>) -> JobRecord {
        let record = JobRecord {
            job_id: JobId::generate(),
            requested_at: now,
            training_data,
            status: JobStatus::Queued,
            started_at: None,
            heartbeat_at: None,
            finished_at: None,
            result_model_reference: None,
            failure_reason: None,
        };
        self.write().insert(record.job_id.clone(), record.clone());
        record
    }

    pub fn start(&self, job_id: &JobId, now: DateTime<Utc>) -> Result<(), JobTransitionError> {
        self.transition(job_id, JobStatus::Running, |record| {
            record.started_at = Some(now);
            record.heartbeat_at = Some(now);
        })
    }

    /// Returns false once the job is no longer running.
    pub fn heartbeat(&self, job_id: &JobId, now: DateTime<Utc>) -> bool {
        let mut jobs = self.write();
        match jobs.get_mut(job_id) {
            Some(record) if record.status == JobStatus::Running => {
                record.heartbeat_at = Some(now);
                true
            }
            _ => false,
        }
    }

    pub fn succeed(
        &self,
        job_id: &JobId,
        model_reference: String,
        now: DateTime<Utc>,
    ) -> Result<(), JobTransitionError> {
        self.transition(job_id, JobStatus::Succeeded, |record| {
            record.finished_at = Some(now);
            record.result_model_reference = Some(model_reference);
        })
    }

    pub fn fail(
        &self,
        job_id: &JobId,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), JobTransitionError> {
        let reason = reason.into();
        self.transition(job_id, JobStatus::Failed, |record| {
            record.finished_at = Some(now);
            record.failure_reason = Some(reason);
        })
    }

    pub fn get(&self, job_id: &JobId) -> Option<JobRecord> {
        self.read().get(job_id).cloned()
    }

    /// All jobs, oldest request first.
    pub fn list(&self) -> Vec<JobRecord> {
        let mut jobs: Vec<JobRecord> = self.read().values().cloned().collect();
        jobs.sort_by(|left, right| {
            left.requested_at.cmp(&right.requested_at).then_with(|| left.job_id.cmp(&right.job_id))
        });
        jobs
    }

    /// Fails every running job whose last heartbeat is older than `liveness`.
    pub fn reap_stale(&self, now: DateTime<Utc>, liveness: Duration) -> Vec<JobId> {
        let mut jobs = self.write();
        let mut reaped = Vec::new();
        for record in jobs.values_mut() {
            let last_seen = record.heartbeat_at.or(record.started_at);
            let stale = record.status == JobStatus::Running
                && last_seen.map_or(true, |seen| now - seen > liveness);
            if stale {
                record.status = JobStatus::Failed;
                record.finished_at = Some(now);
                record.failure_reason = Some(WORKER_LOST.to_string());
                reaped.push(record.job_id.clone());
            }
        }
        reaped.sort();
        reaped
    }

    /// Fails every job still waiting for a worker. Used once the worker is
    /// gone and nothing will ever pick them up.
    pub fn abandon_queued(&self, now: DateTime<Utc>) -> Vec<JobId> {
        let mut jobs = self.write();
        let mut abandoned = Vec::new();
        for record in jobs.values_mut().filter(|record| record.status == JobStatus::Queued) {
            record.status = JobStatus::Failed;
            record.finished_at = Some(now);
            record.failure_reason = Some(WORKER_LOST.to_string());
            abandoned.push(record.job_id.clone());
        }
        abandoned.sort();
        abandoned
    }

    fn transition(
        &self,
        job_id: &JobId,
        next: JobStatus,
        update: impl FnOnce(&mut JobRecord),
    ) -> Result<(), JobTransitionError> {
        let mut jobs = self.write();
        let record =
            jobs.get_mut(job_id).ok_or_else(|| JobTransitionError::UnknownJob(job_id.clone()))?;
        if !record.status.can_become(next) {
            return Err(JobTransitionError::Invalid {
                job_id: job_id.clone(),
                from: record.status,
                to: next,
            });
        }
        record.status = next;
        update(record);
        Ok(())
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<JobId, JobRecord>> {
        self.jobs.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<JobId, JobRecord>> {
        self.jobs.write().unwrap_or_else(PoisonError::into_inner)
    }
}

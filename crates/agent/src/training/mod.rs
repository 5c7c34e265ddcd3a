//! Training job orchestration: a shared job registry, a FIFO worker that runs
//! one job at a time and publishes results, and a reaper for lost workers.

mod coordinator;
mod registry;
mod trainer;

pub use coordinator::{CoordinatorSettings, TrainingCoordinator};
pub use registry::{JobId, JobRecord, JobRegistry, JobStatus, JobTransitionError, TrainingData};
pub use trainer::{CommandTrainer, Trainer, TrainingRun};

//! Runtime services around the tracker store: per-conversation locking, the
//! message processing flow, the active model and training orchestration.
//!
//! # Flow
//!
//! 1. `locks` serializes work on one conversation id.
//! 2. `processor` loads the tracker, asks a [`processor::DialogueEngine`] for
//!    responses and appends the whole batch with an expected version.
//!    `engine` supplies the remote and record-only engines.
//! 3. `training` runs queued jobs one at a time and hands successful results
//!    to `model`, which swaps the active model atomically.

pub mod engine;
pub mod locks;
pub mod model;
pub mod processor;
pub mod training;

#[cfg(test)]
pub(crate) mod testing;

pub use engine::{RecordOnlyEngine, RemoteDialogueEngine};
pub use locks::{ConversationLock, LockManager};
pub use model::{
    LoadedModel, ModelInfo, ModelLoader, ModelReference, ModelServer, PlatformModelLoader,
};
pub use processor::{DialogueEngine, MessageProcessor, ProcessedMessage};
pub use training::{
    CommandTrainer, CoordinatorSettings, JobId, JobRecord, JobStatus, Trainer, TrainingCoordinator,
    TrainingData,
};

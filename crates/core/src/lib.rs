//! Colloquy core: the conversation event model and the contracts around it.
//!
//! A conversation is an append-only log of [`Event`]s. A [`Tracker`] is the
//! state obtained by folding that log, and a [`TrackerStore`] persists the log
//! behind a backend-agnostic contract. Everything in this crate is
//! deterministic; scheduling, locking and model management live in
//! `colloquy-agent`.

pub mod config;
pub mod domain;
pub mod errors;
pub mod export;
pub mod session;
pub mod store;

pub use chrono;

pub use domain::event::{Event, EventKind};
pub use domain::message::UserMessage;
pub use domain::tracker::{ConversationId, Tracker, TrackerSnapshot, TrackerState};
pub use errors::{
    InterfaceError, LockError, ModelLoadError, ProcessingError, StoreError, TrainingError, WORKER_LOST,
};
pub use export::{
    export_conversations, ConversationExport, ExportError, ExportedConversation,
    EXPORT_SCHEMA_VERSION,
};
pub use session::SessionConfig;
pub use store::{CacheConsistency, CachedState, ConversationIds, StoredConversation, TrackerStore};

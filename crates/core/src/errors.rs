use thiserror::Error;

use crate::domain::tracker::ConversationId;

/// Failure reason recorded when a running training job stops heartbeating.
pub const WORKER_LOST: &str = "worker-lost";

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error(
        "conflicting append for conversation `{conversation_id}`: expected version {expected}, found {actual}"
    )]
    Conflict { conversation_id: ConversationId, expected: u64, actual: u64 },
    #[error("tracker store `{backend}` is unavailable: {message}")]
    Unavailable { backend: &'static str, message: String },
    #[error("corrupt record for conversation `{conversation_id}`: {message}")]
    Corrupt { conversation_id: ConversationId, message: String },
}

impl StoreError {
    pub fn unavailable(backend: &'static str, message: impl Into<String>) -> Self {
        Self::Unavailable { backend, message: message.into() }
    }

    pub fn corrupt(conversation_id: &ConversationId, message: impl Into<String>) -> Self {
        Self::Corrupt { conversation_id: conversation_id.clone(), message: message.into() }
    }

    /// Transient backend failures may be retried as-is. A conflict needs the
    /// caller to reload the tracker first; corruption never heals.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum LockError {
    #[error("conversation `{conversation_id}` is busy: lock not acquired within {waited_ms}ms")]
    Timeout { conversation_id: ConversationId, waited_ms: u64 },
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TrainingError {
    #[error("invalid training data: {0}")]
    InvalidData(String),
    #[error("trainer failed: {0}")]
    Trainer(String),
    #[error("trained model could not be published: {0}")]
    Publish(#[from] ModelLoadError),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ModelLoadError {
    #[error("model reference `{0}` does not exist")]
    NotFound(String),
    #[error("could not read model `{reference}`: {message}")]
    Io { reference: String, message: String },
    #[error("remote model store request for `{reference}` failed: {message}")]
    Remote { reference: String, message: String },
    #[error("model `{reference}` is invalid: {message}")]
    Invalid { reference: String, message: String },
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ProcessingError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error("no model is loaded")]
    ModelUnavailable,
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("dialogue engine failed: {0}")]
    Engine(String),
}

impl ProcessingError {
    /// True for failures an upstream caller should retry later: lock
    /// contention, unreachable stores, lost optimistic races and a model that
    /// is not loaded yet.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Store(StoreError::Unavailable { .. } | StoreError::Conflict { .. })
            | Self::Lock(_)
            | Self::ModelUnavailable => true,
            Self::Store(StoreError::Corrupt { .. })
            | Self::InvalidRequest(_)
            | Self::Engine(_) => false,
        }
    }

    pub fn into_interface(self, correlation_id: impl Into<String>) -> InterfaceError {
        let correlation_id = correlation_id.into();
        let mut mapped = InterfaceError::from(self);
        match &mut mapped {
            InterfaceError::BadRequest { correlation_id: id, .. }
            | InterfaceError::ServiceUnavailable { correlation_id: id, .. }
            | InterfaceError::Internal { correlation_id: id, .. } => *id = correlation_id,
        }
        mapped
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InterfaceError {
    #[error("bad request: {message}")]
    BadRequest { message: String, correlation_id: String },
    #[error("service unavailable: {message}")]
    ServiceUnavailable { message: String, correlation_id: String },
    #[error("internal error: {message}")]
    Internal { message: String, correlation_id: String },
}

impl InterfaceError {
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::BadRequest { .. } => {
                "The request could not be processed. Check inputs and try again."
            }
            Self::ServiceUnavailable { .. } => {
                "The service is temporarily unavailable. Please retry shortly."
            }
            Self::Internal { .. } => "An unexpected internal error occurred.",
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ServiceUnavailable { .. })
    }
}

impl From<ProcessingError> for InterfaceError {
    fn from(value: ProcessingError) -> Self {
        let transient = value.is_transient();
        let message = value.to_string();
        let correlation_id = "unassigned".to_owned();
        match value {
            _ if transient => Self::ServiceUnavailable { message, correlation_id },
            ProcessingError::InvalidRequest(_) => Self::BadRequest { message, correlation_id },
            _ => Self::Internal { message, correlation_id },
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::domain::tracker::ConversationId;
    use crate::errors::{InterfaceError, LockError, ProcessingError, StoreError};

    #[test]
    fn lock_timeout_maps_to_service_unavailable() {
        let interface = ProcessingError::from(LockError::Timeout {
            conversation_id: ConversationId::new("c1"),
            waited_ms: 250,
        })
        .into_interface("req-1");

        assert!(matches!(
            interface,
            InterfaceError::ServiceUnavailable {
                ref correlation_id,
                ..
            } if correlation_id == "req-1"
        ));
        assert_eq!(
            interface.user_message(),
            "The service is temporarily unavailable. Please retry shortly."
        );
    }

    #[test]
    fn store_errors_are_classified_for_retry() {
        let unavailable = StoreError::unavailable("sql", "connection refused");
        let conflict = StoreError::Conflict {
            conversation_id: ConversationId::new("c1"),
            expected: 3,
            actual: 4,
        };
        let corrupt = StoreError::corrupt(&ConversationId::new("c1"), "bad json");

        assert!(unavailable.is_retryable());
        assert!(!conflict.is_retryable(), "conflicts need a reload, not a blind retry");
        assert!(conflict.is_conflict());
        assert!(!corrupt.is_retryable());

        assert!(ProcessingError::from(unavailable).is_transient());
        assert!(ProcessingError::from(conflict).is_transient());
        assert!(!ProcessingError::from(corrupt.clone()).is_transient());
        assert!(matches!(
            ProcessingError::from(corrupt).into_interface("req-2"),
            InterfaceError::Internal { .. }
        ));
    }

    #[test]
    fn invalid_request_maps_to_bad_request() {
        let interface =
            ProcessingError::InvalidRequest("empty message".to_owned()).into_interface("req-3");

        assert!(matches!(interface, InterfaceError::BadRequest { .. }));
        assert!(!interface.is_transient());
        assert_eq!(
            interface.user_message(),
            "The request could not be processed. Check inputs and try again."
        );
    }

    #[test]
    fn engine_failure_maps_to_internal() {
        let interface = ProcessingError::Engine("policy crashed".to_owned()).into_interface("req-4");

        assert!(matches!(interface, InterfaceError::Internal { .. }));
        assert_eq!(interface.user_message(), "An unexpected internal error occurred.");
    }
}

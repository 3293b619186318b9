//! Error types for the conversation engine.

use crate::model::{ConversationId, MessageId};
use crate::mt::MtError;
use thiserror::Error;

/// Rejections raised by the conversation aggregate and its owning task
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConversationError {
    /// A send is already in flight for this conversation
    #[error("a pending message already exists")]
    PlaceholderExists,

    #[error("message '{0}' is not part of this conversation")]
    MessageNotFound(MessageId),

    #[error("conversation already has id '{0}'")]
    AlreadyAssigned(ConversationId),

    /// The owning task has shut down (screen closed)
    #[error("conversation task is no longer running")]
    Closed,
}

/// Failures reported by a message store backend
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },

    #[error("store rejected the request: {0}")]
    Rejected(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }
}

/// Failures of the local archive
#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("archive IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("archive serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The conversation has no store id yet and cannot be keyed
    #[error("conversation has no id")]
    Unkeyed,
}

/// Everything a send, observer or retry can surface to its caller
#[derive(Error, Debug)]
pub enum DeliveryError {
    /// Required context or session is missing
    #[error("dependency unavailable: {0}")]
    DependencyUnavailable(String),

    #[error("translation failed: {0}")]
    TranslationFailed(#[source] MtError),

    #[error("persist failed: {0}")]
    PersistFailed(#[source] StoreError),

    /// A message named by a remote event could not be fetched
    #[error("store lookup failed: {0}")]
    StoreLookup(#[source] StoreError),

    #[error("audio synthesis failed: {0}")]
    AudioFailed(String),

    /// Every direct provider handed the text back unchanged
    #[error("message is still untranslated")]
    RetryStillUntranslated,

    /// The bridge translation came back in a different language
    #[error("bridge translation produced '{detected}' instead of '{expected}'")]
    RetryLanguageMismatch { expected: String, detected: String },

    #[error("retry failed: {0}")]
    RetryFailed(String),

    #[error("a retry is already pending for message '{0}'")]
    RetryInFlight(MessageId),

    #[error("operation timed out after {0} seconds")]
    Timeout(u64),

    #[error("malformed remote event: {0}")]
    MalformedRemoteEvent(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Conversation(#[from] ConversationError),

    #[error(transparent)]
    Archive(#[from] ArchiveError),
}

pub type DeliveryResult<T> = Result<T, DeliveryError>;
pub type StoreResult<T> = Result<T, StoreError>;
pub type ArchiveResult<T> = Result<T, ArchiveError>;

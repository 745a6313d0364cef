use shared::domain::{MessageId, ReactionKey, Topic};
use thiserror::Error;

use crate::pending::LocalId;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("transport error on {topic}: {reason}")]
    Transport { topic: Topic, reason: String },
    #[error("a change to reaction {key} is already pending")]
    Conflict { key: ReactionKey },
    #[error("mutation {local_id} was not confirmed in time")]
    MutationTimeout { local_id: LocalId },
    #[error("mutation {local_id} was rejected: {reason}")]
    MutationRejected { local_id: LocalId, reason: String },
    #[error("sweep fetch failed for {topic}: {source}")]
    SweepFetch {
        topic: Topic,
        #[source]
        source: anyhow::Error,
    },
    #[error("merge invariant violated for message {message_id}: {detail}")]
    MergeInvariantViolation { message_id: MessageId, detail: String },
    #[error("invalid mutation target: {0}")]
    InvalidTarget(String),
    #[error("unknown mutation {0}")]
    UnknownMutation(LocalId),
}

impl SyncError {
    /// Transient errors are recovered locally and never reach a caller as a hard failure.
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Transport { .. } | SyncError::SweepFetch { .. })
    }
}

pub type SyncResult<T> = std::result::Result<T, SyncError>;

//! Pool error types.

use spanner_protocol::{RequestId, Status};
use spanner_transport::ContextError;
use thiserror::Error;

/// Errors that can occur during pool operations.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum PoolError {
    /// Pool is closed.
    #[error("session pool is closed")]
    Closed,

    /// The caller's context was cancelled while waiting.
    #[error("session acquisition canceled")]
    Canceled,

    /// The caller's deadline passed while waiting.
    #[error("session acquisition deadline exceeded")]
    DeadlineExceeded,

    /// Session creation failed.
    #[error("failed to create session: {status}")]
    SessionCreation {
        /// Status returned by the service.
        status: Status,
        /// Id of the failing attempt.
        request_id: Option<RequestId>,
    },

    /// Session deletion failed.
    #[error("failed to delete session: {status}")]
    SessionDeletion {
        /// Status returned by the service.
        status: Status,
        /// Id of the failing attempt.
        request_id: Option<RequestId>,
    },

    /// Multiplexed sessions are disabled for this pool.
    #[error("multiplexed sessions are disabled")]
    MultiplexedDisabled,

    /// Pool configuration error.
    #[error("session pool configuration error: {0}")]
    Configuration(String),

    /// The session handle was already returned to the pool.
    #[error("session already released")]
    AlreadyReleased,
}

impl PoolError {
    /// Check if the error is worth retrying with another session.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::SessionCreation { status, .. } if spanner_protocol::classify(status).is_retryable()
        )
    }
}

impl From<ContextError> for PoolError {
    fn from(err: ContextError) -> Self {
        match err {
            ContextError::Canceled => Self::Canceled,
            ContextError::DeadlineExceeded => Self::DeadlineExceeded,
        }
    }
}

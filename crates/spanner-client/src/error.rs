//! Client error types.
//!
//! Errors returned to applications carry the status of the failing RPC and
//! the request id of the attempt that produced it, so client logs can be
//! matched with server-side records.

use std::time::Duration;

use spanner_protocol::{Code, ErrorClass, ProtocolError, RequestId, Status, classify};
use spanner_session_pool::PoolError;
use spanner_transport::ContextError;
use thiserror::Error;

/// Errors that can occur during client operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// An RPC failed.
    #[error("spanner: {status}{}", request_id_suffix(.request_id.as_ref()))]
    Rpc {
        /// Status returned by the service.
        status: Status,
        /// Id of the failing attempt.
        request_id: Option<RequestId>,
    },

    /// The caller's context was cancelled.
    #[error("spanner: context canceled{}", request_id_suffix(.request_id.as_ref()))]
    Canceled {
        /// Id of the attempt in flight, if any.
        request_id: Option<RequestId>,
    },

    /// The caller's deadline passed.
    #[error("spanner: context deadline exceeded{}", request_id_suffix(.request_id.as_ref()))]
    DeadlineExceeded {
        /// Id of the attempt in flight, if any.
        request_id: Option<RequestId>,
    },

    /// Session pool error.
    #[error(transparent)]
    Pool(PoolError),

    /// The handle was already closed.
    #[error("already closed")]
    AlreadyClosed,

    /// The client is closed.
    #[error("client is closed")]
    Closed,

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// The transaction cannot be used for the requested operation.
    #[error("transaction error: {0}")]
    Transaction(String),

    /// A result could not be decoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Error returned by application code inside a transaction.
    #[error("{0}")]
    Application(Box<dyn std::error::Error + Send + Sync>),
}

fn request_id_suffix(request_id: Option<&RequestId>) -> String {
    match request_id {
        Some(id) => format!(", requestID = \"{id}\""),
        None => String::new(),
    }
}

impl Error {
    /// An RPC failure of the given attempt.
    pub(crate) fn rpc(status: Status, request_id: Option<RequestId>) -> Self {
        Self::Rpc { status, request_id }
    }

    /// A context failure observed while `request_id` was in flight.
    pub(crate) fn context(err: ContextError, request_id: Option<RequestId>) -> Self {
        match err {
            ContextError::Canceled => Self::Canceled { request_id },
            ContextError::DeadlineExceeded => Self::DeadlineExceeded { request_id },
        }
    }

    /// Wrap an application error.
    pub fn application(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::Application(err.into())
    }

    /// The status code of the error.
    #[must_use]
    pub fn code(&self) -> Code {
        match self {
            Self::Rpc { status, .. } => status.code,
            Self::Canceled { .. } => Code::Canceled,
            Self::DeadlineExceeded { .. } => Code::DeadlineExceeded,
            Self::Pool(PoolError::Configuration(_)) | Self::Config(_) => Code::InvalidArgument,
            Self::AlreadyClosed | Self::Closed | Self::Pool(_) | Self::Transaction(_) => {
                Code::FailedPrecondition
            }
            Self::Protocol(_) => Code::Internal,
            Self::Application(_) => Code::Unknown,
        }
    }

    /// How the runtime reacts to this error.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Rpc { status, .. } => classify(status),
            _ => ErrorClass::Terminal,
        }
    }

    /// Id of the attempt that failed, if an RPC was involved.
    #[must_use]
    pub fn request_id(&self) -> Option<&RequestId> {
        match self {
            Self::Rpc { request_id, .. }
            | Self::Canceled { request_id }
            | Self::DeadlineExceeded { request_id } => request_id.as_ref(),
            _ => None,
        }
    }

    /// The RPC status, if the error came from the service.
    #[must_use]
    pub fn status(&self) -> Option<&Status> {
        match self {
            Self::Rpc { status, .. } => Some(status),
            _ => None,
        }
    }

    /// Server-suggested delay before retrying.
    #[must_use]
    pub fn retry_delay(&self) -> Option<Duration> {
        self.status().and_then(Status::retry_delay)
    }

    /// Check if this error means the session no longer exists.
    #[must_use]
    pub fn is_session_not_found(&self) -> bool {
        self.class() == ErrorClass::SessionInvalid
    }

    /// Check if this error aborted the transaction.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.class() == ErrorClass::TransactionRetryable
    }
}

impl From<PoolError> for Error {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::Closed => Self::Closed,
            PoolError::Canceled => Self::Canceled { request_id: None },
            PoolError::DeadlineExceeded => Self::DeadlineExceeded { request_id: None },
            PoolError::SessionCreation { status, request_id } => Self::Rpc { status, request_id },
            other => Self::Pool(other),
        }
    }
}

impl From<ContextError> for Error {
    fn from(err: ContextError) -> Self {
        Self::context(err, None)
    }
}

/// Convert a client error into the pool's vocabulary.
pub(crate) fn into_pool_error(err: Error, creating: bool) -> PoolError {
    let (status, request_id) = match err {
        Error::Canceled { .. } => return PoolError::Canceled,
        Error::DeadlineExceeded { .. } => return PoolError::DeadlineExceeded,
        Error::Closed => return PoolError::Closed,
        Error::Pool(e) => return e,
        Error::Rpc { status, request_id } => (status, request_id),
        other => (Status::new(Code::Unknown, other.to_string()), None),
    };
    if creating {
        PoolError::SessionCreation { status, request_id }
    } else {
        PoolError::SessionDeletion { status, request_id }
    }
}

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, Error>;

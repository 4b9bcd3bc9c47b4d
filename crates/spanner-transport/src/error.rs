//! Transport error types.

use spanner_protocol::{Code, Status};
use thiserror::Error;

/// Why a [`Context`](crate::Context) stopped an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ContextError {
    /// The context, or one of its parents, was cancelled.
    #[error("context canceled")]
    Canceled,

    /// The context deadline passed.
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

impl ContextError {
    /// The equivalent RPC status code.
    #[must_use]
    pub fn code(&self) -> Code {
        match self {
            Self::Canceled => Code::Canceled,
            Self::DeadlineExceeded => Code::DeadlineExceeded,
        }
    }
}

impl From<ContextError> for Status {
    fn from(err: ContextError) -> Self {
        Status::new(err.code(), err.to_string())
    }
}

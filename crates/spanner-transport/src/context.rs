//! Cancellation and deadlines.
//!
//! A [`Context`] is passed to every blocking operation of the runtime. It
//! combines a cancellation token with an optional deadline. Contexts form a
//! tree: cancelling a parent cancels every context derived from it, while
//! cancelling a child leaves the parent untouched.
//!
//! ## Example
//!
//! ```rust
//! use std::time::Duration;
//! use spanner_transport::{Context, ContextError};
//!
//! # tokio_test::block_on(async {
//! let (ctx, cancel) = Context::background().with_cancel();
//! cancel.cancel();
//! let result = ctx.run(std::future::pending::<()>()).await;
//! assert_eq!(result, Err(ContextError::Canceled));
//! # });
//! ```

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::ContextError;

/// Cancellation scope of an operation.
#[derive(Debug, Clone)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

impl Context {
    /// A context that is never cancelled and has no deadline.
    #[must_use]
    pub fn background() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
        }
    }

    /// A child context with its own cancel handle.
    #[must_use]
    pub fn with_cancel(&self) -> (Self, CancelHandle) {
        let token = self.token.child_token();
        let handle = CancelHandle {
            token: token.clone(),
        };
        (
            Self {
                token,
                deadline: self.deadline,
            },
            handle,
        )
    }

    /// A child context that expires after `timeout`, or earlier if the
    /// parent's deadline comes first.
    #[must_use]
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// A child context that expires at `deadline`, or earlier if the
    /// parent's deadline comes first.
    #[must_use]
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(parent) if parent < deadline => parent,
            _ => deadline,
        };
        Self {
            token: self.token.child_token(),
            deadline: Some(deadline),
        }
    }

    /// The deadline, if any.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left until the deadline.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Why the context is done, or `None` while it is live.
    #[must_use]
    pub fn err(&self) -> Option<ContextError> {
        if self.token.is_cancelled() {
            Some(ContextError::Canceled)
        } else if self.deadline.is_some_and(|d| d <= Instant::now()) {
            Some(ContextError::DeadlineExceeded)
        } else {
            None
        }
    }

    /// Whether the context is done.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// Wait until the context is done.
    pub async fn done(&self) -> ContextError {
        match self.deadline {
            Some(deadline) => tokio::select! {
                biased;
                () = self.token.cancelled() => ContextError::Canceled,
                () = tokio::time::sleep_until(deadline) => ContextError::DeadlineExceeded,
            },
            None => {
                self.token.cancelled().await;
                ContextError::Canceled
            }
        }
    }

    /// Run `fut` until it completes or the context is done.
    ///
    /// `fut` is dropped when the context finishes first.
    pub async fn run<F>(&self, fut: F) -> Result<F::Output, ContextError>
    where
        F: Future,
    {
        if let Some(err) = self.err() {
            return Err(err);
        }
        tokio::select! {
            biased;
            err = self.done() => Err(err),
            out = fut => Ok(out),
        }
    }

    /// Sleep for `duration` unless the context finishes first.
    pub async fn sleep(&self, duration: Duration) -> Result<(), ContextError> {
        self.run(tokio::time::sleep(duration)).await
    }
}

/// Cancels the context it was created with.
///
/// Cloneable and idempotent; cancelling twice has no further effect.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    token: CancellationToken,
}

impl CancelHandle {
    /// Cancel the context.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Whether the context was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

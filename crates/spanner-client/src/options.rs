//! Per-transaction options.

use std::time::{Duration, SystemTime};

use spanner_protocol::{CommitResponse, CommitStats};

/// How a read-write transaction is begun.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BeginMode {
    /// The first statement carries the begin request; the transaction id
    /// comes back with its result.
    #[default]
    Inline,
    /// A `BeginTransaction` RPC is issued before the first statement.
    Explicit,
}

/// Options applied to `Commit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[non_exhaustive]
pub struct CommitOptions {
    /// Ask the server for commit statistics.
    pub return_commit_stats: bool,
    /// How long the server may delay the commit to batch it with others.
    pub max_commit_delay: Option<Duration>,
}

impl CommitOptions {
    /// Create commit options with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request commit statistics.
    #[must_use]
    pub fn return_commit_stats(mut self, enabled: bool) -> Self {
        self.return_commit_stats = enabled;
        self
    }

    /// Allow the server to delay the commit.
    #[must_use]
    pub fn max_commit_delay(mut self, delay: Duration) -> Self {
        self.max_commit_delay = Some(delay);
        self
    }
}

/// Options for a read-write transaction.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[non_exhaustive]
pub struct ReadWriteOptions {
    /// How the transaction is begun.
    pub begin_mode: BeginMode,
    /// Commit options.
    pub commit: CommitOptions,
    /// Tag attached to every request of the transaction.
    pub transaction_tag: Option<String>,
}

impl ReadWriteOptions {
    /// Create options with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the begin mode.
    #[must_use]
    pub fn begin_mode(mut self, mode: BeginMode) -> Self {
        self.begin_mode = mode;
        self
    }

    /// Set the commit options.
    #[must_use]
    pub fn commit(mut self, options: CommitOptions) -> Self {
        self.commit = options;
        self
    }

    /// Set the transaction tag.
    #[must_use]
    pub fn transaction_tag(mut self, tag: impl Into<String>) -> Self {
        self.transaction_tag = Some(tag.into());
        self
    }
}

/// Options for [`Client::apply`](crate::Client::apply).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[non_exhaustive]
pub struct ApplyOptions {
    /// Commit with a single-use transaction. The mutations may be applied
    /// more than once if the commit is retried.
    pub at_least_once: bool,
    /// Options of the read-write transaction used otherwise.
    pub transaction: ReadWriteOptions,
}

impl ApplyOptions {
    /// Create options with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Commit with a single-use transaction.
    #[must_use]
    pub fn at_least_once(mut self, enabled: bool) -> Self {
        self.at_least_once = enabled;
        self
    }

    /// Set the read-write transaction options.
    #[must_use]
    pub fn transaction(mut self, options: ReadWriteOptions) -> Self {
        self.transaction = options;
        self
    }
}

/// Outcome of a committed transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitResult {
    /// When the transaction committed.
    pub commit_timestamp: SystemTime,
    /// Statistics, if requested.
    pub commit_stats: Option<CommitStats>,
}

impl From<CommitResponse> for CommitResult {
    fn from(resp: CommitResponse) -> Self {
        Self {
            commit_timestamp: resp.commit_timestamp,
            commit_stats: resp.commit_stats,
        }
    }
}

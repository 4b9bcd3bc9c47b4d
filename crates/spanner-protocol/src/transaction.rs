//! Transaction messages.

use std::time::{Duration, SystemTime};

use bytes::Bytes;

use crate::mutation::Mutation;
use crate::request::RequestOptions;

/// Server-assigned transaction identifier.
pub type TransactionId = Bytes;

/// How fresh the data read by a read-only transaction must be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimestampBound {
    /// Read the latest committed data.
    #[default]
    Strong,
    /// Read at exactly this staleness.
    ExactStaleness(Duration),
    /// Read at any timestamp no staler than this (single-use only).
    MaxStaleness(Duration),
    /// Read at exactly this timestamp.
    ReadTimestamp(SystemTime),
    /// Read at any timestamp not older than this (single-use only).
    MinReadTimestamp(SystemTime),
}

impl TimestampBound {
    /// Whether the bound may only be used by single-use transactions.
    #[must_use]
    pub fn single_use_only(&self) -> bool {
        matches!(self, Self::MaxStaleness(_) | Self::MinReadTimestamp(_))
    }
}

/// Transaction mode and its parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionOptions {
    /// Locking read-write transaction.
    ReadWrite {
        /// Id of the aborted attempt this one retries (multiplexed sessions).
        previous_transaction_id: Option<TransactionId>,
    },
    /// Lock-free snapshot reads.
    ReadOnly {
        /// Staleness bound.
        bound: TimestampBound,
        /// Return the chosen read timestamp.
        return_read_timestamp: bool,
    },
    /// Partitioned DML.
    PartitionedDml,
}

impl TransactionOptions {
    /// A fresh read-write transaction.
    #[must_use]
    pub fn read_write() -> Self {
        Self::ReadWrite {
            previous_transaction_id: None,
        }
    }

    /// A read-only transaction with the given bound.
    #[must_use]
    pub fn read_only(bound: TimestampBound) -> Self {
        Self::ReadOnly {
            bound,
            return_read_timestamp: true,
        }
    }
}

/// Which transaction a statement runs in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionSelector {
    /// A temporary transaction for this call only.
    SingleUse(TransactionOptions),
    /// An already-begun transaction.
    Id(TransactionId),
    /// Begin a transaction as part of this call.
    Begin(TransactionOptions),
}

/// Token a multiplexed-session transaction carries into its commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrecommitToken {
    /// Opaque token.
    pub token: Bytes,
    /// Ordering of tokens; the highest one wins.
    pub seq_num: i32,
}

/// A begun transaction.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Transaction {
    /// Transaction id.
    pub id: TransactionId,
    /// Read timestamp of read-only transactions.
    pub read_timestamp: Option<SystemTime>,
    /// Precommit token for multiplexed-session read-write transactions.
    pub precommit_token: Option<PrecommitToken>,
}

/// `BeginTransaction` request.
#[derive(Debug, Clone, PartialEq)]
pub struct BeginTransactionRequest {
    /// Session name.
    pub session: String,
    /// Transaction options.
    pub options: TransactionOptions,
    /// A buffered mutation that lets the service pick a participant for a
    /// mutation-only transaction.
    pub mutation_key: Option<Mutation>,
    /// Request options.
    pub request_options: RequestOptions,
}

/// `Commit` request.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitRequest {
    /// Session name.
    pub session: String,
    /// Either [`TransactionSelector::Id`] or [`TransactionSelector::SingleUse`].
    pub transaction: TransactionSelector,
    /// Buffered mutations.
    pub mutations: Vec<Mutation>,
    /// Ask for commit statistics.
    pub return_commit_stats: bool,
    /// Maximum delay the service may add to batch commits.
    pub max_commit_delay: Option<Duration>,
    /// Latest precommit token of the transaction.
    pub precommit_token: Option<PrecommitToken>,
    /// Request options.
    pub request_options: RequestOptions,
}

/// Commit statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitStats {
    /// Number of mutations applied.
    pub mutation_count: i64,
}

/// `Commit` response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitResponse {
    /// Commit timestamp.
    pub commit_timestamp: SystemTime,
    /// Statistics, when requested.
    pub commit_stats: Option<CommitStats>,
    /// Set when a multiplexed-session commit must be re-issued with this
    /// token and without mutations.
    pub multiplexed_session_retry: Option<PrecommitToken>,
}

/// `Rollback` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackRequest {
    /// Session name.
    pub session: String,
    /// Transaction to roll back.
    pub transaction_id: TransactionId,
}

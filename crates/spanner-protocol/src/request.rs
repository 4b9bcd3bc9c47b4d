//! Query, read, DML and batch messages.

use std::collections::BTreeMap;

use bytes::Bytes;

use crate::mutation::{KeySet, MutationGroup};
use crate::result::{ResultSet, ResultSetMetadata};
use crate::status::Status;
use crate::transaction::{PrecommitToken, TransactionSelector};
use crate::value::Value;

/// A SQL statement with named parameters.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Statement {
    /// SQL text.
    pub sql: String,
    /// Parameter values, keyed by name without the `@` prefix.
    pub params: BTreeMap<String, Value>,
}

impl Statement {
    /// A statement without parameters.
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: BTreeMap::new(),
        }
    }

    /// Bind a parameter.
    #[must_use]
    pub fn bind(mut self, name: impl Into<String>, value: Value) -> Self {
        self.params.insert(name.into(), value);
        self
    }
}

/// Tags attached to a request for server-side statistics.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RequestOptions {
    /// Per-request tag.
    pub request_tag: Option<String>,
    /// Per-transaction tag.
    pub transaction_tag: Option<String>,
}

/// Execution mode of a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryMode {
    /// Return rows only.
    #[default]
    Normal,
    /// Return the plan only.
    Plan,
    /// Return rows, the plan and statistics.
    Profile,
}

/// `ExecuteSql` and `ExecuteStreamingSql` request.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecuteSqlRequest {
    /// Session name.
    pub session: String,
    /// Transaction the statement runs in.
    pub transaction: TransactionSelector,
    /// The statement.
    pub statement: Statement,
    /// Resume from this token; empty for a fresh stream.
    pub resume_token: Bytes,
    /// Execution mode.
    pub query_mode: QueryMode,
    /// Partition to execute, from a partitioned query.
    pub partition_token: Option<Bytes>,
    /// Sequence number of DML statements within a transaction.
    pub seqno: i64,
    /// Request options.
    pub request_options: RequestOptions,
}

/// `StreamingRead` request.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadRequest {
    /// Session name.
    pub session: String,
    /// Transaction the read runs in.
    pub transaction: TransactionSelector,
    /// Table to read.
    pub table: String,
    /// Secondary index to read through, if any.
    pub index: Option<String>,
    /// Columns returned.
    pub columns: Vec<String>,
    /// Rows to read.
    pub key_set: KeySet,
    /// Maximum number of rows; zero means unlimited.
    pub limit: i64,
    /// Resume from this token; empty for a fresh stream.
    pub resume_token: Bytes,
    /// Partition to execute, from a partitioned read.
    pub partition_token: Option<Bytes>,
    /// Request options.
    pub request_options: RequestOptions,
}

/// `ExecuteBatchDml` request.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecuteBatchDmlRequest {
    /// Session name.
    pub session: String,
    /// Transaction the statements run in.
    pub transaction: TransactionSelector,
    /// Statements, executed in order.
    pub statements: Vec<Statement>,
    /// Sequence number of this DML call within the transaction.
    pub seqno: i64,
    /// Request options.
    pub request_options: RequestOptions,
}

/// `ExecuteBatchDml` response.
///
/// Execution stops at the first failing statement; `status` then describes
/// that failure and `result_sets` holds one entry per statement that ran.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ExecuteBatchDmlResponse {
    /// One result per successful statement.
    pub result_sets: Vec<ResultSet>,
    /// Failure of the statement after the last successful one.
    pub status: Option<Status>,
    /// Precommit token for multiplexed-session read-write transactions.
    pub precommit_token: Option<PrecommitToken>,
}

impl ExecuteBatchDmlResponse {
    /// Metadata of the first result, which carries an inlined transaction.
    #[must_use]
    pub fn first_metadata(&self) -> Option<&ResultSetMetadata> {
        self.result_sets.first().and_then(|r| r.metadata.as_ref())
    }
}

/// Hints for partitioning a query or read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PartitionOptions {
    /// Desired bytes per partition; zero leaves it to the service.
    pub partition_size_bytes: i64,
    /// Desired number of partitions; zero leaves it to the service.
    pub max_partitions: i64,
}

/// `PartitionQuery` request.
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionQueryRequest {
    /// Session name.
    pub session: String,
    /// Read-only transaction the partitions belong to.
    pub transaction: TransactionSelector,
    /// Root-partitionable query.
    pub statement: Statement,
    /// Partitioning hints.
    pub options: PartitionOptions,
}

/// `PartitionRead` request.
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionReadRequest {
    /// Session name.
    pub session: String,
    /// Read-only transaction the partitions belong to.
    pub transaction: TransactionSelector,
    /// Table to read.
    pub table: String,
    /// Secondary index, if any.
    pub index: Option<String>,
    /// Columns returned.
    pub columns: Vec<String>,
    /// Rows to read.
    pub key_set: KeySet,
    /// Partitioning hints.
    pub options: PartitionOptions,
}

/// A partition token as returned by the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    /// Opaque token passed back when executing the partition.
    pub token: Bytes,
}

/// `PartitionQuery` and `PartitionRead` response.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PartitionResponse {
    /// The partitions.
    pub partitions: Vec<Partition>,
}

/// `BatchWrite` request.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchWriteRequest {
    /// Session name.
    pub session: String,
    /// Independently applied groups.
    pub mutation_groups: Vec<MutationGroup>,
    /// Request options.
    pub request_options: RequestOptions,
}

/// One message of a `BatchWrite` response stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchWriteResponse {
    /// Indexes of the groups this message reports on.
    pub indexes: Vec<i32>,
    /// Outcome shared by those groups; `None` means they were applied.
    pub status: Option<Status>,
    /// Commit timestamp of applied groups.
    pub commit_timestamp: Option<std::time::SystemTime>,
}

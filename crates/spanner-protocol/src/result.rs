//! Query and read results.

use bytes::Bytes;

use crate::transaction::{PrecommitToken, Transaction};
use crate::value::{Field, Value};

/// Column metadata of a result.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResultSetMetadata {
    /// Columns of each row.
    pub fields: Vec<Field>,
    /// Transaction begun by this call, if it carried a begin selector.
    pub transaction: Option<Transaction>,
}

/// Execution statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResultSetStats {
    /// Exact number of rows modified by a DML statement.
    pub row_count_exact: Option<i64>,
    /// Lower bound of rows modified by a partitioned DML statement.
    pub row_count_lower_bound: Option<i64>,
}

/// One message of a streaming result.
///
/// `values` is a flat sequence of column values; rows may straddle message
/// boundaries, and a value may itself be split when `chunked_value` is set.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PartialResultSet {
    /// Metadata; only present on the first message.
    pub metadata: Option<ResultSetMetadata>,
    /// Flat column values.
    pub values: Vec<Value>,
    /// The last value continues in the next message.
    pub chunked_value: bool,
    /// Checkpoint for resuming the stream after this message; empty if none.
    pub resume_token: Bytes,
    /// Statistics; only present on the last message.
    pub stats: Option<ResultSetStats>,
    /// Precommit token for multiplexed-session read-write transactions.
    pub precommit_token: Option<PrecommitToken>,
}

impl PartialResultSet {
    /// Approximate encoded size in bytes.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        self.values.iter().map(Value::encoded_len).sum::<usize>() + self.resume_token.len() + 8
    }

    /// Whether this message carries a resume token.
    #[must_use]
    pub fn has_resume_token(&self) -> bool {
        !self.resume_token.is_empty()
    }
}

/// A complete, non-streamed result.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ResultSet {
    /// Metadata.
    pub metadata: Option<ResultSetMetadata>,
    /// Rows.
    pub rows: Vec<Vec<Value>>,
    /// Statistics.
    pub stats: Option<ResultSetStats>,
    /// Precommit token for multiplexed-session read-write transactions.
    pub precommit_token: Option<PrecommitToken>,
}

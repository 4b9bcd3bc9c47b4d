//! Protocol error types.

use thiserror::Error;

/// Errors produced while building, parsing or decoding protocol values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ProtocolError {
    /// A request identifier header value could not be parsed.
    #[error("malformed request id {value:?}: {reason}")]
    InvalidRequestId {
        /// The offending header value.
        value: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// Value is null when non-null was expected.
    #[error("unexpected null value")]
    UnexpectedNull,

    /// Type mismatch during decoding.
    #[error("type mismatch: expected {expected}, got {actual}")]
    TypeMismatch {
        /// Expected type name.
        expected: &'static str,
        /// Actual type name.
        actual: String,
    },

    /// A string-encoded value could not be parsed into its column type.
    #[error("invalid {type_name} value: {value:?}")]
    InvalidValue {
        /// Column type name.
        type_name: &'static str,
        /// The offending wire value.
        value: String,
    },

    /// A chunked value could not be merged with its continuation.
    #[error("cannot merge chunked value: {0}")]
    ChunkMerge(String),

    /// Row values arrived before the metadata describing their columns.
    #[error("result values arrived before result metadata")]
    MissingMetadata,

    /// A stream ended in the middle of a row.
    #[error("stream ended with an incomplete row ({values} of {columns} values)")]
    IncompleteRow {
        /// Values received for the last row.
        values: usize,
        /// Columns per row.
        columns: usize,
    },
}

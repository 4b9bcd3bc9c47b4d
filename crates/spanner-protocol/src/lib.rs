//! # spanner-protocol
//!
//! Pure message types for the Spanner session runtime.
//!
//! This crate holds everything that crosses the RPC boundary: request and
//! response messages, status codes, the closed error taxonomy used by every
//! retry decision, and the request identifier stamped on each RPC attempt.
//!
//! ## Design Philosophy
//!
//! This crate is intentionally IO-agnostic. It contains no networking logic and
//! makes no assumptions about the async runtime. Higher-level crates build upon
//! this foundation to provide sessions, streaming and transactions.
//!
//! ## Example
//!
//! ```rust
//! use spanner_protocol::{Code, ErrorClass, Status, classify};
//!
//! let status = Status::new(Code::Aborted, "transaction was aborted");
//! assert_eq!(classify(&status), ErrorClass::TransactionRetryable);
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod error;
pub mod mutation;
pub mod request;
pub mod request_id;
pub mod result;
pub mod session;
pub mod status;
pub mod transaction;
pub mod value;

pub use error::ProtocolError;
pub use mutation::{Key, KeyRange, KeySet, Mutation, MutationGroup, MutationOp};
pub use request::{
    BatchWriteRequest, BatchWriteResponse, ExecuteBatchDmlRequest, ExecuteBatchDmlResponse,
    ExecuteSqlRequest, Partition, PartitionOptions, PartitionQueryRequest, PartitionReadRequest,
    PartitionResponse, QueryMode, ReadRequest, RequestOptions, Statement,
};
pub use request_id::{
    API_CLIENT_HEADER, REQUEST_ID_HEADER, REQUEST_ID_VERSION, RESOURCE_PREFIX_HEADER,
    ROUTE_TO_LEADER_HEADER, RequestId,
};
pub use result::{PartialResultSet, ResultSet, ResultSetMetadata, ResultSetStats};
pub use session::{
    BatchCreateSessionsRequest, BatchCreateSessionsResponse, CreateSessionRequest,
    DeleteSessionRequest, SessionInfo,
};
pub use status::{Code, ErrorClass, Status, StatusDetail, classify};
pub use transaction::{
    BeginTransactionRequest, CommitRequest, CommitResponse, CommitStats, PrecommitToken,
    RollbackRequest, TimestampBound, Transaction, TransactionId, TransactionOptions,
    TransactionSelector,
};
pub use value::{Decode, Encode, Field, Type, TypeCode, Value};

//! The RPC seam.
//!
//! [`SpannerRpc`] is the only way the runtime reaches the service. It is
//! object-safe so channels can hold `Arc<dyn SpannerRpc>` and tests can swap
//! in an in-memory server.

use std::collections::VecDeque;

use async_trait::async_trait;
use spanner_protocol::{
    BatchCreateSessionsRequest, BatchCreateSessionsResponse, BatchWriteRequest, BatchWriteResponse,
    BeginTransactionRequest, CommitRequest, CommitResponse, CreateSessionRequest,
    DeleteSessionRequest, ExecuteBatchDmlRequest, ExecuteBatchDmlResponse, ExecuteSqlRequest,
    PartialResultSet, PartitionQueryRequest, PartitionReadRequest, PartitionResponse, ReadRequest,
    ResultSet, RollbackRequest, SessionInfo, Status, Transaction,
};

use crate::metadata::CallMetadata;

/// A server-streaming response.
#[async_trait]
pub trait ServerStream<T: Send>: Send {
    /// Receive the next message.
    ///
    /// Returns `Ok(None)` once the server has closed the stream cleanly.
    async fn message(&mut self) -> Result<Option<T>, Status>;
}

/// Stream of partial result sets.
pub type PartialResultStream = Box<dyn ServerStream<PartialResultSet>>;

/// Stream of batch-write responses.
pub type BatchWriteStream = Box<dyn ServerStream<BatchWriteResponse>>;

/// A stream replaying a fixed sequence of messages and errors.
///
/// After the sequence is exhausted the stream reports a clean end.
#[derive(Debug)]
pub struct VecStream<T> {
    items: VecDeque<Result<T, Status>>,
}

impl<T> VecStream<T> {
    /// Create a stream from its items.
    pub fn new(items: impl IntoIterator<Item = Result<T, Status>>) -> Self {
        Self {
            items: items.into_iter().collect(),
        }
    }
}

#[async_trait]
impl<T: Send> ServerStream<T> for VecStream<T> {
    async fn message(&mut self) -> Result<Option<T>, Status> {
        self.items.pop_front().transpose()
    }
}

/// Client stub for one channel.
///
/// Every method is one physical RPC attempt; retries are the caller's
/// business. `metadata` carries the request headers of the attempt.
#[async_trait]
pub trait SpannerRpc: Send + Sync {
    /// Create one session.
    async fn create_session(
        &self,
        request: CreateSessionRequest,
        metadata: CallMetadata,
    ) -> Result<SessionInfo, Status>;

    /// Create up to `session_count` sessions.
    async fn batch_create_sessions(
        &self,
        request: BatchCreateSessionsRequest,
        metadata: CallMetadata,
    ) -> Result<BatchCreateSessionsResponse, Status>;

    /// Delete a session.
    async fn delete_session(
        &self,
        request: DeleteSessionRequest,
        metadata: CallMetadata,
    ) -> Result<(), Status>;

    /// Begin a transaction.
    async fn begin_transaction(
        &self,
        request: BeginTransactionRequest,
        metadata: CallMetadata,
    ) -> Result<Transaction, Status>;

    /// Commit a transaction.
    async fn commit(
        &self,
        request: CommitRequest,
        metadata: CallMetadata,
    ) -> Result<CommitResponse, Status>;

    /// Roll back a transaction.
    async fn rollback(&self, request: RollbackRequest, metadata: CallMetadata)
    -> Result<(), Status>;

    /// Execute a statement and return the whole result.
    async fn execute_sql(
        &self,
        request: ExecuteSqlRequest,
        metadata: CallMetadata,
    ) -> Result<ResultSet, Status>;

    /// Execute a statement and stream the result.
    async fn execute_streaming_sql(
        &self,
        request: ExecuteSqlRequest,
        metadata: CallMetadata,
    ) -> Result<PartialResultStream, Status>;

    /// Read rows and stream the result.
    async fn streaming_read(
        &self,
        request: ReadRequest,
        metadata: CallMetadata,
    ) -> Result<PartialResultStream, Status>;

    /// Execute DML statements in order.
    async fn execute_batch_dml(
        &self,
        request: ExecuteBatchDmlRequest,
        metadata: CallMetadata,
    ) -> Result<ExecuteBatchDmlResponse, Status>;

    /// Partition a query.
    async fn partition_query(
        &self,
        request: PartitionQueryRequest,
        metadata: CallMetadata,
    ) -> Result<PartitionResponse, Status>;

    /// Partition a read.
    async fn partition_read(
        &self,
        request: PartitionReadRequest,
        metadata: CallMetadata,
    ) -> Result<PartitionResponse, Status>;

    /// Apply mutation groups independently.
    async fn batch_write(
        &self,
        request: BatchWriteRequest,
        metadata: CallMetadata,
    ) -> Result<BatchWriteStream, Status>;
}

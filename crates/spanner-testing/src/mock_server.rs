//! In-memory Spanner server for unit testing.
//!
//! [`MockSpannerServer`] implements [`SpannerRpc`] directly, so it can be
//! handed to a client as a channel stub without any networking.
//!
//! ## Features
//!
//! - Session bookkeeping: unknown or expired sessions fail with
//!   `Session not found`
//! - Configurable query, read and DML results keyed by SQL text or table
//! - Resumable streams that honour resume tokens
//! - One-shot error injection per method, including mid-stream failures
//! - Recording of every call with its headers
//!
//! ## Example
//!
//! ```rust,ignore
//! use spanner_testing::mock_server::{Method, MockResults, MockSpannerServer};
//!
//! let server = Arc::new(MockSpannerServer::new());
//! server.set_query("SELECT 1", MockResults::rows(fields, rows));
//! server.fail_next(Method::Commit, Status::aborted("retry", Duration::ZERO));
//! let client = Client::new(config, vec![server.clone()])?;
//! ```

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use spanner_protocol::{
    BatchCreateSessionsRequest, BatchCreateSessionsResponse, BatchWriteRequest, BatchWriteResponse,
    BeginTransactionRequest, Code, CommitRequest, CommitResponse, CommitStats, CreateSessionRequest,
    DeleteSessionRequest, ExecuteBatchDmlRequest, ExecuteBatchDmlResponse, ExecuteSqlRequest, Field,
    PartialResultSet, Partition, PartitionQueryRequest, PartitionReadRequest, PartitionResponse,
    PrecommitToken, ReadRequest, RequestId, ResultSet, ResultSetMetadata, ResultSetStats,
    RollbackRequest, SessionInfo, Status, Transaction, TransactionId, TransactionOptions,
    TransactionSelector, Value,
};
use spanner_transport::{
    BatchWriteStream, CallMetadata, PartialResultStream, SpannerRpc, VecStream,
};
use tracing::trace;

/// The RPC methods of the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// `CreateSession`.
    CreateSession,
    /// `BatchCreateSessions`.
    BatchCreateSessions,
    /// `DeleteSession`.
    DeleteSession,
    /// `BeginTransaction`.
    BeginTransaction,
    /// `Commit`.
    Commit,
    /// `Rollback`.
    Rollback,
    /// `ExecuteSql`.
    ExecuteSql,
    /// `ExecuteStreamingSql`.
    ExecuteStreamingSql,
    /// `StreamingRead`.
    StreamingRead,
    /// `ExecuteBatchDml`.
    ExecuteBatchDml,
    /// `PartitionQuery`.
    PartitionQuery,
    /// `PartitionRead`.
    PartitionRead,
    /// `BatchWrite`.
    BatchWrite,
}

impl Method {
    /// The method name as it appears on the wire.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::CreateSession => "CreateSession",
            Self::BatchCreateSessions => "BatchCreateSessions",
            Self::DeleteSession => "DeleteSession",
            Self::BeginTransaction => "BeginTransaction",
            Self::Commit => "Commit",
            Self::Rollback => "Rollback",
            Self::ExecuteSql => "ExecuteSql",
            Self::ExecuteStreamingSql => "ExecuteStreamingSql",
            Self::StreamingRead => "StreamingRead",
            Self::ExecuteBatchDml => "ExecuteBatchDml",
            Self::PartitionQuery => "PartitionQuery",
            Self::PartitionRead => "PartitionRead",
            Self::BatchWrite => "BatchWrite",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A request as received by the server.
#[derive(Debug, Clone)]
#[allow(missing_docs)]
pub enum RecordedRequest {
    CreateSession(CreateSessionRequest),
    BatchCreateSessions(BatchCreateSessionsRequest),
    DeleteSession(DeleteSessionRequest),
    BeginTransaction(BeginTransactionRequest),
    Commit(CommitRequest),
    Rollback(RollbackRequest),
    ExecuteSql(ExecuteSqlRequest),
    ExecuteStreamingSql(ExecuteSqlRequest),
    StreamingRead(ReadRequest),
    ExecuteBatchDml(ExecuteBatchDmlRequest),
    PartitionQuery(PartitionQueryRequest),
    PartitionRead(PartitionReadRequest),
    BatchWrite(BatchWriteRequest),
}

impl RecordedRequest {
    /// Session the request names, if any.
    #[must_use]
    pub fn session(&self) -> Option<&str> {
        match self {
            Self::CreateSession(_) | Self::BatchCreateSessions(_) => None,
            Self::DeleteSession(r) => Some(&r.name),
            Self::BeginTransaction(r) => Some(&r.session),
            Self::Commit(r) => Some(&r.session),
            Self::Rollback(r) => Some(&r.session),
            Self::ExecuteSql(r) | Self::ExecuteStreamingSql(r) => Some(&r.session),
            Self::StreamingRead(r) => Some(&r.session),
            Self::ExecuteBatchDml(r) => Some(&r.session),
            Self::PartitionQuery(r) => Some(&r.session),
            Self::PartitionRead(r) => Some(&r.session),
            Self::BatchWrite(r) => Some(&r.session),
        }
    }
}

/// One call received by the server.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    /// The method called.
    pub method: Method,
    /// Request headers.
    pub metadata: CallMetadata,
    /// The request.
    pub request: RecordedRequest,
}

impl RecordedCall {
    /// The request id header, parsed.
    #[must_use]
    pub fn request_id(&self) -> Option<RequestId> {
        self.metadata.request_id()
    }
}

/// Results served for a query or read.
#[derive(Debug, Clone, PartialEq)]
pub struct MockResults {
    fields: Vec<Field>,
    partials: Vec<PartialResultSet>,
}

impl MockResults {
    /// One row per message; message `i` (from 1) carries resume token
    /// `token-i`.
    #[must_use]
    pub fn rows(fields: Vec<Field>, rows: Vec<Vec<Value>>) -> Self {
        let partials = rows
            .into_iter()
            .enumerate()
            .map(|(i, values)| PartialResultSet {
                values,
                resume_token: Bytes::from(format!("token-{}", i + 1)),
                ..Default::default()
            })
            .collect();
        Self::partials(fields, partials)
    }

    /// Serve these messages as they are. The first one gets the metadata.
    #[must_use]
    pub fn partials(fields: Vec<Field>, partials: Vec<PartialResultSet>) -> Self {
        Self { fields, partials }
    }

    /// Attach statistics to the last message.
    #[must_use]
    pub fn with_stats(mut self, stats: ResultSetStats) -> Self {
        match self.partials.last_mut() {
            Some(last) => last.stats = Some(stats),
            None => self.partials.push(PartialResultSet {
                stats: Some(stats),
                ..Default::default()
            }),
        }
        self
    }

    /// The messages of a stream, starting after `resume_token`.
    fn stream_from(
        &self,
        resume_token: &Bytes,
        transaction: Option<Transaction>,
    ) -> Result<Vec<PartialResultSet>, Status> {
        let start = if resume_token.is_empty() {
            0
        } else {
            self.partials
                .iter()
                .position(|p| &p.resume_token == resume_token)
                .map(|i| i + 1)
                .ok_or_else(|| Status::new(Code::InvalidArgument, "unknown resume token"))?
        };
        let mut out: Vec<PartialResultSet> = self.partials[start..].to_vec();
        if start == 0 {
            if out.is_empty() {
                out.push(PartialResultSet::default());
            }
            let first = &mut out[0];
            let metadata = first.metadata.get_or_insert_with(|| ResultSetMetadata {
                fields: self.fields.clone(),
                transaction: None,
            });
            if metadata.transaction.is_none() {
                metadata.transaction = transaction;
            }
        }
        Ok(out)
    }

    fn result_set(&self, transaction: Option<Transaction>) -> ResultSet {
        let columns = self.fields.len().max(1);
        let values: Vec<Value> = self.partials.iter().flat_map(|p| p.values.clone()).collect();
        ResultSet {
            metadata: Some(ResultSetMetadata {
                fields: self.fields.clone(),
                transaction,
            }),
            rows: values.chunks(columns).map(<[Value]>::to_vec).collect(),
            stats: self.partials.iter().rev().find_map(|p| p.stats),
            precommit_token: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxKind {
    ReadWrite,
    ReadOnly,
    PartitionedDml,
}

#[derive(Debug)]
struct TxRecord {
    kind: TxKind,
    multiplexed: bool,
    finished: bool,
}

#[derive(Debug, Default)]
struct ServerState {
    next_id: u64,
    precommit_seq: i32,
    sessions: HashMap<String, bool>,
    transactions: HashMap<TransactionId, TxRecord>,
    queries: HashMap<String, MockResults>,
    reads: HashMap<String, MockResults>,
    updates: HashMap<String, i64>,
    errors: HashMap<Method, VecDeque<Status>>,
    stream_errors: HashMap<Method, VecDeque<(usize, Status)>>,
    calls: Vec<RecordedCall>,
    multiplexed_rw_unsupported: bool,
    commit_retry_token: Option<PrecommitToken>,
    partition_count: usize,
    batch_create_limit: Option<u32>,
    latency: Duration,
}

impl ServerState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn record(&mut self, method: Method, metadata: CallMetadata, request: RecordedRequest) {
        trace!(%method, request_id = ?metadata.request_id(), "mock call");
        self.calls.push(RecordedCall {
            method,
            metadata,
            request,
        });
    }

    fn injected(&mut self, method: Method) -> Result<(), Status> {
        match self.errors.get_mut(&method).and_then(VecDeque::pop_front) {
            Some(status) => Err(status),
            None => Ok(()),
        }
    }

    fn create_session(&mut self, database: &str, multiplexed: bool) -> SessionInfo {
        let name = format!("{database}/sessions/s{}", self.next_id());
        self.sessions.insert(name.clone(), multiplexed);
        SessionInfo {
            name,
            create_time: SystemTime::now(),
            multiplexed,
        }
    }

    /// Whether the session is multiplexed.
    fn check_session(&self, name: &str) -> Result<bool, Status> {
        self.sessions
            .get(name)
            .copied()
            .ok_or_else(|| Status::session_not_found(name))
    }

    fn begin(&mut self, multiplexed: bool, options: &TransactionOptions) -> Result<Transaction, Status> {
        let kind = match options {
            TransactionOptions::ReadWrite { .. } => TxKind::ReadWrite,
            TransactionOptions::ReadOnly { .. } => TxKind::ReadOnly,
            TransactionOptions::PartitionedDml => TxKind::PartitionedDml,
        };
        if kind == TxKind::ReadWrite && multiplexed && self.multiplexed_rw_unsupported {
            return Err(Status::multiplexed_rw_unsupported());
        }
        let id = Bytes::from(format!("tx-{}", self.next_id()));
        self.transactions.insert(
            id.clone(),
            TxRecord {
                kind,
                multiplexed,
                finished: false,
            },
        );
        let precommit_token = (kind == TxKind::ReadWrite && multiplexed)
            .then(|| self.precommit_token())
            .flatten();
        Ok(Transaction {
            id,
            read_timestamp: (kind == TxKind::ReadOnly).then(SystemTime::now),
            precommit_token,
        })
    }

    fn precommit_token(&mut self) -> Option<PrecommitToken> {
        self.precommit_seq += 1;
        Some(PrecommitToken {
            token: Bytes::from(format!("precommit-{}", self.precommit_seq)),
            seq_num: self.precommit_seq,
        })
    }

    fn active_transaction(&self, id: &TransactionId) -> Result<&TxRecord, Status> {
        match self.transactions.get(id) {
            Some(tx) if !tx.finished => Ok(tx),
            Some(_) => Err(Status::new(Code::FailedPrecondition, "transaction has finished")),
            None => Err(Status::new(Code::FailedPrecondition, "transaction not found")),
        }
    }

    /// Resolve a selector. Returns the transaction to report back to the
    /// caller, the kind of transaction the call runs in, and whether a
    /// precommit token is due.
    fn select(
        &mut self,
        multiplexed: bool,
        selector: &TransactionSelector,
    ) -> Result<(Option<Transaction>, TxKind, bool), Status> {
        match selector {
            TransactionSelector::Begin(options) => {
                let tx = self.begin(multiplexed, options)?;
                let kind = self.transactions.get(&tx.id).map_or(TxKind::ReadOnly, |t| t.kind);
                let precommit = tx.precommit_token.is_some();
                Ok((Some(tx), kind, precommit))
            }
            TransactionSelector::Id(id) => {
                let tx = self.active_transaction(id)?;
                Ok((None, tx.kind, tx.kind == TxKind::ReadWrite && tx.multiplexed))
            }
            TransactionSelector::SingleUse(TransactionOptions::ReadOnly {
                return_read_timestamp,
                ..
            }) => {
                let tx = return_read_timestamp.then(|| Transaction {
                    id: Bytes::new(),
                    read_timestamp: Some(SystemTime::now()),
                    precommit_token: None,
                });
                Ok((tx, TxKind::ReadOnly, false))
            }
            TransactionSelector::SingleUse(TransactionOptions::ReadWrite { .. }) => {
                if multiplexed && self.multiplexed_rw_unsupported {
                    return Err(Status::multiplexed_rw_unsupported());
                }
                Ok((None, TxKind::ReadWrite, false))
            }
            TransactionSelector::SingleUse(TransactionOptions::PartitionedDml) => Err(Status::new(
                Code::InvalidArgument,
                "partitioned DML cannot be single-use",
            )),
        }
    }

    fn stream(
        &mut self,
        method: Method,
        source: Option<MockResults>,
        resume_token: &Bytes,
        transaction: Option<Transaction>,
        precommit: bool,
    ) -> Result<PartialResultStream, Status> {
        let source =
            source.ok_or_else(|| Status::new(Code::InvalidArgument, "no results configured"))?;
        let mut partials = source.stream_from(resume_token, transaction)?;
        if precommit {
            let token = self.precommit_token();
            if let Some(last) = partials.last_mut() {
                last.precommit_token = token;
            }
        }
        let mut items: Vec<Result<PartialResultSet, Status>> = partials.into_iter().map(Ok).collect();
        if let Some((after, status)) = self.stream_errors.get_mut(&method).and_then(VecDeque::pop_front) {
            items.truncate(after);
            items.push(Err(status));
        }
        Ok(Box::new(VecStream::new(items)))
    }
}

/// In-memory Spanner server.
pub struct MockSpannerServer {
    state: Mutex<ServerState>,
}

impl MockSpannerServer {
    /// Create a server with no configured results.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ServerState {
                partition_count: 2,
                ..Default::default()
            }),
        }
    }

    /// Serve `results` for queries with this SQL text.
    pub fn set_query(&self, sql: impl Into<String>, results: MockResults) {
        self.state.lock().queries.insert(sql.into(), results);
    }

    /// Serve `results` for reads of this table.
    pub fn set_read(&self, table: impl Into<String>, results: MockResults) {
        self.state.lock().reads.insert(table.into(), results);
    }

    /// Treat this SQL text as DML modifying `count` rows.
    pub fn set_update_count(&self, sql: impl Into<String>, count: i64) {
        self.state.lock().updates.insert(sql.into(), count);
    }

    /// Fail the next call of `method` with `status`. Repeated calls queue
    /// further failures.
    pub fn fail_next(&self, method: Method, status: Status) {
        self.state
            .lock()
            .errors
            .entry(method)
            .or_default()
            .push_back(status);
    }

    /// Make the next stream opened by `method` fail with `status` after
    /// delivering `after` messages.
    pub fn fail_stream(&self, method: Method, after: usize, status: Status) {
        self.state
            .lock()
            .stream_errors
            .entry(method)
            .or_default()
            .push_back((after, status));
    }

    /// Reject read-write transactions on multiplexed sessions.
    pub fn set_multiplexed_rw_unsupported(&self, unsupported: bool) {
        self.state.lock().multiplexed_rw_unsupported = unsupported;
    }

    /// Answer the next commit by asking for a retry with `token`.
    pub fn set_commit_retry_token(&self, token: PrecommitToken) {
        self.state.lock().commit_retry_token = Some(token);
    }

    /// Number of partitions returned by `PartitionQuery` and
    /// `PartitionRead` (default: 2).
    pub fn set_partition_count(&self, count: usize) {
        self.state.lock().partition_count = count;
    }

    /// Create at most `limit` sessions per `BatchCreateSessions` call.
    pub fn set_batch_create_limit(&self, limit: u32) {
        self.state.lock().batch_create_limit = Some(limit);
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().latency = latency;
    }

    /// Forget a session as if it had expired. Returns false if it did not
    /// exist.
    pub fn expire_session(&self, name: &str) -> bool {
        self.state.lock().sessions.remove(name).is_some()
    }

    /// Forget every session.
    pub fn expire_all_sessions(&self) {
        self.state.lock().sessions.clear();
    }

    /// Names of live sessions.
    #[must_use]
    pub fn sessions(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.lock().sessions.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of live sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.state.lock().sessions.len()
    }

    /// Every call received, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.state.lock().calls.clone()
    }

    /// Calls of one method, in order.
    #[must_use]
    pub fn calls_to(&self, method: Method) -> Vec<RecordedCall> {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| c.method == method)
            .cloned()
            .collect()
    }

    /// Number of calls of one method.
    #[must_use]
    pub fn call_count(&self, method: Method) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| c.method == method)
            .count()
    }

    /// Forget recorded calls.
    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    async fn delay(&self) {
        let latency = self.state.lock().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

impl Default for MockSpannerServer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MockSpannerServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MockSpannerServer")
            .field("sessions", &state.sessions.len())
            .field("transactions", &state.transactions.len())
            .field("calls", &state.calls.len())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl SpannerRpc for MockSpannerServer {
    async fn create_session(
        &self,
        request: CreateSessionRequest,
        metadata: CallMetadata,
    ) -> Result<SessionInfo, Status> {
        self.delay().await;
        let mut state = self.state.lock();
        state.record(
            Method::CreateSession,
            metadata,
            RecordedRequest::CreateSession(request.clone()),
        );
        state.injected(Method::CreateSession)?;
        Ok(state.create_session(&request.database, request.multiplexed))
    }

    async fn batch_create_sessions(
        &self,
        request: BatchCreateSessionsRequest,
        metadata: CallMetadata,
    ) -> Result<BatchCreateSessionsResponse, Status> {
        self.delay().await;
        let mut state = self.state.lock();
        state.record(
            Method::BatchCreateSessions,
            metadata,
            RecordedRequest::BatchCreateSessions(request.clone()),
        );
        state.injected(Method::BatchCreateSessions)?;
        let count = state
            .batch_create_limit
            .map_or(request.session_count, |limit| limit.min(request.session_count));
        let sessions = (0..count)
            .map(|_| state.create_session(&request.database, false))
            .collect();
        Ok(BatchCreateSessionsResponse { sessions })
    }

    async fn delete_session(
        &self,
        request: DeleteSessionRequest,
        metadata: CallMetadata,
    ) -> Result<(), Status> {
        self.delay().await;
        let mut state = self.state.lock();
        state.record(
            Method::DeleteSession,
            metadata,
            RecordedRequest::DeleteSession(request.clone()),
        );
        state.injected(Method::DeleteSession)?;
        state
            .sessions
            .remove(&request.name)
            .map(|_| ())
            .ok_or_else(|| Status::session_not_found(&request.name))
    }

    async fn begin_transaction(
        &self,
        request: BeginTransactionRequest,
        metadata: CallMetadata,
    ) -> Result<Transaction, Status> {
        self.delay().await;
        let mut state = self.state.lock();
        state.record(
            Method::BeginTransaction,
            metadata,
            RecordedRequest::BeginTransaction(request.clone()),
        );
        state.injected(Method::BeginTransaction)?;
        let multiplexed = state.check_session(&request.session)?;
        state.begin(multiplexed, &request.options)
    }

    async fn commit(
        &self,
        request: CommitRequest,
        metadata: CallMetadata,
    ) -> Result<CommitResponse, Status> {
        self.delay().await;
        let mut state = self.state.lock();
        state.record(Method::Commit, metadata, RecordedRequest::Commit(request.clone()));
        state.injected(Method::Commit)?;
        let multiplexed = state.check_session(&request.session)?;

        let id = match &request.transaction {
            TransactionSelector::Id(id) => {
                if state.active_transaction(id)?.kind != TxKind::ReadWrite {
                    return Err(Status::new(
                        Code::FailedPrecondition,
                        "cannot commit a read-only transaction",
                    ));
                }
                Some(id.clone())
            }
            selector @ TransactionSelector::SingleUse(TransactionOptions::ReadWrite { .. }) => {
                state.select(multiplexed, selector)?;
                None
            }
            _ => {
                return Err(Status::new(
                    Code::InvalidArgument,
                    "commit requires a transaction id or a single-use read-write transaction",
                ));
            }
        };

        if let Some(token) = state.commit_retry_token.take() {
            return Ok(CommitResponse {
                commit_timestamp: SystemTime::now(),
                commit_stats: None,
                multiplexed_session_retry: Some(token),
            });
        }
        if let Some(id) = id {
            if let Some(tx) = state.transactions.get_mut(&id) {
                tx.finished = true;
            }
        }
        Ok(CommitResponse {
            commit_timestamp: SystemTime::now(),
            commit_stats: request.return_commit_stats.then(|| CommitStats {
                mutation_count: request.mutations.len() as i64,
            }),
            multiplexed_session_retry: None,
        })
    }

    async fn rollback(&self, request: RollbackRequest, metadata: CallMetadata) -> Result<(), Status> {
        self.delay().await;
        let mut state = self.state.lock();
        state.record(Method::Rollback, metadata, RecordedRequest::Rollback(request.clone()));
        state.injected(Method::Rollback)?;
        state.check_session(&request.session)?;
        if let Some(tx) = state.transactions.get_mut(&request.transaction_id) {
            tx.finished = true;
        }
        Ok(())
    }

    async fn execute_sql(
        &self,
        request: ExecuteSqlRequest,
        metadata: CallMetadata,
    ) -> Result<ResultSet, Status> {
        self.delay().await;
        let mut state = self.state.lock();
        state.record(Method::ExecuteSql, metadata, RecordedRequest::ExecuteSql(request.clone()));
        state.injected(Method::ExecuteSql)?;
        let multiplexed = state.check_session(&request.session)?;
        let sql = &request.statement.sql;
        let known = state.updates.contains_key(sql) || state.queries.contains_key(sql);
        if !known {
            return Err(Status::new(
                Code::InvalidArgument,
                format!("no result configured for: {sql}"),
            ));
        }

        let (transaction, _, precommit) = state.select(multiplexed, &request.transaction)?;
        let mut result = match state.updates.get(sql) {
            Some(&count) => ResultSet {
                metadata: Some(ResultSetMetadata {
                    fields: Vec::new(),
                    transaction,
                }),
                rows: Vec::new(),
                stats: Some(ResultSetStats {
                    row_count_exact: Some(count),
                    row_count_lower_bound: None,
                }),
                precommit_token: None,
            },
            None => state
                .queries
                .get(sql)
                .map(|q| q.result_set(transaction))
                .unwrap_or_default(),
        };
        if precommit {
            result.precommit_token = state.precommit_token();
        }
        Ok(result)
    }

    async fn execute_streaming_sql(
        &self,
        request: ExecuteSqlRequest,
        metadata: CallMetadata,
    ) -> Result<PartialResultStream, Status> {
        self.delay().await;
        let mut state = self.state.lock();
        state.record(
            Method::ExecuteStreamingSql,
            metadata,
            RecordedRequest::ExecuteStreamingSql(request.clone()),
        );
        state.injected(Method::ExecuteStreamingSql)?;
        let multiplexed = state.check_session(&request.session)?;
        let (transaction, kind, precommit) = state.select(multiplexed, &request.transaction)?;

        let sql = &request.statement.sql;
        let source = match state.updates.get(sql) {
            Some(&count) => {
                let stats = if kind == TxKind::PartitionedDml {
                    ResultSetStats {
                        row_count_exact: None,
                        row_count_lower_bound: Some(count),
                    }
                } else {
                    ResultSetStats {
                        row_count_exact: Some(count),
                        row_count_lower_bound: None,
                    }
                };
                Some(MockResults::partials(Vec::new(), Vec::new()).with_stats(stats))
            }
            None => state.queries.get(sql).cloned(),
        };
        state.stream(
            Method::ExecuteStreamingSql,
            source,
            &request.resume_token,
            transaction,
            precommit,
        )
    }

    async fn streaming_read(
        &self,
        request: ReadRequest,
        metadata: CallMetadata,
    ) -> Result<PartialResultStream, Status> {
        self.delay().await;
        let mut state = self.state.lock();
        state.record(
            Method::StreamingRead,
            metadata,
            RecordedRequest::StreamingRead(request.clone()),
        );
        state.injected(Method::StreamingRead)?;
        let multiplexed = state.check_session(&request.session)?;
        let (transaction, _, precommit) = state.select(multiplexed, &request.transaction)?;
        let source = state.reads.get(&request.table).cloned();
        state.stream(
            Method::StreamingRead,
            source,
            &request.resume_token,
            transaction,
            precommit,
        )
    }

    async fn execute_batch_dml(
        &self,
        request: ExecuteBatchDmlRequest,
        metadata: CallMetadata,
    ) -> Result<ExecuteBatchDmlResponse, Status> {
        self.delay().await;
        let mut state = self.state.lock();
        state.record(
            Method::ExecuteBatchDml,
            metadata,
            RecordedRequest::ExecuteBatchDml(request.clone()),
        );
        state.injected(Method::ExecuteBatchDml)?;
        let multiplexed = state.check_session(&request.session)?;

        let mut response = ExecuteBatchDmlResponse::default();
        let mut begin = Some(&request.transaction);
        for statement in &request.statements {
            let Some(&count) = state.updates.get(&statement.sql) else {
                response.status = Some(Status::new(
                    Code::InvalidArgument,
                    format!("no result configured for: {}", statement.sql),
                ));
                break;
            };
            let transaction = match begin.take() {
                Some(selector) => {
                    let (transaction, _, precommit) = state.select(multiplexed, selector)?;
                    if precommit {
                        response.precommit_token = state.precommit_token();
                    }
                    transaction
                }
                None => None,
            };
            response.result_sets.push(ResultSet {
                metadata: Some(ResultSetMetadata {
                    fields: Vec::new(),
                    transaction,
                }),
                rows: Vec::new(),
                stats: Some(ResultSetStats {
                    row_count_exact: Some(count),
                    row_count_lower_bound: None,
                }),
                precommit_token: None,
            });
        }
        Ok(response)
    }

    async fn partition_query(
        &self,
        request: PartitionQueryRequest,
        metadata: CallMetadata,
    ) -> Result<PartitionResponse, Status> {
        self.delay().await;
        let mut state = self.state.lock();
        state.record(
            Method::PartitionQuery,
            metadata,
            RecordedRequest::PartitionQuery(request.clone()),
        );
        state.injected(Method::PartitionQuery)?;
        let multiplexed = state.check_session(&request.session)?;
        state.select(multiplexed, &request.transaction)?;
        Ok(partitions(state.partition_count))
    }

    async fn partition_read(
        &self,
        request: PartitionReadRequest,
        metadata: CallMetadata,
    ) -> Result<PartitionResponse, Status> {
        self.delay().await;
        let mut state = self.state.lock();
        state.record(
            Method::PartitionRead,
            metadata,
            RecordedRequest::PartitionRead(request.clone()),
        );
        state.injected(Method::PartitionRead)?;
        let multiplexed = state.check_session(&request.session)?;
        state.select(multiplexed, &request.transaction)?;
        Ok(partitions(state.partition_count))
    }

    async fn batch_write(
        &self,
        request: BatchWriteRequest,
        metadata: CallMetadata,
    ) -> Result<BatchWriteStream, Status> {
        self.delay().await;
        let mut state = self.state.lock();
        state.record(Method::BatchWrite, metadata, RecordedRequest::BatchWrite(request.clone()));
        state.injected(Method::BatchWrite)?;
        state.check_session(&request.session)?;
        let responses: Vec<Result<BatchWriteResponse, Status>> = (0..request.mutation_groups.len())
            .map(|i| {
                Ok(BatchWriteResponse {
                    indexes: vec![i as i32],
                    status: None,
                    commit_timestamp: Some(SystemTime::now()),
                })
            })
            .collect();
        Ok(Box::new(VecStream::new(responses)))
    }
}

fn partitions(count: usize) -> PartitionResponse {
    PartitionResponse {
        partitions: (0..count)
            .map(|i| Partition {
                token: Bytes::from(format!("partition-{i}")),
            })
            .collect(),
    }
}

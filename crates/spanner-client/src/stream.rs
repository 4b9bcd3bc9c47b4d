//! Streaming calls feeding a [`RowIterator`](crate::RowIterator).

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use spanner_protocol::{
    ExecuteSqlRequest, KeySet, QueryMode, ReadRequest, RequestId, RequestOptions, Statement,
    Status, TimestampBound, TransactionId, TransactionOptions, TransactionSelector,
};
use spanner_transport::{Context, PartialResultStream};
use tracing::debug;

use crate::client::ClientInner;
use crate::decoder::StreamSource;
use crate::error::Error;
use crate::handle::SessionHandle;
use crate::request_id::Attempts;

/// A resumable streaming request.
#[derive(Debug, Clone)]
pub(crate) enum StreamingRequest {
    Query(ExecuteSqlRequest),
    Read(ReadRequest),
}

impl StreamingRequest {
    pub(crate) fn set_session(&mut self, name: &str) {
        match self {
            Self::Query(r) => r.session = name.to_string(),
            Self::Read(r) => r.session = name.to_string(),
        }
    }

    pub(crate) fn set_transaction(&mut self, selector: TransactionSelector) {
        match self {
            Self::Query(r) => r.transaction = selector,
            Self::Read(r) => r.transaction = selector,
        }
    }

    /// A query with no session or transaction bound yet.
    pub(crate) fn query(statement: Statement, request_options: RequestOptions) -> Self {
        Self::Query(ExecuteSqlRequest {
            session: String::new(),
            transaction: TransactionSelector::SingleUse(TransactionOptions::read_only(
                TimestampBound::Strong,
            )),
            statement,
            resume_token: Bytes::new(),
            query_mode: QueryMode::Normal,
            partition_token: None,
            seqno: 0,
            request_options,
        })
    }

    /// A read with no session or transaction bound yet.
    pub(crate) fn read(
        table: &str,
        index: Option<&str>,
        key_set: KeySet,
        columns: &[&str],
        request_options: RequestOptions,
    ) -> Self {
        Self::Read(ReadRequest {
            session: String::new(),
            transaction: TransactionSelector::SingleUse(TransactionOptions::read_only(
                TimestampBound::Strong,
            )),
            table: table.to_string(),
            index: index.map(str::to_string),
            columns: columns.iter().map(|c| (*c).to_string()).collect(),
            key_set,
            limit: 0,
            resume_token: Bytes::new(),
            partition_token: None,
            request_options,
        })
    }

    pub(crate) fn set_partition_token(&mut self, token: Bytes) {
        match self {
            Self::Query(r) => r.partition_token = Some(token),
            Self::Read(r) => r.partition_token = Some(token),
        }
    }

    pub(crate) fn set_seqno(&mut self, seqno: i64) {
        if let Self::Query(r) = self {
            r.seqno = seqno;
        }
    }

    fn resumed(&self, resume_token: Bytes) -> Self {
        let mut request = self.clone();
        match &mut request {
            Self::Query(r) => r.resume_token = resume_token,
            Self::Read(r) => r.resume_token = resume_token,
        }
        request
    }
}

/// The transaction a streaming call runs in.
///
/// A call that began its transaction inline must name it by id once the
/// first result has returned it, so every re-issue asks for the current id.
pub(crate) trait TransactionBinding: Send + Sync {
    /// Id of the transaction, once known.
    fn transaction_id(&self) -> Option<TransactionId>;
}

/// Issues `ExecuteStreamingSql` or `StreamingRead` for a decoder.
pub(crate) struct StreamingCall {
    client: Arc<ClientInner>,
    request: StreamingRequest,
    channel_id: u32,
    leader: bool,
    attempts: Attempts,
    session: Option<SessionHandle>,
    transaction: Option<Arc<dyn TransactionBinding>>,
}

impl StreamingCall {
    /// A call on a session owned by someone else, such as a transaction.
    pub(crate) fn new(
        client: Arc<ClientInner>,
        request: StreamingRequest,
        channel_id: u32,
        leader: bool,
    ) -> Self {
        let attempts = Attempts::new(client.sessions.request_ids().next(channel_id));
        Self {
            client,
            request,
            channel_id,
            leader,
            attempts,
            session: None,
            transaction: None,
        }
    }

    /// Re-issues name `transaction` by id once it has one.
    pub(crate) fn bound_to(mut self, transaction: Arc<dyn TransactionBinding>) -> Self {
        self.transaction = Some(transaction);
        self
    }

    /// A call that owns its session. The session is released when the
    /// stream ends and replaced if the server loses it before any result
    /// was delivered.
    pub(crate) fn owning(
        client: Arc<ClientInner>,
        mut request: StreamingRequest,
        session: SessionHandle,
        leader: bool,
    ) -> Self {
        request.set_session(session.name());
        let mut call = Self::new(client, request, session.channel_id(), leader);
        call.session = Some(session);
        call
    }
}

#[async_trait]
impl StreamSource for StreamingCall {
    async fn open(&mut self, resume_token: Bytes) -> Result<PartialResultStream, Status> {
        let id = self.attempts.next();
        let mut md = self.client.sessions.metadata(self.leader);
        md.set_request_id(id);
        let rpc = Arc::clone(self.client.sessions.channel(self.channel_id).rpc());
        if let Some(id) = self.transaction.as_ref().and_then(|t| t.transaction_id()) {
            self.request.set_transaction(TransactionSelector::Id(id));
        }
        match self.request.resumed(resume_token) {
            StreamingRequest::Query(request) => rpc.execute_streaming_sql(request, md).await,
            StreamingRequest::Read(request) => rpc.streaming_read(request, md).await,
        }
    }

    fn request_id(&self) -> Option<RequestId> {
        self.attempts.last()
    }

    async fn replace_session(&mut self, ctx: &Context) -> Result<bool, Error> {
        let Some(old) = self.session.take() else {
            return Ok(false);
        };
        let pool = &self.client.pool;
        let multiplexed = old.is_multiplexed();
        old.discard(pool);
        let session = SessionHandle::acquire(pool, ctx, multiplexed).await?;
        debug!(session_id = session.name(), "replaying call on a new session");

        self.request.set_session(session.name());
        self.channel_id = session.channel_id();
        self.attempts = Attempts::new(self.client.sessions.request_ids().next(self.channel_id));
        self.session = Some(session);
        Ok(true)
    }

    fn release(&mut self) {
        self.session = None;
    }
}

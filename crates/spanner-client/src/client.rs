//! The client facade.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use spanner_protocol::{
    BatchWriteRequest, BatchWriteResponse, BeginTransactionRequest, CommitRequest, ErrorClass,
    ExecuteSqlRequest, Mutation, MutationGroup, QueryMode, RequestOptions, Statement,
    TimestampBound, TransactionOptions, TransactionSelector,
};
use spanner_session_pool::{PoolError, PoolStatus, SessionFactory, SessionPool};
use spanner_transport::{ChannelPool, Context, SpannerRpc};
use tracing::{debug, info};

use crate::batch::BatchReadOnlyTransaction;
use crate::config::ClientConfig;
use crate::decoder::DecoderOptions;
use crate::error::Error;
use crate::handle::SessionHandle;
use crate::options::{ApplyOptions, CommitResult, ReadWriteOptions};
use crate::read_only::ReadOnlyTransaction;
use crate::read_write::ReadWriteTransaction;
use crate::row::RowIterator;
use crate::runner;
use crate::session_client::SessionClient;
use crate::stream::{StreamingCall, StreamingRequest};

/// State shared by a client and everything it hands out.
#[derive(Debug)]
pub(crate) struct ClientInner {
    pub(crate) config: ClientConfig,
    pub(crate) sessions: Arc<SessionClient>,
    pub(crate) pool: SessionPool,
    closed: AtomicBool,
}

impl ClientInner {
    pub(crate) fn ensure_open(&self) -> Result<(), Error> {
        if self.closed.load(Ordering::Acquire) {
            Err(Error::Closed)
        } else {
            Ok(())
        }
    }

    pub(crate) fn decoder_options(&self) -> DecoderOptions {
        DecoderOptions {
            backoff: self.config.stream_backoff,
            max_bytes_between_resume_tokens: self.config.max_bytes_between_resume_tokens,
        }
    }

    /// A session for reads outside a read-write transaction.
    pub(crate) async fn read_session(&self, ctx: &Context) -> Result<SessionHandle, Error> {
        SessionHandle::acquire(&self.pool, ctx, self.pool.multiplexed_enabled()).await
    }
}

/// A client for one database.
///
/// Create one client per database and share it; it owns the session pool
/// and every channel.
///
/// # Example
///
/// ```rust,ignore
/// use spanner_client::{Client, ClientConfig};
/// use spanner_protocol::Statement;
/// use spanner_transport::Context;
///
/// let client = Client::new(ClientConfig::new("projects/p/instances/i/databases/d"), channels)?;
/// let ctx = Context::background();
///
/// client
///     .read_write_transaction(&ctx, |tx| async move {
///         tx.update(&ctx, Statement::new("UPDATE Singers SET Active = TRUE WHERE TRUE")).await?;
///         Ok(())
///     })
///     .await?;
/// ```
#[derive(Debug, Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Create a client over `channels`, one stub per channel.
    ///
    /// Must be called from within a Tokio runtime; the session pool starts
    /// its maintenance task immediately.
    pub fn new(config: ClientConfig, channels: Vec<Arc<dyn SpannerRpc>>) -> Result<Self, Error> {
        config.validate()?;
        let channels = ChannelPool::new(channels)
            .ok_or_else(|| Error::Config("at least one channel is required".into()))?;
        let num_channels = channels.len();
        let sessions = Arc::new(SessionClient::new(&config, channels));
        let pool = SessionPool::new(
            config.session_pool.clone(),
            Arc::clone(&sessions) as Arc<dyn SessionFactory>,
        )?;
        info!(
            database = %config.database,
            client_id = sessions.request_ids().client_id(),
            channels = num_channels,
            "spanner client created"
        );
        Ok(Self {
            inner: Arc::new(ClientInner {
                config,
                sessions,
                pool,
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Database path.
    #[must_use]
    pub fn database(&self) -> &str {
        &self.inner.config.database
    }

    /// Id of this client within the process, as stamped on request ids.
    #[must_use]
    pub fn client_id(&self) -> u32 {
        self.inner.sessions.request_ids().client_id()
    }

    /// Snapshot of the session pool.
    #[must_use]
    pub fn pool_status(&self) -> PoolStatus {
        self.inner.pool.status()
    }

    /// A single-use, strong read-only transaction.
    #[must_use]
    pub fn single(&self) -> ReadOnlyTransaction {
        self.single_with_bound(TimestampBound::Strong)
    }

    /// A single-use read-only transaction reading at `bound`.
    #[must_use]
    pub fn single_with_bound(&self, bound: TimestampBound) -> ReadOnlyTransaction {
        ReadOnlyTransaction::single_use(Arc::clone(&self.inner), bound)
    }

    /// A multi-use, strong read-only transaction.
    #[must_use]
    pub fn read_only_transaction(&self) -> ReadOnlyTransaction {
        self.read_only_transaction_with_bound(TimestampBound::Strong)
    }

    /// A multi-use read-only transaction reading at `bound`.
    #[must_use]
    pub fn read_only_transaction_with_bound(&self, bound: TimestampBound) -> ReadOnlyTransaction {
        ReadOnlyTransaction::multi_use(Arc::clone(&self.inner), bound)
    }

    /// Run `f` in a read-write transaction and commit.
    ///
    /// `f` is invoked once per attempt. It is re-invoked from scratch when
    /// the transaction aborts or its session is lost, so it must not have
    /// side effects outside the transaction.
    pub async fn read_write_transaction<F, Fut>(&self, ctx: &Context, f: F) -> Result<CommitResult, Error>
    where
        F: FnMut(ReadWriteTransaction) -> Fut,
        Fut: Future<Output = Result<(), Error>>,
    {
        self.read_write_transaction_with_options(ctx, ReadWriteOptions::default(), f)
            .await
    }

    /// Like [`read_write_transaction`](Self::read_write_transaction) with
    /// options.
    pub async fn read_write_transaction_with_options<F, Fut>(
        &self,
        ctx: &Context,
        options: ReadWriteOptions,
        f: F,
    ) -> Result<CommitResult, Error>
    where
        F: FnMut(ReadWriteTransaction) -> Fut,
        Fut: Future<Output = Result<(), Error>>,
    {
        runner::run(&self.inner, ctx, options, f).await
    }

    /// Apply mutations atomically.
    ///
    /// By default the mutations run in a read-write transaction and are
    /// replayed if it aborts. With
    /// [`at_least_once`](ApplyOptions::at_least_once) they are committed with
    /// a single RPC and may be applied more than once.
    pub async fn apply(
        &self,
        ctx: &Context,
        mutations: Vec<Mutation>,
        options: ApplyOptions,
    ) -> Result<CommitResult, Error> {
        if options.at_least_once {
            return self.apply_at_least_once(ctx, mutations, &options.transaction).await;
        }
        runner::run(&self.inner, ctx, options.transaction, |tx| {
            let result = tx.buffer_write(mutations.iter().cloned());
            async move { result }
        })
        .await
    }

    async fn apply_at_least_once(
        &self,
        ctx: &Context,
        mutations: Vec<Mutation>,
        options: &ReadWriteOptions,
    ) -> Result<CommitResult, Error> {
        let inner = &self.inner;
        inner.ensure_open()?;
        let mut aborts = 0;
        loop {
            let session =
                SessionHandle::acquire(&inner.pool, ctx, inner.pool.multiplexed_for_rw()).await?;
            let request = CommitRequest {
                session: session.name().to_string(),
                transaction: TransactionSelector::SingleUse(TransactionOptions::read_write()),
                mutations: mutations.clone(),
                return_commit_stats: options.commit.return_commit_stats,
                max_commit_delay: options.commit.max_commit_delay,
                precommit_token: None,
                request_options: RequestOptions {
                    request_tag: None,
                    transaction_tag: options.transaction_tag.clone(),
                },
            };
            let result = inner
                .sessions
                .invoke(ctx, session.channel_id(), true, |rpc, md| {
                    let request = request.clone();
                    async move { rpc.commit(request, md).await }
                })
                .await;

            let err = match result {
                Ok(resp) => return Ok(resp.into()),
                Err(e) => e,
            };
            match err.class() {
                ErrorClass::SessionInvalid => session.discard(&inner.pool),
                ErrorClass::CapabilityUnsupported if session.is_multiplexed() => {
                    inner.pool.disable_multiplexed_for_rw();
                }
                ErrorClass::TransactionRetryable => {
                    aborts += 1;
                    let delay = err
                        .retry_delay()
                        .unwrap_or_else(|| inner.config.abort_backoff.delay_for_attempt(aborts));
                    debug!(
                        attempt = aborts,
                        delay_ms = delay.as_millis() as u64,
                        "single-use commit aborted; retrying"
                    );
                    drop(session);
                    ctx.sleep(delay).await?;
                }
                _ => return Err(err),
            }
        }
    }

    /// Apply groups of mutations independently, without atomicity across
    /// groups.
    ///
    /// Returns every response streamed back; each names the groups it
    /// covers and whether they were applied.
    pub async fn batch_write(
        &self,
        ctx: &Context,
        groups: Vec<MutationGroup>,
    ) -> Result<Vec<BatchWriteResponse>, Error> {
        let inner = &self.inner;
        inner.ensure_open()?;
        loop {
            let session = inner.read_session(ctx).await?;
            let request = BatchWriteRequest {
                session: session.name().to_string(),
                mutation_groups: groups.clone(),
                request_options: RequestOptions::default(),
            };
            let id = inner.sessions.request_ids().next(session.channel_id());
            let mut md = inner.sessions.metadata(true);
            md.set_request_id(id);
            let rpc = Arc::clone(inner.sessions.channel(session.channel_id()).rpc());

            let mut responses = Vec::new();
            let outcome = match ctx.run(rpc.batch_write(request, md)).await {
                Ok(Ok(mut stream)) => loop {
                    match ctx.run(stream.message()).await {
                        Ok(Ok(Some(resp))) => responses.push(resp),
                        Ok(Ok(None)) => break Ok(()),
                        Ok(Err(status)) => break Err(Error::rpc(status, Some(id))),
                        Err(e) => break Err(Error::context(e, Some(id))),
                    }
                },
                Ok(Err(status)) => Err(Error::rpc(status, Some(id))),
                Err(e) => Err(Error::context(e, Some(id))),
            };

            match outcome {
                Ok(()) => return Ok(responses),
                Err(e) if e.is_session_not_found() && responses.is_empty() => {
                    session.discard(&inner.pool);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Run a partitioned DML statement and return the lower bound of the
    /// rows it modified.
    ///
    /// The statement is retried from scratch if the transaction aborts, so
    /// it must be idempotent.
    pub async fn partitioned_update(&self, ctx: &Context, statement: Statement) -> Result<i64, Error> {
        let inner = &self.inner;
        inner.ensure_open()?;
        let mut aborts = 0;
        loop {
            let session = inner.read_session(ctx).await?;
            let err = match self.partitioned_update_on(ctx, &session, &statement).await {
                Ok(count) => return Ok(count),
                Err(e) => e,
            };
            match err.class() {
                ErrorClass::TransactionRetryable => {
                    aborts += 1;
                    let delay = err
                        .retry_delay()
                        .unwrap_or_else(|| inner.config.abort_backoff.delay_for_attempt(aborts));
                    debug!(
                        request_id = ?err.request_id(),
                        attempt = aborts,
                        delay_ms = delay.as_millis() as u64,
                        "partitioned update aborted; retrying"
                    );
                    drop(session);
                    ctx.sleep(delay)
                        .await
                        .map_err(|e| Error::context(e, err.request_id().copied()))?;
                }
                ErrorClass::SessionInvalid => session.discard(&inner.pool),
                _ => return Err(err),
            }
        }
    }

    async fn partitioned_update_on(
        &self,
        ctx: &Context,
        session: &SessionHandle,
        statement: &Statement,
    ) -> Result<i64, Error> {
        let inner = &self.inner;
        let begin = BeginTransactionRequest {
            session: session.name().to_string(),
            options: TransactionOptions::PartitionedDml,
            mutation_key: None,
            request_options: RequestOptions::default(),
        };
        let tx = inner
            .sessions
            .invoke(ctx, session.channel_id(), true, |rpc, md| {
                let begin = begin.clone();
                async move { rpc.begin_transaction(begin, md).await }
            })
            .await?;

        let request = ExecuteSqlRequest {
            session: session.name().to_string(),
            transaction: TransactionSelector::Id(tx.id),
            statement: statement.clone(),
            resume_token: bytes::Bytes::new(),
            query_mode: QueryMode::Normal,
            partition_token: None,
            seqno: 1,
            request_options: RequestOptions::default(),
        };
        let call = StreamingCall::new(
            Arc::clone(inner),
            StreamingRequest::Query(request),
            session.channel_id(),
            true,
        );
        let mut rows = RowIterator::new(ctx.clone(), Box::new(call), inner.decoder_options(), None);
        rows.drain().await?;
        rows.row_count()
            .ok_or_else(|| Error::Transaction("partitioned DML returned no row count".into()))
    }

    /// Begin a read-only transaction whose reads can be partitioned and run
    /// in parallel, possibly from other processes.
    pub async fn batch_read_only_transaction(
        &self,
        ctx: &Context,
        bound: TimestampBound,
    ) -> Result<BatchReadOnlyTransaction, Error> {
        self.inner.ensure_open()?;
        BatchReadOnlyTransaction::begin(Arc::clone(&self.inner), ctx, bound).await
    }

    /// Close the client: stop the pool and delete its sessions.
    ///
    /// Returns [`Error::AlreadyClosed`] if the client was already closed.
    pub async fn close(&self) -> Result<(), Error> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Err(Error::AlreadyClosed);
        }
        match self.inner.pool.close().await {
            Ok(()) | Err(PoolError::Closed) => {}
            Err(e) => return Err(e.into()),
        }
        info!(database = %self.inner.config.database, "spanner client closed");
        Ok(())
    }

    /// Whether [`close`](Self::close) was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

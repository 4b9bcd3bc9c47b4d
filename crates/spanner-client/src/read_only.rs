//! Read-only transactions.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;

use parking_lot::Mutex;
use spanner_protocol::{
    BeginTransactionRequest, KeySet, PrecommitToken, RequestOptions, Statement, TimestampBound,
    Transaction, TransactionId, TransactionOptions, TransactionSelector,
};
use spanner_transport::Context;
use tracing::debug;

use crate::client::ClientInner;
use crate::error::Error;
use crate::handle::SessionHandle;
use crate::row::{ResultObserver, RowIterator};
use crate::stream::{StreamingCall, StreamingRequest};

struct Begun {
    session: SessionHandle,
    id: TransactionId,
}

/// A snapshot read transaction.
///
/// A single-use transaction (from [`Client::single`](crate::Client::single))
/// runs exactly one query or read and never calls `BeginTransaction`. A
/// multi-use transaction begins on first use and reads every statement at
/// the same timestamp until [`close`](Self::close)d.
pub struct ReadOnlyTransaction {
    client: Arc<ClientInner>,
    bound: TimestampBound,
    single_use: bool,
    used: AtomicBool,
    closed: AtomicBool,
    read_timestamp: Arc<Mutex<Option<SystemTime>>>,
    begin_lock: tokio::sync::Mutex<()>,
    begun: Mutex<Option<Begun>>,
}

impl ReadOnlyTransaction {
    pub(crate) fn single_use(client: Arc<ClientInner>, bound: TimestampBound) -> Self {
        Self::new(client, bound, true)
    }

    pub(crate) fn multi_use(client: Arc<ClientInner>, bound: TimestampBound) -> Self {
        Self::new(client, bound, false)
    }

    fn new(client: Arc<ClientInner>, bound: TimestampBound, single_use: bool) -> Self {
        Self {
            client,
            bound,
            single_use,
            used: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            read_timestamp: Arc::new(Mutex::new(None)),
            begin_lock: tokio::sync::Mutex::new(()),
            begun: Mutex::new(None),
        }
    }

    /// Execute a query.
    pub async fn query(&self, ctx: &Context, statement: Statement) -> Result<RowIterator, Error> {
        self.stream(ctx, StreamingRequest::query(statement, RequestOptions::default()))
            .await
    }

    /// Read rows by key from a table.
    pub async fn read(
        &self,
        ctx: &Context,
        table: &str,
        key_set: KeySet,
        columns: &[&str],
    ) -> Result<RowIterator, Error> {
        let request = StreamingRequest::read(table, None, key_set, columns, RequestOptions::default());
        self.stream(ctx, request).await
    }

    /// Read rows through a secondary index.
    pub async fn read_using_index(
        &self,
        ctx: &Context,
        table: &str,
        index: &str,
        key_set: KeySet,
        columns: &[&str],
    ) -> Result<RowIterator, Error> {
        let request =
            StreamingRequest::read(table, Some(index), key_set, columns, RequestOptions::default());
        self.stream(ctx, request).await
    }

    /// Timestamp the transaction reads at, once known.
    ///
    /// For a single-use transaction this is set when the first result
    /// arrives.
    #[must_use]
    pub fn read_timestamp(&self) -> Option<SystemTime> {
        *self.read_timestamp.lock()
    }

    /// Release the transaction's session.
    ///
    /// A begin still in flight releases its session when it completes.
    /// Returns [`Error::AlreadyClosed`] if called twice.
    pub fn close(&self) -> Result<(), Error> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(Error::AlreadyClosed);
        }
        self.begun.lock().take();
        Ok(())
    }

    async fn stream(&self, ctx: &Context, mut request: StreamingRequest) -> Result<RowIterator, Error> {
        self.client.ensure_open()?;
        if self.closed.load(Ordering::Acquire) {
            return Err(closed_error());
        }

        if self.single_use {
            if self.used.swap(true, Ordering::AcqRel) {
                return Err(Error::Transaction(
                    "single-use read-only transaction can only be used once".into(),
                ));
            }
            let session = self.client.read_session(ctx).await?;
            request.set_transaction(TransactionSelector::SingleUse(TransactionOptions::read_only(
                self.bound,
            )));
            let call = StreamingCall::owning(Arc::clone(&self.client), request, session, false);
            let observer = Arc::new(ReadTimestamp(Arc::clone(&self.read_timestamp)));
            return Ok(RowIterator::new(
                ctx.clone(),
                Box::new(call),
                self.client.decoder_options(),
                Some(observer),
            ));
        }

        let (session, channel_id, id) = self.begin(ctx).await?;
        request.set_session(&session);
        request.set_transaction(TransactionSelector::Id(id));
        let call = StreamingCall::new(Arc::clone(&self.client), request, channel_id, false);
        Ok(RowIterator::new(
            ctx.clone(),
            Box::new(call),
            self.client.decoder_options(),
            None,
        ))
    }

    /// Begin the transaction on first use; later callers wait for it.
    async fn begin(&self, ctx: &Context) -> Result<(String, u32, TransactionId), Error> {
        let _serialized = ctx.run(self.begin_lock.lock()).await?;
        if let Some(b) = self.begun.lock().as_ref() {
            return Ok((b.session.name().to_string(), b.session.channel_id(), b.id.clone()));
        }
        if self.bound.single_use_only() {
            return Err(Error::Transaction(format!(
                "{:?} is only valid for single-use transactions",
                self.bound
            )));
        }

        loop {
            let session = self.client.read_session(ctx).await?;
            let request = BeginTransactionRequest {
                session: session.name().to_string(),
                options: TransactionOptions::read_only(self.bound),
                mutation_key: None,
                request_options: RequestOptions::default(),
            };
            let result = self
                .client
                .sessions
                .invoke(ctx, session.channel_id(), false, |rpc, md| {
                    let request = request.clone();
                    async move { rpc.begin_transaction(request, md).await }
                })
                .await;
            match result {
                Ok(tx) => {
                    *self.read_timestamp.lock() = tx.read_timestamp;
                    let out = (session.name().to_string(), session.channel_id(), tx.id.clone());
                    let mut begun = self.begun.lock();
                    // `close` marks the transaction before emptying the slot.
                    if self.closed.load(Ordering::Acquire) {
                        return Err(closed_error());
                    }
                    *begun = Some(Begun {
                        session,
                        id: tx.id,
                    });
                    return Ok(out);
                }
                Err(e) if e.is_session_not_found() => {
                    debug!(session_id = session.name(), "session lost during begin; retrying");
                    session.discard(&self.client.pool);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn closed_error() -> Error {
    Error::Transaction("read-only transaction is closed".into())
}

impl std::fmt::Debug for ReadOnlyTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadOnlyTransaction")
            .field("bound", &self.bound)
            .field("single_use", &self.single_use)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Records the read timestamp of a single-use transaction.
struct ReadTimestamp(Arc<Mutex<Option<SystemTime>>>);

impl ResultObserver for ReadTimestamp {
    fn on_transaction(&self, transaction: &Transaction) {
        if transaction.read_timestamp.is_some() {
            *self.0.lock() = transaction.read_timestamp;
        }
    }

    fn on_precommit_token(&self, _token: &PrecommitToken) {}

    fn on_done(&self, _error: Option<&Error>) {}
}

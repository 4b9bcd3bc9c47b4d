//! Read-write transactions.
//!
//! A transaction is begun lazily. By default the first statement carries
//! the begin request and the transaction id returns with its first result;
//! statements issued concurrently wait on a gate until that id is known.
//! If the inlined begin fails to produce an id, the next statement (or the
//! commit) begins explicitly.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use spanner_protocol::{
    BeginTransactionRequest, Code, CommitRequest, ExecuteBatchDmlRequest, ExecuteSqlRequest, KeySet,
    Mutation, PrecommitToken, QueryMode, RequestOptions, RollbackRequest, Statement, Transaction,
    TransactionId, TransactionOptions, TransactionSelector,
};
use spanner_transport::Context;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, warn};

use crate::client::ClientInner;
use crate::error::Error;
use crate::handle::SessionHandle;
use crate::options::{BeginMode, CommitResult, ReadWriteOptions};
use crate::row::{ResultObserver, RowIterator};
use crate::stream::{StreamingCall, StreamingRequest, TransactionBinding};

const ROLLBACK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Default)]
struct State {
    id: Option<TransactionId>,
    inline_begin_failed: bool,
    seqno: i64,
    mutations: Vec<Mutation>,
    precommit: Option<PrecommitToken>,
    finished: bool,
}

struct Shared {
    client: Arc<ClientInner>,
    session: String,
    channel_id: u32,
    options: ReadWriteOptions,
    previous_transaction_id: Option<TransactionId>,
    state: Mutex<State>,
    begin_gate: Arc<tokio::sync::Mutex<()>>,
}

impl Shared {
    fn current_id(&self) -> Option<TransactionId> {
        self.state.lock().id.clone()
    }

    fn set_transaction(&self, tx: &Transaction) {
        let mut state = self.state.lock();
        if !tx.id.is_empty() && state.id.is_none() {
            state.id = Some(tx.id.clone());
        }
        if let Some(token) = &tx.precommit_token {
            update_precommit(&mut state, token);
        }
    }

    fn update_precommit(&self, token: &PrecommitToken) {
        update_precommit(&mut self.state.lock(), token);
    }

    fn mark_inline_failed(&self) {
        let mut state = self.state.lock();
        if state.id.is_none() {
            state.inline_begin_failed = true;
        }
    }
}

impl TransactionBinding for Shared {
    fn transaction_id(&self) -> Option<TransactionId> {
        self.current_id()
    }
}

fn update_precommit(state: &mut State, token: &PrecommitToken) {
    if state.precommit.as_ref().is_none_or(|p| token.seq_num > p.seq_num) {
        state.precommit = Some(token.clone());
    }
}

/// A locking read-write transaction, handed to the closure passed to
/// [`Client::read_write_transaction`](crate::Client::read_write_transaction).
///
/// Cloning is cheap; clones refer to the same transaction, so statements
/// may be issued concurrently from several tasks.
#[derive(Clone)]
pub struct ReadWriteTransaction {
    inner: Arc<Shared>,
}

impl ReadWriteTransaction {
    pub(crate) fn new(
        client: Arc<ClientInner>,
        session: &SessionHandle,
        options: ReadWriteOptions,
        previous_transaction_id: Option<TransactionId>,
    ) -> Self {
        Self {
            inner: Arc::new(Shared {
                client,
                session: session.name().to_string(),
                channel_id: session.channel_id(),
                options,
                previous_transaction_id,
                state: Mutex::new(State::default()),
                begin_gate: Arc::new(tokio::sync::Mutex::new(())),
            }),
        }
    }

    /// Execute a query in the transaction.
    ///
    /// If this is the first statement, the transaction begins with it and
    /// other statements wait until its first result has been read.
    pub async fn query(&self, ctx: &Context, statement: Statement) -> Result<RowIterator, Error> {
        let request = StreamingRequest::query(statement, self.request_options());
        self.stream(ctx, request).await
    }

    /// Read rows by key from a table.
    pub async fn read(
        &self,
        ctx: &Context,
        table: &str,
        key_set: KeySet,
        columns: &[&str],
    ) -> Result<RowIterator, Error> {
        let request = StreamingRequest::read(table, None, key_set, columns, self.request_options());
        self.stream(ctx, request).await
    }

    /// Execute a DML statement and return the number of rows it modified.
    pub async fn update(&self, ctx: &Context, statement: Statement) -> Result<i64, Error> {
        let (selector, gate) = self.selector(ctx).await?;
        let inline = gate.is_some();
        let request = ExecuteSqlRequest {
            session: self.inner.session.clone(),
            transaction: selector,
            statement,
            resume_token: Bytes::new(),
            query_mode: QueryMode::Normal,
            partition_token: None,
            seqno: self.next_seqno(),
            request_options: self.request_options(),
        };
        let result = self
            .inner
            .client
            .sessions
            .invoke(ctx, self.inner.channel_id, true, |rpc, md| {
                let request = request.clone();
                async move { rpc.execute_sql(request, md).await }
            })
            .await;

        let rs = match result {
            Ok(rs) => rs,
            Err(e) => {
                if inline {
                    self.inner.mark_inline_failed();
                }
                return Err(e);
            }
        };
        match rs.metadata.as_ref().and_then(|m| m.transaction.as_ref()) {
            Some(tx) => self.inner.set_transaction(tx),
            None if inline => self.inner.mark_inline_failed(),
            None => {}
        }
        if let Some(token) = &rs.precommit_token {
            self.inner.update_precommit(token);
        }
        drop(gate);
        rs.stats
            .and_then(|s| s.row_count_exact)
            .ok_or_else(|| Error::Transaction("DML statement returned no row count".into()))
    }

    /// Execute DML statements in one round trip.
    ///
    /// Execution stops at the first failing statement; its error is
    /// returned and the statements before it stay applied in the
    /// transaction.
    pub async fn batch_update(&self, ctx: &Context, statements: Vec<Statement>) -> Result<Vec<i64>, Error> {
        let (selector, gate) = self.selector(ctx).await?;
        let inline = gate.is_some();
        let request = ExecuteBatchDmlRequest {
            session: self.inner.session.clone(),
            transaction: selector,
            statements,
            seqno: self.next_seqno(),
            request_options: self.request_options(),
        };
        let result = self
            .inner
            .client
            .sessions
            .invoke_with_id(ctx, self.inner.channel_id, true, |rpc, md| {
                let request = request.clone();
                async move { rpc.execute_batch_dml(request, md).await }
            })
            .await;

        let (resp, request_id) = match result {
            Ok(found) => found,
            Err(e) => {
                if inline {
                    self.inner.mark_inline_failed();
                }
                return Err(e);
            }
        };
        match resp.first_metadata().and_then(|m| m.transaction.as_ref()) {
            Some(tx) => self.inner.set_transaction(tx),
            None if inline => self.inner.mark_inline_failed(),
            None => {}
        }
        if let Some(token) = &resp.precommit_token {
            self.inner.update_precommit(token);
        }
        drop(gate);

        if let Some(status) = resp.status.filter(|s| s.code != Code::Ok) {
            return Err(Error::rpc(status, Some(request_id)));
        }
        Ok(resp
            .result_sets
            .iter()
            .map(|rs| rs.stats.as_ref().and_then(|s| s.row_count_exact).unwrap_or(0))
            .collect())
    }

    /// Buffer mutations to be applied at commit.
    pub fn buffer_write(&self, mutations: impl IntoIterator<Item = Mutation>) -> Result<(), Error> {
        let mut state = self.inner.state.lock();
        if state.finished {
            return Err(finished_error());
        }
        state.mutations.extend(mutations);
        Ok(())
    }

    /// Id of the transaction, once begun.
    #[must_use]
    pub fn transaction_id(&self) -> Option<TransactionId> {
        self.inner.current_id()
    }

    pub(crate) fn inline_begin_failed(&self) -> bool {
        self.inner.state.lock().inline_begin_failed
    }

    /// Commit the transaction.
    pub(crate) async fn commit(&self, ctx: &Context) -> Result<CommitResult, Error> {
        self.check_active()?;
        let id = match self.inner.current_id() {
            Some(id) => id,
            None => {
                let _gate = ctx.run(Arc::clone(&self.inner.begin_gate).lock_owned()).await?;
                match self.inner.current_id() {
                    Some(id) => id,
                    None => {
                        let mutation_key = self.inner.state.lock().mutations.first().cloned();
                        self.begin_explicit(ctx, mutation_key).await?
                    }
                }
            }
        };

        let (mutations, precommit_token) = {
            let state = self.inner.state.lock();
            (state.mutations.clone(), state.precommit.clone())
        };
        let options = &self.inner.options;
        let mut request = CommitRequest {
            session: self.inner.session.clone(),
            transaction: TransactionSelector::Id(id),
            mutations,
            return_commit_stats: options.commit.return_commit_stats,
            max_commit_delay: options.commit.max_commit_delay,
            precommit_token,
            request_options: self.request_options(),
        };

        let mut resp = self.send_commit(ctx, &request).await?;
        if let Some(token) = resp.multiplexed_session_retry.take() {
            debug!(seq_num = token.seq_num, "re-issuing commit with a newer precommit token");
            request.precommit_token = Some(token);
            request.mutations.clear();
            resp = self.send_commit(ctx, &request).await?;
        }
        self.inner.state.lock().finished = true;
        Ok(resp.into())
    }

    /// Roll back, best effort.
    pub(crate) async fn rollback(&self) {
        let id = {
            let mut state = self.inner.state.lock();
            if state.finished {
                return;
            }
            state.finished = true;
            state.id.clone()
        };
        let Some(transaction_id) = id else {
            return;
        };
        let request = RollbackRequest {
            session: self.inner.session.clone(),
            transaction_id,
        };
        let ctx = Context::background().with_timeout(ROLLBACK_TIMEOUT);
        let result = self
            .inner
            .client
            .sessions
            .invoke(&ctx, self.inner.channel_id, true, |rpc, md| {
                let request = request.clone();
                async move { rpc.rollback(request, md).await }
            })
            .await;
        if let Err(e) = result {
            warn!(session_id = %self.inner.session, error = %e, "rollback failed");
        }
    }

    async fn send_commit(
        &self,
        ctx: &Context,
        request: &CommitRequest,
    ) -> Result<spanner_protocol::CommitResponse, Error> {
        self.inner
            .client
            .sessions
            .invoke(ctx, self.inner.channel_id, true, |rpc, md| {
                let request = request.clone();
                async move { rpc.commit(request, md).await }
            })
            .await
    }

    async fn stream(&self, ctx: &Context, mut request: StreamingRequest) -> Result<RowIterator, Error> {
        let (selector, gate) = self.selector(ctx).await?;
        request.set_session(&self.inner.session);
        request.set_transaction(selector);
        request.set_seqno(self.next_seqno());
        let client = Arc::clone(&self.inner.client);
        let options = client.decoder_options();
        let call = StreamingCall::new(client, request, self.inner.channel_id, true)
            .bound_to(Arc::clone(&self.inner) as Arc<dyn TransactionBinding>);
        let observer = Arc::new(TransactionObserver {
            tx: Arc::clone(&self.inner),
            gate: Mutex::new(gate),
        });
        Ok(RowIterator::new(ctx.clone(), Box::new(call), options, Some(observer)))
    }

    /// Selector for the next statement. When the statement is to begin the
    /// transaction inline, the begin gate is returned and must be held until
    /// its result names the transaction.
    async fn selector(
        &self,
        ctx: &Context,
    ) -> Result<(TransactionSelector, Option<OwnedMutexGuard<()>>), Error> {
        self.check_active()?;
        if let Some(id) = self.inner.current_id() {
            return Ok((TransactionSelector::Id(id), None));
        }
        let gate = ctx.run(Arc::clone(&self.inner.begin_gate).lock_owned()).await?;
        if let Some(id) = self.inner.current_id() {
            return Ok((TransactionSelector::Id(id), None));
        }
        let explicit = self.inner.options.begin_mode == BeginMode::Explicit
            || self.inner.state.lock().inline_begin_failed;
        if explicit {
            let id = self.begin_explicit(ctx, None).await?;
            return Ok((TransactionSelector::Id(id), None));
        }
        Ok((TransactionSelector::Begin(self.begin_options()), Some(gate)))
    }

    async fn begin_explicit(
        &self,
        ctx: &Context,
        mutation_key: Option<Mutation>,
    ) -> Result<TransactionId, Error> {
        let request = BeginTransactionRequest {
            session: self.inner.session.clone(),
            options: self.begin_options(),
            mutation_key,
            request_options: self.request_options(),
        };
        let tx = self
            .inner
            .client
            .sessions
            .invoke(ctx, self.inner.channel_id, true, |rpc, md| {
                let request = request.clone();
                async move { rpc.begin_transaction(request, md).await }
            })
            .await?;
        self.inner.set_transaction(&tx);
        Ok(tx.id)
    }

    fn begin_options(&self) -> TransactionOptions {
        TransactionOptions::ReadWrite {
            previous_transaction_id: self.inner.previous_transaction_id.clone(),
        }
    }

    fn request_options(&self) -> RequestOptions {
        RequestOptions {
            request_tag: None,
            transaction_tag: self.inner.options.transaction_tag.clone(),
        }
    }

    fn next_seqno(&self) -> i64 {
        let mut state = self.inner.state.lock();
        state.seqno += 1;
        state.seqno
    }

    fn check_active(&self) -> Result<(), Error> {
        if self.inner.state.lock().finished {
            Err(finished_error())
        } else {
            Ok(())
        }
    }
}

fn finished_error() -> Error {
    Error::Transaction("transaction has already been committed or rolled back".into())
}

impl fmt::Debug for ReadWriteTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("ReadWriteTransaction")
            .field("session", &self.inner.session)
            .field("id", &state.id)
            .field("buffered_mutations", &state.mutations.len())
            .field("finished", &state.finished)
            .finish_non_exhaustive()
    }
}

/// Feeds streamed transaction state back into the transaction and releases
/// the begin gate once the id is known.
struct TransactionObserver {
    tx: Arc<Shared>,
    gate: Mutex<Option<OwnedMutexGuard<()>>>,
}

impl ResultObserver for TransactionObserver {
    fn on_transaction(&self, transaction: &Transaction) {
        self.tx.set_transaction(transaction);
        if !transaction.id.is_empty() {
            self.gate.lock().take();
        }
    }

    fn on_precommit_token(&self, token: &PrecommitToken) {
        self.tx.update_precommit(token);
    }

    fn on_done(&self, _error: Option<&Error>) {
        if self.gate.lock().take().is_some() {
            self.tx.mark_inline_failed();
        }
    }
}

//! Partitioned reads.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;

use bytes::Bytes;
use spanner_protocol::{
    BeginTransactionRequest, KeySet, PartitionOptions, PartitionQueryRequest,
    PartitionReadRequest, RequestOptions, Statement, TimestampBound, TransactionId,
    TransactionOptions, TransactionSelector,
};
use spanner_session_pool::{Session, SessionKind};
use spanner_transport::Context;
use tracing::{debug, warn};

use crate::client::ClientInner;
use crate::error::Error;
use crate::row::RowIterator;
use crate::stream::{StreamingCall, StreamingRequest};

/// What a partition executes.
#[derive(Debug, Clone, PartialEq)]
enum PartitionedRequest {
    Query(Statement),
    Read {
        table: String,
        index: Option<String>,
        columns: Vec<String>,
        key_set: KeySet,
    },
}

/// One partition of a query or read.
///
/// Partitions may be executed in any order, concurrently, and by any
/// transaction sharing the same session and transaction id.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchPartition {
    token: Bytes,
    request: PartitionedRequest,
}

impl BatchPartition {
    /// The service's partition token.
    #[must_use]
    pub fn token(&self) -> &Bytes {
        &self.token
    }
}

/// A read-only transaction whose queries and reads are split into
/// partitions.
///
/// The transaction runs on a session of its own, outside the pool. Call
/// [`cleanup`](Self::cleanup) once every partition has been executed.
#[derive(Debug)]
pub struct BatchReadOnlyTransaction {
    client: Arc<ClientInner>,
    session: Session,
    transaction_id: TransactionId,
    read_timestamp: Option<SystemTime>,
    cleaned_up: AtomicBool,
}

impl BatchReadOnlyTransaction {
    pub(crate) async fn begin(
        client: Arc<ClientInner>,
        ctx: &Context,
        bound: TimestampBound,
    ) -> Result<Self, Error> {
        if bound.single_use_only() {
            return Err(Error::Transaction(format!(
                "{bound:?} is only valid for single-use transactions"
            )));
        }
        let session = client.sessions.create_session(ctx, SessionKind::Regular).await?;
        let request = BeginTransactionRequest {
            session: session.name().to_string(),
            options: TransactionOptions::read_only(bound),
            mutation_key: None,
            request_options: RequestOptions::default(),
        };
        let result = client
            .sessions
            .invoke(ctx, session.channel_id(), false, |rpc, md| {
                let request = request.clone();
                async move { rpc.begin_transaction(request, md).await }
            })
            .await;
        let tx = match result {
            Ok(tx) => tx,
            Err(e) => {
                if let Err(delete_err) = client.sessions.delete_session(ctx, &session).await {
                    warn!(session_id = session.name(), error = %delete_err, "failed to delete batch session");
                }
                return Err(e);
            }
        };
        debug!(session_id = session.name(), "batch read-only transaction begun");
        Ok(Self {
            client,
            session,
            transaction_id: tx.id,
            read_timestamp: tx.read_timestamp,
            cleaned_up: AtomicBool::new(false),
        })
    }

    /// Timestamp every partition reads at.
    #[must_use]
    pub fn read_timestamp(&self) -> Option<SystemTime> {
        self.read_timestamp
    }

    /// Id of the transaction.
    #[must_use]
    pub fn transaction_id(&self) -> &TransactionId {
        &self.transaction_id
    }

    /// Name of the transaction's session.
    #[must_use]
    pub fn session_name(&self) -> &str {
        self.session.name()
    }

    /// Split a root-partitionable query into partitions.
    pub async fn partition_query(
        &self,
        ctx: &Context,
        statement: Statement,
        options: PartitionOptions,
    ) -> Result<Vec<BatchPartition>, Error> {
        self.check_active()?;
        let request = PartitionQueryRequest {
            session: self.session.name().to_string(),
            transaction: self.selector(),
            statement: statement.clone(),
            options,
        };
        let resp = self
            .client
            .sessions
            .invoke(ctx, self.session.channel_id(), false, |rpc, md| {
                let request = request.clone();
                async move { rpc.partition_query(request, md).await }
            })
            .await?;
        Ok(resp
            .partitions
            .into_iter()
            .map(|p| BatchPartition {
                token: p.token,
                request: PartitionedRequest::Query(statement.clone()),
            })
            .collect())
    }

    /// Split a read into partitions.
    pub async fn partition_read(
        &self,
        ctx: &Context,
        table: &str,
        key_set: KeySet,
        columns: &[&str],
        options: PartitionOptions,
    ) -> Result<Vec<BatchPartition>, Error> {
        self.check_active()?;
        let columns: Vec<String> = columns.iter().map(|c| (*c).to_string()).collect();
        let request = PartitionReadRequest {
            session: self.session.name().to_string(),
            transaction: self.selector(),
            table: table.to_string(),
            index: None,
            columns: columns.clone(),
            key_set: key_set.clone(),
            options,
        };
        let resp = self
            .client
            .sessions
            .invoke(ctx, self.session.channel_id(), false, |rpc, md| {
                let request = request.clone();
                async move { rpc.partition_read(request, md).await }
            })
            .await?;
        Ok(resp
            .partitions
            .into_iter()
            .map(|p| BatchPartition {
                token: p.token,
                request: PartitionedRequest::Read {
                    table: table.to_string(),
                    index: None,
                    columns: columns.clone(),
                    key_set: key_set.clone(),
                },
            })
            .collect())
    }

    /// Execute one partition.
    pub async fn execute(&self, ctx: &Context, partition: &BatchPartition) -> Result<RowIterator, Error> {
        self.check_active()?;
        let mut request = match &partition.request {
            PartitionedRequest::Query(statement) => {
                StreamingRequest::query(statement.clone(), RequestOptions::default())
            }
            PartitionedRequest::Read {
                table,
                index,
                columns,
                key_set,
            } => {
                let columns: Vec<&str> = columns.iter().map(String::as_str).collect();
                StreamingRequest::read(
                    table,
                    index.as_deref(),
                    key_set.clone(),
                    &columns,
                    RequestOptions::default(),
                )
            }
        };
        request.set_session(self.session.name());
        request.set_transaction(self.selector());
        request.set_partition_token(partition.token.clone());
        let call = StreamingCall::new(
            Arc::clone(&self.client),
            request,
            self.session.channel_id(),
            false,
        );
        Ok(RowIterator::new(
            ctx.clone(),
            Box::new(call),
            self.client.decoder_options(),
            None,
        ))
    }

    /// Delete the transaction's session.
    ///
    /// Failing to delete is logged, not returned; the server expires idle
    /// sessions on its own. Returns [`Error::AlreadyClosed`] if called
    /// twice.
    pub async fn cleanup(&self, ctx: &Context) -> Result<(), Error> {
        if self.cleaned_up.swap(true, Ordering::AcqRel) {
            return Err(Error::AlreadyClosed);
        }
        if let Err(e) = self.client.sessions.delete_session(ctx, &self.session).await {
            warn!(session_id = self.session.name(), error = %e, "failed to delete batch session");
        }
        Ok(())
    }

    fn selector(&self) -> TransactionSelector {
        TransactionSelector::Id(self.transaction_id.clone())
    }

    fn check_active(&self) -> Result<(), Error> {
        if self.cleaned_up.load(Ordering::Acquire) {
            Err(Error::Transaction("batch transaction was cleaned up".into()))
        } else {
            Ok(())
        }
    }
}

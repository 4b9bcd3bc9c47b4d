//! Retry loop of read-write transactions.

use std::future::Future;
use std::sync::Arc;

use spanner_protocol::{ErrorClass, TransactionId};
use spanner_transport::Context;
use tracing::{debug, info};

use crate::client::ClientInner;
use crate::error::Error;
use crate::handle::SessionHandle;
use crate::options::{BeginMode, CommitResult, ReadWriteOptions};
use crate::read_write::ReadWriteTransaction;

/// Run `f` and commit, retrying the whole attempt until it commits or fails
/// with an error that retrying cannot fix.
///
/// Each attempt gets a fresh transaction and invokes `f` exactly once.
pub(crate) async fn run<F, Fut>(
    client: &Arc<ClientInner>,
    ctx: &Context,
    options: ReadWriteOptions,
    mut f: F,
) -> Result<CommitResult, Error>
where
    F: FnMut(ReadWriteTransaction) -> Fut,
    Fut: Future<Output = Result<(), Error>>,
{
    client.ensure_open()?;
    let mut attempt: u32 = 0;
    let mut aborts: u32 = 0;
    let mut previous: Option<TransactionId> = None;
    let mut begin_explicitly = false;

    loop {
        attempt += 1;
        let session = SessionHandle::acquire(&client.pool, ctx, client.pool.multiplexed_for_rw()).await?;
        let mut attempt_options = options.clone();
        if begin_explicitly {
            attempt_options.begin_mode = BeginMode::Explicit;
        }
        let tx = ReadWriteTransaction::new(Arc::clone(client), &session, attempt_options, previous.take());

        let result = match f(tx.clone()).await {
            Ok(()) => tx.commit(ctx).await,
            Err(e) => Err(e),
        };
        let err = match result {
            Ok(committed) => {
                if attempt > 1 {
                    info!(attempt, "transaction committed after retries");
                }
                return Ok(committed);
            }
            Err(e) => e,
        };
        begin_explicitly = tx.inline_begin_failed();

        match err.class() {
            ErrorClass::TransactionRetryable => {
                aborts += 1;
                if session.is_multiplexed() {
                    previous = tx.transaction_id();
                }
                let delay = err
                    .retry_delay()
                    .unwrap_or_else(|| client.config.abort_backoff.delay_for_attempt(aborts));
                debug!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    request_id = ?err.request_id(),
                    "transaction aborted; retrying"
                );
                drop(session);
                ctx.sleep(delay)
                    .await
                    .map_err(|e| Error::context(e, err.request_id().copied()))?;
            }
            ErrorClass::SessionInvalid => {
                debug!(attempt, session_id = session.name(), "session lost; retrying transaction");
                session.discard(&client.pool);
            }
            ErrorClass::CapabilityUnsupported if session.is_multiplexed() => {
                info!("multiplexed sessions unsupported for read-write; falling back to pooled sessions");
                client.pool.disable_multiplexed_for_rw();
            }
            _ => {
                tx.rollback().await;
                return Err(err);
            }
        }
    }
}

//! Client integration tests against the in-memory mock server.
//!
//! These tests drive the public client API end to end: session acquisition,
//! resumable streams, transaction retries and request ids as the server
//! sees them.
//!
//! ```bash
//! cargo test -p spanner-client --test client
//! ```

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use bytes::Bytes;
use spanner_client::{
    ApplyOptions, BeginMode, Client, ClientConfig, CommitOptions, Error, ProcessId,
    ReadWriteOptions, RpcRetryPolicy, SequentialClientIds, SessionPoolConfig,
};
use spanner_protocol::{
    Code, ErrorClass, KeySet, Mutation, MutationGroup, PartitionOptions, PrecommitToken, Statement,
    Status, TimestampBound, TransactionOptions, TransactionSelector, Value,
};
use spanner_testing::{
    Method, MockResults, MockSpannerServer, RecordedRequest, SingersFixture, TEST_DATABASE,
    int_fields, partial,
};
use spanner_transport::{Backoff, Context, SpannerRpc};

const SINGERS: &str = "SELECT SingerId, Name FROM Singers";
const UPDATE: &str = "UPDATE Singers SET Name = 'x' WHERE SingerId = 1";

// =============================================================================
// Helpers
// =============================================================================

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn fast() -> Backoff {
    Backoff::new()
        .initial(Duration::from_millis(1))
        .max(Duration::from_millis(5))
}

fn pool_config() -> SessionPoolConfig {
    SessionPoolConfig::new().min_opened(0).max_opened(10).inc_step(1)
}

fn regular_sessions() -> SessionPoolConfig {
    pool_config().enable_multiplexed_session(false)
}

fn client_with(pool: SessionPoolConfig) -> (Client, Arc<MockSpannerServer>) {
    init_tracing();
    let server = Arc::new(MockSpannerServer::new());
    let config = ClientConfig::new(TEST_DATABASE)
        .session_pool(pool)
        .process_id(ProcessId::fixed(7))
        .client_id_allocator(Arc::new(SequentialClientIds::new()))
        .stream_backoff(fast())
        .abort_backoff(fast())
        .rpc_retry(RpcRetryPolicy::new().backoff(fast()));
    let client = Client::new(config, vec![server.clone() as Arc<dyn SpannerRpc>]).unwrap();
    (client, server)
}

fn singer(id: i64, name: &str) -> Mutation {
    Mutation::insert("Singers", &["SingerId", "Name"], &[&id, &name])
}

fn streaming_requests(server: &MockSpannerServer) -> Vec<spanner_protocol::ExecuteSqlRequest> {
    server
        .calls_to(Method::ExecuteStreamingSql)
        .into_iter()
        .filter_map(|c| match c.request {
            RecordedRequest::ExecuteStreamingSql(r) => Some(r),
            _ => None,
        })
        .collect()
}

fn commit_requests(server: &MockSpannerServer) -> Vec<spanner_protocol::CommitRequest> {
    server
        .calls_to(Method::Commit)
        .into_iter()
        .filter_map(|c| match c.request {
            RecordedRequest::Commit(r) => Some(r),
            _ => None,
        })
        .collect()
}

async fn update_once(client: &Client, ctx: &Context, invocations: &AtomicU32) -> Result<(), Error> {
    client
        .read_write_transaction(ctx, |tx| {
            invocations.fetch_add(1, Ordering::SeqCst);
            let ctx = ctx.clone();
            async move {
                tx.update(&ctx, Statement::new(UPDATE)).await?;
                Ok(())
            }
        })
        .await
        .map(|_| ())
}

fn execute_sql_requests(server: &MockSpannerServer) -> Vec<spanner_protocol::ExecuteSqlRequest> {
    server
        .calls_to(Method::ExecuteSql)
        .into_iter()
        .filter_map(|c| match c.request {
            RecordedRequest::ExecuteSql(r) => Some(r),
            _ => None,
        })
        .collect()
}

// =============================================================================
// Single-Use Reads
// =============================================================================

#[tokio::test]
async fn test_single_use_query_returns_rows() {
    let (client, server) = client_with(pool_config());
    server.set_query(SINGERS, SingersFixture::new(3).results());
    let ctx = Context::background();

    let tx = client.single();
    let rows = tx
        .query(&ctx, Statement::new(SINGERS))
        .await
        .unwrap()
        .collect_all()
        .await
        .unwrap();

    assert_eq!(rows.len(), 3);
    assert_eq!(rows[0].get::<i64>(0).unwrap(), 1);
    assert_eq!(rows[2].get_by_name::<String>("Name").unwrap(), "singer-3");
    assert!(tx.read_timestamp().is_some());
}

#[tokio::test]
async fn test_single_use_read() {
    let (client, server) = client_with(pool_config());
    server.set_read("Singers", SingersFixture::new(2).results());
    let ctx = Context::background();

    let rows = client
        .single()
        .read(&ctx, "Singers", KeySet::all(), &["SingerId", "Name"])
        .await
        .unwrap()
        .collect_all()
        .await
        .unwrap();

    assert_eq!(rows.len(), 2);
    assert_eq!(server.call_count(Method::StreamingRead), 1);
}

#[tokio::test]
async fn test_single_use_transaction_cannot_be_reused() {
    let (client, server) = client_with(pool_config());
    server.set_query(SINGERS, SingersFixture::new(1).results());
    let ctx = Context::background();

    let tx = client.single();
    tx.query(&ctx, Statement::new(SINGERS))
        .await
        .unwrap()
        .collect_all()
        .await
        .unwrap();
    let err = tx.query(&ctx, Statement::new(SINGERS)).await.unwrap_err();
    assert!(matches!(err, Error::Transaction(_)));
}

#[tokio::test]
async fn test_single_use_replays_on_lost_session() {
    let (client, server) = client_with(regular_sessions());
    server.set_query(SINGERS, SingersFixture::new(2).results());
    let ctx = Context::background();

    client
        .single()
        .query(&ctx, Statement::new(SINGERS))
        .await
        .unwrap()
        .collect_all()
        .await
        .unwrap();
    server.expire_all_sessions();

    let rows = client
        .single()
        .query(&ctx, Statement::new(SINGERS))
        .await
        .unwrap()
        .collect_all()
        .await
        .unwrap();
    assert_eq!(rows.len(), 2);
    assert!(server.call_count(Method::ExecuteStreamingSql) >= 3);
}

// =============================================================================
// Resumable Streams
// =============================================================================

#[tokio::test]
async fn test_stream_resumes_without_duplicates() {
    let (client, server) = client_with(pool_config());
    server.set_query(
        "SELECT n FROM Numbers",
        MockResults::partials(
            int_fields(),
            vec![
                partial(vec![Value::Int64(0)], ""),
                partial(vec![Value::Int64(1)], "t1"),
                partial(vec![Value::Int64(2)], ""),
                partial(vec![Value::Int64(3)], "t3"),
            ],
        ),
    );
    server.fail_stream(
        Method::ExecuteStreamingSql,
        3,
        Status::new(Code::Unavailable, "connection reset"),
    );
    let ctx = Context::background();

    let rows = client
        .single()
        .query(&ctx, Statement::new("SELECT n FROM Numbers"))
        .await
        .unwrap()
        .collect_all()
        .await
        .unwrap();
    let values: Vec<i64> = rows.iter().map(|r| r.get(0).unwrap()).collect();
    assert_eq!(values, vec![0, 1, 2, 3]);

    let requests = streaming_requests(&server);
    assert_eq!(requests.len(), 2);
    assert!(requests[0].resume_token.is_empty());
    assert_eq!(requests[1].resume_token, Bytes::from_static(b"t1"));
}

#[tokio::test]
async fn test_resumed_stream_stays_in_read_write_transaction() {
    let (client, server) = client_with(regular_sessions());
    server.set_query(
        "SELECT n FROM Numbers",
        MockResults::partials(
            int_fields(),
            vec![
                partial(vec![Value::Int64(0)], ""),
                partial(vec![Value::Int64(1)], "t1"),
                partial(vec![Value::Int64(2)], ""),
                partial(vec![Value::Int64(3)], "t3"),
            ],
        ),
    );
    server.fail_stream(
        Method::ExecuteStreamingSql,
        3,
        Status::new(Code::Unavailable, "connection reset"),
    );
    let ctx = Context::background();

    client
        .read_write_transaction(&ctx, |tx| {
            let ctx = ctx.clone();
            async move {
                let rows = tx
                    .query(&ctx, Statement::new("SELECT n FROM Numbers"))
                    .await?
                    .collect_all()
                    .await?;
                let values: Vec<i64> = rows.iter().map(|r| r.get(0).unwrap()).collect();
                assert_eq!(values, vec![0, 1, 2, 3]);
                Ok(())
            }
        })
        .await
        .unwrap();

    let requests = streaming_requests(&server);
    assert_eq!(requests.len(), 2);
    assert!(matches!(requests[0].transaction, TransactionSelector::Begin(_)));
    assert_eq!(requests[1].resume_token, Bytes::from_static(b"t1"));
    assert_eq!(server.call_count(Method::BeginTransaction), 0);

    let commits = commit_requests(&server);
    assert_eq!(commits.len(), 1);
    assert!(matches!(commits[0].transaction, TransactionSelector::Id(_)));
    assert_eq!(requests[1].transaction, commits[0].transaction);
}

#[tokio::test]
async fn test_stream_retries_share_request_number() {
    let (client, server) = client_with(pool_config());
    server.set_query(SINGERS, SingersFixture::new(3).results());
    server.fail_stream(
        Method::ExecuteStreamingSql,
        1,
        Status::new(Code::Unavailable, "connection reset"),
    );
    let ctx = Context::background();

    client
        .single()
        .query(&ctx, Statement::new(SINGERS))
        .await
        .unwrap()
        .collect_all()
        .await
        .unwrap();

    let ids: Vec<_> = server
        .calls_to(Method::ExecuteStreamingSql)
        .iter()
        .map(|c| c.request_id().unwrap())
        .collect();
    assert_eq!(ids.len(), 2);
    assert!(ids[0].same_operation(&ids[1]));
    assert_eq!(ids[0].rpc_number, 1);
    assert_eq!(ids[1].rpc_number, 2);
}

#[tokio::test]
async fn test_stopped_iterator_reports_already_closed() {
    let (client, server) = client_with(pool_config());
    server.set_query(SINGERS, SingersFixture::new(3).results());
    let ctx = Context::background();

    let mut rows = client.single().query(&ctx, Statement::new(SINGERS)).await.unwrap();
    assert!(rows.next().await.unwrap().is_ok());
    rows.stop().unwrap();
    assert!(matches!(rows.stop(), Err(Error::AlreadyClosed)));
}

// =============================================================================
// Request Ids
// =============================================================================

#[tokio::test]
async fn test_unary_retries_increment_rpc_number() {
    let (client, server) = client_with(regular_sessions());
    server.set_query(SINGERS, SingersFixture::new(1).results());
    server.fail_next(
        Method::BeginTransaction,
        Status::new(Code::Unavailable, "try again"),
    );
    server.fail_next(
        Method::BeginTransaction,
        Status::new(Code::Unavailable, "try again"),
    );
    let ctx = Context::background();

    let tx = client.read_only_transaction();
    tx.query(&ctx, Statement::new(SINGERS))
        .await
        .unwrap()
        .collect_all()
        .await
        .unwrap();

    let ids: Vec<_> = server
        .calls_to(Method::BeginTransaction)
        .iter()
        .map(|c| c.request_id().unwrap())
        .collect();
    assert_eq!(ids.len(), 3);
    assert!(ids.windows(2).all(|w| w[0].same_operation(&w[1])));
    let rpc_numbers: Vec<u32> = ids.iter().map(|id| id.rpc_number).collect();
    assert_eq!(rpc_numbers, vec![1, 2, 3]);
}

#[tokio::test]
async fn test_every_call_carries_client_request_id() {
    let (client, server) = client_with(pool_config());
    server.set_query(SINGERS, SingersFixture::new(1).results());
    server.set_update_count(UPDATE, 1);
    let ctx = Context::background();

    client
        .single()
        .query(&ctx, Statement::new(SINGERS))
        .await
        .unwrap()
        .collect_all()
        .await
        .unwrap();
    client
        .read_write_transaction(&ctx, |tx| {
            let ctx = ctx.clone();
            async move {
                tx.update(&ctx, Statement::new(UPDATE)).await?;
                Ok(())
            }
        })
        .await
        .unwrap();

    let calls = server.calls();
    assert!(!calls.is_empty());
    for call in &calls {
        let id = call.request_id().unwrap_or_else(|| panic!("{} has no request id", call.method));
        assert_eq!(id.process_id, 7);
        assert_eq!(id.client_id, client.client_id());
    }
    let mut numbers: Vec<u32> = calls
        .iter()
        .filter(|c| c.method != Method::CreateSession && c.method != Method::BatchCreateSessions)
        .map(|c| c.request_id().unwrap().request_number)
        .collect();
    let len = numbers.len();
    numbers.dedup();
    assert_eq!(numbers.len(), len);
}

// =============================================================================
// Read-Only Transactions
// =============================================================================

#[tokio::test]
async fn test_read_only_transaction_begins_once() {
    let (client, server) = client_with(pool_config());
    server.set_query(SINGERS, SingersFixture::new(2).results());
    let ctx = Context::background();

    let tx = client.read_only_transaction();
    for _ in 0..2 {
        let rows = tx
            .query(&ctx, Statement::new(SINGERS))
            .await
            .unwrap()
            .collect_all()
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
    }

    assert_eq!(server.call_count(Method::BeginTransaction), 1);
    assert!(tx.read_timestamp().is_some());
    for request in streaming_requests(&server) {
        assert!(matches!(request.transaction, TransactionSelector::Id(_)));
    }

    tx.close().unwrap();
    assert!(matches!(tx.close(), Err(Error::AlreadyClosed)));
    assert!(tx.query(&ctx, Statement::new(SINGERS)).await.is_err());
}

#[tokio::test]
async fn test_read_only_begin_survives_lost_session() {
    let (client, server) = client_with(regular_sessions());
    server.set_query(SINGERS, SingersFixture::new(1).results());
    server.fail_next(
        Method::BeginTransaction,
        Status::session_not_found("projects/p/instances/i/databases/d/sessions/gone"),
    );
    let ctx = Context::background();

    let tx = client.read_only_transaction();
    let rows = tx
        .query(&ctx, Statement::new(SINGERS))
        .await
        .unwrap()
        .collect_all()
        .await
        .unwrap();

    assert_eq!(rows.len(), 1);
    assert_eq!(server.call_count(Method::BeginTransaction), 2);
}

#[tokio::test]
async fn test_single_use_only_bound_rejected_for_multi_use() {
    let (client, server) = client_with(pool_config());
    server.set_query(SINGERS, SingersFixture::new(1).results());
    let ctx = Context::background();

    let tx = client.read_only_transaction_with_bound(TimestampBound::MaxStaleness(
        Duration::from_secs(10),
    ));
    let err = tx.query(&ctx, Statement::new(SINGERS)).await.unwrap_err();
    assert!(matches!(err, Error::Transaction(_)));
}

#[tokio::test(start_paused = true)]
async fn test_read_only_close_during_begin_releases_session() {
    let (client, server) = client_with(regular_sessions());
    server.set_query(SINGERS, SingersFixture::new(1).results());
    server.set_latency(Duration::from_millis(50));
    let ctx = Context::background();

    let tx = client.read_only_transaction();
    // Session creation ends at 50ms and the begin at 100ms.
    let (result, ()) = tokio::join!(tx.query(&ctx, Statement::new(SINGERS)), async {
        tokio::time::sleep(Duration::from_millis(60)).await;
        tx.close().unwrap();
    });

    assert!(matches!(result, Err(Error::Transaction(_))));
    assert_eq!(server.call_count(Method::BeginTransaction), 1);
    let status = client.pool_status();
    assert_eq!(status.in_use, 0);
    assert_eq!(status.available, 1);
}

// =============================================================================
// Read-Write Transactions
// =============================================================================

#[tokio::test]
async fn test_inline_begin_then_transaction_id() {
    let (client, server) = client_with(pool_config());
    server.set_update_count(UPDATE, 1);
    let ctx = Context::background();

    client
        .read_write_transaction(&ctx, |tx| {
            let ctx = ctx.clone();
            async move {
                assert_eq!(tx.update(&ctx, Statement::new(UPDATE)).await?, 1);
                assert!(tx.transaction_id().is_some());
                tx.update(&ctx, Statement::new(UPDATE)).await?;
                Ok(())
            }
        })
        .await
        .unwrap();

    let requests = execute_sql_requests(&server);
    assert_eq!(requests.len(), 2);
    assert!(matches!(requests[0].transaction, TransactionSelector::Begin(_)));
    assert!(matches!(requests[1].transaction, TransactionSelector::Id(_)));
    assert!(requests[0].seqno < requests[1].seqno);
    assert_eq!(server.call_count(Method::BeginTransaction), 0);
}

#[tokio::test]
async fn test_explicit_begin_mode() {
    let (client, server) = client_with(regular_sessions());
    server.set_update_count(UPDATE, 1);
    let ctx = Context::background();

    client
        .read_write_transaction_with_options(
            &ctx,
            ReadWriteOptions::new().begin_mode(BeginMode::Explicit),
            |tx| {
                let ctx = ctx.clone();
                async move {
                    tx.update(&ctx, Statement::new(UPDATE)).await?;
                    Ok(())
                }
            },
        )
        .await
        .unwrap();

    assert_eq!(server.call_count(Method::BeginTransaction), 1);
    let requests = execute_sql_requests(&server);
    assert!(matches!(requests[0].transaction, TransactionSelector::Id(_)));
}

#[tokio::test]
async fn test_aborted_commit_is_retried() {
    let (client, server) = client_with(pool_config());
    server.set_update_count(UPDATE, 1);
    server.fail_next(
        Method::Commit,
        Status::aborted("conflict", Duration::from_millis(1)),
    );
    server.fail_next(
        Method::Commit,
        Status::aborted("conflict", Duration::from_millis(1)),
    );
    let ctx = Context::background();
    let invocations = AtomicU32::new(0);

    client
        .read_write_transaction(&ctx, |tx| {
            invocations.fetch_add(1, Ordering::SeqCst);
            let ctx = ctx.clone();
            async move {
                tx.update(&ctx, Statement::new(UPDATE)).await?;
                Ok(())
            }
        })
        .await
        .unwrap();

    assert_eq!(invocations.load(Ordering::SeqCst), 3);
    assert_eq!(server.call_count(Method::Commit), 3);
}

#[tokio::test]
async fn test_retry_on_multiplexed_session_names_previous_transaction() {
    let (client, server) = client_with(pool_config());
    server.set_update_count(UPDATE, 1);
    server.fail_next(
        Method::Commit,
        Status::aborted("conflict", Duration::from_millis(1)),
    );
    let ctx = Context::background();

    client
        .read_write_transaction(&ctx, |tx| {
            let ctx = ctx.clone();
            async move {
                tx.update(&ctx, Statement::new(UPDATE)).await?;
                Ok(())
            }
        })
        .await
        .unwrap();

    let commits = commit_requests(&server);
    let TransactionSelector::Id(first) = &commits[0].transaction else {
        panic!("commit without transaction id");
    };
    let requests = execute_sql_requests(&server);
    assert_eq!(requests.len(), 2);
    assert_eq!(
        requests[1].transaction,
        TransactionSelector::Begin(TransactionOptions::ReadWrite {
            previous_transaction_id: Some(first.clone()),
        })
    );
}

#[tokio::test]
async fn test_transaction_survives_lost_session_at_begin() {
    let (client, server) = client_with(regular_sessions());
    server.set_update_count(UPDATE, 1);
    server.fail_next(
        Method::BeginTransaction,
        Status::session_not_found("projects/p/instances/i/databases/d/sessions/gone"),
    );
    let ctx = Context::background();

    let result = client
        .read_write_transaction_with_options(
            &ctx,
            ReadWriteOptions::new().begin_mode(BeginMode::Explicit),
            |tx| {
                let ctx = ctx.clone();
                async move {
                    tx.update(&ctx, Statement::new(UPDATE)).await?;
                    Ok(())
                }
            },
        )
        .await;

    assert!(result.is_ok());
    assert_eq!(server.call_count(Method::BeginTransaction), 2);
}

#[tokio::test]
async fn test_application_error_rolls_back() {
    let (client, server) = client_with(pool_config());
    server.set_update_count(UPDATE, 1);
    let ctx = Context::background();

    let err = client
        .read_write_transaction(&ctx, |tx| {
            let ctx = ctx.clone();
            async move {
                tx.update(&ctx, Statement::new(UPDATE)).await?;
                Err(Error::application("insufficient funds"))
            }
        })
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Application(_)));
    assert_eq!(server.call_count(Method::Rollback), 1);
    assert_eq!(server.call_count(Method::Commit), 0);
}

#[tokio::test]
async fn test_mutation_only_transaction_sends_mutation_key() {
    let (client, server) = client_with(pool_config());
    let ctx = Context::background();

    let result = client
        .apply(
            &ctx,
            vec![singer(1, "Marc"), singer(2, "Catalina")],
            ApplyOptions::new().transaction(
                ReadWriteOptions::new().commit(CommitOptions::new().return_commit_stats(true)),
            ),
        )
        .await
        .unwrap();
    assert_eq!(result.commit_stats.unwrap().mutation_count, 2);

    let begins = server.calls_to(Method::BeginTransaction);
    assert_eq!(begins.len(), 1);
    let RecordedRequest::BeginTransaction(begin) = &begins[0].request else {
        panic!("unexpected request");
    };
    assert_eq!(begin.mutation_key, Some(singer(1, "Marc")));
    assert_eq!(server.call_count(Method::ExecuteSql), 0);
    assert_eq!(server.call_count(Method::ExecuteStreamingSql), 0);
    assert_eq!(commit_requests(&server)[0].mutations.len(), 2);
}

#[tokio::test]
async fn test_apply_at_least_once_uses_single_use_commit() {
    let (client, server) = client_with(pool_config());
    let ctx = Context::background();

    client
        .apply(
            &ctx,
            vec![singer(1, "Marc")],
            ApplyOptions::new().at_least_once(true),
        )
        .await
        .unwrap();

    assert_eq!(server.call_count(Method::BeginTransaction), 0);
    let commits = commit_requests(&server);
    assert_eq!(commits.len(), 1);
    assert_eq!(
        commits[0].transaction,
        TransactionSelector::SingleUse(TransactionOptions::read_write())
    );
}

#[tokio::test]
async fn test_batch_update_counts() {
    let (client, server) = client_with(pool_config());
    server.set_update_count(UPDATE, 1);
    server.set_update_count("DELETE FROM Albums WHERE TRUE", 4);
    let ctx = Context::background();

    client
        .read_write_transaction(&ctx, |tx| {
            let ctx = ctx.clone();
            async move {
                let counts = tx
                    .batch_update(
                        &ctx,
                        vec![
                            Statement::new(UPDATE),
                            Statement::new("DELETE FROM Albums WHERE TRUE"),
                        ],
                    )
                    .await?;
                assert_eq!(counts, vec![1, 4]);
                Ok(())
            }
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn test_batch_update_statement_failure_carries_request_id() {
    let (client, server) = client_with(regular_sessions());
    server.set_update_count(UPDATE, 1);
    let ctx = Context::background();

    let err = client
        .read_write_transaction(&ctx, |tx| {
            let ctx = ctx.clone();
            async move {
                tx.batch_update(
                    &ctx,
                    vec![
                        Statement::new(UPDATE),
                        Statement::new("DELETE FROM Unknown WHERE TRUE"),
                    ],
                )
                .await?;
                Ok(())
            }
        })
        .await
        .unwrap_err();

    assert_eq!(err.code(), Code::InvalidArgument);
    let sent = server.calls_to(Method::ExecuteBatchDml)[0].request_id().unwrap();
    assert_eq!(err.request_id(), Some(&sent));
    assert!(err.to_string().contains(&sent.to_string()));
    assert_eq!(server.call_count(Method::Rollback), 1);
}

// =============================================================================
// Multiplexed Sessions
// =============================================================================

#[tokio::test]
async fn test_commit_sends_highest_precommit_token() {
    let (client, server) = client_with(pool_config());
    server.set_update_count(UPDATE, 1);
    let ctx = Context::background();

    client
        .read_write_transaction(&ctx, |tx| {
            let ctx = ctx.clone();
            async move {
                tx.update(&ctx, Statement::new(UPDATE)).await?;
                tx.update(&ctx, Statement::new(UPDATE)).await?;
                Ok(())
            }
        })
        .await
        .unwrap();

    let token = commit_requests(&server)[0].precommit_token.clone().unwrap();
    assert_eq!(token.seq_num, 3);
}

#[tokio::test]
async fn test_commit_reissued_with_retry_token() {
    let (client, server) = client_with(pool_config());
    server.set_update_count(UPDATE, 1);
    let retry = PrecommitToken {
        token: Bytes::from_static(b"retry"),
        seq_num: 99,
    };
    server.set_commit_retry_token(retry.clone());
    let ctx = Context::background();

    client
        .read_write_transaction(&ctx, |tx| {
            let ctx = ctx.clone();
            async move {
                tx.buffer_write([singer(3, "Alice")])?;
                tx.update(&ctx, Statement::new(UPDATE)).await?;
                Ok(())
            }
        })
        .await
        .unwrap();

    let commits = commit_requests(&server);
    assert_eq!(commits.len(), 2);
    assert_eq!(commits[0].mutations.len(), 1);
    assert!(commits[1].mutations.is_empty());
    assert_eq!(commits[1].precommit_token, Some(retry));
}

#[tokio::test]
async fn test_multiplexed_read_write_falls_back_to_pool() {
    let (client, server) = client_with(pool_config());
    server.set_update_count(UPDATE, 1);
    server.set_multiplexed_rw_unsupported(true);
    let ctx = Context::background();
    let invocations = AtomicU32::new(0);

    update_once(&client, &ctx, &invocations).await.unwrap();
    assert_eq!(invocations.load(Ordering::SeqCst), 2);

    update_once(&client, &ctx, &invocations).await.unwrap();
    assert_eq!(invocations.load(Ordering::SeqCst), 3);
    assert!(client.pool_status().total >= 1);
}

// =============================================================================
// Batch Operations
// =============================================================================

#[tokio::test]
async fn test_batch_write_reports_every_group() {
    let (client, server) = client_with(pool_config());
    let ctx = Context::background();

    let responses = client
        .batch_write(
            &ctx,
            vec![
                MutationGroup::new(vec![singer(1, "Marc")]),
                MutationGroup::new(vec![singer(2, "Catalina")]),
            ],
        )
        .await
        .unwrap();

    assert_eq!(responses.len(), 2);
    assert!(responses.iter().all(|r| r.status.is_none()));
    assert!(server.calls_to(Method::BatchWrite)[0].request_id().is_some());
}

#[tokio::test]
async fn test_partitioned_update_returns_lower_bound() {
    let (client, server) = client_with(pool_config());
    server.set_update_count("DELETE FROM Singers WHERE TRUE", 42);
    let ctx = Context::background();

    let count = client
        .partitioned_update(&ctx, Statement::new("DELETE FROM Singers WHERE TRUE"))
        .await
        .unwrap();
    assert_eq!(count, 42);

    let RecordedRequest::BeginTransaction(begin) = &server.calls_to(Method::BeginTransaction)[0].request
    else {
        panic!("unexpected request");
    };
    assert_eq!(begin.options, TransactionOptions::PartitionedDml);
}

#[tokio::test(start_paused = true)]
async fn test_partitioned_update_retries_aborted() {
    let (client, server) = client_with(pool_config());
    server.set_update_count("DELETE FROM Singers WHERE TRUE", 5);
    server.fail_stream(
        Method::ExecuteStreamingSql,
        0,
        Status::aborted("conflict", Duration::from_secs(3)),
    );
    let ctx = Context::background();
    let started = tokio::time::Instant::now();

    let count = client
        .partitioned_update(&ctx, Statement::new("DELETE FROM Singers WHERE TRUE"))
        .await
        .unwrap();
    assert_eq!(count, 5);
    assert_eq!(server.call_count(Method::BeginTransaction), 2);
    assert!(started.elapsed() >= Duration::from_secs(3));
}

#[tokio::test(start_paused = true)]
async fn test_partitioned_update_abort_wait_is_cancellable() {
    let (client, server) = client_with(pool_config());
    server.set_update_count("DELETE FROM Singers WHERE TRUE", 5);
    server.fail_stream(
        Method::ExecuteStreamingSql,
        0,
        Status::aborted("conflict", Duration::from_secs(60)),
    );
    let ctx = Context::background().with_timeout(Duration::from_secs(1));

    let err = client
        .partitioned_update(&ctx, Statement::new("DELETE FROM Singers WHERE TRUE"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::DeadlineExceeded { .. }));
    assert_eq!(server.call_count(Method::BeginTransaction), 1);
}

#[tokio::test]
async fn test_batch_read_only_transaction() {
    let (client, server) = client_with(pool_config());
    server.set_query(SINGERS, SingersFixture::new(2).results());
    server.set_partition_count(3);
    let ctx = Context::background();

    let tx = client
        .batch_read_only_transaction(&ctx, TimestampBound::Strong)
        .await
        .unwrap();
    assert!(tx.read_timestamp().is_some());

    let partitions = tx
        .partition_query(&ctx, Statement::new(SINGERS), PartitionOptions::default())
        .await
        .unwrap();
    assert_eq!(partitions.len(), 3);

    for partition in &partitions {
        let rows = tx.execute(&ctx, partition).await.unwrap().collect_all().await.unwrap();
        assert_eq!(rows.len(), 2);
    }
    let requests = streaming_requests(&server);
    assert_eq!(requests.len(), 3);
    assert_eq!(requests[0].partition_token, Some(partitions[0].token().clone()));

    let session = tx.session_name().to_string();
    tx.cleanup(&ctx).await.unwrap();
    assert!(!server.sessions().contains(&session));
    assert!(matches!(tx.cleanup(&ctx).await, Err(Error::AlreadyClosed)));
    assert!(tx.execute(&ctx, &partitions[0]).await.is_err());
}

// =============================================================================
// Lifecycle
// =============================================================================

#[tokio::test]
async fn test_close_twice_fails() {
    let (client, _server) = client_with(pool_config());
    client.close().await.unwrap();
    assert!(client.is_closed());
    assert!(matches!(client.close().await, Err(Error::AlreadyClosed)));
}

#[tokio::test]
async fn test_operations_after_close_fail() {
    let (client, server) = client_with(pool_config());
    server.set_update_count(UPDATE, 1);
    let ctx = Context::background();
    client.close().await.unwrap();

    let err = client
        .read_write_transaction(&ctx, |_tx| async { Ok(()) })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Closed));
    assert!(client.apply(&ctx, vec![singer(1, "Marc")], ApplyOptions::new()).await.is_err());
}

#[tokio::test]
async fn test_cancelled_context_stops_transaction_retries() {
    let (client, server) = client_with(pool_config());
    server.set_update_count(UPDATE, 1);
    for _ in 0..3 {
        server.fail_next(
            Method::Commit,
            Status::aborted("conflict", Duration::from_secs(60)),
        );
    }
    let (ctx, cancel) = Context::background().with_cancel();

    let handle = {
        let client = client.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            client
                .read_write_transaction(&ctx, |tx| {
                    let ctx = ctx.clone();
                    async move {
                        tx.update(&ctx, Statement::new(UPDATE)).await?;
                        Ok(())
                    }
                })
                .await
        })
    };
    while server.call_count(Method::Commit) == 0 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    cancel.cancel();

    let err = handle.await.unwrap().unwrap_err();
    assert_eq!(err.code(), Code::Canceled);
    assert_eq!(err.class(), ErrorClass::Terminal);
}

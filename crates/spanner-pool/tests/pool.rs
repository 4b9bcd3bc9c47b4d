//! Session pool behaviour tests.
//!
//! These tests drive the pool with a scripted in-process session factory,
//! so no service is needed:
//!
//! ```bash
//! cargo test -p spanner-session-pool --test pool
//! ```

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use spanner_protocol::{Code, Status};
use spanner_session_pool::{
    LeakedSessionAction, PoolError, Session, SessionFactory, SessionKind, SessionPool,
    SessionPoolConfig,
};
use spanner_transport::Context;

#[derive(Default)]
struct ScriptedFactory {
    next_id: AtomicU32,
    batch_calls: AtomicU32,
    multiplexed_created: AtomicU32,
    fail_batches: AtomicU32,
    deleted: Mutex<Vec<String>>,
}

impl ScriptedFactory {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn fail_next_batches(&self, n: u32) {
        self.fail_batches.store(n, Ordering::SeqCst);
    }

    fn deleted(&self) -> Vec<String> {
        self.deleted.lock().clone()
    }

    fn session(&self, kind: SessionKind) -> Session {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        Session::new(
            format!("projects/p/instances/i/databases/d/sessions/s{id}"),
            0,
            kind,
        )
    }
}

#[async_trait]
impl SessionFactory for ScriptedFactory {
    async fn batch_create(&self, _ctx: &Context, count: u32) -> Result<Vec<Session>, PoolError> {
        self.batch_calls.fetch_add(1, Ordering::SeqCst);
        let fail = self
            .fail_batches
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(PoolError::SessionCreation {
                status: Status::new(Code::ResourceExhausted, "too many sessions"),
                request_id: None,
            });
        }
        Ok((0..count).map(|_| self.session(SessionKind::Regular)).collect())
    }

    async fn create_multiplexed(&self, _ctx: &Context) -> Result<Session, PoolError> {
        self.multiplexed_created.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        Ok(self.session(SessionKind::Multiplexed))
    }

    async fn delete(&self, _ctx: &Context, session: &Session) -> Result<(), PoolError> {
        self.deleted.lock().push(session.name().to_string());
        Ok(())
    }
}

fn quiet_config() -> SessionPoolConfig {
    SessionPoolConfig::new()
        .min_opened(0)
        .max_opened(10)
        .inc_step(3)
        .maintenance_interval(Duration::from_secs(3600))
        .enable_multiplexed_session(false)
}

fn pool_with(config: SessionPoolConfig, factory: &Arc<ScriptedFactory>) -> Arc<SessionPool> {
    Arc::new(
        SessionPool::builder()
            .config(config)
            .factory(Arc::clone(factory) as Arc<dyn SessionFactory>)
            .build()
            .unwrap(),
    )
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

// =============================================================================
// Acquire and Release
// =============================================================================

#[tokio::test]
async fn test_acquire_creates_batch() {
    let factory = ScriptedFactory::new();
    let pool = pool_with(quiet_config(), &factory);

    let session = pool.acquire(&Context::background()).await.unwrap();
    let status = pool.status();
    assert_eq!(status.in_use, 1);
    assert_eq!(status.available, 2);
    assert_eq!(status.total, 3);
    assert_eq!(status.creating, 0);
    assert_eq!(factory.batch_calls.load(Ordering::SeqCst), 1);

    drop(session);
    let status = pool.status();
    assert_eq!(status.in_use, 0);
    assert_eq!(status.available, 3);
}

#[tokio::test]
async fn test_release_reuses_most_recent_session() {
    let factory = ScriptedFactory::new();
    let pool = pool_with(quiet_config(), &factory);
    let ctx = Context::background();

    let mut first = pool.acquire(&ctx).await.unwrap();
    let name = first.name().to_string();
    first.release().unwrap();

    let again = pool.acquire(&ctx).await.unwrap();
    assert_eq!(again.name(), name);
    assert_eq!(factory.batch_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_double_release_fails() {
    let factory = ScriptedFactory::new();
    let pool = pool_with(quiet_config(), &factory);

    let mut session = pool.acquire(&Context::background()).await.unwrap();
    session.release().unwrap();
    assert!(matches!(session.release(), Err(PoolError::AlreadyReleased)));
    assert!(matches!(session.destroy(), Err(PoolError::AlreadyReleased)));
    assert!(session.is_released());

    // The session went back exactly once.
    assert_eq!(pool.status().available, 3);
    drop(session);
    assert_eq!(pool.status().available, 3);
}

#[tokio::test]
async fn test_creation_failure_surfaces_to_caller() {
    let factory = ScriptedFactory::new();
    let pool = pool_with(quiet_config(), &factory);
    factory.fail_next_batches(1);

    let err = pool.acquire(&Context::background()).await.unwrap_err();
    assert!(matches!(err, PoolError::SessionCreation { .. }));
    let status = pool.status();
    assert_eq!(status.total, 0);
    assert_eq!(status.creating, 0);

    assert!(pool.acquire(&Context::background()).await.is_ok());
}

// =============================================================================
// Capacity and Waiting
// =============================================================================

#[tokio::test]
async fn test_max_opened_never_exceeded() {
    let factory = ScriptedFactory::new();
    let pool = pool_with(quiet_config().max_opened(4).inc_step(3), &factory);
    let ctx = Context::background();

    let mut held = Vec::new();
    for _ in 0..4 {
        held.push(pool.acquire(&ctx).await.unwrap());
        assert!(pool.status().total <= 4);
    }
    assert_eq!(pool.status().total, 4);

    let short = ctx.with_timeout(Duration::from_millis(50));
    assert!(matches!(
        pool.acquire(&short).await,
        Err(PoolError::DeadlineExceeded)
    ));
    assert_eq!(pool.status().total, 4);
}

#[tokio::test]
async fn test_blocked_acquire_wakes_on_release() {
    let factory = ScriptedFactory::new();
    let pool = pool_with(quiet_config().max_opened(1).inc_step(1), &factory);

    let mut held = pool.acquire(&Context::background()).await.unwrap();
    let name = held.name().to_string();

    let waiter = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.acquire(&Context::background()).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiter.is_finished());

    held.release().unwrap();
    let got = tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .expect("waiter woke")
        .unwrap()
        .unwrap();
    assert_eq!(got.name(), name);
    assert_eq!(pool.status().total, 1);
}

#[tokio::test]
async fn test_blocked_acquire_canceled() {
    let factory = ScriptedFactory::new();
    let pool = pool_with(quiet_config().max_opened(1).inc_step(1), &factory);
    let _held = pool.acquire(&Context::background()).await.unwrap();

    let (ctx, cancel) = Context::background().with_cancel();
    let waiter = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.acquire(&ctx).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    cancel.cancel();

    let result = tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(PoolError::Canceled)));
}

// =============================================================================
// Invalid Sessions and Maintenance
// =============================================================================

#[tokio::test]
async fn test_destroyed_session_is_deleted_and_not_reused() {
    let factory = ScriptedFactory::new();
    let pool = pool_with(quiet_config().max_opened(1).inc_step(1), &factory);
    let ctx = Context::background();

    let mut session = pool.acquire(&ctx).await.unwrap();
    let name = session.name().to_string();
    session.destroy().unwrap();
    assert_eq!(pool.status().total, 0);

    wait_until(|| factory.deleted().contains(&name)).await;

    let fresh = pool.acquire(&ctx).await.unwrap();
    assert_ne!(fresh.name(), name);
}

#[tokio::test]
async fn test_maintainer_replenishes_to_min_opened() {
    let factory = ScriptedFactory::new();
    let config = quiet_config()
        .min_opened(5)
        .maintenance_interval(Duration::from_millis(10));
    let pool = pool_with(config, &factory);

    wait_until(|| pool.status().available == 5).await;
    assert_eq!(pool.status().total, 5);
}

#[tokio::test(start_paused = true)]
async fn test_maintainer_backs_off_after_failures() {
    let factory = ScriptedFactory::new();
    factory.fail_next_batches(2);
    let config = quiet_config()
        .min_opened(2)
        .maintenance_interval(Duration::from_millis(10));
    let pool = pool_with(config, &factory);

    wait_until(|| pool.status().available == 2).await;
    assert_eq!(factory.batch_calls.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn test_idle_sessions_evicted_down_to_min() {
    let factory = ScriptedFactory::new();
    let config = quiet_config()
        .min_opened(1)
        .inc_step(4)
        .idle_timeout(Duration::from_secs(10))
        .maintenance_interval(Duration::from_secs(1));
    let pool = pool_with(config, &factory);

    wait_until(|| pool.status().total == 1).await;

    let ctx = Context::background();
    let warm = pool.acquire(&ctx).await.unwrap();
    let grown = pool.acquire(&ctx).await.unwrap();
    assert_eq!(pool.status().total, 5);
    drop(warm);
    drop(grown);

    tokio::time::sleep(Duration::from_secs(12)).await;
    wait_until(|| pool.status().total == 1).await;
    assert_eq!(factory.deleted().len(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_leaked_session_reclaimed() {
    let factory = ScriptedFactory::new();
    let config = quiet_config()
        .leaked_session_threshold(Duration::from_secs(5))
        .leaked_session_action(LeakedSessionAction::Close)
        .maintenance_interval(Duration::from_secs(1));
    let pool = pool_with(config, &factory);

    let leaked = pool.acquire(&Context::background()).await.unwrap();
    let name = leaked.name().to_string();

    tokio::time::sleep(Duration::from_secs(7)).await;
    wait_until(|| factory.deleted().contains(&name)).await;
    assert_eq!(pool.status().in_use, 0);
    assert!(!leaked.is_valid());

    // Returning the reclaimed session does not disturb the counts.
    let total = pool.status().total;
    drop(leaked);
    assert_eq!(pool.status().total, total);
}

// =============================================================================
// Multiplexed Session
// =============================================================================

#[tokio::test]
async fn test_multiplexed_created_once_for_concurrent_callers() {
    let factory = ScriptedFactory::new();
    let pool = pool_with(quiet_config().enable_multiplexed_session(true), &factory);

    let mut tasks = Vec::new();
    for _ in 0..10 {
        let pool = Arc::clone(&pool);
        tasks.push(tokio::spawn(async move {
            pool.acquire_multiplexed(&Context::background()).await
        }));
    }
    let mut names = Vec::new();
    for task in tasks {
        names.push(task.await.unwrap().unwrap().name().to_string());
    }
    names.dedup();
    assert_eq!(names.len(), 1);
    assert_eq!(factory.multiplexed_created.load(Ordering::SeqCst), 1);
    assert!(pool.status().multiplexed);
}

#[tokio::test(start_paused = true)]
async fn test_multiplexed_refreshed_copy_on_write() {
    let factory = ScriptedFactory::new();
    let config = quiet_config()
        .enable_multiplexed_session(true)
        .multiplexed_session_refresh_interval(Duration::from_secs(60))
        .maintenance_interval(Duration::from_secs(1));
    let pool = pool_with(config, &factory);

    let old = pool
        .acquire_multiplexed(&Context::background())
        .await
        .unwrap();
    assert!(old.is_multiplexed());

    tokio::time::sleep(Duration::from_secs(61)).await;
    wait_until(|| factory.multiplexed_created.load(Ordering::SeqCst) == 2).await;

    let new = pool
        .acquire_multiplexed(&Context::background())
        .await
        .unwrap();
    assert_ne!(new.name(), old.name());
    // The old handle is still intact for in-flight users.
    assert!(old.is_valid());
}

#[tokio::test]
async fn test_multiplexed_disabled() {
    let factory = ScriptedFactory::new();
    let pool = pool_with(quiet_config(), &factory);
    assert!(matches!(
        pool.acquire_multiplexed(&Context::background()).await,
        Err(PoolError::MultiplexedDisabled)
    ));
    assert!(!pool.multiplexed_for_rw());
}

#[tokio::test]
async fn test_disable_multiplexed_for_rw_is_sticky() {
    let factory = ScriptedFactory::new();
    let pool = pool_with(quiet_config().enable_multiplexed_session(true), &factory);
    assert!(pool.multiplexed_for_rw());
    pool.disable_multiplexed_for_rw();
    pool.disable_multiplexed_for_rw();
    assert!(!pool.multiplexed_for_rw());
    assert!(pool.multiplexed_enabled());
}

// =============================================================================
// Close
// =============================================================================

#[tokio::test]
async fn test_close_wakes_waiters_and_deletes_sessions() {
    let factory = ScriptedFactory::new();
    let pool = pool_with(
        quiet_config().max_opened(2).inc_step(2).enable_multiplexed_session(true),
        &factory,
    );
    let ctx = Context::background();

    let a = pool.acquire(&ctx).await.unwrap();
    let b = pool.acquire(&ctx).await.unwrap();
    let mux = pool.acquire_multiplexed(&ctx).await.unwrap();
    let b_name = b.name().to_string();
    drop(b);

    let waiter = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move {
            // Pool is full with `a` held and `b` idle: take `b`, then block.
            let _b = pool.acquire(&Context::background()).await?;
            pool.acquire(&Context::background()).await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    pool.close().await.unwrap();
    let result = tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(PoolError::Closed)));
    assert!(pool.is_closed());
    assert!(factory.deleted().contains(&mux.name().to_string()));

    assert!(matches!(pool.close().await, Err(PoolError::Closed)));
    assert!(matches!(
        pool.acquire(&Context::background()).await,
        Err(PoolError::Closed)
    ));

    // Sessions returned after close are deleted, not pooled.
    let a_name = a.name().to_string();
    drop(a);
    wait_until(|| {
        let deleted = factory.deleted();
        deleted.contains(&a_name) && deleted.contains(&b_name)
    })
    .await;
    assert_eq!(pool.status().available, 0);
}

#[tokio::test]
async fn test_builder_requires_factory() {
    let result = SessionPool::builder().build();
    assert!(matches!(result, Err(PoolError::Configuration(_))));

    let factory = ScriptedFactory::new();
    let result = SessionPool::new(
        SessionPoolConfig::new().min_opened(5).max_opened(1),
        factory as Arc<dyn SessionFactory>,
    );
    assert!(matches!(result, Err(PoolError::Configuration(_))));
}

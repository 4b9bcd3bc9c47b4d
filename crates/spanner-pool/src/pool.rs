//! Session pool implementation.
//!
//! ## Acquisition
//!
//! [`SessionPool::acquire`] hands out the most recently used idle session.
//! When none is idle and `opened + creating < max_opened`, the caller
//! reserves room for up to `inc_step` sessions, creates them synchronously,
//! keeps one and parks the rest in the idle list; a creation failure is
//! returned to that caller. When the pool is full the caller waits on a
//! [`Notify`] that is signalled on every release, so waiting never spins and
//! ends as soon as the caller's [`Context`] is done.
//!
//! ## Multiplexed session
//!
//! One shared session is created on first use and replaced by the
//! maintainer when it grows older than the refresh interval. Replacement
//! swaps a new `Arc<Session>` in; holders of the old one keep using it.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use spanner_protocol::{Code, Status};
use spanner_transport::{CancelHandle, Context};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::config::SessionPoolConfig;
use crate::error::PoolError;
use crate::lifecycle::SessionFactory;
use crate::maintainer;
use crate::session::Session;

/// Time allowed for best-effort deletes once the pool is closed.
const DELETE_TIMEOUT: Duration = Duration::from_secs(15);

pub(crate) struct PoolState {
    /// Front is the most recently used session.
    pub(crate) idle: VecDeque<Arc<Session>>,
    pub(crate) in_use: HashMap<String, Arc<Session>>,
    /// Idle plus in use.
    pub(crate) num_opened: u32,
    pub(crate) num_creating: u32,
    pub(crate) pending_deletes: Vec<Arc<Session>>,
    pub(crate) closed: bool,
}

impl PoolState {
    fn room(&self, max: u32) -> u32 {
        max.saturating_sub(self.num_opened + self.num_creating)
    }
}

pub(crate) struct PoolInner {
    pub(crate) config: SessionPoolConfig,
    pub(crate) factory: Arc<dyn SessionFactory>,
    pub(crate) state: Mutex<PoolState>,
    /// Signalled when a session is released or room to create one appears.
    pub(crate) available: Notify,
    /// Wakes the maintainer early.
    pub(crate) wakeup: Arc<Notify>,
    multiplexed: RwLock<Option<Arc<Session>>>,
    multiplexed_create: tokio::sync::Mutex<()>,
    multiplexed_rw: AtomicBool,
    shutdown: CancelHandle,
}

impl PoolInner {
    fn check_out(&self, state: &mut PoolState, session: &Arc<Session>, now: Instant) {
        session.mark_checked_out(now);
        state
            .in_use
            .insert(session.name().to_string(), Arc::clone(session));
    }

    fn release(&self, session: Arc<Session>) {
        let now = Instant::now();
        let mut state = self.state.lock();
        if state.in_use.remove(session.name()).is_none() {
            // Reclaimed by leak detection in the meantime.
            trace!(session_id = session.name(), "released session no longer tracked");
            return;
        }
        session.mark_returned(now);

        if state.closed {
            state.num_opened -= 1;
            drop(state);
            self.delete_detached(vec![session]);
        } else if !session.is_valid() {
            debug!(session_id = session.name(), "discarding invalid session");
            state.num_opened -= 1;
            state.pending_deletes.push(session);
            drop(state);
            self.wakeup.notify_one();
            self.available.notify_one();
        } else {
            trace!(session_id = session.name(), "returning session to pool");
            state.idle.push_front(session);
            drop(state);
            self.available.notify_one();
        }
    }

    /// Delete sessions from a spawned task; used once the maintainer is gone.
    pub(crate) fn delete_detached(&self, sessions: Vec<Arc<Session>>) {
        if sessions.is_empty() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(count = sessions.len(), "no runtime to delete sessions on; leaving them to expire");
            return;
        };
        let factory = Arc::clone(&self.factory);
        runtime.spawn(async move {
            let ctx = Context::background().with_timeout(DELETE_TIMEOUT);
            delete_sessions(factory.as_ref(), &ctx, &sessions).await;
        });
    }

    pub(crate) fn current_multiplexed(&self) -> Option<Arc<Session>> {
        self.multiplexed.read().clone()
    }

    /// Create the multiplexed session, or replace it when `refresh` is set.
    ///
    /// Creation is single-flight: concurrent callers wait for the one in
    /// progress and share its result.
    pub(crate) async fn create_multiplexed(
        &self,
        ctx: &Context,
        refresh: bool,
    ) -> Result<Arc<Session>, PoolError> {
        let _flight = ctx.run(self.multiplexed_create.lock()).await?;
        if let Some(current) = self.current_multiplexed() {
            let fresh = current.age() < self.config.multiplexed_session_refresh_interval;
            if !refresh || fresh {
                return Ok(current);
            }
        }

        let session = Arc::new(ctx.run(self.factory.create_multiplexed(ctx)).await??);
        if self.state.lock().closed {
            self.delete_detached(vec![session]);
            return Err(PoolError::Closed);
        }
        let previous = self.multiplexed.write().replace(Arc::clone(&session));
        match previous {
            Some(old) => info!(
                session_id = session.name(),
                previous = old.name(),
                "multiplexed session refreshed"
            ),
            None => info!(session_id = session.name(), "multiplexed session created"),
        }
        Ok(session)
    }
}

/// Best-effort deletion; failures are logged and ignored.
pub(crate) async fn delete_sessions(
    factory: &dyn SessionFactory,
    ctx: &Context,
    sessions: &[Arc<Session>],
) {
    for session in sessions {
        match ctx.run(factory.delete(ctx, session)).await {
            Ok(Ok(())) => trace!(session_id = session.name(), "deleted session"),
            Ok(Err(e)) => debug!(session_id = session.name(), error = %e, "failed to delete session"),
            Err(e) => {
                debug!(error = %e, count = sessions.len(), "abandoning session deletes");
                return;
            }
        }
    }
}

/// Room reserved in the pool for sessions being created.
///
/// Dropping an unfulfilled reservation gives the room back, so a cancelled
/// or failed creation never leaks capacity.
pub(crate) struct Reservation<'a> {
    inner: &'a PoolInner,
    count: u32,
    settled: bool,
}

pub(crate) enum Fulfilment {
    /// Sessions were added; holds the one checked out for the caller.
    Added(Option<Arc<Session>>),
    /// The pool closed while creating; the sessions must be deleted.
    Closed(Vec<Arc<Session>>),
}

impl<'a> Reservation<'a> {
    /// Reserve room for `count` sessions; the caller checked it is available.
    pub(crate) fn new(inner: &'a PoolInner, state: &mut PoolState, count: u32) -> Self {
        state.num_creating += count;
        Self {
            inner,
            count,
            settled: false,
        }
    }

    pub(crate) fn count(&self) -> u32 {
        self.count
    }

    /// Account for the sessions created under this reservation.
    pub(crate) fn fulfil(mut self, created: Vec<Session>, check_out_one: bool) -> Fulfilment {
        let inner = self.inner;
        let now = Instant::now();
        let mut sessions: Vec<Arc<Session>> = created.into_iter().map(Arc::new).collect();

        let mut state = inner.state.lock();
        state.num_creating -= self.count;
        self.settled = true;
        if state.closed {
            return Fulfilment::Closed(sessions);
        }

        let room = state.room(inner.config.max_opened) as usize;
        if sessions.len() > room {
            let extra = sessions.split_off(room);
            state.pending_deletes.extend(extra);
            inner.wakeup.notify_one();
        }
        state.num_opened += sessions.len() as u32;

        let mut sessions = sessions.into_iter();
        let mine = if check_out_one { sessions.next() } else { None };
        if let Some(session) = &mine {
            inner.check_out(&mut state, session, now);
        }
        let mut added = 0;
        for session in sessions {
            state.idle.push_back(session);
            added += 1;
        }
        drop(state);

        for _ in 0..added {
            inner.available.notify_one();
        }
        Fulfilment::Added(mine)
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.inner.state.lock().num_creating -= self.count;
            self.inner.available.notify_one();
        }
    }
}

enum Step<'a> {
    Create(Reservation<'a>),
    Wait(std::pin::Pin<Box<tokio::sync::futures::Notified<'a>>>),
}

/// A pool of sessions against one database.
///
/// The pool manages a set of regular sessions plus one shared multiplexed
/// session, creating them on demand, keeping `min_opened` of them warm and
/// evicting idle ones in a background maintainer.
pub struct SessionPool {
    inner: Arc<PoolInner>,
    maintainer: Mutex<Option<JoinHandle<()>>>,
}

impl SessionPool {
    /// Create a builder for the pool.
    #[must_use]
    pub fn builder() -> SessionPoolBuilder {
        SessionPoolBuilder::new()
    }

    /// Create a pool and start its maintainer.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        config: SessionPoolConfig,
        factory: Arc<dyn SessionFactory>,
    ) -> Result<Self, PoolError> {
        config.validate()?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            PoolError::Configuration("session pool must be created inside a tokio runtime".into())
        })?;

        let (ctx, shutdown) = Context::background().with_cancel();
        let interval = config.maintenance_interval;
        let inner = Arc::new(PoolInner {
            multiplexed_rw: AtomicBool::new(config.enable_multiplexed_session_for_rw),
            config,
            factory,
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                in_use: HashMap::new(),
                num_opened: 0,
                num_creating: 0,
                pending_deletes: Vec::new(),
                closed: false,
            }),
            available: Notify::new(),
            wakeup: Arc::new(Notify::new()),
            multiplexed: RwLock::new(None),
            multiplexed_create: tokio::sync::Mutex::new(()),
            shutdown,
        });

        let handle = runtime.spawn(maintainer::run(
            Arc::downgrade(&inner),
            Arc::clone(&inner.wakeup),
            ctx,
            interval,
        ));

        info!(
            min_opened = inner.config.min_opened,
            max_opened = inner.config.max_opened,
            multiplexed = inner.config.enable_multiplexed_session,
            "session pool opened"
        );
        Ok(Self {
            inner,
            maintainer: Mutex::new(Some(handle)),
        })
    }

    /// Get a regular session from the pool.
    ///
    /// Returns an idle session if there is one; otherwise creates a batch of
    /// up to `inc_step` sessions if the pool has room, or waits for a
    /// release until `ctx` is done.
    pub async fn acquire(&self, ctx: &Context) -> Result<PooledSession, PoolError> {
        loop {
            let step = {
                let mut state = self.inner.state.lock();
                if state.closed {
                    return Err(PoolError::Closed);
                }
                if let Some(session) = state.idle.pop_front() {
                    self.inner.check_out(&mut state, &session, Instant::now());
                    trace!(session_id = session.name(), "acquired idle session");
                    return Ok(PooledSession::new(session, Arc::clone(&self.inner)));
                }
                let room = state.room(self.inner.config.max_opened);
                if room > 0 {
                    let count = room.min(self.inner.config.inc_step);
                    Step::Create(Reservation::new(&self.inner, &mut state, count))
                } else {
                    let mut notified = Box::pin(self.inner.available.notified());
                    notified.as_mut().enable();
                    Step::Wait(notified)
                }
            };

            match step {
                Step::Create(reservation) => {
                    debug!(count = reservation.count(), "creating sessions on demand");
                    let created = ctx
                        .run(self.inner.factory.batch_create(ctx, reservation.count()))
                        .await??;
                    match reservation.fulfil(created, true) {
                        Fulfilment::Added(Some(session)) => {
                            trace!(session_id = session.name(), "acquired new session");
                            return Ok(PooledSession::new(session, Arc::clone(&self.inner)));
                        }
                        Fulfilment::Added(None) => {
                            return Err(PoolError::SessionCreation {
                                status: Status::new(Code::Internal, "no sessions were created"),
                                request_id: None,
                            });
                        }
                        Fulfilment::Closed(sessions) => {
                            self.inner.delete_detached(sessions);
                            return Err(PoolError::Closed);
                        }
                    }
                }
                Step::Wait(notified) => {
                    trace!("session pool exhausted, waiting for a release");
                    ctx.run(notified).await?;
                }
            }
        }
    }

    /// Get the shared multiplexed session, creating it on first use.
    pub async fn acquire_multiplexed(&self, ctx: &Context) -> Result<Arc<Session>, PoolError> {
        if !self.inner.config.enable_multiplexed_session {
            return Err(PoolError::MultiplexedDisabled);
        }
        if self.is_closed() {
            return Err(PoolError::Closed);
        }
        if let Some(session) = self.inner.current_multiplexed() {
            return Ok(session);
        }
        self.inner.create_multiplexed(ctx, false).await
    }

    /// Forget the multiplexed session if it is `session`, so the next
    /// [`acquire_multiplexed`](Self::acquire_multiplexed) creates a new one.
    pub fn invalidate_multiplexed(&self, session: &Session) {
        let mut current = self.inner.multiplexed.write();
        if current.as_ref().is_some_and(|s| s.name() == session.name()) {
            warn!(session_id = session.name(), "multiplexed session invalidated");
            *current = None;
        }
    }

    /// Whether multiplexed sessions are in use for single-use and read-only
    /// work.
    #[must_use]
    pub fn multiplexed_enabled(&self) -> bool {
        self.inner.config.enable_multiplexed_session
    }

    /// Whether read-write transactions should use the multiplexed session.
    #[must_use]
    pub fn multiplexed_for_rw(&self) -> bool {
        self.inner.config.enable_multiplexed_session && self.inner.multiplexed_rw.load(Ordering::Acquire)
    }

    /// Stop using the multiplexed session for read-write transactions for
    /// the lifetime of this pool.
    pub fn disable_multiplexed_for_rw(&self) {
        if self.inner.multiplexed_rw.swap(false, Ordering::AcqRel) {
            warn!("multiplexed sessions are not supported for read-write transactions; using regular sessions");
        }
    }

    /// Get the current pool status.
    #[must_use]
    pub fn status(&self) -> PoolStatus {
        let state = self.inner.state.lock();
        PoolStatus {
            available: state.idle.len() as u32,
            in_use: state.in_use.len() as u32,
            total: state.num_opened,
            creating: state.num_creating,
            max: self.inner.config.max_opened,
            multiplexed: self.inner.multiplexed.read().is_some(),
        }
    }

    /// Close the pool.
    ///
    /// Stops the maintainer, wakes every waiting caller with
    /// [`PoolError::Closed`], and deletes idle sessions and the multiplexed
    /// session. Sessions still checked out are deleted when returned.
    /// Closing twice returns [`PoolError::Closed`].
    pub async fn close(&self) -> Result<(), PoolError> {
        let mut doomed = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(PoolError::Closed);
            }
            state.closed = true;
            let mut doomed: Vec<Arc<Session>> = state.idle.drain(..).collect();
            state.num_opened -= doomed.len() as u32;
            doomed.append(&mut state.pending_deletes);
            doomed
        };

        self.inner.shutdown.cancel();
        self.inner.available.notify_waiters();

        let handle = self.maintainer.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "session pool maintainer ended abnormally");
            }
        }

        let multiplexed = self.inner.multiplexed.write().take();
        doomed.extend(multiplexed);

        let ctx = Context::background().with_timeout(DELETE_TIMEOUT);
        delete_sessions(self.inner.factory.as_ref(), &ctx, &doomed).await;
        info!(deleted = doomed.len(), "session pool closed");
        Ok(())
    }

    /// Check if the pool is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Get the pool configuration.
    #[must_use]
    pub fn config(&self) -> &SessionPoolConfig {
        &self.inner.config
    }
}

impl Drop for SessionPool {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

impl fmt::Debug for SessionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionPool")
            .field("status", &self.status())
            .finish()
    }
}

/// Builder for [`SessionPool`].
#[derive(Default)]
pub struct SessionPoolBuilder {
    config: SessionPoolConfig,
    factory: Option<Arc<dyn SessionFactory>>,
}

impl SessionPoolBuilder {
    /// Create a builder with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole configuration.
    #[must_use]
    pub fn config(mut self, config: SessionPoolConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the session factory.
    #[must_use]
    pub fn factory(mut self, factory: Arc<dyn SessionFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Set the number of sessions kept open.
    #[must_use]
    pub fn min_opened(mut self, count: u32) -> Self {
        self.config.min_opened = count;
        self
    }

    /// Set the maximum number of open sessions.
    #[must_use]
    pub fn max_opened(mut self, count: u32) -> Self {
        self.config.max_opened = count;
        self
    }

    /// Set the batch size for on-demand growth.
    #[must_use]
    pub fn inc_step(mut self, count: u32) -> Self {
        self.config.inc_step = count;
        self
    }

    /// Set the idle eviction timeout.
    #[must_use]
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout = timeout;
        self
    }

    /// Enable or disable the multiplexed session.
    #[must_use]
    pub fn enable_multiplexed_session(mut self, enabled: bool) -> Self {
        self.config.enable_multiplexed_session = enabled;
        self
    }

    /// Build the pool and start its maintainer.
    pub fn build(self) -> Result<SessionPool, PoolError> {
        let factory = self
            .factory
            .ok_or_else(|| PoolError::Configuration("a session factory is required".into()))?;
        SessionPool::new(self.config, factory)
    }
}

/// Status information about the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Number of idle sessions available.
    pub available: u32,
    /// Number of sessions currently checked out.
    pub in_use: u32,
    /// Total number of open regular sessions.
    pub total: u32,
    /// Sessions being created.
    pub creating: u32,
    /// Maximum allowed sessions.
    pub max: u32,
    /// Whether a multiplexed session is open.
    pub multiplexed: bool,
}

/// A session borrowed from the pool.
///
/// When dropped, the session is automatically returned to the pool.
pub struct PooledSession {
    session: Arc<Session>,
    pool: Arc<PoolInner>,
    released: bool,
}

impl PooledSession {
    fn new(session: Arc<Session>, pool: Arc<PoolInner>) -> Self {
        Self {
            session,
            pool,
            released: false,
        }
    }

    /// The underlying session.
    #[must_use]
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Whether the session was already given back.
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Return the session to the pool.
    ///
    /// Returns [`PoolError::AlreadyReleased`] if called more than once.
    pub fn release(&mut self) -> Result<(), PoolError> {
        if self.released {
            return Err(PoolError::AlreadyReleased);
        }
        self.released = true;
        self.pool.release(Arc::clone(&self.session));
        Ok(())
    }

    /// Mark the session invalid and return it; the pool deletes it.
    pub fn destroy(&mut self) -> Result<(), PoolError> {
        if self.released {
            return Err(PoolError::AlreadyReleased);
        }
        self.session.mark_invalid();
        self.release()
    }
}

impl Deref for PooledSession {
    type Target = Session;

    fn deref(&self) -> &Session {
        &self.session
    }
}

impl Drop for PooledSession {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            self.pool.release(Arc::clone(&self.session));
        }
    }
}

impl fmt::Debug for PooledSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledSession")
            .field("session", &self.session.name())
            .field("released", &self.released)
            .finish()
    }
}

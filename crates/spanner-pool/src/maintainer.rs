//! Background pool maintenance.
//!
//! One task per pool, started at construction and stopped by the pool's
//! shutdown token. Each tick it:
//!
//! 1. deletes sessions that were invalidated or evicted;
//! 2. evicts sessions idle longer than `idle_timeout`, down to `min_opened`;
//! 3. handles sessions checked out longer than the leak threshold;
//! 4. tops the pool up to `min_opened`, backing off after failures;
//! 5. creates or refreshes the multiplexed session.
//!
//! The task holds only a weak reference to the pool, so it never keeps a
//! dropped pool alive.

use std::sync::{Arc, Weak};
use std::time::Duration;

use spanner_transport::Context;
use tokio::sync::Notify;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::error::PoolError;
use crate::pool::{Fulfilment, PoolInner, Reservation, delete_sessions};
use crate::session::Session;

pub(crate) async fn run(pool: Weak<PoolInner>, wakeup: Arc<Notify>, ctx: Context, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut maintainer = Maintainer::default();

    loop {
        tokio::select! {
            biased;
            _ = ctx.done() => break,
            _ = ticker.tick() => {}
            () = wakeup.notified() => {}
        }
        let Some(inner) = pool.upgrade() else {
            break;
        };
        maintainer.tick(&inner, &ctx).await;
    }
    debug!("session pool maintainer stopped");
}

#[derive(Debug, Default)]
struct Maintainer {
    creation_failures: u32,
    next_creation_at: Option<Instant>,
    multiplexed_failures: u32,
    next_multiplexed_at: Option<Instant>,
}

impl Maintainer {
    async fn tick(&mut self, inner: &PoolInner, ctx: &Context) {
        let now = Instant::now();
        let mut doomed = take_pending_deletes(inner);
        doomed.extend(evict_idle(inner, now));
        doomed.extend(reclaim_leaked(inner, now));
        if !doomed.is_empty() {
            debug!(count = doomed.len(), "deleting discarded sessions");
            delete_sessions(inner.factory.as_ref(), ctx, &doomed).await;
        }

        self.replenish(inner, ctx, now).await;
        self.refresh_multiplexed(inner, ctx, now).await;
    }

    async fn replenish(&mut self, inner: &PoolInner, ctx: &Context, now: Instant) {
        if self.next_creation_at.is_some_and(|at| now < at) {
            return;
        }
        let reservation = {
            let mut state = inner.state.lock();
            let opened = state.num_opened + state.num_creating;
            if state.closed || opened >= inner.config.min_opened {
                return;
            }
            let room = inner.config.max_opened.saturating_sub(opened);
            let count = (inner.config.min_opened - opened).min(room);
            if count == 0 {
                return;
            }
            Reservation::new(inner, &mut state, count)
        };

        let count = reservation.count();
        match ctx.run(inner.factory.batch_create(ctx, count)).await {
            Ok(Ok(created)) => {
                self.creation_failures = 0;
                self.next_creation_at = None;
                debug!(requested = count, created = created.len(), "replenished session pool");
                if let Fulfilment::Closed(sessions) = reservation.fulfil(created, false) {
                    inner.delete_detached(sessions);
                }
            }
            Ok(Err(e)) => {
                self.creation_failures += 1;
                let delay = inner
                    .config
                    .creation_backoff
                    .delay_for_attempt(self.creation_failures);
                self.next_creation_at = Some(now + delay);
                warn!(
                    error = %e,
                    attempt = self.creation_failures,
                    delay_ms = delay.as_millis() as u64,
                    "background session creation failed"
                );
            }
            // Shutting down.
            Err(_) => {}
        }
    }

    async fn refresh_multiplexed(&mut self, inner: &PoolInner, ctx: &Context, now: Instant) {
        if !inner.config.enable_multiplexed_session
            || self.next_multiplexed_at.is_some_and(|at| now < at)
        {
            return;
        }
        let due = inner
            .current_multiplexed()
            .is_none_or(|s| s.age() >= inner.config.multiplexed_session_refresh_interval);
        if !due {
            return;
        }

        match inner.create_multiplexed(ctx, true).await {
            Ok(_) => {
                self.multiplexed_failures = 0;
                self.next_multiplexed_at = None;
            }
            Err(PoolError::Closed | PoolError::Canceled | PoolError::DeadlineExceeded) => {}
            Err(e) => {
                self.multiplexed_failures += 1;
                let delay = inner
                    .config
                    .creation_backoff
                    .delay_for_attempt(self.multiplexed_failures);
                self.next_multiplexed_at = Some(now + delay);
                warn!(
                    error = %e,
                    attempt = self.multiplexed_failures,
                    delay_ms = delay.as_millis() as u64,
                    "multiplexed session creation failed"
                );
            }
        }
    }
}

fn take_pending_deletes(inner: &PoolInner) -> Vec<Arc<Session>> {
    std::mem::take(&mut inner.state.lock().pending_deletes)
}

/// Remove least recently used sessions idle for longer than the timeout,
/// never going below `min_opened`.
fn evict_idle(inner: &PoolInner, now: Instant) -> Vec<Arc<Session>> {
    let mut state = inner.state.lock();
    let mut evicted = Vec::new();
    if state.closed {
        return evicted;
    }
    while state.num_opened > inner.config.min_opened {
        let expired = state
            .idle
            .back()
            .is_some_and(|s| s.idle_for(now) >= inner.config.idle_timeout);
        if !expired {
            break;
        }
        if let Some(session) = state.idle.pop_back() {
            state.num_opened -= 1;
            evicted.push(session);
        }
    }
    if !evicted.is_empty() {
        debug!(count = evicted.len(), "evicted idle sessions");
    }
    evicted
}

fn reclaim_leaked(inner: &PoolInner, now: Instant) -> Vec<Arc<Session>> {
    let threshold = inner.config.leaked_session_threshold;
    let action = inner.config.leaked_session_action;
    let mut state = inner.state.lock();

    let leaked: Vec<Arc<Session>> = state
        .in_use
        .values()
        .filter(|s| s.checked_out_for(now).is_some_and(|d| d >= threshold))
        .cloned()
        .collect();

    let mut reclaimed = Vec::new();
    for session in leaked {
        if action.warns() && session.report_leak_once() {
            warn!(
                session_id = session.name(),
                threshold_secs = threshold.as_secs(),
                "session checked out longer than the leak threshold"
            );
        }
        if action.closes() {
            state.in_use.remove(session.name());
            state.num_opened -= 1;
            session.mark_invalid();
            reclaimed.push(session);
        }
    }
    drop(state);

    for _ in &reclaimed {
        inner.available.notify_one();
    }
    reclaimed
}

//! Session handles.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

/// Kind of session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionKind {
    /// A session used by one transaction at a time.
    Regular,
    /// A session shared by any number of concurrent operations.
    Multiplexed,
}

#[derive(Debug)]
struct Usage {
    last_used_at: Instant,
    checked_out_at: Option<Instant>,
}

/// A server-side session.
///
/// Sessions are owned by the pool; callers borrow them through a
/// [`PooledSession`](crate::PooledSession) or, for the multiplexed session,
/// a shared `Arc<Session>`.
#[derive(Debug)]
pub struct Session {
    name: String,
    channel_id: u32,
    kind: SessionKind,
    created_at: Instant,
    usage: Mutex<Usage>,
    valid: AtomicBool,
    leak_reported: AtomicBool,
}

impl Session {
    /// Wrap a session just created on `channel_id`.
    pub fn new(name: impl Into<String>, channel_id: u32, kind: SessionKind) -> Self {
        let now = Instant::now();
        Self {
            name: name.into(),
            channel_id,
            kind,
            created_at: now,
            usage: Mutex::new(Usage {
                last_used_at: now,
                checked_out_at: None,
            }),
            valid: AtomicBool::new(true),
            leak_reported: AtomicBool::new(false),
        }
    }

    /// Fully-qualified session name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Channel the session was created on; its RPCs go there too.
    #[must_use]
    pub fn channel_id(&self) -> u32 {
        self.channel_id
    }

    /// Session kind.
    #[must_use]
    pub fn kind(&self) -> SessionKind {
        self.kind
    }

    /// Whether this is a multiplexed session.
    #[must_use]
    pub fn is_multiplexed(&self) -> bool {
        self.kind == SessionKind::Multiplexed
    }

    /// Time since creation.
    #[must_use]
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// When the session was last returned to the pool, or created.
    #[must_use]
    pub fn last_used_at(&self) -> Instant {
        self.usage.lock().last_used_at
    }

    /// Whether the session may still be used.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    /// Mark the session as gone on the server.
    ///
    /// An invalid session is deleted instead of returned to the idle list.
    pub fn mark_invalid(&self) {
        self.valid.store(false, Ordering::Release);
    }

    pub(crate) fn mark_checked_out(&self, now: Instant) {
        self.usage.lock().checked_out_at = Some(now);
        self.leak_reported.store(false, Ordering::Relaxed);
    }

    pub(crate) fn mark_returned(&self, now: Instant) {
        let mut usage = self.usage.lock();
        usage.checked_out_at = None;
        usage.last_used_at = now;
    }

    pub(crate) fn checked_out_for(&self, now: Instant) -> Option<Duration> {
        self.usage
            .lock()
            .checked_out_at
            .map(|at| now.saturating_duration_since(at))
    }

    pub(crate) fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.usage.lock().last_used_at)
    }

    /// Returns true the first time it is called during a checkout.
    pub(crate) fn report_leak_once(&self) -> bool {
        !self.leak_reported.swap(true, Ordering::Relaxed)
    }
}

//! Pool configuration.

use std::time::Duration;

use spanner_transport::Backoff;

use crate::error::PoolError;

/// What the maintainer does with a session checked out for longer than
/// [`SessionPoolConfig::leaked_session_threshold`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LeakedSessionAction {
    /// Log a warning once per checkout.
    #[default]
    Warn,
    /// Take the session back from its holder and delete it.
    Close,
    /// Both.
    WarnAndClose,
}

impl LeakedSessionAction {
    pub(crate) fn warns(self) -> bool {
        matches!(self, Self::Warn | Self::WarnAndClose)
    }

    pub(crate) fn closes(self) -> bool {
        matches!(self, Self::Close | Self::WarnAndClose)
    }
}

/// Configuration for the session pool.
///
/// This struct is marked `#[non_exhaustive]` to allow adding new fields
/// in future minor versions without breaking changes. Use the builder
/// pattern methods or [`Default::default()`] to construct instances.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct SessionPoolConfig {
    /// Sessions the maintainer keeps open.
    pub min_opened: u32,

    /// Upper bound on open sessions, idle or in use.
    pub max_opened: u32,

    /// Sessions created per batch when the pool grows on demand.
    pub inc_step: u32,

    /// Idle time after which a session above `min_opened` is evicted.
    pub idle_timeout: Duration,

    /// Period of the background maintainer.
    pub maintenance_interval: Duration,

    /// Age after which the multiplexed session is replaced.
    pub multiplexed_session_refresh_interval: Duration,

    /// Serve single-use and read-only work from a multiplexed session.
    pub enable_multiplexed_session: bool,

    /// Also serve read-write transactions from the multiplexed session.
    pub enable_multiplexed_session_for_rw: bool,

    /// Backoff between failed background creations.
    pub creation_backoff: Backoff,

    /// Checkout time after which a session counts as leaked.
    pub leaked_session_threshold: Duration,

    /// What to do with leaked sessions.
    pub leaked_session_action: LeakedSessionAction,
}

impl Default for SessionPoolConfig {
    fn default() -> Self {
        Self {
            min_opened: 100,
            max_opened: 400,
            inc_step: 25,
            idle_timeout: Duration::from_secs(30 * 60),
            maintenance_interval: Duration::from_secs(1),
            multiplexed_session_refresh_interval: Duration::from_secs(7 * 24 * 60 * 60),
            enable_multiplexed_session: true,
            enable_multiplexed_session_for_rw: true,
            creation_backoff: Backoff::default(),
            leaked_session_threshold: Duration::from_secs(60 * 60),
            leaked_session_action: LeakedSessionAction::Warn,
        }
    }
}

impl SessionPoolConfig {
    /// Create a new pool configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of sessions kept open.
    #[must_use]
    pub fn min_opened(mut self, count: u32) -> Self {
        self.min_opened = count;
        self
    }

    /// Set the maximum number of open sessions.
    #[must_use]
    pub fn max_opened(mut self, count: u32) -> Self {
        self.max_opened = count;
        self
    }

    /// Set the batch size for on-demand growth.
    #[must_use]
    pub fn inc_step(mut self, count: u32) -> Self {
        self.inc_step = count;
        self
    }

    /// Set the idle eviction timeout.
    #[must_use]
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set the maintainer period.
    #[must_use]
    pub fn maintenance_interval(mut self, interval: Duration) -> Self {
        self.maintenance_interval = interval;
        self
    }

    /// Set the multiplexed session refresh age.
    #[must_use]
    pub fn multiplexed_session_refresh_interval(mut self, interval: Duration) -> Self {
        self.multiplexed_session_refresh_interval = interval;
        self
    }

    /// Enable or disable the multiplexed session.
    #[must_use]
    pub fn enable_multiplexed_session(mut self, enabled: bool) -> Self {
        self.enable_multiplexed_session = enabled;
        self
    }

    /// Enable or disable multiplexed read-write transactions.
    #[must_use]
    pub fn enable_multiplexed_session_for_rw(mut self, enabled: bool) -> Self {
        self.enable_multiplexed_session_for_rw = enabled;
        self
    }

    /// Set the backoff used after failed background creations.
    #[must_use]
    pub fn creation_backoff(mut self, backoff: Backoff) -> Self {
        self.creation_backoff = backoff;
        self
    }

    /// Set the leaked-session threshold.
    #[must_use]
    pub fn leaked_session_threshold(mut self, threshold: Duration) -> Self {
        self.leaked_session_threshold = threshold;
        self
    }

    /// Set the leaked-session action.
    #[must_use]
    pub fn leaked_session_action(mut self, action: LeakedSessionAction) -> Self {
        self.leaked_session_action = action;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.max_opened == 0 {
            return Err(PoolError::Configuration(
                "max_opened must be greater than 0".into(),
            ));
        }
        if self.min_opened > self.max_opened {
            return Err(PoolError::Configuration(
                "min_opened cannot be greater than max_opened".into(),
            ));
        }
        if self.inc_step == 0 {
            return Err(PoolError::Configuration(
                "inc_step must be greater than 0".into(),
            ));
        }
        if self.maintenance_interval.is_zero() {
            return Err(PoolError::Configuration(
                "maintenance_interval must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

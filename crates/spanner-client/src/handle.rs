//! Sessions as held by operations.

use std::sync::Arc;

use spanner_session_pool::{PooledSession, Session, SessionPool};
use spanner_transport::Context;
use tracing::debug;

use crate::error::Error;

/// A session in use by one operation: either borrowed from the pool or the
/// shared multiplexed session.
#[derive(Debug)]
pub(crate) enum SessionHandle {
    Pooled(PooledSession),
    Multiplexed(Arc<Session>),
}

impl SessionHandle {
    /// Get a session, preferring the multiplexed one when asked to.
    pub(crate) async fn acquire(
        pool: &SessionPool,
        ctx: &Context,
        multiplexed: bool,
    ) -> Result<Self, Error> {
        if multiplexed {
            Ok(Self::Multiplexed(pool.acquire_multiplexed(ctx).await?))
        } else {
            Ok(Self::Pooled(pool.acquire(ctx).await?))
        }
    }

    pub(crate) fn session(&self) -> &Session {
        match self {
            Self::Pooled(s) => s.session().as_ref(),
            Self::Multiplexed(s) => s.as_ref(),
        }
    }

    pub(crate) fn name(&self) -> &str {
        self.session().name()
    }

    pub(crate) fn channel_id(&self) -> u32 {
        self.session().channel_id()
    }

    pub(crate) fn is_multiplexed(&self) -> bool {
        matches!(self, Self::Multiplexed(_))
    }

    /// Give up a session the server no longer knows.
    pub(crate) fn discard(self, pool: &SessionPool) {
        debug!(session_id = self.name(), "discarding session");
        match self {
            Self::Pooled(mut session) => {
                let _ = session.destroy();
            }
            Self::Multiplexed(session) => pool.invalidate_multiplexed(&session),
        }
    }
}

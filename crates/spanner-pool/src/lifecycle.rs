//! Session lifecycle strategy.
//!
//! The pool never issues RPCs itself. Creating and deleting sessions is
//! delegated to a [`SessionFactory`] supplied at construction, which keeps
//! the pool independent of request stamping, channel selection and the
//! transport, and lets tests drive it with a scripted factory.

use async_trait::async_trait;
use spanner_transport::Context;

use crate::error::PoolError;
use crate::session::Session;

/// Creates and deletes sessions on behalf of the pool.
///
/// Uses `#[async_trait]` for trait object compatibility; the pool stores an
/// `Arc<dyn SessionFactory>`.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    /// Create `count` regular sessions.
    ///
    /// Implementations may spread the sessions over several channels. They
    /// should return exactly `count` sessions or an error; a shorter vector
    /// is accepted and the pool accounts only for what it received.
    async fn batch_create(&self, ctx: &Context, count: u32) -> Result<Vec<Session>, PoolError>;

    /// Create one multiplexed session.
    async fn create_multiplexed(&self, ctx: &Context) -> Result<Session, PoolError>;

    /// Delete a session on the server.
    async fn delete(&self, ctx: &Context, session: &Session) -> Result<(), PoolError>;
}

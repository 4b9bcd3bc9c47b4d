//! # spanner-session-pool
//!
//! Purpose-built session pool for Spanner with a multiplexed-session fast
//! path.
//!
//! Creating a session is a fallible RPC with noticeable latency, so sessions
//! are created in batches and reused across callers. Regular sessions serve
//! one transaction at a time; the single multiplexed session is shared by
//! any number of concurrent operations.
//!
//! ## Features
//!
//! - Batch creation of up to `inc_step` sessions on demand
//! - Bounded waits when the pool is full, ended by release or cancellation
//! - Background top-up to `min_opened` and idle eviction
//! - Multiplexed session created on first use and refreshed by age
//! - Leaked-session detection
//!
//! ## Example
//!
//! ```rust,ignore
//! use spanner_session_pool::SessionPool;
//! use spanner_transport::Context;
//!
//! let pool = SessionPool::builder()
//!     .factory(factory)
//!     .min_opened(10)
//!     .max_opened(100)
//!     .build()?;
//!
//! let session = pool.acquire(&Context::background()).await?;
//! // Use session...
//! // Session automatically returned to pool on drop
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod config;
pub mod error;
pub mod lifecycle;
mod maintainer;
pub mod pool;
pub mod session;

pub use config::{LeakedSessionAction, SessionPoolConfig};
pub use error::PoolError;
pub use lifecycle::SessionFactory;
pub use pool::{PoolStatus, PooledSession, SessionPool, SessionPoolBuilder};
pub use session::{Session, SessionKind};

//! # spanner-transport
//!
//! The boundary between the session runtime and the wire.
//!
//! The runtime never talks to a network stack directly. Every RPC goes
//! through the object-safe [`SpannerRpc`] trait, one implementation per
//! channel, so a real gRPC stub and the in-memory test server are
//! interchangeable.
//!
//! ## Architecture
//!
//! ```text
//! Pool / Client → ChannelPool → Channel(id) → dyn SpannerRpc
//!                      ▲
//!              Context (cancel + deadline), Backoff
//! ```
//!
//! ### Cancellation
//!
//! Every blocking operation takes a [`Context`]. A context carries a
//! cancellation token and an optional deadline; child contexts created with
//! [`Context::with_cancel`] or [`Context::with_timeout`] are cancelled when
//! their parent is.
//!
//! ```rust,ignore
//! use spanner_transport::Context;
//! use std::time::Duration;
//!
//! let (ctx, cancel) = Context::background().with_cancel();
//! tokio::spawn(async move {
//!     tokio::time::sleep(Duration::from_secs(5)).await;
//!     cancel.cancel();
//! });
//! let session = pool.acquire(&ctx).await?;
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod backoff;
pub mod channel;
pub mod context;
pub mod error;
pub mod metadata;
pub mod rpc;

pub use backoff::Backoff;
pub use channel::{Channel, ChannelPool};
pub use context::{CancelHandle, Context};
pub use error::ContextError;
pub use metadata::CallMetadata;
pub use rpc::{BatchWriteStream, PartialResultStream, ServerStream, SpannerRpc, VecStream};

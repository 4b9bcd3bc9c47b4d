//! # spanner-client
//!
//! Resilient async client runtime for Spanner.
//!
//! This is the primary public API surface of the workspace. It sits on top of
//! the session pool and turns unreliable RPCs into operations that either
//! complete once or fail with a classified error.
//!
//! ## Features
//!
//! - **Request ids**: Every RPC attempt carries a unique, ordered id that
//!   survives into errors
//! - **Resumable streams**: Query and read results resume from the last
//!   resume token without duplicating or losing rows
//! - **Transaction retries**: Aborted read-write transactions are replayed
//!   with the server's retry delay
//! - **Inline begin**: The first statement of a transaction begins it,
//!   saving a round trip
//! - **Multiplexed sessions**: Reads and, where supported, read-write
//!   transactions share one session
//!
//! ## Stream Decoder States
//!
//! ```text
//! Unconnected -> QueueingRetryable (stream opened)
//! QueueingRetryable -> QueueingUnretryable (buffer exceeded without a token)
//! QueueingUnretryable -> QueueingRetryable (resume token received)
//! any -> Finished | Aborted
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use spanner_client::{Client, ClientConfig};
//! use spanner_protocol::Statement;
//! use spanner_transport::Context;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ClientConfig::new("projects/p/instances/i/databases/d");
//!     let client = Client::new(config, channels)?;
//!     let ctx = Context::background();
//!
//!     let mut rows = client.single().query(&ctx, Statement::new("SELECT 1")).await?;
//!     while let Some(row) = rows.next().await {
//!         let value: i64 = row?.get(0)?;
//!         println!("{value}");
//!     }
//!
//!     client
//!         .read_write_transaction(&ctx, |tx| {
//!             let ctx = ctx.clone();
//!             async move {
//!                 tx.update(&ctx, Statement::new("UPDATE T SET V = V + 1 WHERE K = 1")).await?;
//!                 Ok(())
//!             }
//!         })
//!         .await?;
//!
//!     client.close().await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod batch;
pub mod client;
pub mod config;
pub mod decoder;
pub mod error;
mod handle;
pub mod options;
pub mod read_only;
pub mod read_write;
pub mod request_id;
pub mod row;
mod runner;
pub mod session_client;
mod stream;

pub use batch::{BatchPartition, BatchReadOnlyTransaction};
pub use client::Client;
pub use config::{ClientConfig, DEFAULT_MAX_BYTES_BETWEEN_RESUME_TOKENS, RpcRetryPolicy};
pub use decoder::{
    DecoderEvent, DecoderOptions, DecoderState, PendingResultQueue, ResumableStreamDecoder,
    StreamSource,
};
pub use error::{Error, Result};
pub use options::{ApplyOptions, BeginMode, CommitOptions, CommitResult, ReadWriteOptions};
pub use read_only::ReadOnlyTransaction;
pub use read_write::ReadWriteTransaction;
pub use request_id::{ClientIdAllocator, ProcessId, RequestIdGenerator, SequentialClientIds};
pub use row::{Row, RowIterator};
pub use session_client::SessionClient;
pub use spanner_session_pool::{PoolStatus, SessionPoolConfig};

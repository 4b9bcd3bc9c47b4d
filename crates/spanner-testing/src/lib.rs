//! # spanner-testing
//!
//! Test infrastructure for the Spanner session runtime.
//!
//! This crate provides an in-memory server implementing the RPC seam, so
//! pools, streams and transactions can be exercised without a network or an
//! emulator.
//!
//! ## Features
//!
//! - Mock server with session and transaction bookkeeping
//! - Scripted query, read and DML results with resume tokens
//! - Error injection per method and mid-stream
//! - Call recording, including request-id headers
//! - Test fixture utilities
//!
//! ## Mock Server Example
//!
//! ```rust,ignore
//! use spanner_testing::{Method, MockSpannerServer, SingersFixture};
//!
//! #[tokio::test]
//! async fn test_with_mock_server() {
//!     let server = Arc::new(MockSpannerServer::new());
//!     server.set_query("SELECT * FROM Singers", SingersFixture::new(3).results());
//!
//!     let client = Client::new(ClientConfig::new(TEST_DATABASE), vec![server.clone()]).unwrap();
//!     // ...
//!     assert_eq!(server.call_count(Method::ExecuteStreamingSql), 1);
//! }
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod fixtures;
pub mod mock_server;

pub use fixtures::{SingersFixture, TEST_DATABASE, int_fields, partial};
pub use mock_server::{Method, MockResults, MockSpannerServer, RecordedCall, RecordedRequest};

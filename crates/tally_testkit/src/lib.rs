//! # Tally Testkit
//!
//! Test utilities for the Tally sync engine.
//!
//! This crate provides:
//! - [`FakeServer`], an in-memory authoritative server with fault injection
//! - Entity fixtures and [`TestClient`], a coordinator wired to a fake server
//! - Property-based generators, including random client operation sequences
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tally_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn offline_edits_reach_the_server() {
//!     let client = TestClient::memory(Arc::new(FakeServer::new()));
//!     client.server.set_offline(true);
//!     // ... mutate, sync, go online, sync again
//!     assert_converged(&client);
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fake_server;
pub mod fixtures;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fake_server::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
}

pub use fake_server::FakeServer;
pub use fixtures::{assert_converged, challenge, entry, follow, TestClient, TOKEN};
pub use generators::{
    client_op_strategy, client_ops_strategy, color_strategy, date_strategy, feeling_strategy,
    name_strategy, new_challenge_strategy, timeframe_strategy, ClientOp,
};

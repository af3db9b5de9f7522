//! Shared test utilities for postflow integration tests.
//!
//! This crate provides:
//! - [`Harness`]: every pipeline component wired over in-memory backends and a
//!   [`ManualClock`](postflow_core::ManualClock)
//! - Factory functions for profiles, templates and ledger items
//! - [`FailingLedgerStore`]: a ledger wrapper that fails chosen mutations
//!
//! # Example
//!
//! ```rust,ignore
//! use postflow_test_utils::{Harness, profile};
//! use postflow_pipeline::ledger::DistributionChannel;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let harness = Harness::new(vec![profile("acct", "p1", DistributionChannel::Blog, 0)]);
//!     let ledger_id = harness.ingest("async rust").await;
//!     // ... advance and assert ...
//! }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![allow(clippy::must_use_candidate)]
// Test utilities use expect/unwrap for cleaner test code - panics are acceptable in tests
#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::missing_panics_doc)]

pub mod fixtures;
pub mod harness;
pub mod storage;

pub use fixtures::*;
pub use harness::*;
pub use storage::*;

/// Initialize test logging (call once per test module).
pub fn init_test_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("postflow=debug".parse().expect("valid directive")),
        )
        .with_test_writer()
        .try_init();
}

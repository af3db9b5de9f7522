//! # postflow-core
//!
//! Store-agnostic coordination primitives for the postflow publishing pipeline.
//!
//! Every worker process in a postflow deployment coordinates exclusively through
//! single-row conditional writes. This crate provides the pieces that make those
//! writes safe without a central scheduler:
//!
//! - **Versioned records**: [`VersionedRecordStore`] abstracts compare-and-swap over
//!   any backing store (key-value table, relational row with a version column)
//! - **Leases**: [`LeaseManager`] grants time-bounded, CAS-protected ownership of a
//!   lock domain key, used both for per-resource locks and singleton daemons
//! - **Bounded polling**: [`poll_until`] waits for external completion with a deadline
//!   and backoff, returning a tri-state [`PollOutcome`]
//! - **Idempotent keys**: deterministic identifiers so re-running a stage never
//!   duplicates records
//! - **Backpressure**: backlog thresholds for load-shedding at ingestion
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use postflow_core::{LeaseManager, LeaseRecord, ManualClock, MemoryVersionedStore};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> postflow_core::Result<()> {
//! let clock = Arc::new(ManualClock::new(1_000));
//! let leases = LeaseManager::new(
//!     Arc::new(MemoryVersionedStore::<LeaseRecord>::new()),
//!     clock.clone(),
//! );
//!
//! let first = leases.try_acquire("daemon/reaper", "p1", Duration::from_secs(30)).await?;
//! assert!(first.is_granted());
//!
//! let second = leases.try_acquire("daemon/reaper", "p2", Duration::from_secs(30)).await?;
//! assert!(!second.is_granted());
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod backpressure;
pub mod clock;
pub mod error;
pub mod keys;
pub mod lease;
pub mod observability;
pub mod page;
pub mod polling;
pub mod versioned;

pub use backpressure::{BackpressureDecision, BacklogState};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Error, Result};
pub use lease::{AcquireOutcome, LeaseEntry, LeaseManager, LeaseRecord};
pub use page::Page;
pub use polling::{PollOutcome, PollPolicy, poll_until};
pub use versioned::{CasOutcome, MemoryVersionedStore, Versioned, VersionedRecordStore};

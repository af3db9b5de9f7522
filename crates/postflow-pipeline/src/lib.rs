//! # postflow-pipeline
//!
//! Ledger-driven content publishing pipeline.
//!
//! Raw triggers become [`ledger::LedgerItem`]s; every accepted ledger write
//! emits a change notification; workers consume those notifications and
//! advance the item through its stages until every required channel has
//! published.
//!
//! - **Ledger**: per-item record with independently versioned media, dispatch
//!   and publish sub-collections
//! - **Publisher assignment**: fairness-ordered profile selection under
//!   lease-based locks
//! - **Orchestrator**: six idempotent stages, safe under redelivery and
//!   concurrent workers
//! - **Change stream**: at-least-once consumption with visibility timeouts
//! - **Heartbeat reaper**: a singleton daemon that nudges live items and
//!   reports stalled ones
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use postflow_core::SystemClock;
//! use postflow_pipeline::config::PipelineConfig;
//! use postflow_pipeline::ledger::MediaFormat;
//! use postflow_pipeline::templates::PromptTemplate;
//! use postflow_pipeline::worker::LocalBackends;
//! use tokio_util::sync::CancellationToken;
//!
//! # #[tokio::main]
//! # async fn main() -> postflow_pipeline::Result<()> {
//! let backends = LocalBackends::new(
//!     Arc::new(SystemClock),
//!     PipelineConfig::default(),
//!     vec![PromptTemplate::new("blog", MediaFormat::Article, "explain {content}")],
//!     Vec::new(),
//! )?;
//! backends.worker("worker-1").run(CancellationToken::new()).await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod channels;
pub mod config;
pub mod error;
pub mod generator;
pub mod heartbeat;
pub mod ingest;
pub mod leader;
pub mod ledger;
pub mod metrics;
pub mod orchestrator;
pub mod publisher;
pub mod resolver;
pub mod stream;
pub mod templates;
pub mod worker;

pub use error::{Error, Result};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::channels::{ChannelDriver, ChannelRegistry};
    pub use crate::config::PipelineConfig;
    pub use crate::error::{Error, Result};
    pub use crate::generator::MediaGenerator;
    pub use crate::heartbeat::{HeartbeatReaper, HeartbeatStore, SweepOutcome};
    pub use crate::ingest::{IngestOutcome, IngestSource, Ingestor};
    pub use crate::leader::{DaemonLease, LeadershipResult};
    pub use crate::ledger::{
        DistributionChannel, LedgerItem, LedgerMutation, LedgerStore, MutationOutcome,
        PublishStatus,
    };
    pub use crate::metrics::PipelineMetrics;
    pub use crate::orchestrator::{AdvanceReport, Orchestrator, OrchestratorDeps};
    pub use crate::publisher::{AccountPublisher, PublisherStore};
    pub use crate::resolver::{AssignOutcome, PublisherResolver};
    pub use crate::stream::{ChangeHandler, ChangeQueue, ChangeStreamConsumer};
    pub use crate::templates::PromptTemplate;
    pub use crate::worker::{LocalBackends, Worker};
}

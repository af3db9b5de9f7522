//! Worker composition root.
//!
//! A [`Worker`] runs the change-stream consumer and the heartbeat reaper side
//! by side until cancelled. [`LocalBackends`] wires every component over the
//! in-memory stores and collaborators, for local runs and tests; several
//! orchestrators or reapers with different process ids can share one set of
//! backends to stand in for separate worker processes.

use std::sync::Arc;

use postflow_core::{Clock, LeaseManager, LeaseRecord, MemoryVersionedStore};
use tokio_util::sync::CancellationToken;

use crate::channels::{ChannelDriver, ChannelRegistry, InMemoryChannelDriver};
use crate::config::PipelineConfig;
use crate::error::{Error, Result};
use crate::generator::{InMemoryMediaGenerator, ScriptShape};
use crate::heartbeat::{HeartbeatReaper, MemoryHeartbeatStore};
use crate::ingest::{Ingestor, SourceRegistry};
use crate::leader::DaemonLease;
use crate::ledger::{DistributionChannel, MemoryLedgerStore};
use crate::orchestrator::{Orchestrator, OrchestratorDeps};
use crate::publisher::{AccountPublisher, MemoryPublisherStore};
use crate::resolver::PublisherResolver;
use crate::stream::{ChangeFeed, ChangeStreamConsumer, InMemoryChangeQueue};
use crate::templates::PromptTemplate;

/// Consumer and reaper of one worker process.
#[derive(Debug, Clone)]
pub struct Worker {
    consumer: ChangeStreamConsumer,
    reaper: HeartbeatReaper,
}

impl Worker {
    /// Creates a worker.
    #[must_use]
    pub const fn new(consumer: ChangeStreamConsumer, reaper: HeartbeatReaper) -> Self {
        Self { consumer, reaper }
    }

    /// Runs the consumer and the reaper until `cancel` fires.
    ///
    /// Both finish their current batch or sweep; the reaper then releases its
    /// daemon lease.
    ///
    /// # Errors
    ///
    /// Returns the first error either loop reports on shutdown.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        tracing::info!("worker started");
        let (consumed, reaped) = tokio::join!(
            self.consumer.run(cancel.clone()),
            self.reaper.run(cancel)
        );
        tracing::info!("worker stopped");
        consumed.and(reaped)
    }
}

/// Every component of the pipeline over in-memory backends.
pub struct LocalBackends {
    /// Time source shared by every component.
    pub clock: Arc<dyn Clock>,
    /// Validated configuration.
    pub config: PipelineConfig,
    /// Change queue fed by the ledger.
    pub queue: Arc<InMemoryChangeQueue>,
    /// Feed writing into `queue`.
    pub feed: ChangeFeed,
    /// Ledger store emitting into `feed`.
    pub ledger: Arc<MemoryLedgerStore>,
    /// Publisher profiles and their lock fields.
    pub publishers: Arc<MemoryPublisherStore>,
    /// Heartbeat index.
    pub heartbeats: Arc<MemoryHeartbeatStore>,
    /// Lease manager for daemon ownership.
    pub daemon_leases: LeaseManager,
    /// Media generation service.
    pub generator: Arc<InMemoryMediaGenerator>,
    /// One driver per channel.
    pub drivers: Vec<Arc<InMemoryChannelDriver>>,
    /// Prompt templates.
    pub templates: Vec<PromptTemplate>,
}

impl std::fmt::Debug for LocalBackends {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalBackends")
            .field("config", &self.config)
            .field("templates", &self.templates.len())
            .finish_non_exhaustive()
    }
}

impl LocalBackends {
    /// Wires in-memory backends with a generator that completes every request
    /// on submission.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the configuration is invalid or no
    /// template is given.
    pub fn new(
        clock: Arc<dyn Clock>,
        config: PipelineConfig,
        templates: Vec<PromptTemplate>,
        profiles: Vec<AccountPublisher>,
    ) -> Result<Self> {
        let generator = Arc::new(InMemoryMediaGenerator::auto_complete(
            clock.clone(),
            ScriptShape::default(),
        ));
        Self::with_generator(clock, config, templates, profiles, generator)
    }

    /// Wires in-memory backends around a caller-supplied generator.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the configuration is invalid or no
    /// template is given.
    pub fn with_generator(
        clock: Arc<dyn Clock>,
        config: PipelineConfig,
        templates: Vec<PromptTemplate>,
        profiles: Vec<AccountPublisher>,
        generator: Arc<InMemoryMediaGenerator>,
    ) -> Result<Self> {
        config.validate()?;
        if templates.is_empty() {
            return Err(Error::configuration("at least one prompt template is required"));
        }

        let queue = Arc::new(InMemoryChangeQueue::new(clock.clone()));
        let feed = ChangeFeed::new(queue.clone(), config.consumer.topic.clone(), clock.clone());
        let ledger = Arc::new(MemoryLedgerStore::with_change_feed(feed.clone()));
        let publishers = Arc::new(MemoryPublisherStore::with_profiles(profiles));
        let heartbeats = Arc::new(MemoryHeartbeatStore::new(clock.clone()));
        let daemon_leases = LeaseManager::new(
            Arc::new(MemoryVersionedStore::<LeaseRecord>::new()),
            clock.clone(),
        );
        let drivers = DistributionChannel::ALL
            .into_iter()
            .map(|channel| Arc::new(InMemoryChannelDriver::new(channel)))
            .collect();

        Ok(Self {
            clock,
            config,
            queue,
            feed,
            ledger,
            publishers,
            heartbeats,
            daemon_leases,
            generator,
            drivers,
            templates,
        })
    }

    /// The in-memory driver for `channel`.
    #[must_use]
    pub fn driver(&self, channel: DistributionChannel) -> Option<&Arc<InMemoryChannelDriver>> {
        self.drivers.iter().find(|d| d.channel() == channel)
    }

    /// Registry over every driver.
    #[must_use]
    pub fn channel_registry(&self) -> ChannelRegistry {
        let mut registry = ChannelRegistry::new();
        for driver in &self.drivers {
            registry.register(driver.clone());
        }
        registry
    }

    /// An orchestrator acting as worker `process_id`.
    #[must_use]
    pub fn orchestrator(&self, process_id: &str) -> Orchestrator {
        self.orchestrator_with_channels(process_id, self.channel_registry())
    }

    /// An orchestrator with a custom set of channel drivers.
    #[must_use]
    pub fn orchestrator_with_channels(
        &self,
        process_id: &str,
        channels: ChannelRegistry,
    ) -> Orchestrator {
        let locks = LeaseManager::new(self.publishers.clone(), self.clock.clone());
        let resolver = PublisherResolver::new(
            self.publishers.clone(),
            locks,
            self.clock.clone(),
            self.config.stages.resolver_page_size,
            self.config.stages.resolver_race_retries,
        );
        Orchestrator::new(OrchestratorDeps {
            ledger: self.ledger.clone(),
            publishers: self.publishers.clone(),
            resolver,
            generator: self.generator.clone(),
            channels,
            templates: self.templates.clone(),
            clock: self.clock.clone(),
            stages: self.config.stages.clone(),
            locks: self.config.locks.clone(),
            process_id: process_id.to_string(),
        })
    }

    /// A heartbeat reaper acting as worker `process_id`.
    #[must_use]
    pub fn reaper(&self, process_id: &str) -> HeartbeatReaper {
        let lease = DaemonLease::new(
            self.daemon_leases.clone(),
            self.config.reaper.daemon_name.clone(),
            process_id,
            self.config.reaper.lease_ttl(),
        );
        HeartbeatReaper::new(
            lease,
            self.heartbeats.clone(),
            self.ledger.clone(),
            self.feed.clone(),
            self.clock.clone(),
            self.config.reaper.clone(),
        )
    }

    /// An ingestor writing into the ledger, shedding on the change queue depth.
    #[must_use]
    pub fn ingestor(&self) -> Ingestor {
        Ingestor::new(
            self.ledger.clone(),
            self.queue.clone(),
            self.heartbeats.clone(),
            SourceRegistry::with_defaults(),
            self.clock.clone(),
            self.config.consumer.topic.clone(),
            self.config.ingest.clone(),
            self.config.reaper.clone(),
        )
    }

    /// A full worker acting as `process_id`.
    #[must_use]
    pub fn worker(&self, process_id: &str) -> Worker {
        let consumer = ChangeStreamConsumer::new(
            self.queue.clone(),
            Arc::new(self.orchestrator(process_id)),
            self.config.consumer.clone(),
        );
        Worker::new(consumer, self.reaper(process_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use postflow_core::ManualClock;

    use crate::ledger::MediaFormat;

    fn templates() -> Vec<PromptTemplate> {
        vec![PromptTemplate::new("blog", MediaFormat::Article, "write about {content}")]
    }

    #[test]
    fn rejects_missing_templates() {
        let clock = Arc::new(ManualClock::new(0));
        let err = LocalBackends::new(clock, PipelineConfig::default(), Vec::new(), Vec::new())
            .expect_err("templates required");
        assert!(matches!(err, Error::Configuration { .. }));
    }

    #[test]
    fn registers_a_driver_per_channel() -> Result<()> {
        let clock = Arc::new(ManualClock::new(0));
        let backends = LocalBackends::new(clock, PipelineConfig::default(), templates(), Vec::new())?;
        let registry = backends.channel_registry();
        for channel in DistributionChannel::ALL {
            assert!(registry.get(channel).is_some());
            assert!(backends.driver(channel).is_some());
        }
        Ok(())
    }

    #[tokio::test]
    async fn worker_stops_on_cancel_and_releases_reaper_lease() -> Result<()> {
        let clock = Arc::new(ManualClock::new(0));
        let backends = LocalBackends::new(clock, PipelineConfig::default(), templates(), Vec::new())?;
        let cancel = CancellationToken::new();
        cancel.cancel();

        backends.worker("w1").run(cancel).await?;

        let other = backends.reaper("w2");
        assert!(matches!(
            other.sweep_once().await?,
            crate::heartbeat::SweepOutcome::Swept(_)
        ));
        Ok(())
    }
}

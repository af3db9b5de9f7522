//! Media generation collaborator.
//!
//! Generation itself happens elsewhere. The pipeline submits one request per
//! media event and later asks whether output exists; the output's blob
//! reference and, for scripts, the structured script are all it consumes.

pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use memory::{InMemoryMediaGenerator, ScriptShape};

use crate::error::Result;
use crate::ledger::{MediaEvent, MediaFormat, MediaOutput, MediaType};

/// A request to generate the media for one event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// Owning ledger item, for correlation.
    pub ledger_id: String,
    /// Media event to generate; submissions are idempotent on this id.
    pub media_event_id: String,
    /// Kind of media.
    pub media_type: MediaType,
    /// Root format.
    pub format: MediaFormat,
    /// Content language.
    pub language: String,
    /// Content niche.
    pub niche: String,
    /// Generation prompt.
    pub prompt: String,
    /// Content lookup keys to compose, for render requests.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<String>,
}

impl GenerationRequest {
    /// Builds the request for a media event.
    #[must_use]
    pub fn for_event(event: &MediaEvent) -> Self {
        Self {
            ledger_id: event.ledger_id.clone(),
            media_event_id: event.event_id.clone(),
            media_type: event.media_type,
            format: event.format,
            language: event.language.clone(),
            niche: event.niche.clone(),
            prompt: event.prompt.clone(),
            inputs: event.inputs.clone(),
        }
    }
}

/// External media generation service.
#[async_trait]
pub trait MediaGenerator: Send + Sync {
    /// Submits a request. Resubmitting the same media event id is a no-op.
    async fn submit(&self, request: GenerationRequest) -> Result<()>;

    /// Returns the output once generation has finished.
    async fn poll(&self, media_event_id: &str) -> Result<Option<MediaOutput>>;
}

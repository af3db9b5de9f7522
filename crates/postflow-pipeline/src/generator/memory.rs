//! In-memory media generator.
//!
//! In auto-complete mode every submission finishes immediately with a
//! synthetic blob key; scripts get a structured output of the configured
//! [`ScriptShape`]. In manual mode outputs appear only through
//! [`InMemoryMediaGenerator::complete`]. [`InMemoryMediaGenerator::hold_renders`]
//! keeps final renders pending in either mode.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use postflow_core::Clock;

use super::{GenerationRequest, MediaGenerator};
use crate::error::{Error, Result};
use crate::ledger::{MediaOutput, MediaType, ScriptOutput};

/// Shape of synthesized script outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScriptShape {
    /// Image prompts per script.
    pub images: usize,
    /// Narration segments per script.
    pub narration_segments: usize,
    /// Whether a background prompt is produced.
    pub background: bool,
}

impl Default for ScriptShape {
    fn default() -> Self {
        Self {
            images: 2,
            narration_segments: 1,
            background: true,
        }
    }
}

#[derive(Debug, Default)]
struct GeneratorState {
    submissions: Vec<GenerationRequest>,
    outputs: HashMap<String, MediaOutput>,
}

/// In-memory [`MediaGenerator`].
pub struct InMemoryMediaGenerator {
    clock: Arc<dyn Clock>,
    auto_complete: bool,
    hold_renders: AtomicBool,
    shape: ScriptShape,
    state: Mutex<GeneratorState>,
}

impl std::fmt::Debug for InMemoryMediaGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryMediaGenerator")
            .field("auto_complete", &self.auto_complete)
            .field("hold_renders", &self.hold_renders.load(Ordering::SeqCst))
            .field("shape", &self.shape)
            .finish_non_exhaustive()
    }
}

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::collaborator("media generator", "state lock poisoned")
}

impl InMemoryMediaGenerator {
    /// Creates a generator that completes every request on submission.
    #[must_use]
    pub fn auto_complete(clock: Arc<dyn Clock>, shape: ScriptShape) -> Self {
        Self {
            clock,
            auto_complete: true,
            hold_renders: AtomicBool::new(false),
            shape,
            state: Mutex::default(),
        }
    }

    /// Creates a generator whose outputs are supplied with [`Self::complete`].
    #[must_use]
    pub fn manual(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            auto_complete: false,
            hold_renders: AtomicBool::new(false),
            shape: ScriptShape::default(),
            state: Mutex::default(),
        }
    }

    /// While set, render submissions are accepted but never completed on
    /// their own.
    pub fn hold_renders(&self, hold: bool) {
        self.hold_renders.store(hold, Ordering::SeqCst);
    }

    /// Records the output for a media event.
    ///
    /// # Errors
    ///
    /// Returns an error if the state lock is poisoned.
    pub fn complete(&self, media_event_id: &str, output: MediaOutput) -> Result<()> {
        let mut state = self.state.lock().map_err(poison_err)?;
        state.outputs.insert(media_event_id.to_string(), output);
        Ok(())
    }

    /// Every accepted submission, in order.
    ///
    /// # Errors
    ///
    /// Returns an error if the state lock is poisoned.
    pub fn submissions(&self) -> Result<Vec<GenerationRequest>> {
        Ok(self.state.lock().map_err(poison_err)?.submissions.clone())
    }

    /// Builds the output this generator would synthesize for a request.
    #[must_use]
    pub fn synthesize(&self, request: &GenerationRequest) -> MediaOutput {
        let script = (request.media_type == MediaType::Script).then(|| ScriptOutput {
            title: format!("{} / {}", request.niche, request.prompt),
            body: request.prompt.clone(),
            image_prompts: (0..self.shape.images)
                .map(|i| format!("{} image {i}", request.prompt))
                .collect(),
            narration_segments: (0..self.shape.narration_segments)
                .map(|i| format!("{} narration {i}", request.prompt))
                .collect(),
            background_prompt: self
                .shape
                .background
                .then(|| format!("{} background", request.prompt)),
        });
        MediaOutput {
            content_lookup_key: format!("blob://{}/{}", request.media_type, request.media_event_id),
            script,
            completed_at: self.clock.now_millis(),
        }
    }
}

#[async_trait]
impl MediaGenerator for InMemoryMediaGenerator {
    async fn submit(&self, request: GenerationRequest) -> Result<()> {
        let held = request.media_type == MediaType::Render && self.hold_renders.load(Ordering::SeqCst);
        let output = (self.auto_complete && !held).then(|| self.synthesize(&request));
        let mut state = self.state.lock().map_err(poison_err)?;
        if state
            .submissions
            .iter()
            .any(|s| s.media_event_id == request.media_event_id)
        {
            return Ok(());
        }
        if let Some(output) = output {
            state.outputs.insert(request.media_event_id.clone(), output);
        }
        state.submissions.push(request);
        Ok(())
    }

    async fn poll(&self, media_event_id: &str) -> Result<Option<MediaOutput>> {
        let state = self.state.lock().map_err(poison_err)?;
        Ok(state.outputs.get(media_event_id).cloned())
    }
}

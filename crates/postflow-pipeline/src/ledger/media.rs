//! Media events: the generation DAG of one ledger item.
//!
//! Each prompt template yields one root `script` event. Once the script output
//! arrives, enrichment derives its children (images, background video/audio,
//! narration). A final `render` event per assignment aggregates the children in
//! presentation order.

use std::fmt;

use postflow_core::keys::media_event_key;
use serde::{Deserialize, Serialize};

use crate::ledger::DistributionChannel;

/// Kind of media a node produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaType {
    /// Root script generated from a prompt template.
    Script,
    /// Still image.
    Image,
    /// Background video loop.
    BackgroundVideo,
    /// Background music.
    BackgroundAudio,
    /// Narration voice-over segment.
    Narration,
    /// Final composition.
    Render,
}

impl MediaType {
    /// Returns the lowercase identifier used in keys and logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Script => "script",
            Self::Image => "image",
            Self::BackgroundVideo => "background_video",
            Self::BackgroundAudio => "background_audio",
            Self::Narration => "narration",
            Self::Render => "render",
        }
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output format of a root media event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaFormat {
    /// Vertical short-form video.
    ShortVideo,
    /// Long-form article with illustrations.
    Article,
}

impl MediaFormat {
    /// Channels a root of this format must be published to.
    #[must_use]
    pub const fn channels(self) -> &'static [DistributionChannel] {
        match self {
            Self::ShortVideo => &[
                DistributionChannel::Youtube,
                DistributionChannel::Tiktok,
                DistributionChannel::Instagram,
            ],
            Self::Article => &[DistributionChannel::Blog],
        }
    }

    const fn uses_audio_visual(self) -> bool {
        matches!(self, Self::ShortVideo)
    }
}

/// Structured script produced by a root event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptOutput {
    /// Post title.
    pub title: String,
    /// Script or article body.
    pub body: String,
    /// One prompt per illustration.
    #[serde(default)]
    pub image_prompts: Vec<String>,
    /// Voice-over text, one entry per segment.
    #[serde(default)]
    pub narration_segments: Vec<String>,
    /// Prompt for background video and audio.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background_prompt: Option<String>,
}

/// Completed output of a media event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaOutput {
    /// External blob reference.
    pub content_lookup_key: String,
    /// Structured script, present for script events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<ScriptOutput>,
    /// Completion time in epoch milliseconds.
    pub completed_at: i64,
}

/// A node in the media DAG.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaEvent {
    /// Idempotent key, see [`media_event_key`].
    pub event_id: String,
    /// Owning ledger item.
    pub ledger_id: String,
    /// Kind of media.
    pub media_type: MediaType,
    /// Parent node, `None` for roots.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_event_id: Option<String>,
    /// Template that produced the root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,
    /// Format of the root this node belongs to.
    pub format: MediaFormat,
    /// Content language.
    pub language: String,
    /// Content niche.
    pub niche: String,
    /// Generation prompt.
    pub prompt: String,
    /// Content lookup keys this node composes, in presentation order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<String>,
    /// Order within its layer of the final composition.
    pub render_sequence: u32,
    /// Composition layer (0 = background).
    pub position_layer: u32,
    /// True for the final render node.
    pub is_final_render: bool,
    /// Assignment a render node belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignment_id: Option<String>,
    /// Output once generation completes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<MediaOutput>,
    /// Creation time in epoch milliseconds.
    pub created_at: i64,
}

impl MediaEvent {
    /// Builds a root script event for a rendered template prompt.
    ///
    /// The key covers the template id as well as the prompt, so two templates
    /// rendering the same text still get one root each.
    #[must_use]
    pub fn root(
        ledger_id: &str,
        template_id: &str,
        format: MediaFormat,
        language: &str,
        niche: &str,
        prompt: String,
        now: i64,
    ) -> Self {
        let seed = format!("{template_id}|{prompt}");
        Self {
            event_id: media_event_key(language, MediaType::Script, niche, &seed),
            ledger_id: ledger_id.to_string(),
            media_type: MediaType::Script,
            parent_event_id: None,
            template_id: Some(template_id.to_string()),
            format,
            language: language.to_string(),
            niche: niche.to_string(),
            prompt,
            inputs: Vec::new(),
            render_sequence: 0,
            position_layer: 0,
            is_final_render: false,
            assignment_id: None,
            output: None,
            created_at: now,
        }
    }

    fn child(&self, media_type: MediaType, prompt: &str, sequence: u32, layer: u32, now: i64) -> Self {
        let seed = format!("{}|{prompt}|{sequence}", self.event_id);
        Self {
            event_id: media_event_key(&self.language, media_type, &self.niche, &seed),
            ledger_id: self.ledger_id.clone(),
            media_type,
            parent_event_id: Some(self.event_id.clone()),
            template_id: None,
            format: self.format,
            language: self.language.clone(),
            niche: self.niche.clone(),
            prompt: prompt.to_string(),
            inputs: Vec::new(),
            render_sequence: sequence,
            position_layer: layer,
            is_final_render: false,
            assignment_id: None,
            output: None,
            created_at: now,
        }
    }

    /// Builds the final render node for one assignment of this root.
    ///
    /// `inputs` are the children's content lookup keys in presentation order.
    #[must_use]
    pub fn render(&self, assignment_id: &str, inputs: Vec<String>, now: i64) -> Self {
        let seed = format!("{}|{assignment_id}", self.event_id);
        let mut render = self.child(MediaType::Render, &seed, 0, u32::MAX, now);
        render.event_id = media_event_key(&self.language, MediaType::Render, &self.niche, &seed);
        render.prompt = self
            .output
            .as_ref()
            .and_then(|o| o.script.as_ref())
            .map(|s| s.title.clone())
            .unwrap_or_default();
        render.inputs = inputs;
        render.is_final_render = true;
        render.assignment_id = Some(assignment_id.to_string());
        render
    }

    /// Returns true for root script nodes.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.parent_event_id.is_none()
    }

    /// Returns true once generation output is recorded.
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.output.is_some()
    }

    /// Returns the external blob reference once generated.
    #[must_use]
    pub fn content_lookup_key(&self) -> Option<&str> {
        self.output.as_ref().map(|o| o.content_lookup_key.as_str())
    }

    /// Returns the structured script output of a root.
    #[must_use]
    pub fn script_output(&self) -> Option<&ScriptOutput> {
        self.output.as_ref().and_then(|o| o.script.as_ref())
    }
}

/// Derives the children a root expects from its script output.
///
/// Keys are derived from the parent id, prompt and sequence, so the result is
/// identical on every call.
#[must_use]
pub fn expected_children(root: &MediaEvent, script: &ScriptOutput, now: i64) -> Vec<MediaEvent> {
    let mut children = Vec::new();

    for (sequence, prompt) in (0u32..).zip(&script.image_prompts) {
        children.push(root.child(MediaType::Image, prompt, sequence, 1, now));
    }

    if root.format.uses_audio_visual() {
        for (sequence, segment) in (0u32..).zip(&script.narration_segments) {
            children.push(root.child(MediaType::Narration, segment, sequence, 2, now));
        }
        if let Some(background) = &script.background_prompt {
            children.push(root.child(MediaType::BackgroundVideo, background, 0, 0, now));
            children.push(root.child(MediaType::BackgroundAudio, background, 0, 3, now));
        }
    }

    children
}

/// A generation dispatch record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptEvent {
    /// Media event the request was dispatched for.
    pub media_event_id: String,
    /// Kind of media requested.
    pub media_type: MediaType,
    /// Worker that dispatched the request.
    pub process_id: String,
    /// Dispatch time in epoch milliseconds.
    pub dispatched_at: i64,
}

//! Prompt templates.
//!
//! A template turns a ledger item into the prompt of one root script event.
//! Placeholders `{content}`, `{niche}` and `{language}` are substituted
//! verbatim; anything else in braces is left alone.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::ledger::{LedgerItem, MediaEvent, MediaFormat};

/// One configured prompt template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptTemplate {
    /// Stable template id.
    pub template_id: String,
    /// Output format of roots built from this template.
    pub format: MediaFormat,
    /// Prompt text with placeholders.
    pub prompt: String,
}

impl PromptTemplate {
    /// Creates a template.
    #[must_use]
    pub fn new(template_id: impl Into<String>, format: MediaFormat, prompt: impl Into<String>) -> Self {
        Self {
            template_id: template_id.into(),
            format,
            prompt: prompt.into(),
        }
    }

    /// Substitutes the item's fields into the prompt.
    #[must_use]
    pub fn render(&self, item: &LedgerItem) -> String {
        self.prompt
            .replace("{content}", &item.content)
            .replace("{niche}", &item.niche)
            .replace("{language}", &item.language)
    }

    /// The root script event this template derives for `item`.
    #[must_use]
    pub fn root_for(&self, item: &LedgerItem, now: i64) -> MediaEvent {
        MediaEvent::root(
            &item.ledger_id,
            &self.template_id,
            self.format,
            &item.language,
            &item.niche,
            self.render(item),
            now,
        )
    }
}

/// Parses a JSON array of templates and checks ids are unique.
///
/// # Errors
///
/// Returns [`Error::Configuration`] on bad JSON, an empty list or a repeated id.
pub fn parse_templates(json: &str) -> Result<Vec<PromptTemplate>> {
    let templates: Vec<PromptTemplate> = serde_json::from_str(json)
        .map_err(|e| Error::configuration(format!("prompt templates: {e}")))?;
    if templates.is_empty() {
        return Err(Error::configuration("at least one prompt template is required"));
    }
    let mut seen = std::collections::HashSet::new();
    for template in &templates {
        if !seen.insert(template.template_id.as_str()) {
            return Err(Error::configuration(format!(
                "duplicate template id '{}'",
                template.template_id
            )));
        }
    }
    Ok(templates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::{EventPayload, IngestSource};

    fn item() -> LedgerItem {
        LedgerItem::new(
            "L1",
            IngestSource::Manual,
            EventPayload {
                language: "en".into(),
                niche: "tech".into(),
                content: "borrow checker".into(),
            },
            serde_json::Value::Null,
            "hash",
            0,
        )
    }

    #[test]
    fn placeholders_are_substituted() {
        let template = PromptTemplate::new(
            "t1",
            MediaFormat::Article,
            "Write about {content} for {niche} readers in {language}. {unknown}",
        );
        assert_eq!(
            template.render(&item()),
            "Write about borrow checker for tech readers in en. {unknown}"
        );
    }

    #[test]
    fn root_keys_are_stable() {
        let template = PromptTemplate::new("t1", MediaFormat::ShortVideo, "{content}");
        let a = template.root_for(&item(), 1);
        let b = template.root_for(&item(), 2);
        assert_eq!(a.event_id, b.event_id);
        assert_eq!(a.template_id.as_deref(), Some("t1"));
    }

    #[test]
    fn templates_sharing_a_prompt_get_distinct_roots() {
        let article = PromptTemplate::new("long", MediaFormat::Article, "{content}");
        let video = PromptTemplate::new("short", MediaFormat::ShortVideo, "{content}");
        let a = article.root_for(&item(), 0);
        let b = video.root_for(&item(), 0);
        assert_eq!(a.prompt, b.prompt);
        assert_ne!(a.event_id, b.event_id);
    }

    #[test]
    fn duplicate_template_ids_are_rejected() {
        let json = r#"[
            {"template_id":"a","format":"article","prompt":"x"},
            {"template_id":"a","format":"short_video","prompt":"y"}
        ]"#;
        assert!(parse_templates(json).is_err());
        assert!(parse_templates("[]").is_err());
    }
}

//! Chat text → one `Intent`.
//!
//! Deterministic rules run first; only when none claims the message is the
//! language model asked.  Any model failure degrades to `GeneralChat`.

pub mod model;
pub mod rules;

use std::sync::Arc;

use dj_proto::config::Personality;
use dj_proto::vibes::{normalize, VibeCatalog};
use tracing::{debug, warn};

use crate::conversation::ConversationContext;
use crate::llm::LanguageModel;
use rules::Rule;

#[derive(Debug, Clone, PartialEq)]
pub enum Intent {
    SongRequest { query: String },
    VibeRequest { vibe: String },
    StatusNow,
    StatusNext,
    Help,
    /// `response` is a canned reply supplied by the classifier, if any.
    GeneralChat { response: Option<String> },
}

impl Intent {
    pub fn label(&self) -> &'static str {
        match self {
            Intent::SongRequest { .. } => "song_request",
            Intent::VibeRequest { .. } => "vibe_request",
            Intent::StatusNow => "status_now",
            Intent::StatusNext => "status_next",
            Intent::Help => "help",
            Intent::GeneralChat { .. } => "general_chat",
        }
    }
}

pub struct IntentPipeline {
    rules: Vec<Rule>,
    model: Option<Arc<dyn LanguageModel>>,
    personality: Personality,
}

impl IntentPipeline {
    pub fn new(model: Option<Arc<dyn LanguageModel>>, personality: Personality) -> Self {
        Self {
            rules: rules::RULES.to_vec(),
            model,
            personality,
        }
    }

    /// Rules only, no model.
    pub fn resolve_rules(&self, text: &str, catalog: &VibeCatalog) -> Option<Intent> {
        let normalized = normalize(text);
        if normalized.is_empty() {
            return None;
        }
        self.rules.iter().find_map(|rule| rule(&normalized, catalog))
    }

    pub async fn resolve(
        &self,
        text: &str,
        catalog: &VibeCatalog,
        context: &ConversationContext,
    ) -> Intent {
        if let Some(intent) = self.resolve_rules(text, catalog) {
            debug!(intent = intent.label(), "rule match");
            return intent;
        }

        let Some(model) = &self.model else {
            return Intent::GeneralChat { response: None };
        };

        let request = model::classify_prompt(&self.personality, text, context);
        let raw = match model.complete(&request).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(model = model.name(), error = %e, "intent classification failed");
                return Intent::GeneralChat { response: None };
            }
        };

        match model::parse_classification(&raw) {
            Ok(intent) => {
                debug!(intent = intent.label(), "model classification");
                intent
            }
            Err(e) => {
                warn!(error = %e, raw = %raw, "intent parse failed");
                Intent::GeneralChat { response: None }
            }
        }
    }
}

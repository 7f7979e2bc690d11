//! Rolling chat memory used as model context: a running summary plus the
//! most recent raw lines.

use std::collections::VecDeque;

use tracing::{debug, warn};

use crate::llm::{CompletionRequest, LanguageModel};

/// Raw lines kept in memory.
pub const HISTORY_LIMIT: usize = 100;
/// Raw lines handed to the model as context.
pub const CONTEXT_LINES: usize = 20;
/// Un-summarized lines that trigger a summary refresh.
pub const SUMMARY_BATCH: usize = 24;

#[derive(Debug, Clone, PartialEq)]
pub struct ChatLine {
    pub author: String,
    pub content: String,
    pub is_bot: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConversationContext {
    pub summary: String,
    pub last_messages: String,
}

#[derive(Debug)]
pub struct Conversation {
    dj_name: String,
    summary: String,
    lines: VecDeque<ChatLine>,
    /// Lines not yet folded into the summary, capped at `HISTORY_LIMIT`.
    unsummarized: VecDeque<ChatLine>,
}

impl Conversation {
    pub fn new(dj_name: impl Into<String>) -> Self {
        Self {
            dj_name: dj_name.into(),
            summary: String::new(),
            lines: VecDeque::new(),
            unsummarized: VecDeque::new(),
        }
    }

    pub fn add_user(&mut self, author: &str, content: &str) {
        self.push(ChatLine {
            author: author.to_string(),
            content: content.to_string(),
            is_bot: false,
        });
    }

    pub fn add_bot(&mut self, content: &str) {
        let author = self.dj_name.clone();
        self.push(ChatLine {
            author,
            content: content.to_string(),
            is_bot: true,
        });
    }

    fn push(&mut self, line: ChatLine) {
        self.unsummarized.push_back(line.clone());
        self.lines.push_back(line);
        while self.lines.len() > HISTORY_LIMIT {
            self.lines.pop_front();
        }
        while self.unsummarized.len() > HISTORY_LIMIT {
            self.unsummarized.pop_front();
        }
    }

    fn render(&self, line: &ChatLine) -> String {
        let who = if line.is_bot { &self.dj_name } else { &line.author };
        format!("{}: {}", who, line.content)
    }

    pub fn context(&self) -> ConversationContext {
        let skip = self.lines.len().saturating_sub(CONTEXT_LINES);
        let last_messages = self
            .lines
            .iter()
            .skip(skip)
            .map(|l| self.render(l))
            .collect::<Vec<_>>()
            .join("\n");
        ConversationContext {
            summary: self.summary.clone(),
            last_messages,
        }
    }

    pub fn summary(&self) -> &str {
        &self.summary
    }

    /// When enough lines piled up, take them and return the summary prompt.
    /// The caller runs the prompt and stores the result with `set_summary`.
    pub fn take_summary_batch(&mut self) -> Option<CompletionRequest> {
        if self.unsummarized.len() < SUMMARY_BATCH {
            return None;
        }
        let chunk: Vec<ChatLine> = self.unsummarized.drain(..).collect();
        let input = chunk
            .iter()
            .map(|l| self.render(l))
            .collect::<Vec<_>>()
            .join("\n");

        let prompt = [
            format!("You summarize Discord chat for {}, an AI DJ.", self.dj_name),
            "Keep it short, factual, and useful for future context.".to_string(),
            "Summarize in 4-6 bullet fragments, no full sentences required.".to_string(),
            format!(
                "Existing summary: {}",
                if self.summary.is_empty() { "(none)" } else { self.summary.as_str() }
            ),
            "New messages:".to_string(),
            input,
        ]
        .join("\n");

        Some(CompletionRequest {
            prompt,
            max_tokens: 180,
        })
    }

    pub fn set_summary(&mut self, summary: String) {
        if !summary.trim().is_empty() {
            self.summary = summary.trim().to_string();
        }
    }
}

/// Run one summary refresh if a batch is due.  Failures keep the old summary.
pub async fn refresh_summary(
    conversation: &std::sync::Mutex<Conversation>,
    model: &dyn LanguageModel,
) {
    let request = match conversation.lock() {
        Ok(mut c) => c.take_summary_batch(),
        Err(_) => return,
    };
    let Some(request) = request else {
        return;
    };
    match model.complete(&request).await {
        Ok(text) => {
            if let Ok(mut c) = conversation.lock() {
                c.set_summary(text);
                debug!(chars = c.summary().len(), "conversation summary updated");
            }
        }
        Err(e) => warn!(error = %e, "summary update failed"),
    }
}

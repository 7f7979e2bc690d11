//! Language-model capability.  The daemon only needs "prompt in, text out";
//! everything else (prompt building, parsing) lives with the callers.

use std::time::Duration;

use async_trait::async_trait;
use dj_proto::config::LlmConfig;
use serde_json::json;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("model returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("model returned no content")]
    Empty,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    /// Sent as a single system message.
    pub prompt: String,
    pub max_tokens: u32,
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn name(&self) -> &str;

    /// Complete `request`, returning the trimmed text of the first choice.
    async fn complete(&self, request: &CompletionRequest) -> Result<String, ModelError>;
}

/// OpenAI-compatible `/chat/completions` client.
pub struct OpenAiModel {
    http_client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiModel {
    pub fn new(config: &LlmConfig) -> anyhow::Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()?;
        Ok(Self {
            http_client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
        })
    }
}

#[async_trait]
impl LanguageModel for OpenAiModel {
    fn name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String, ModelError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = json!({
            "model": self.model,
            "messages": [{ "role": "system", "content": request.prompt }],
            "max_tokens": request.max_tokens,
        });

        debug!(model = %self.model, chars = request.prompt.len(), "model request");
        let resp = self
            .http_client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(ModelError::Status { status, body });
        }

        let result: serde_json::Value = resp.json().await?;
        let content = result
            .pointer("/choices/0/message/content")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .unwrap_or_default();
        if content.is_empty() {
            return Err(ModelError::Empty);
        }
        Ok(content.to_string())
    }
}

#[cfg(test)]
pub mod testing {
    //! Scripted model for tests.

    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    pub enum Scripted {
        Reply(String),
        /// Reply after sleeping, to hold a call open.
        Slow(Duration, String),
        Fail,
    }

    /// Pops one scripted answer per call; fails once the script runs out.
    pub struct ScriptedModel {
        script: Mutex<VecDeque<Scripted>>,
        pub prompts: Mutex<Vec<String>>,
    }

    impl ScriptedModel {
        pub fn new(script: Vec<Scripted>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                prompts: Mutex::new(Vec::new()),
            }
        }

        pub fn replying(text: &str) -> Self {
            Self::new(vec![Scripted::Reply(text.to_string())])
        }

        pub fn calls(&self) -> usize {
            self.prompts.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl LanguageModel for ScriptedModel {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn complete(&self, request: &CompletionRequest) -> Result<String, ModelError> {
            self.prompts.lock().unwrap().push(request.prompt.clone());
            let next = self.script.lock().unwrap().pop_front();
            match next {
                Some(Scripted::Reply(text)) => Ok(text),
                Some(Scripted::Slow(delay, text)) => {
                    tokio::time::sleep(delay).await;
                    Ok(text)
                }
                Some(Scripted::Fail) | None => Err(ModelError::Empty),
            }
        }
    }
}

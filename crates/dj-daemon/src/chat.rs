//! Chat platform adapter.
//!
//! Outbound replies go straight to the Discord REST API.  Inbound messages
//! arrive from a gateway relay over HTTP (see `http.rs`) and are filtered here
//! to the one configured guild and channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use dj_proto::config::ChatConfig;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, error, info, warn};

/// Discord rejects messages longer than this.
const MAX_MESSAGE_CHARS: usize = 2000;

/// Startup connect retries back off from the first delay up to the cap.
pub const CONNECT_RETRY_FIRST: Duration = Duration::from_secs(2);
pub const CONNECT_RETRY_MAX: Duration = Duration::from_secs(60);

#[async_trait]
pub trait ChatSink: Send + Sync {
    fn is_ready(&self) -> bool;

    async fn send(&self, text: &str) -> anyhow::Result<()>;
}

/// A message relayed from the chat gateway.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    pub author: String,
    #[serde(default)]
    pub author_is_bot: bool,
    pub guild_id: String,
    pub channel_id: String,
    #[serde(default)]
    pub content: String,
}

impl InboundMessage {
    /// Only human messages in the configured guild/channel get through.
    pub fn admitted_by(&self, config: &ChatConfig) -> bool {
        !self.author_is_bot
            && !self.content.trim().is_empty()
            && self.guild_id == config.guild_id
            && self.channel_id == config.channel_id
    }
}

/// Used when no bot token is configured: every send is dropped.
pub struct NullSink;

#[async_trait]
impl ChatSink for NullSink {
    fn is_ready(&self) -> bool {
        false
    }

    async fn send(&self, text: &str) -> anyhow::Result<()> {
        debug!(chars = text.len(), "chat not configured, reply dropped");
        Ok(())
    }
}

pub struct DiscordChannel {
    http_client: reqwest::Client,
    api_base: String,
    token: String,
    channel_id: String,
    ready: AtomicBool,
}

impl DiscordChannel {
    pub fn new(config: &ChatConfig) -> anyhow::Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            http_client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            token: config.bot_token.clone(),
            channel_id: config.channel_id.clone(),
            ready: AtomicBool::new(false),
        })
    }

    fn channel_url(&self) -> String {
        format!("{}/channels/{}", self.api_base, self.channel_id)
    }

    /// Check the token can see the channel; marks the sink ready on success.
    pub async fn connect(&self) -> anyhow::Result<()> {
        let resp = self
            .http_client
            .get(self.channel_url())
            .header("Authorization", format!("Bot {}", self.token))
            .send()
            .await
            .context("discord channel lookup")?;
        if !resp.status().is_success() {
            bail!("discord channel lookup returned {}", resp.status());
        }
        self.ready.store(true, Ordering::Relaxed);
        info!(channel = %self.channel_id, "discord channel ready");
        Ok(())
    }

    /// Keep calling `connect` until it succeeds, doubling the delay between
    /// attempts up to `max`.
    pub async fn connect_with_retry(&self, first: Duration, max: Duration) {
        let mut delay = first;
        let mut attempt = 1u32;
        while !self.is_ready() {
            match self.connect().await {
                Ok(()) => break,
                Err(e) => {
                    warn!(attempt, retry_in = ?delay, "discord channel unavailable: {:#}", e);
                }
            }
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(max);
            attempt += 1;
        }
    }

    /// Reconnect on demand if the sink is not ready yet.
    async fn ensure_ready(&self) -> bool {
        if self.is_ready() {
            return true;
        }
        match self.connect().await {
            Ok(()) => true,
            Err(e) => {
                warn!("discord reconnect failed: {:#}", e);
                false
            }
        }
    }
}

#[async_trait]
impl ChatSink for DiscordChannel {
    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    async fn send(&self, text: &str) -> anyhow::Result<()> {
        if !self.ensure_ready().await {
            warn!("discord not ready, reply dropped");
            return Ok(());
        }
        let content: String = text.chars().take(MAX_MESSAGE_CHARS).collect();
        let body = json!({
            "content": content,
            "allowed_mentions": { "parse": [] },
        });
        let resp = self
            .http_client
            .post(format!("{}/messages", self.channel_url()))
            .header("Authorization", format!("Bot {}", self.token))
            .json(&body)
            .send()
            .await
            .context("discord send")?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            error!(%status, body = %body, "discord send failed");
            bail!("discord send returned {status}");
        }
        Ok(())
    }
}

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::platform;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub personality: Personality,
    #[serde(default)]
    pub actions: ActionsConfig,
    #[serde(default)]
    pub vibes: VibesConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Chat platform (Discord) credentials and routing.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChatConfig {
    #[serde(default)]
    pub bot_token: String,
    #[serde(default)]
    pub guild_id: String,
    #[serde(default)]
    pub channel_id: String,
    /// Bearer token the gateway relay must present on `/api/chat`.
    /// Empty means the endpoint is open (bind to loopback in that case).
    #[serde(default)]
    pub relay_token: String,
    #[serde(default = "default_discord_api")]
    pub api_base: String,
}

impl ChatConfig {
    pub fn is_configured(&self) -> bool {
        !self.bot_token.is_empty() && !self.guild_id.is_empty() && !self.channel_id.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_llm_base")]
    pub base_url: String,
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
}

impl LlmConfig {
    pub fn is_configured(&self) -> bool {
        !self.api_key.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Personality {
    #[serde(default = "default_dj_name")]
    pub name: String,
    #[serde(default = "default_tagline")]
    pub tagline: String,
    #[serde(default = "default_tone")]
    pub tone: String,
    /// Extra style rule appended to the chat prompt.
    #[serde(default = "default_rule")]
    pub rule: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionsConfig {
    #[serde(default = "default_action_timeout")]
    pub timeout_secs: u64,
}

/// Where the vibe catalog lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VibesConfig {
    #[serde(default = "default_vibes_toml")]
    pub vibes_toml: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: default_model(),
            base_url: default_llm_base(),
            timeout_secs: default_llm_timeout(),
        }
    }
}

impl Default for Personality {
    fn default() -> Self {
        Self {
            name: default_dj_name(),
            tagline: default_tagline(),
            tone: default_tone(),
            rule: default_rule(),
        }
    }
}

impl Default for ActionsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_action_timeout(),
        }
    }
}

impl Default for VibesConfig {
    fn default() -> Self {
        Self {
            vibes_toml: default_vibes_toml(),
        }
    }
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    platform::DEFAULT_HTTP_PORT
}

fn default_discord_api() -> String {
    "https://discord.com/api/v10".to_string()
}

fn default_model() -> String {
    "gpt-4.1-mini".to_string()
}

fn default_llm_base() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_llm_timeout() -> u64 {
    20
}

fn default_dj_name() -> String {
    "PromptDJ".to_string()
}

fn default_tagline() -> String {
    "Live from your local channel.".to_string()
}

fn default_tone() -> String {
    "concise and playful".to_string()
}

fn default_rule() -> String {
    "Keep replies to 1-2 sentences.".to_string()
}

fn default_action_timeout() -> u64 {
    15
}

fn default_vibes_toml() -> PathBuf {
    platform::config_dir().join("vibes.toml")
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_path();

        let mut config = if !config_path.exists() {
            let config = Self::default();
            config.save()?;
            config
        } else {
            let content = std::fs::read_to_string(&config_path)?;
            toml::from_str(&content)?
        };

        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let config_path = Self::config_path();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }

    /// Secrets and deploy knobs may come from the environment; non-empty
    /// values override the file.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("DISCORD_BOT_TOKEN") {
            self.chat.bot_token = v;
        }
        if let Some(v) = get("DISCORD_GUILD_ID") {
            self.chat.guild_id = v;
        }
        if let Some(v) = get("DISCORD_CHANNEL_ID") {
            self.chat.channel_id = v;
        }
        if let Some(v) = get("CHAT_RELAY_TOKEN") {
            self.chat.relay_token = v;
        }
        if let Some(v) = get("OPENAI_API_KEY") {
            self.llm.api_key = v;
        }
        if let Some(v) = get("OPENAI_MODEL") {
            self.llm.model = v;
        }
        if let Some(port) = get("PORT").and_then(|v| v.trim().parse().ok()) {
            self.server.port = port;
        }
    }
}

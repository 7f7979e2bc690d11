//! `promptdj doctor`: preflight checks run before going live.
//!
//! Checks credentials, the vibe catalog, a screen websocket round trip on a
//! throwaway port, the Discord channel and the language model.  Any error
//! makes the command exit non-zero; warnings only get reported.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use dj_proto::config::{ChatConfig, Config, LlmConfig};
use dj_proto::vibes::{load_catalog_from_toml, VibeCatalog};
use futures_util::StreamExt;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::chat::{ChatSink, DiscordChannel, NullSink};
use crate::clock::SystemClock;
use crate::core::{CoreHandle, CoreSettings, DjCore};
use crate::dispatch::Dispatcher;
use crate::http::{self, HttpState};
use crate::llm::{CompletionRequest, LanguageModel, OpenAiModel};

const SOCKET_CHECK_TIMEOUT: Duration = Duration::from_secs(3);
const DISCORD_CHECK_TIMEOUT: Duration = Duration::from_secs(6);
const MODEL_CHECK_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Default)]
pub struct DoctorReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl DoctorReport {
    fn ok(&self, message: &str) {
        println!("OK: {message}");
    }

    fn warn(&mut self, message: String) {
        eprintln!("WARN: {message}");
        self.warnings.push(message);
    }

    fn error(&mut self, message: String) {
        eprintln!("ERROR: {message}");
        self.errors.push(message);
    }

    pub fn passed(&self) -> bool {
        self.errors.is_empty()
    }
}

pub async fn run(config: &Config) -> DoctorReport {
    println!("PromptDJ doctor starting...\n");
    let mut report = DoctorReport::default();

    check_settings(config, &mut report);
    check_vibes(&config.vibes.vibes_toml, &mut report);
    check_screen_socket(&mut report).await;
    check_discord(&config.chat, &mut report).await;
    check_model(&config.llm, &mut report).await;

    println!("\nDoctor finished.");
    if !report.warnings.is_empty() {
        println!("Warnings: {}", report.warnings.len());
    }
    if !report.errors.is_empty() {
        println!("Errors: {}", report.errors.len());
    }
    report
}

fn check_settings(config: &Config, report: &mut DoctorReport) {
    let required = [
        ("chat.bot_token", "DISCORD_BOT_TOKEN", &config.chat.bot_token),
        ("chat.guild_id", "DISCORD_GUILD_ID", &config.chat.guild_id),
        ("chat.channel_id", "DISCORD_CHANNEL_ID", &config.chat.channel_id),
        ("llm.api_key", "OPENAI_API_KEY", &config.llm.api_key),
    ];
    for (key, env, value) in required {
        if value.trim().is_empty() {
            report.error(format!("Missing setting: {key} (or {env})"));
        }
    }
}

fn check_vibes(path: &Path, report: &mut DoctorReport) {
    match load_catalog_from_toml(path) {
        Ok(catalog) if catalog.placeholder_count() > 0 => {
            report.warn(format!(
                "Vibe catalog {} has placeholder playlist ids.",
                path.display()
            ));
        }
        Ok(catalog) => report.ok(&format!("Vibe catalog loaded ({} vibes).", catalog.vibes.len())),
        Err(e) => report.error(format!("Vibe catalog error: {e:#}")),
    }
}

/// Boot the screen endpoint on an ephemeral port and expect `server:hello`.
async fn check_screen_socket(report: &mut DoctorReport) {
    match screen_round_trip().await {
        Ok(()) => report.ok("Screen websocket answered with hello."),
        Err(e) => report.error(format!("Screen websocket check failed: {e:#}")),
    }
}

async fn screen_round_trip() -> anyhow::Result<()> {
    let (event_tx, event_rx) = mpsc::channel(64);
    let catalog = Arc::new(VibeCatalog::default());
    let chat: Arc<dyn ChatSink> = Arc::new(NullSink);
    let core = DjCore::new(
        CoreSettings {
            catalog: Arc::clone(&catalog),
            personality: Default::default(),
            action_timeout: SOCKET_CHECK_TIMEOUT,
        },
        chat.clone(),
        Arc::new(SystemClock),
        Box::new(StdRng::from_entropy()),
        event_tx.clone(),
    );
    let handle = CoreHandle::new(event_tx);
    let status_rx = core.status_rx();
    let view_rx = core.view_rx();
    let core_task = tokio::spawn(core.run(event_rx));

    let dispatcher = Dispatcher::new(
        handle.clone(),
        status_rx.clone(),
        chat.clone(),
        None,
        catalog,
        Default::default(),
        SOCKET_CHECK_TIMEOUT,
    );
    let app = http::router(HttpState {
        core: handle.clone(),
        dispatcher: Arc::new(dispatcher),
        chat,
        chat_config: Arc::new(ChatConfig::default()),
        view_rx,
        status_rx,
    });

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let shutdown = CancellationToken::new();
    let server = tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await
        }
    });

    let result = tokio::time::timeout(SOCKET_CHECK_TIMEOUT, expect_hello(&format!("ws://{addr}/ws")))
        .await
        .unwrap_or_else(|_| Err(anyhow::anyhow!("timed out")));

    shutdown.cancel();
    handle.shutdown().await;
    let _ = tokio::time::timeout(SOCKET_CHECK_TIMEOUT, server).await;
    let _ = core_task.await;
    result
}

async fn expect_hello(url: &str) -> anyhow::Result<()> {
    let (mut ws, _response) = tokio_tungstenite::connect_async(url).await?;
    while let Some(msg) = ws.next().await {
        if let Message::Text(text) = msg? {
            let frame: serde_json::Value = serde_json::from_str(&text)?;
            let event = frame["event"].as_str().unwrap_or_default().to_string();
            let _ = ws.close(None).await;
            if event == "server:hello" {
                return Ok(());
            }
            anyhow::bail!("first frame was {event:?}, expected server:hello");
        }
    }
    anyhow::bail!("socket closed before hello")
}

async fn check_discord(chat: &ChatConfig, report: &mut DoctorReport) {
    if !chat.is_configured() {
        return;
    }
    let channel = match DiscordChannel::new(chat) {
        Ok(channel) => channel,
        Err(e) => return report.error(format!("Discord client failed to build: {e:#}")),
    };
    match tokio::time::timeout(DISCORD_CHECK_TIMEOUT, channel.connect()).await {
        Ok(Ok(())) => report.ok("Discord channel reachable."),
        Ok(Err(e)) => report.error(format!("Discord check failed: {e:#}")),
        Err(_) => report.error("Discord check timed out.".to_string()),
    }
}

async fn check_model(llm: &LlmConfig, report: &mut DoctorReport) {
    if !llm.is_configured() {
        return;
    }
    let model = match OpenAiModel::new(llm) {
        Ok(model) => model,
        Err(e) => return report.error(format!("Language model client failed to build: {e:#}")),
    };
    match ping_model(&model).await {
        Ok(()) => report.ok(&format!("Language model {} answered.", llm.model)),
        Err(e) => report.error(format!("Language model check failed: {e:#}")),
    }
}

async fn ping_model(model: &dyn LanguageModel) -> anyhow::Result<()> {
    let request = CompletionRequest {
        prompt: "Reply with the single word OK.".to_string(),
        max_tokens: 5,
    };
    tokio::time::timeout(MODEL_CHECK_TIMEOUT, model.complete(&request))
        .await
        .map_err(|_| anyhow::anyhow!("timed out"))??;
    Ok(())
}

mod bridge;
mod chat;
mod clock;
mod conversation;
mod core;
mod dispatch;
mod doctor;
mod error;
mod http;
mod intent;
mod llm;
mod rotation;
mod session;
mod socket;

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use dj_proto::config::Config;
use dj_proto::vibes::{load_catalog_from_toml, VibeCatalog};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::chat::{ChatSink, DiscordChannel, NullSink};
use crate::clock::{Clock, SystemClock};
use crate::llm::{LanguageModel, OpenAiModel};

/// PromptDJ: an AI radio host driving a browser player from Discord chat.
#[derive(Parser, Debug)]
#[command(name = "promptdj", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the daemon (default)
    Serve,
    /// Check credentials, the vibe catalog, the screen socket, Discord and
    /// the language model, then exit
    Doctor,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Command::Serve);

    // File log, plus stderr unless the doctor owns the terminal
    let data_dir = dj_proto::platform::data_dir();
    std::fs::create_dir_all(&data_dir)?;
    let log_path = dj_proto::platform::log_path();

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_ansi(false);
    let stderr_layer = matches!(command, Command::Serve)
        .then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr));

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,promptdj=debug")),
        )
        .init();

    info!("Log file: {:?}", log_path);

    let config = Config::load()?;
    info!("Config loaded from: {:?}", Config::config_path());

    if let Command::Doctor = command {
        let report = doctor::run(&config).await;
        if !report.passed() {
            std::process::exit(1);
        }
        return Ok(());
    }

    let catalog = Arc::new(load_vibes(&config));
    let model = build_model(&config);
    let chat = build_chat(&config);

    // Event channel: every mutation funnels into DjCore
    let (event_tx, event_rx) = tokio::sync::mpsc::channel::<core::CoreEvent>(256);
    let action_timeout = Duration::from_secs(config.actions.timeout_secs.max(1));
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let dj_core = core::DjCore::new(
        core::CoreSettings {
            catalog: catalog.clone(),
            personality: config.personality.clone(),
            action_timeout,
        },
        chat.clone(),
        clock.clone(),
        Box::new(StdRng::from_entropy()),
        event_tx.clone(),
    );
    let handle = core::CoreHandle::new(event_tx);
    let status_rx = dj_core.status_rx();
    let view_rx = dj_core.view_rx();

    let dispatcher = dispatch::Dispatcher::new(
        handle.clone(),
        status_rx.clone(),
        chat.clone(),
        model,
        catalog,
        config.personality.clone(),
        action_timeout,
    )
    .with_clock(clock);

    let shutdown = CancellationToken::new();
    let _http_handle = http::start_server(
        config.server.bind_address.clone(),
        config.server.port,
        http::HttpState {
            core: handle.clone(),
            dispatcher: Arc::new(dispatcher),
            chat,
            chat_config: Arc::new(config.chat.clone()),
            view_rx,
            status_rx,
        },
        shutdown.clone(),
    );

    let ctrl_c_handle = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received, shutting down");
            shutdown.cancel();
            ctrl_c_handle.shutdown().await;
        }
    });

    info!("{} initialised, running event loop", config.personality.name);
    dj_core.run(event_rx).await?;

    Ok(())
}

fn load_vibes(config: &Config) -> VibeCatalog {
    let path = &config.vibes.vibes_toml;
    let catalog = match load_catalog_from_toml(path) {
        Ok(catalog) => catalog,
        Err(e) => {
            error!(
                "Failed to load vibes from {:?}: {:#}. Copy config/vibes.example.toml there.",
                path, e
            );
            return VibeCatalog::default();
        }
    };
    info!(vibes = catalog.vibes.len(), "Vibe catalog loaded from {:?}", path);

    let placeholders = catalog.placeholder_count();
    if placeholders > 0 {
        warn!(
            placeholders,
            "Vibe catalog has placeholder playlist ids. Update {:?}.", path
        );
    }
    catalog
}

fn build_model(config: &Config) -> Option<Arc<dyn LanguageModel>> {
    if !config.llm.is_configured() {
        warn!("Language model not configured; classification fallback and chat replies disabled.");
        return None;
    }
    match OpenAiModel::new(&config.llm) {
        Ok(model) => {
            info!(model = %config.llm.model, "Language model ready");
            Some(Arc::new(model))
        }
        Err(e) => {
            error!("Language model client failed to build: {:#}", e);
            None
        }
    }
}

fn build_chat(config: &Config) -> Arc<dyn ChatSink> {
    if !config.chat.is_configured() {
        warn!("Discord not configured. Missing bot token, guild id or channel id.");
        return Arc::new(NullSink);
    }
    let channel = match DiscordChannel::new(&config.chat) {
        Ok(channel) => Arc::new(channel),
        Err(e) => {
            error!("Discord client failed to build: {:#}", e);
            return Arc::new(NullSink);
        }
    };

    let connecting = channel.clone();
    tokio::spawn(async move {
        connecting
            .connect_with_retry(chat::CONNECT_RETRY_FIRST, chat::CONNECT_RETRY_MAX)
            .await;
    });
    channel
}

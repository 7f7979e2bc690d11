use std::sync::Arc;

use axum::{
    extract::{State, WebSocketUpgrade},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use dj_proto::config::ChatConfig;
use dj_proto::protocol::{HealthReport, StatusSnapshot};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{debug, error, info, warn};

use crate::chat::{ChatSink, InboundMessage};
use crate::core::{CoreHandle, CoreView};
use crate::dispatch::Dispatcher;
use crate::socket;

#[derive(Clone)]
pub struct HttpState {
    pub core: CoreHandle,
    pub dispatcher: Arc<Dispatcher>,
    pub chat: Arc<dyn ChatSink>,
    pub chat_config: Arc<ChatConfig>,
    pub view_rx: watch::Receiver<CoreView>,
    pub status_rx: watch::Receiver<Option<Arc<StatusSnapshot>>>,
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/ws", get(screen_ws))
        .route("/health", get(health))
        .route("/api/chat", post(relay_chat))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub fn start_server(
    bind_address: String,
    port: u16,
    state: HttpState,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let app = router(state);

        let addr = format!("{}:{}", bind_address, port);
        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind HTTP server to {}: {}", addr, e);
                return;
            }
        };

        info!("PromptDJ listening on http://{}", addr);
        info!("Screen websocket: ws://{}/ws", addr);

        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await
        {
            error!("HTTP server error: {}", e);
        }
    })
}

async fn screen_ws(ws: WebSocketUpgrade, State(state): State<HttpState>) -> Response {
    let core = state.core.clone();
    ws.on_upgrade(move |socket| socket::handle_screen(socket, core))
}

async fn health(State(state): State<HttpState>) -> Json<HealthReport> {
    let view = state.view_rx.borrow().clone();
    let now_playing = state
        .status_rx
        .borrow()
        .as_ref()
        .and_then(|s| s.now_playing.clone());

    Json(HealthReport {
        ok: true,
        screen_connected: view.screen_connected,
        discord_ready: state.chat.is_ready(),
        vibe: view.vibe,
        now_playing,
        pending_actions: view.pending_actions,
    })
}

fn authorized(headers: &HeaderMap, token: &str) -> bool {
    if token.is_empty() {
        return true;
    }
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|given| given == token)
}

/// Inbound chat from the gateway relay.  Accepted messages are handled in the
/// background; the relay only learns whether the message was taken.
async fn relay_chat(
    State(state): State<HttpState>,
    headers: HeaderMap,
    Json(message): Json<InboundMessage>,
) -> Response {
    if !authorized(&headers, &state.chat_config.relay_token) {
        warn!("chat relay: bad or missing token");
        return StatusCode::UNAUTHORIZED.into_response();
    }
    if !message.admitted_by(&state.chat_config) {
        debug!(
            guild = %message.guild_id,
            channel = %message.channel_id,
            bot = message.author_is_bot,
            "chat relay: message filtered"
        );
        return StatusCode::NO_CONTENT.into_response();
    }

    let dispatcher = state.dispatcher.clone();
    tokio::spawn(async move {
        dispatcher.handle_message(message).await;
    });
    StatusCode::ACCEPTED.into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::testing::RecordingSink;
    use crate::clock::SystemClock;
    use crate::core::{CoreSettings, DjCore};
    use crate::dispatch::HELP_TEXT;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use dj_proto::config::Personality;
    use dj_proto::vibes::VibeCatalog;
    use rand::rngs::mock::StepRng;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    fn app(relay_token: &str) -> (Router, Arc<RecordingSink>) {
        let catalog = Arc::new(VibeCatalog::default());
        let sink = Arc::new(RecordingSink::default());
        let (tx, rx) = mpsc::channel(64);
        let core = DjCore::new(
            CoreSettings {
                catalog: catalog.clone(),
                personality: Personality::default(),
                action_timeout: Duration::from_secs(15),
            },
            sink.clone(),
            Arc::new(SystemClock),
            Box::new(StepRng::new(0, 0)),
            tx.clone(),
        );
        let view_rx = core.view_rx();
        let status_rx = core.status_rx();
        tokio::spawn(core.run(rx));

        let handle = CoreHandle::new(tx);
        let dispatcher = Dispatcher::new(
            handle.clone(),
            status_rx.clone(),
            sink.clone(),
            None,
            catalog,
            Personality::default(),
            Duration::from_secs(15),
        );
        let state = HttpState {
            core: handle,
            dispatcher: Arc::new(dispatcher),
            chat: sink.clone(),
            chat_config: Arc::new(ChatConfig {
                guild_id: "g1".into(),
                channel_id: "c1".into(),
                relay_token: relay_token.into(),
                ..Default::default()
            }),
            view_rx,
            status_rx,
        };
        (router(state), sink)
    }

    fn chat_request(body: &str, token: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/api/chat")
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    const HELP_BODY: &str = r#"{"author":"sam","guildId":"g1","channelId":"c1","content":"help"}"#;

    #[tokio::test]
    async fn test_health_reports_disconnected_screen() {
        let (app, _) = app("");
        let resp = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["ok"], true);
        assert_eq!(json["screenConnected"], false);
        assert_eq!(json["discordReady"], true);
        assert_eq!(json["pendingActions"], 0);
        assert!(json["nowPlaying"].is_null());
    }

    #[tokio::test]
    async fn test_relay_requires_token_when_configured() {
        let (app, sink) = app("s3cret");
        let resp = app
            .clone()
            .oneshot(chat_request(HELP_BODY, None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = app
            .clone()
            .oneshot(chat_request(HELP_BODY, Some("wrong")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = app
            .oneshot(chat_request(HELP_BODY, Some("s3cret")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);

        for _ in 0..50 {
            if !sink.messages().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(sink.messages(), vec![HELP_TEXT.to_string()]);
    }

    #[tokio::test]
    async fn test_relay_filters_other_channels_and_bots() {
        let (app, sink) = app("");
        let other = r#"{"author":"sam","guildId":"g1","channelId":"c9","content":"help"}"#;
        let bot = r#"{"author":"dj","authorIsBot":true,"guildId":"g1","channelId":"c1","content":"help"}"#;
        for body in [other, bot] {
            let resp = app.clone().oneshot(chat_request(body, None)).await.unwrap();
            assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(sink.messages().is_empty());
    }
}

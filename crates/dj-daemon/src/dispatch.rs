//! Command dispatcher: runs one inbound chat message end to end.
//!
//! Resolve the intent, act on it through the core, reply in chat.  Each
//! message is handled in its own task so a slow model call never holds up
//! the next message.

use std::sync::{Arc, LazyLock, Mutex};
use std::time::{Duration, Instant};

use dj_proto::config::Personality;
use dj_proto::protocol::{ActionKind, StatusSnapshot, Track};
use dj_proto::vibes::VibeCatalog;
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use regex::Regex;
use serde_json::json;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::chat::{ChatSink, InboundMessage};
use crate::clock::{Clock, SystemClock};
use crate::conversation::{refresh_summary, Conversation};
use crate::core::CoreHandle;
use crate::intent::{model, Intent, IntentPipeline};
use crate::llm::LanguageModel;

pub const GENERAL_COOLDOWN: Duration = Duration::from_secs(8);
pub const MAX_REPLY_CHARS: usize = 260;

pub const HELP_TEXT: &str = "Ask me to play a song, switch vibes, or ask what's playing. \
Try: \"play get lucky\", \"switch to focus\", \"what's next\".";

static LEADING_VERB: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?:play|queue|add|spin|drop|put on|put in|request)(?:\s+|$)").unwrap()
});

static SENTENCE_END: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[.!?]\s+").unwrap());

/// General-chat reply slot: the last reply time, plus whether a reply is
/// being produced right now.
#[derive(Debug, Default)]
struct ChatCooldown {
    last_reply: Option<Instant>,
    in_flight: bool,
}

/// Releases the claimed slot however `general_chat` exits.
struct ReplySlot<'a>(&'a Mutex<ChatCooldown>);

impl Drop for ReplySlot<'_> {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.0.lock() {
            slot.in_flight = false;
        }
    }
}

pub struct Dispatcher {
    core: CoreHandle,
    status_rx: watch::Receiver<Option<Arc<StatusSnapshot>>>,
    chat: Arc<dyn ChatSink>,
    pipeline: IntentPipeline,
    model: Option<Arc<dyn LanguageModel>>,
    catalog: Arc<VibeCatalog>,
    personality: Personality,
    conversation: Arc<Mutex<Conversation>>,
    cooldown: Mutex<ChatCooldown>,
    action_timeout: Duration,
    clock: Arc<dyn Clock>,
    rng: Mutex<Box<dyn RngCore + Send>>,
}

impl Dispatcher {
    pub fn new(
        core: CoreHandle,
        status_rx: watch::Receiver<Option<Arc<StatusSnapshot>>>,
        chat: Arc<dyn ChatSink>,
        model: Option<Arc<dyn LanguageModel>>,
        catalog: Arc<VibeCatalog>,
        personality: Personality,
        action_timeout: Duration,
    ) -> Self {
        Self {
            core,
            status_rx,
            chat,
            pipeline: IntentPipeline::new(model.clone(), personality.clone()),
            model,
            catalog,
            conversation: Arc::new(Mutex::new(Conversation::new(personality.name.clone()))),
            personality,
            cooldown: Mutex::new(ChatCooldown::default()),
            action_timeout,
            clock: Arc::new(SystemClock),
            rng: Mutex::new(Box::new(StdRng::from_entropy())),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_rng(mut self, rng: Box<dyn RngCore + Send>) -> Self {
        self.rng = Mutex::new(rng);
        self
    }

    pub async fn handle_message(&self, message: InboundMessage) {
        let content = message.content.trim();
        if content.is_empty() {
            return;
        }
        let author = message.author.as_str();
        info!(author, content, "message in channel");

        self.core.note_channel_activity().await;
        let context = {
            let Ok(mut conversation) = self.conversation.lock() else {
                return;
            };
            conversation.add_user(author, content);
            conversation.context()
        };
        self.spawn_summary_refresh();

        let intent = self.pipeline.resolve(content, &self.catalog, &context).await;
        info!(intent = intent.label(), author, "intent");

        let Some(reply) = self.execute(intent, author, content).await else {
            return;
        };
        if let Err(e) = self.chat.send(&reply).await {
            warn!(error = %e, "chat reply failed");
        }
        if let Ok(mut conversation) = self.conversation.lock() {
            conversation.add_bot(&reply);
        }
    }

    /// Act on `intent` and return the chat reply, if any.
    pub async fn execute(&self, intent: Intent, author: &str, content: &str) -> Option<String> {
        match intent {
            Intent::SongRequest { query } => Some(self.queue_song(query, author, content).await),
            Intent::VibeRequest { vibe } => Some(self.switch_vibe(vibe, author, content).await),
            Intent::StatusNow => Some(self.now_playing()),
            Intent::StatusNext => Some(self.up_next()),
            Intent::Help => Some(HELP_TEXT.to_string()),
            Intent::GeneralChat { response } => self.general_chat(response, content).await,
        }
    }

    async fn queue_song(&self, query: String, author: &str, content: &str) -> String {
        let query = if query.trim().is_empty() {
            LEADING_VERB.replace(content, "").trim().to_string()
        } else {
            query.trim().to_string()
        };
        if query.is_empty() {
            return "Tell me the song title and artist.".to_string();
        }

        self.core.note_manual_request().await;
        info!(query = %query, requested_by = author, "queue request");
        let payload = json!({ "query": query, "requestedBy": author });
        match self
            .core
            .send_action(ActionKind::QueueSong, payload, self.action_timeout)
            .await
        {
            Ok(data) => {
                let track = serde_json::from_value::<Track>(data)
                    .unwrap_or_default()
                    .display();
                self.core
                    .toast(format!("Queued: {track} — requested by {author}"), None)
                    .await;
                let variant = self.pick(3);
                match variant {
                    0 => format!("Queued: {track}."),
                    1 => format!("On deck: {track}."),
                    _ => format!("Spinning up {track}."),
                }
            }
            Err(e) if e.is_timeout() => {
                warn!(query = %query, "queue request timed out");
                format!("Queue failed: {e}.")
            }
            Err(e) => {
                warn!(error = %e, "queue failed");
                format!("Queue failed: {e}.")
            }
        }
    }

    async fn switch_vibe(&self, vibe_text: String, author: &str, content: &str) -> String {
        if self.catalog.is_empty() {
            return "No vibes configured yet.".to_string();
        }
        let text = if vibe_text.trim().is_empty() {
            content
        } else {
            vibe_text.as_str()
        };
        let Some(vibe) = self.catalog.resolve(text) else {
            debug!(text, "no matching vibe");
            return format!("I don't have that vibe. Try: {}.", self.catalog.names().join(", "));
        };

        self.core.note_manual_request().await;
        info!(vibe = %vibe.name, requested_by = author, "vibe request");
        match self.core.switch_vibe(vibe.clone(), Some(author.to_string())).await {
            Ok(()) => format!("{author}, switching to {}.", vibe.name),
            Err(e) => format!("Vibe switch failed: {e}."),
        }
    }

    fn status(&self) -> Option<Arc<StatusSnapshot>> {
        self.status_rx.borrow().clone()
    }

    fn now_playing(&self) -> String {
        match self.status().and_then(|s| s.now_playing.clone()) {
            Some(track) => format!("Now playing: {}.", track.display()),
            None => "Nothing playing yet. Queue a track.".to_string(),
        }
    }

    fn up_next(&self) -> String {
        let upcoming: Vec<String> = self
            .status()
            .map(|s| s.up_next.iter().map(Track::display).collect())
            .unwrap_or_default();
        if upcoming.is_empty() {
            "Queue is empty. Toss me a song.".to_string()
        } else {
            format!("Up next: {}.", upcoming.join(" | "))
        }
    }

    /// Take the reply slot unless another reply is cooling down or in flight.
    fn claim_reply_slot(&self) -> Option<ReplySlot<'_>> {
        let now = self.clock.now();
        let mut slot = self.cooldown.lock().ok()?;
        let cooling = slot
            .last_reply
            .is_some_and(|at| now.saturating_duration_since(at) < GENERAL_COOLDOWN);
        if cooling || slot.in_flight {
            return None;
        }
        slot.in_flight = true;
        Some(ReplySlot(&self.cooldown))
    }

    async fn general_chat(&self, canned: Option<String>, content: &str) -> Option<String> {
        let Some(_slot) = self.claim_reply_slot() else {
            debug!("general chat skipped: cooldown");
            return None;
        };

        let raw = match canned {
            Some(text) => text,
            None => self.model_reply(content).await,
        };
        let reply = trim_reply(&raw);
        if reply.is_empty() {
            return None;
        }

        if let Ok(mut slot) = self.cooldown.lock() {
            slot.last_reply = Some(self.clock.now());
        }
        self.core.toast(format!("DJ says: {reply}"), None).await;
        Some(reply)
    }

    async fn model_reply(&self, content: &str) -> String {
        let Some(llm) = &self.model else {
            debug!("no model configured, chat reply skipped");
            return String::new();
        };
        let context = match self.conversation.lock() {
            Ok(conversation) => conversation.context(),
            Err(_) => return String::new(),
        };
        let request = model::reply_prompt(&self.personality, content, &context);
        match llm.complete(&request).await {
            Ok(text) => model::sanitize(&text, model::MAX_RESPONSE_CHARS).unwrap_or_default(),
            Err(e) => {
                warn!(error = %e, "chat reply failed");
                String::new()
            }
        }
    }

    fn pick(&self, n: usize) -> usize {
        self.rng
            .lock()
            .map(|mut rng| rng.gen_range(0..n))
            .unwrap_or(0)
    }

    fn spawn_summary_refresh(&self) {
        let Some(model) = self.model.clone() else {
            return;
        };
        let conversation = self.conversation.clone();
        tokio::spawn(async move {
            refresh_summary(&conversation, model.as_ref()).await;
        });
    }
}

/// Keep the first two sentences, capped at `MAX_REPLY_CHARS`.
pub fn trim_reply(text: &str) -> String {
    let text = text.trim();
    let mut sentences = Vec::new();
    let mut start = 0;
    for m in SENTENCE_END.find_iter(text) {
        sentences.push(text[start..m.start() + 1].trim());
        start = m.end();
        if sentences.len() == 2 {
            break;
        }
    }
    if sentences.len() < 2 && start < text.len() {
        sentences.push(text[start..].trim());
    }
    let joined = sentences.join(" ");
    joined
        .chars()
        .take(MAX_REPLY_CHARS)
        .collect::<String>()
        .trim_end()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::testing::RecordingSink;
    use crate::clock::ManualClock;
    use crate::core::{CoreSettings, DjCore};
    use crate::llm::testing::{Scripted, ScriptedModel};
    use dj_proto::protocol::{ActionResult, ClientFrame, ServerFrame};
    use dj_proto::vibes::Vibe;
    use rand::rngs::mock::StepRng;
    use tokio::sync::mpsc;

    fn catalog() -> VibeCatalog {
        VibeCatalog {
            default_vibe: Some("Chill".into()),
            vibes: vec![
                Vibe {
                    id: "pl.chill".into(),
                    name: "Chill".into(),
                    aliases: vec!["lofi".into()],
                },
                Vibe {
                    id: "pl.focus".into(),
                    name: "Focus".into(),
                    aliases: vec!["study".into()],
                },
            ],
            ..Default::default()
        }
    }

    struct Rig {
        dispatcher: Dispatcher,
        handle: CoreHandle,
        sink: Arc<RecordingSink>,
        clock: Arc<ManualClock>,
        status_rx: watch::Receiver<Option<Arc<StatusSnapshot>>>,
    }

    /// Core loop running in the background, dispatcher in the foreground.
    fn rig(catalog: VibeCatalog, model: Option<Arc<dyn LanguageModel>>) -> Rig {
        let catalog = Arc::new(catalog);
        let (tx, rx) = mpsc::channel(64);
        let sink = Arc::new(RecordingSink::default());
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
        let status_rx = core.status_rx();
        tokio::spawn(core.run(rx));

        let handle = CoreHandle::new(tx);
        let clock = Arc::new(ManualClock::new());
        let dispatcher = Dispatcher::new(
            handle.clone(),
            status_rx.clone(),
            sink.clone(),
            model,
            catalog,
            Personality::default(),
            Duration::from_secs(15),
        )
        .with_clock(clock.clone())
        .with_rng(Box::new(StepRng::new(0, 0)));

        Rig {
            dispatcher,
            handle,
            sink,
            clock,
            status_rx,
        }
    }

    fn msg(content: &str) -> InboundMessage {
        InboundMessage {
            author: "sam".into(),
            author_is_bot: false,
            guild_id: "g".into(),
            channel_id: "c".into(),
            content: content.into(),
        }
    }

    /// Answers every queueSong/setVibe like a healthy screen would.
    async fn fake_screen(handle: CoreHandle) -> mpsc::Receiver<String> {
        let (out_tx, mut out_rx) = mpsc::channel(64);
        let session = handle.open_session(out_tx).await.unwrap();
        let (toast_tx, toast_rx) = mpsc::channel(64);
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                match frame {
                    ServerFrame::Action(req) if req.kind != ActionKind::GetStatus => {
                        let data = match req.kind {
                            ActionKind::QueueSong => {
                                Some(json!({ "title": "Get Lucky", "artist": "Daft Punk" }))
                            }
                            _ => None,
                        };
                        let result = ActionResult {
                            id: req.id,
                            ok: true,
                            data,
                            error: None,
                        };
                        handle.frame(session, ClientFrame::ActionResult(result)).await;
                    }
                    ServerFrame::Toast(t) => {
                        let _ = toast_tx.send(t.message).await;
                    }
                    _ => {}
                }
            }
        });
        toast_rx
    }

    #[test]
    fn test_trim_reply() {
        assert_eq!(trim_reply("One. Two! Three?"), "One. Two!");
        assert_eq!(trim_reply("  just one  "), "just one");
        assert_eq!(trim_reply("Hi.\nSecond line. Third."), "Hi. Second line.");
        assert_eq!(trim_reply(&"x".repeat(400)).len(), MAX_REPLY_CHARS);
        assert_eq!(trim_reply(""), "");
    }

    #[tokio::test]
    async fn test_song_request_queues_and_confirms() {
        let r = rig(catalog(), None);
        let mut toasts = fake_screen(r.handle.clone()).await;

        r.dispatcher.handle_message(msg("play get lucky")).await;
        assert_eq!(r.sink.messages(), vec!["Queued: Get Lucky — Daft Punk.".to_string()]);
        assert_eq!(
            toasts.recv().await.unwrap(),
            "Queued: Get Lucky — Daft Punk — requested by sam"
        );
    }

    #[tokio::test]
    async fn test_song_request_without_query() {
        let r = rig(catalog(), None);
        let reply = r
            .dispatcher
            .execute(Intent::SongRequest { query: String::new() }, "sam", "play")
            .await;
        assert_eq!(reply.as_deref(), Some("Tell me the song title and artist."));

        // a bare verb in any case is still no query
        for bare in ["Play", "PUT ON"] {
            let reply = r
                .dispatcher
                .execute(Intent::SongRequest { query: String::new() }, "sam", bare)
                .await;
            assert_eq!(reply.as_deref(), Some("Tell me the song title and artist."));
        }

        // model gave no query: strip the verb from the raw message
        let reply = r
            .dispatcher
            .execute(
                Intent::SongRequest { query: String::new() },
                "sam",
                "Queue around the world",
            )
            .await
            .unwrap();
        // no screen: fails fast
        assert_eq!(reply, "Queue failed: screen not connected.");
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_queue_reports_timeout() {
        let r = rig(catalog(), None);
        // screen connected but never answers
        let (out_tx, _out_rx) = mpsc::channel(64);
        r.handle.open_session(out_tx).await.unwrap();

        r.dispatcher.handle_message(msg("play get lucky")).await;
        assert_eq!(
            r.sink.messages(),
            vec!["Queue failed: queueSong timed out.".to_string()]
        );
    }

    #[tokio::test]
    async fn test_vibe_requests() {
        let r = rig(catalog(), None);
        let _toasts = fake_screen(r.handle.clone()).await;

        r.dispatcher.handle_message(msg("switch to study vibe")).await;
        r.dispatcher.handle_message(msg("change the vibe to polka")).await;
        assert_eq!(
            r.sink.messages(),
            vec![
                "sam, switching to Focus.".to_string(),
                "I don't have that vibe. Try: Chill, Focus.".to_string(),
            ]
        );

        let empty = rig(VibeCatalog::default(), None);
        let reply = empty
            .dispatcher
            .execute(Intent::VibeRequest { vibe: "chill".into() }, "sam", "chill vibes")
            .await;
        assert_eq!(reply.as_deref(), Some("No vibes configured yet."));
    }

    #[tokio::test]
    async fn test_status_answers_from_snapshot() {
        let mut r = rig(catalog(), None);
        assert_eq!(r.dispatcher.now_playing(), "Nothing playing yet. Queue a track.");
        assert_eq!(r.dispatcher.up_next(), "Queue is empty. Toss me a song.");

        let (out_tx, _out_rx) = mpsc::channel(64);
        let session = r.handle.open_session(out_tx).await.unwrap();
        let status: StatusSnapshot = serde_json::from_value(json!({
            "nowPlaying": { "id": "1", "title": "Digital Love", "artist": "Daft Punk" },
            "upNext": [
                { "id": "2", "title": "Aerodynamic", "artist": "Daft Punk" },
                { "id": "3", "title": "Veridis Quo" }
            ]
        }))
        .unwrap();
        r.handle.frame(session, ClientFrame::Status(status)).await;
        r.status_rx.changed().await.unwrap();

        assert_eq!(r.dispatcher.now_playing(), "Now playing: Digital Love — Daft Punk.");
        assert_eq!(
            r.dispatcher.up_next(),
            "Up next: Aerodynamic — Daft Punk | Veridis Quo — Unknown."
        );
    }

    #[tokio::test]
    async fn test_general_chat_cooldown() {
        let r = rig(catalog(), None);
        let canned = || Intent::GeneralChat {
            response: Some("Morning! Coffee and disco. Extra sentence.".into()),
        };

        let first = r.dispatcher.execute(canned(), "sam", "morning").await;
        assert_eq!(first.as_deref(), Some("Morning! Coffee and disco."));

        r.clock.advance(Duration::from_secs(5));
        assert_eq!(r.dispatcher.execute(canned(), "sam", "hello?").await, None);

        r.clock.advance(Duration::from_secs(4));
        assert!(r.dispatcher.execute(canned(), "sam", "hello?").await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_general_chat_replies_once() {
        let model = Arc::new(ScriptedModel::new(vec![
            Scripted::Slow(Duration::from_millis(200), "Hello there.".into()),
            Scripted::Slow(Duration::from_millis(200), "Hello there.".into()),
        ]));
        let r = rig(catalog(), Some(model.clone()));
        let chat = || Intent::GeneralChat { response: None };

        let (a, b) = tokio::join!(
            r.dispatcher.execute(chat(), "sam", "hi"),
            r.dispatcher.execute(chat(), "kim", "yo"),
        );
        assert_eq!(
            [a, b].into_iter().flatten().collect::<Vec<_>>(),
            vec!["Hello there.".to_string()]
        );
        assert_eq!(model.calls(), 1);
    }

    #[tokio::test]
    async fn test_empty_general_reply_frees_the_slot() {
        let model = Arc::new(ScriptedModel::new(vec![
            Scripted::Fail,
            Scripted::Reply("Still here.".into()),
        ]));
        let r = rig(catalog(), Some(model));
        let chat = || Intent::GeneralChat { response: None };

        assert_eq!(r.dispatcher.execute(chat(), "sam", "hi").await, None);
        // nothing was sent, so no cooldown applies
        assert_eq!(
            r.dispatcher.execute(chat(), "sam", "hi again").await.as_deref(),
            Some("Still here.")
        );
    }

    #[tokio::test]
    async fn test_general_chat_without_model_stays_silent() {
        let r = rig(catalog(), None);
        r.dispatcher.handle_message(msg("good morning all")).await;
        assert!(r.sink.messages().is_empty());
    }

    #[tokio::test]
    async fn test_general_chat_uses_model_reply() {
        let model = Arc::new(ScriptedModel::new(vec![
            // classification: not JSON, falls back to general chat
            Scripted::Reply("hmm".into()),
            Scripted::Reply("Good morning, night owl.".into()),
        ]));
        let r = rig(catalog(), Some(model.clone()));
        r.dispatcher.handle_message(msg("good morning all")).await;
        assert_eq!(r.sink.messages(), vec!["Good morning, night owl.".to_string()]);
        assert_eq!(model.calls(), 2);
    }

    #[tokio::test]
    async fn test_help_reply() {
        let r = rig(catalog(), None);
        r.dispatcher.handle_message(msg("help")).await;
        assert_eq!(r.sink.messages(), vec![HELP_TEXT.to_string()]);
    }
}

/// DjCore: single-owner event loop for all mutable orchestrator state.
///
/// The session manager, action bridge and rotation scheduler live here and
/// nowhere else.  Socket tasks, the dispatcher and timers talk to the core by
/// sending `CoreEvent`s through a `CoreHandle`; anything slow (waiting on an
/// action outcome, posting to chat) runs in a spawned task that reports back
/// with another event.
///
/// ```text
///   socket task ── SessionOpened / Frame / SessionClosed ──┐
///   dispatcher  ── SendAction / SwitchVibe / stamps ───────┼──► DjCore::run
///   timers      ── ActionDeadline / Heartbeat ─────────────┘        │
///                                                                   ├── watch: StatusSnapshot
///                                                                   └── watch: CoreView
/// ```
use std::sync::Arc;
use std::time::{Duration, Instant};

use dj_proto::config::Personality;
use dj_proto::protocol::{
    ActionId, ActionKind, ClientFrame, Hello, ServerFrame, StatusSnapshot, Toast, VibeState,
};
use dj_proto::vibes::{Vibe, VibeCatalog};
use rand::RngCore;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::bridge::{ActionBridge, ActionOutcome, ActionReply};
use crate::chat::ChatSink;
use crate::clock::Clock;
use crate::error::DjError;
use crate::rotation::{RotationParams, RotationScheduler};
use crate::session::{SessionId, SessionManager};

const HEARTBEAT: Duration = Duration::from_secs(5);

pub type SwitchReply = oneshot::Sender<Result<(), DjError>>;

// ── CoreEvent ─────────────────────────────────────────────────────────────────

/// All inputs into the DjCore loop.
#[derive(Debug)]
pub enum CoreEvent {
    /// A screen connected.  Replies with the new session id.
    SessionOpened {
        outbound: mpsc::Sender<ServerFrame>,
        reply: oneshot::Sender<SessionId>,
    },
    SessionClosed {
        session: SessionId,
    },
    /// Inbound frame from a screen socket.
    Frame {
        session: SessionId,
        frame: ClientFrame,
    },
    SendAction {
        kind: ActionKind,
        payload: Value,
        timeout: Duration,
        reply: ActionReply,
    },
    /// Per-action deadline timer fired.
    ActionDeadline {
        id: ActionId,
    },
    /// Switch to `vibe` now, bypassing the rotation trigger.
    SwitchVibe {
        vibe: Vibe,
        requested_by: Option<String>,
        reply: Option<SwitchReply>,
    },
    /// A `setVibe` action settled.
    VibeSwitchFinished {
        vibe: Vibe,
        requested_by: Option<String>,
        result: ActionOutcome,
        reply: Option<SwitchReply>,
    },
    ManualRequest,
    ChannelActivity,
    Toast {
        message: String,
        tone: Option<String>,
    },
    Heartbeat,
    Shutdown,
}

/// What `/health` needs from the core.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CoreView {
    pub screen_connected: bool,
    pub vibe: Option<VibeState>,
    pub pending_actions: usize,
}

pub struct CoreSettings {
    pub catalog: Arc<VibeCatalog>,
    pub personality: Personality,
    pub action_timeout: Duration,
}

// ── DjCore ────────────────────────────────────────────────────────────────────

pub struct DjCore {
    catalog: Arc<VibeCatalog>,
    personality: Personality,
    action_timeout: Duration,
    sessions: SessionManager,
    bridge: ActionBridge,
    rotation: RotationScheduler,
    current_vibe: Option<VibeState>,
    last_channel_activity: Option<Instant>,
    chat: Arc<dyn ChatSink>,
    clock: Arc<dyn Clock>,
    /// Our own inbox, for timers and spawned tasks to report back.
    event_tx: mpsc::Sender<CoreEvent>,
    status_tx: watch::Sender<Option<Arc<StatusSnapshot>>>,
    view_tx: watch::Sender<CoreView>,
}

impl DjCore {
    pub fn new(
        settings: CoreSettings,
        chat: Arc<dyn ChatSink>,
        clock: Arc<dyn Clock>,
        rng: Box<dyn RngCore + Send>,
        event_tx: mpsc::Sender<CoreEvent>,
    ) -> Self {
        let CoreSettings {
            catalog,
            personality,
            action_timeout,
        } = settings;
        let rotation = RotationScheduler::new(RotationParams::from_catalog(&catalog), rng);
        let current_vibe = catalog.default_vibe().map(Vibe::state);
        let (status_tx, _) = watch::channel(None);
        let (view_tx, _) = watch::channel(CoreView {
            vibe: current_vibe.clone(),
            ..Default::default()
        });

        Self {
            bridge: ActionBridge::new(clock.clone()),
            sessions: SessionManager::new(),
            catalog,
            personality,
            action_timeout,
            rotation,
            current_vibe,
            last_channel_activity: None,
            chat,
            clock,
            event_tx,
            status_tx,
            view_tx,
        }
    }

    pub fn status_rx(&self) -> watch::Receiver<Option<Arc<StatusSnapshot>>> {
        self.status_tx.subscribe()
    }

    pub fn view_rx(&self) -> watch::Receiver<CoreView> {
        self.view_tx.subscribe()
    }

    /// Run the core event loop until `Shutdown` or until every sender is gone.
    pub async fn run(mut self, mut event_rx: mpsc::Receiver<CoreEvent>) -> anyhow::Result<()> {
        let params = self.rotation.params();
        info!(
            vibes = self.catalog.vibes.len(),
            tracks_per_vibe = params.tracks_per_vibe,
            avoid_last = params.avoid_last,
            "DjCore: starting event loop"
        );

        let heartbeat_tx = self.event_tx.clone();
        let heartbeat = tokio::spawn(async move {
            loop {
                tokio::time::sleep(HEARTBEAT).await;
                if heartbeat_tx.send(CoreEvent::Heartbeat).await.is_err() {
                    break;
                }
            }
        });

        while let Some(evt) = event_rx.recv().await {
            if !self.handle_event(evt) {
                info!("DjCore: shutdown requested");
                break;
            }
        }

        heartbeat.abort();
        self.bridge.disconnect_all();
        Ok(())
    }

    /// Apply one event.  Returns false when the loop should stop.
    pub fn handle_event(&mut self, evt: CoreEvent) -> bool {
        match evt {
            CoreEvent::Shutdown => return false,

            CoreEvent::SessionOpened { outbound, reply } => {
                let id = self.open_session(outbound);
                let _ = reply.send(id);
            }

            CoreEvent::SessionClosed { session } => {
                if self.sessions.close(session) {
                    self.bridge.disconnect_all();
                }
            }

            CoreEvent::Frame { session, frame } => {
                if !self.sessions.is_current(session) {
                    debug!(session, "frame from stale session dropped");
                } else {
                    self.handle_frame(session, frame);
                }
            }

            CoreEvent::SendAction {
                kind,
                payload,
                timeout,
                reply,
            } => self.dispatch_action(kind, payload, timeout, reply),

            CoreEvent::ActionDeadline { id } => {
                self.bridge.time_out(id);
            }

            CoreEvent::SwitchVibe {
                vibe,
                requested_by,
                reply,
            } => {
                if let Err(e) = self.check_vibe(&vibe) {
                    warn!(vibe = %vibe.name, error = %e, "switch refused");
                    if let Some(reply) = reply {
                        let _ = reply.send(Err(e));
                    }
                } else {
                    self.rotation.begin_switch();
                    self.start_switch(vibe, requested_by, reply);
                }
            }

            CoreEvent::VibeSwitchFinished {
                vibe,
                requested_by,
                result,
                reply,
            } => self.finish_switch(vibe, requested_by, result, reply),

            CoreEvent::ManualRequest => {
                self.rotation.stamp_manual_request(self.clock.now());
            }

            CoreEvent::ChannelActivity => {
                self.last_channel_activity = Some(self.clock.now());
            }

            CoreEvent::Toast { message, tone } => self.push_toast(&message, tone.as_deref()),

            CoreEvent::Heartbeat => {
                let expired = self.bridge.expire_due(self.clock.now());
                if expired > 0 {
                    debug!(expired, "heartbeat expired overdue actions");
                }
            }
        }
        self.publish_view();
        true
    }

    // ── sessions ──────────────────────────────────────────────────────────────

    fn open_session(&mut self, outbound: mpsc::Sender<ServerFrame>) -> SessionId {
        // Old entries must fail before the new session can register any.
        self.bridge.disconnect_all();
        let (id, _) = self.sessions.open(outbound);

        let hello = ServerFrame::Hello(Hello {
            dj_name: self.personality.name.clone(),
            dj_tagline: self.personality.tagline.clone(),
            vibe: self.current_vibe.clone(),
        });
        if let Err(e) = self.sessions.send(hello) {
            warn!(session = id, error = %e, "hello not delivered");
        }

        // Nobody waits on this one; the reply arrives as a status frame.
        let (reply, _) = oneshot::channel();
        self.dispatch_action(ActionKind::GetStatus, json!({}), self.action_timeout, reply);
        id
    }

    fn handle_frame(&mut self, session: SessionId, frame: ClientFrame) {
        match frame {
            ClientFrame::Hello(payload) => {
                info!(session, payload = ?payload, "screen hello");
            }
            ClientFrame::ActionResult(result) => {
                self.bridge.settle(session, result);
            }
            ClientFrame::Status(status) => self.apply_status(status),
        }
    }

    fn apply_status(&mut self, status: StatusSnapshot) {
        if let Some(vibe) = status.vibe.as_ref().filter(|v| !v.id.is_empty()) {
            self.current_vibe = Some(vibe.clone());
        }
        let track_id = status.now_playing_id().map(str::to_string);
        debug!(
            track = ?status.now_playing.as_ref().and_then(|t| t.title.as_deref()),
            "status update"
        );
        self.status_tx.send_replace(Some(Arc::new(status)));

        if self.rotation.observe_track(track_id.as_deref()) {
            self.maybe_rotate();
        }
    }

    // ── actions ───────────────────────────────────────────────────────────────

    fn dispatch_action(
        &mut self,
        kind: ActionKind,
        payload: Value,
        timeout: Duration,
        reply: ActionReply,
    ) {
        let Some(request) =
            self.bridge
                .register(self.sessions.current_id(), kind, payload, timeout, reply)
        else {
            return;
        };
        let id = request.id;

        if let Err(e) = self.sessions.send(ServerFrame::Action(request)) {
            warn!(%id, %kind, error = %e, "action frame not delivered");
            self.bridge.abandon(id);
            return;
        }

        let deadline_tx = self.event_tx.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = deadline_tx.send(CoreEvent::ActionDeadline { id }).await;
        });
        self.bridge.arm(id, timer.abort_handle());
    }

    fn push_toast(&mut self, message: &str, tone: Option<&str>) {
        let frame = ServerFrame::Toast(Toast::new(message, tone));
        if let Err(e) = self.sessions.send(frame) {
            debug!(error = %e, "toast dropped");
        }
    }

    // ── vibes ─────────────────────────────────────────────────────────────────

    fn check_vibe(&self, vibe: &Vibe) -> Result<(), DjError> {
        if self.catalog.is_empty() {
            return Err(DjError::NO_VIBES);
        }
        match self.catalog.get(&vibe.id) {
            Some(_) => Ok(()),
            None => Err(DjError::UnknownVibe(vibe.name.clone())),
        }
    }

    fn maybe_rotate(&mut self) {
        let Some(current) = self.current_vibe.as_ref() else {
            debug!("rotation skipped: no current vibe");
            return;
        };
        if !self.rotation.should_rotate(self.clock.now()) {
            return;
        }
        let Some(next) = self
            .rotation
            .pick_next(&self.catalog, Some(current.id.as_str()))
            .cloned()
        else {
            return;
        };

        info!(
            from = %current.name,
            to = %next.name,
            tracks = self.rotation.state().tracks_since_vibe_start,
            "auto-rotating vibe"
        );
        self.rotation.begin_switch();
        self.start_switch(next, None, None);
    }

    fn start_switch(&mut self, vibe: Vibe, requested_by: Option<String>, reply: Option<SwitchReply>) {
        let reason = if requested_by.is_some() { "request" } else { "rotation" };
        let payload = json!({
            "vibeId": vibe.id,
            "vibeName": vibe.name,
            "reason": reason,
        });

        let (tx, rx) = oneshot::channel();
        self.dispatch_action(ActionKind::SetVibe, payload, self.action_timeout, tx);

        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            let result = rx.await.unwrap_or(Err(DjError::Disconnected {
                kind: ActionKind::SetVibe,
            }));
            let _ = event_tx
                .send(CoreEvent::VibeSwitchFinished {
                    vibe,
                    requested_by,
                    result,
                    reply,
                })
                .await;
        });
    }

    fn finish_switch(
        &mut self,
        vibe: Vibe,
        requested_by: Option<String>,
        result: ActionOutcome,
        reply: Option<SwitchReply>,
    ) {
        match result {
            Ok(_) => {
                info!(vibe = %vibe.name, requested_by = ?requested_by, "vibe switched");
                self.rotation.record_switch(&vibe.id);
                self.current_vibe = Some(vibe.state());
                self.push_toast(&format!("Vibe shift: {}", vibe.name), Some("accent"));

                let quiet = self
                    .rotation
                    .should_announce(self.clock.now(), self.last_channel_activity);
                if requested_by.is_none() && quiet {
                    self.announce(format!("Vibe shift: {}.", vibe.name));
                }
                if let Some(reply) = reply {
                    let _ = reply.send(Ok(()));
                }
            }
            Err(e) => {
                self.rotation.switch_failed();
                match &requested_by {
                    Some(user) => warn!(vibe = %vibe.name, user = %user, error = %e, "vibe switch failed"),
                    None => error!(vibe = %vibe.name, error = %e, "auto-rotation failed"),
                }
                if let Some(reply) = reply {
                    let _ = reply.send(Err(e));
                }
            }
        }
    }

    fn announce(&self, text: String) {
        let chat = self.chat.clone();
        tokio::spawn(async move {
            if let Err(e) = chat.send(&text).await {
                warn!(error = %e, "announcement failed");
            }
        });
    }

    fn publish_view(&self) {
        let view = CoreView {
            screen_connected: self.sessions.is_connected(),
            vibe: self.current_vibe.clone(),
            pending_actions: self.bridge.pending_count(),
        };
        self.view_tx.send_if_modified(|current| {
            if *current == view {
                false
            } else {
                *current = view;
                true
            }
        });
    }
}

// ── CoreHandle ────────────────────────────────────────────────────────────────

/// Cheaply cloneable sender side of the core.
#[derive(Clone)]
pub struct CoreHandle {
    tx: mpsc::Sender<CoreEvent>,
}

impl CoreHandle {
    pub fn new(tx: mpsc::Sender<CoreEvent>) -> Self {
        Self { tx }
    }

    /// Send an action to the screen and wait for its outcome.
    pub async fn send_action(&self, kind: ActionKind, payload: Value, timeout: Duration) -> ActionOutcome {
        let (reply, rx) = oneshot::channel();
        let evt = CoreEvent::SendAction {
            kind,
            payload,
            timeout,
            reply,
        };
        if self.tx.send(evt).await.is_err() {
            return Err(DjError::NO_SESSION);
        }
        rx.await.unwrap_or(Err(DjError::Disconnected { kind }))
    }

    pub async fn switch_vibe(&self, vibe: Vibe, requested_by: Option<String>) -> Result<(), DjError> {
        let (reply, rx) = oneshot::channel();
        let evt = CoreEvent::SwitchVibe {
            vibe,
            requested_by,
            reply: Some(reply),
        };
        if self.tx.send(evt).await.is_err() {
            return Err(DjError::NO_SESSION);
        }
        rx.await.unwrap_or(Err(DjError::Disconnected {
            kind: ActionKind::SetVibe,
        }))
    }

    pub async fn note_manual_request(&self) {
        let _ = self.tx.send(CoreEvent::ManualRequest).await;
    }

    pub async fn note_channel_activity(&self) {
        let _ = self.tx.send(CoreEvent::ChannelActivity).await;
    }

    pub async fn toast(&self, message: impl Into<String>, tone: Option<&str>) {
        let _ = self
            .tx
            .send(CoreEvent::Toast {
                message: message.into(),
                tone: tone.map(str::to_string),
            })
            .await;
    }

    /// Register a new screen session.  `None` if the core is gone.
    pub async fn open_session(&self, outbound: mpsc::Sender<ServerFrame>) -> Option<SessionId> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(CoreEvent::SessionOpened { outbound, reply })
            .await
            .ok()?;
        rx.await.ok()
    }

    pub async fn close_session(&self, session: SessionId) {
        let _ = self.tx.send(CoreEvent::SessionClosed { session }).await;
    }

    pub async fn frame(&self, session: SessionId, frame: ClientFrame) {
        let _ = self.tx.send(CoreEvent::Frame { session, frame }).await;
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(CoreEvent::Shutdown).await;
    }
}

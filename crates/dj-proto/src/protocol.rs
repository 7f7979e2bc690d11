use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Identifier of a correlated action.  Allocated from a monotonic counter on
/// the daemon side and echoed back verbatim by the screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionId(pub u64);

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Actions the screen knows how to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ActionKind {
    QueueSong,
    SetVibe,
    GetStatus,
    SearchSong,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::QueueSong => "queueSong",
            Self::SetVibe => "setVibe",
            Self::GetStatus => "getStatus",
            Self::SearchSong => "searchSong",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Messages sent from the daemon to the screen.
///
/// Serialised as `{"event": "...", "data": {...}}` text frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerFrame {
    #[serde(rename = "server:hello")]
    Hello(Hello),
    #[serde(rename = "server:action")]
    Action(ActionRequest),
    #[serde(rename = "server:toast")]
    Toast(Toast),
}

/// Messages sent from the screen to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientFrame {
    /// Free-form greeting, only logged.
    #[serde(rename = "screen:hello")]
    Hello(Option<Value>),
    #[serde(rename = "screen:status")]
    Status(StatusSnapshot),
    #[serde(rename = "screen:actionResult")]
    ActionResult(ActionResult),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hello {
    pub dj_name: String,
    pub dj_tagline: String,
    pub vibe: Option<VibeState>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRequest {
    pub id: ActionId,
    #[serde(rename = "type")]
    pub kind: ActionKind,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub id: ActionId,
    pub ok: bool,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Toast {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tone: Option<String>,
    /// Unix epoch milliseconds.
    pub ts: i64,
}

impl Toast {
    pub fn new(message: impl Into<String>, tone: Option<&str>) -> Self {
        Self {
            message: message.into(),
            tone: tone.map(str::to_string),
            ts: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// The ambience currently applied on the screen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VibeState {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Track {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub artist: Option<String>,
}

impl Track {
    /// "Title — Artist", with "Unknown" standing in for a missing half.
    pub fn display(&self) -> String {
        let title = self.title.as_deref().filter(|s| !s.is_empty());
        let artist = self.artist.as_deref().filter(|s| !s.is_empty());
        if title.is_none() && artist.is_none() {
            return "Unknown track".to_string();
        }
        format!(
            "{} — {}",
            title.unwrap_or("Unknown"),
            artist.unwrap_or("Unknown")
        )
    }
}

/// Playback snapshot pushed by the screen.  Always replaced as a whole.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    #[serde(default)]
    pub now_playing: Option<Track>,
    #[serde(default)]
    pub up_next: Vec<Track>,
    #[serde(default)]
    pub progress: Option<f64>,
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub vibe: Option<VibeState>,
}

impl StatusSnapshot {
    /// Id of the track now playing, if the screen reported one.
    pub fn now_playing_id(&self) -> Option<&str> {
        self.now_playing
            .as_ref()
            .and_then(|t| t.id.as_deref())
            .filter(|id| !id.is_empty())
    }
}

/// Read-only projection served on `/health`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub ok: bool,
    pub screen_connected: bool,
    pub discord_ready: bool,
    pub vibe: Option<VibeState>,
    pub now_playing: Option<Track>,
    pub pending_actions: usize,
}

impl ServerFrame {
    pub fn encode(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

impl ClientFrame {
    pub fn decode(text: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_action_frame_shape() {
        let frame = ServerFrame::Action(ActionRequest {
            id: ActionId(7),
            kind: ActionKind::QueueSong,
            payload: json!({ "query": "get lucky" }),
        });
        let value: Value = serde_json::from_str(&frame.encode().unwrap()).unwrap();
        assert_eq!(value["event"], "server:action");
        assert_eq!(value["data"]["id"], 7);
        assert_eq!(value["data"]["type"], "queueSong");
        assert_eq!(value["data"]["payload"]["query"], "get lucky");
    }

    #[test]
    fn test_decode_action_result_failure() {
        let raw = r#"{"event":"screen:actionResult","data":{"id":3,"ok":false,"error":"not found"}}"#;
        match ClientFrame::decode(raw).unwrap() {
            ClientFrame::ActionResult(r) => {
                assert_eq!(r.id, ActionId(3));
                assert!(!r.ok);
                assert_eq!(r.error.as_deref(), Some("not found"));
                assert!(r.data.is_none());
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_decode_sparse_status() {
        let raw = r#"{"event":"screen:status","data":{"nowPlaying":{"id":"t1","title":"One More Time","artist":"Daft Punk"}}}"#;
        match ClientFrame::decode(raw).unwrap() {
            ClientFrame::Status(s) => {
                assert_eq!(s.now_playing_id(), Some("t1"));
                assert!(s.up_next.is_empty());
                assert!(s.vibe.is_none());
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_track_display() {
        assert_eq!(Track::default().display(), "Unknown track");
        let t = Track {
            title: Some("Get Lucky".into()),
            ..Default::default()
        };
        assert_eq!(t.display(), "Get Lucky — Unknown");
    }
}

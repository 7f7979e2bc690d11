use dj_proto::protocol::ActionKind;
use thiserror::Error;

/// Failures the orchestrator can report back to a caller.
///
/// Bridge-originated variants are rendered into chat replies, so their
/// `Display` output is written for humans.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DjError {
    /// No reply arrived before the action's deadline.
    #[error("{kind} timed out")]
    Timeout { kind: ActionKind },
    /// The screen answered with `ok: false`.
    #[error("{reason}")]
    Rejected { kind: ActionKind, reason: String },
    /// The session went away while the action was pending.
    #[error("screen disconnected")]
    Disconnected { kind: ActionKind },
    /// A precondition is missing: no screen session, or no vibes configured.
    #[error("{0}")]
    Unconfigured(&'static str),
    #[error("unknown vibe \"{0}\"")]
    UnknownVibe(String),
}

impl DjError {
    pub const NO_SESSION: DjError = DjError::Unconfigured("screen not connected");
    pub const NO_VIBES: DjError = DjError::Unconfigured("no vibes configured");

    pub fn is_timeout(&self) -> bool {
        matches!(self, DjError::Timeout { .. })
    }
}

//! The single authoritative screen connection.
//!
//! Opening a session replaces whatever was there before; the old outbound
//! sender is dropped, which closes the old socket's writer loop.

use dj_proto::protocol::ServerFrame;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub type SessionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SendError {
    #[error("no screen session")]
    NoSession,
    #[error("screen writer closed")]
    Closed,
    #[error("screen writer backed up")]
    Full,
}

struct Session {
    id: SessionId,
    outbound: mpsc::Sender<ServerFrame>,
}

pub struct SessionManager {
    current: Option<Session>,
    next_id: SessionId,
}

impl SessionManager {
    pub fn new() -> Self {
        Self {
            current: None,
            next_id: 1,
        }
    }

    /// Install a new session.  Returns its id and the id it superseded.
    pub fn open(&mut self, outbound: mpsc::Sender<ServerFrame>) -> (SessionId, Option<SessionId>) {
        let id = self.next_id;
        self.next_id += 1;
        let previous = self.current.replace(Session { id, outbound }).map(|s| s.id);
        match previous {
            Some(old) => info!(session = id, superseded = old, "screen session replaced"),
            None => info!(session = id, "screen session opened"),
        }
        (id, previous)
    }

    /// Drop the session if `id` is still the current one.  A close from a
    /// superseded session is a no-op.
    pub fn close(&mut self, id: SessionId) -> bool {
        if self.is_current(id) {
            self.current = None;
            info!(session = id, "screen session closed");
            true
        } else {
            debug!(session = id, "close for stale session ignored");
            false
        }
    }

    pub fn is_current(&self, id: SessionId) -> bool {
        self.current.as_ref().map(|s| s.id) == Some(id)
    }

    pub fn current_id(&self) -> Option<SessionId> {
        self.current.as_ref().map(|s| s.id)
    }

    pub fn is_connected(&self) -> bool {
        self.current.is_some()
    }

    /// Hand a frame to the current session's writer without waiting.
    pub fn send(&self, frame: ServerFrame) -> Result<(), SendError> {
        let session = self.current.as_ref().ok_or(SendError::NoSession)?;
        session.outbound.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                warn!(session = session.id, "screen writer queue full, frame dropped");
                SendError::Full
            }
            mpsc::error::TrySendError::Closed(_) => SendError::Closed,
        })
    }
}

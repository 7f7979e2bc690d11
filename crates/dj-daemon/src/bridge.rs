/// Action correlation: turns fire-and-forget screen frames into awaitable
/// request/reply pairs.
///
/// ```text
///   register(kind, payload, timeout, reply)
///         │
///         ├── id = next counter value, entry {kind, session, deadline, reply}
///         └── returns ActionRequest → caller writes it to the session
///
///   settle(actionResult)   ok → Ok(data)        removes entry
///                          !ok → Rejected(msg)  removes entry
///   time_out(id)           → Timeout            removes entry
///   disconnect_all()       → Disconnected       clears every entry
/// ```
///
/// Every exit path removes the entry before the reply is sent, so each id
/// settles exactly once and a late reply finds nothing to settle.  The bridge
/// is owned by `DjCore` and only touched from its event loop.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dj_proto::protocol::{ActionId, ActionKind, ActionRequest, ActionResult};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::DjError;
use crate::session::SessionId;

pub type ActionOutcome = Result<Value, DjError>;
pub type ActionReply = oneshot::Sender<ActionOutcome>;

struct PendingAction {
    kind: ActionKind,
    session: SessionId,
    deadline: Instant,
    reply: ActionReply,
    /// Deadline timer task, aborted on settlement.
    timer: Option<AbortHandle>,
}

impl PendingAction {
    fn finish(self, outcome: ActionOutcome) {
        if let Some(timer) = self.timer {
            timer.abort();
        }
        // receiver may have given up; nothing to do then
        let _ = self.reply.send(outcome);
    }
}

pub struct ActionBridge {
    pending: HashMap<ActionId, PendingAction>,
    next_id: u64,
    clock: Arc<dyn Clock>,
}

impl ActionBridge {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            pending: HashMap::new(),
            next_id: 1,
            clock,
        }
    }

    /// Register a pending action for `session`.  With no session the reply
    /// fails at once with `Unconfigured` and nothing is tracked.
    pub fn register(
        &mut self,
        session: Option<SessionId>,
        kind: ActionKind,
        payload: Value,
        timeout: Duration,
        reply: ActionReply,
    ) -> Option<ActionRequest> {
        let Some(session) = session else {
            debug!(%kind, "action refused: no session");
            let _ = reply.send(Err(DjError::NO_SESSION));
            return None;
        };

        let id = ActionId(self.next_id);
        self.next_id += 1;

        self.pending.insert(
            id,
            PendingAction {
                kind,
                session,
                deadline: self.clock.now() + timeout,
                reply,
                timer: None,
            },
        );
        info!(%id, %kind, session, "action send");
        Some(ActionRequest { id, kind, payload })
    }

    /// Attach the deadline timer.  If the action already settled the timer is
    /// stopped straight away.
    pub fn arm(&mut self, id: ActionId, timer: AbortHandle) {
        match self.pending.get_mut(&id) {
            Some(entry) => entry.timer = Some(timer),
            None => timer.abort(),
        }
    }

    /// Apply a reply from `session`.  Unknown ids and replies from another
    /// session have no effect.  Returns whether an action was settled.
    pub fn settle(&mut self, session: SessionId, result: ActionResult) -> bool {
        match self.pending.get(&result.id) {
            None => {
                debug!(id = %result.id, "reply for unknown action ignored");
                return false;
            }
            Some(entry) if entry.session != session => {
                warn!(id = %result.id, session, "reply from foreign session ignored");
                return false;
            }
            Some(_) => {}
        }
        let Some(entry) = self.pending.remove(&result.id) else {
            return false;
        };

        if result.ok {
            info!(id = %result.id, kind = %entry.kind, "action ok");
            entry.finish(Ok(result.data.unwrap_or(Value::Null)));
        } else {
            let reason = result
                .error
                .filter(|e| !e.trim().is_empty())
                .unwrap_or_else(|| "Action failed".to_string());
            warn!(id = %result.id, kind = %entry.kind, error = %reason, "action failed");
            let kind = entry.kind;
            entry.finish(Err(DjError::Rejected { kind, reason }));
        }
        true
    }

    /// Fail one action with `Timeout`.  No-op if it already settled.
    pub fn time_out(&mut self, id: ActionId) -> bool {
        match self.pending.remove(&id) {
            Some(entry) => {
                warn!(%id, kind = %entry.kind, "action timed out");
                let kind = entry.kind;
                entry.finish(Err(DjError::Timeout { kind }));
                true
            }
            None => false,
        }
    }

    /// Fail one action with `Disconnected`, used when its frame never made it
    /// onto the wire.
    pub fn abandon(&mut self, id: ActionId) -> bool {
        match self.pending.remove(&id) {
            Some(entry) => {
                let kind = entry.kind;
                entry.finish(Err(DjError::Disconnected { kind }));
                true
            }
            None => false,
        }
    }

    /// Time out every action whose deadline is at or before `now`.
    pub fn expire_due(&mut self, now: Instant) -> usize {
        let due: Vec<ActionId> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in &due {
            self.time_out(*id);
        }
        due.len()
    }

    /// Fail everything with `Disconnected` and leave the map empty.
    pub fn disconnect_all(&mut self) -> usize {
        let drained: Vec<PendingAction> = self.pending.drain().map(|(_, p)| p).collect();
        let count = drained.len();
        for entry in drained {
            let kind = entry.kind;
            entry.finish(Err(DjError::Disconnected { kind }));
        }
        if count > 0 {
            warn!(count, "pending actions failed: screen disconnected");
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    #[cfg(test)]
    pub fn is_pending(&self, id: ActionId) -> bool {
        self.pending.contains_key(&id)
    }
}

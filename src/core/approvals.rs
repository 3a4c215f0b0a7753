use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Fixed upper bound after which a suspended interactive approval
/// auto-resolves as denied.
pub const APPROVAL_SAFETY_TIMEOUT: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone, PartialEq)]
pub enum ApprovalDecision {
    Approved { answer: Option<String> },
    Denied { message: String },
}

#[derive(Debug, PartialEq)]
pub enum ApprovalWait {
    Resolved(ApprovalDecision),
    /// The safety timeout elapsed with no resolution.
    TimedOut,
    /// The owning turn was cancelled while parked.
    Cancelled,
}

struct PendingApproval {
    session_id: String,
    resolver: oneshot::Sender<ApprovalDecision>,
}

/// Pending interactive approvals, keyed by call id. Each is scoped to
/// one session: cancelling a session denies only that session's
/// approvals.
#[derive(Clone, Default)]
pub struct ApprovalBroker {
    pending: Arc<Mutex<HashMap<String, PendingApproval>>>,
}

impl ApprovalBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parks the calling pipeline until the approval resolves, the
    /// safety timeout fires, or the turn is cancelled. The entry is
    /// removed on every exit path.
    pub async fn wait(
        &self,
        session_id: &str,
        call_id: &str,
        cancel: &CancellationToken,
    ) -> ApprovalWait {
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().expect("pending lock");
            pending.insert(
                call_id.to_string(),
                PendingApproval {
                    session_id: session_id.to_string(),
                    resolver: tx,
                },
            );
        }
        debug!(call_id = %call_id, session_id = %session_id, "Question pending");

        let wait = tokio::select! {
            resolution = rx => match resolution {
                Ok(decision) => ApprovalWait::Resolved(decision),
                // Resolver dropped via cancel_session.
                Err(_) => ApprovalWait::Cancelled,
            },
            _ = tokio::time::sleep(APPROVAL_SAFETY_TIMEOUT) => ApprovalWait::TimedOut,
            _ = cancel.cancelled() => ApprovalWait::Cancelled,
        };

        self.pending
            .lock()
            .expect("pending lock")
            .remove(call_id);
        wait
    }

    /// External resolution entry point. Returns false when no approval
    /// with that call id is pending (already resolved or timed out).
    pub fn resolve(&self, call_id: &str, decision: ApprovalDecision) -> bool {
        let entry = self.pending.lock().expect("pending lock").remove(call_id);
        match entry {
            Some(pending) => pending.resolver.send(decision).is_ok(),
            None => false,
        }
    }

    /// Denies every approval belonging to `session_id`, leaving other
    /// sessions' approvals untouched.
    pub fn cancel_session(&self, session_id: &str) {
        let drained: Vec<PendingApproval> = {
            let mut pending = self.pending.lock().expect("pending lock");
            let ids: Vec<String> = pending
                .iter()
                .filter(|(_, approval)| approval.session_id == session_id)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| pending.remove(&id))
                .collect()
        };
        for approval in drained {
            let _ = approval.resolver.send(ApprovalDecision::Denied {
                message: "Session cancelled.".to_string(),
            });
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().expect("pending lock").len()
    }
}

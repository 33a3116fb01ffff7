//! In-memory registry of pending human-approval requests.
//!
//! Every approval resolves exactly once: by an explicit decision, by its
//! timeout (auto-deny), or by session cancellation. The registry is owned by
//! the hub instance - no module-level state - so multiple gateways can
//! coexist in one process. Nothing here persists: a process restart loses
//! all pending approvals, an accepted tradeoff for simplicity.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;

use relay_types::SessionId;

const MIN_TIMEOUT: Duration = Duration::from_secs(1);
const MAX_TIMEOUT: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ApprovalId(String);

impl ApprovalId {
    fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ApprovalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ApprovalId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalDecision {
    Approve,
    Deny,
}

/// Terminal state of one approval. Exactly one of these is ever delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApprovalResolution {
    pub approved: bool,
    pub timed_out: bool,
    pub canceled: bool,
}

impl ApprovalResolution {
    fn decided(approved: bool) -> Self {
        Self {
            approved,
            timed_out: false,
            canceled: false,
        }
    }

    fn timed_out() -> Self {
        Self {
            approved: false,
            timed_out: true,
            canceled: false,
        }
    }

    fn canceled() -> Self {
        Self {
            approved: false,
            timed_out: false,
            canceled: true,
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ApprovalError {
    /// Unknown id, or an approval that has already been resolved.
    #[error("approval not found")]
    NotFound,
    /// The supplied session does not own this approval.
    #[error("approval belongs to a different session")]
    WrongSession,
}

struct PendingEntry {
    session_id: SessionId,
    created_at: std::time::Instant,
    tx: oneshot::Sender<ApprovalResolution>,
}

/// Registry of pending approvals, cheap to clone and share.
#[derive(Clone, Default)]
pub struct ApprovalHub {
    pending: Arc<Mutex<HashMap<ApprovalId, PendingEntry>>>,
}

impl ApprovalHub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending approval and start its auto-deny timer.
    ///
    /// The timeout is clamped to `[1s, 1h]`. The returned receiver always
    /// resolves; if the hub itself is dropped the wait reports a canceled
    /// denial.
    pub fn create(
        &self,
        session_id: &SessionId,
        timeout: Duration,
    ) -> (ApprovalId, oneshot::Receiver<ApprovalResolution>) {
        let id = ApprovalId::generate();
        let (tx, rx) = oneshot::channel();

        self.pending
            .lock()
            .expect("approval lock poisoned")
            .insert(
                id.clone(),
                PendingEntry {
                    session_id: session_id.clone(),
                    created_at: std::time::Instant::now(),
                    tx,
                },
            );

        let timeout = timeout.clamp(MIN_TIMEOUT, MAX_TIMEOUT);
        let pending = Arc::downgrade(&self.pending);
        let timer_id = id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(pending) = pending.upgrade() else {
                return;
            };
            let entry = pending
                .lock()
                .expect("approval lock poisoned")
                .remove(&timer_id);
            if let Some(entry) = entry {
                tracing::debug!(approval = %timer_id, "Approval timed out; auto-denying");
                let _ = entry.tx.send(ApprovalResolution::timed_out());
            }
        });

        (id, rx)
    }

    /// Resolve a still-pending approval.
    ///
    /// A `session_id`, when supplied, must match the entry's owner - this
    /// blocks cross-session approval forgery. A second decision on a settled
    /// approval reports `NotFound`.
    pub fn decide(
        &self,
        id: &ApprovalId,
        decision: ApprovalDecision,
        session_id: Option<&SessionId>,
    ) -> Result<(), ApprovalError> {
        let mut pending = self.pending.lock().expect("approval lock poisoned");

        let entry = pending.get(id).ok_or(ApprovalError::NotFound)?;
        if let Some(session_id) = session_id
            && entry.session_id != *session_id
        {
            return Err(ApprovalError::WrongSession);
        }

        let entry = pending.remove(id).ok_or(ApprovalError::NotFound)?;
        let approved = matches!(decision, ApprovalDecision::Approve);
        tracing::debug!(
            approval = %id,
            approved,
            waited_ms = entry.created_at.elapsed().as_millis() as u64,
            "Approval decided"
        );
        let _ = entry.tx.send(ApprovalResolution::decided(approved));
        Ok(())
    }

    /// Deny-and-cancel every pending approval owned by a session.
    ///
    /// Used when the requesting connection disconnects.
    pub fn cancel_session(&self, session_id: &SessionId) {
        let mut pending = self.pending.lock().expect("approval lock poisoned");
        let ids: Vec<ApprovalId> = pending
            .iter()
            .filter(|(_, entry)| entry.session_id == *session_id)
            .map(|(id, _)| id.clone())
            .collect();
        for id in ids {
            if let Some(entry) = pending.remove(&id) {
                let _ = entry.tx.send(ApprovalResolution::canceled());
            }
        }
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.lock().expect("approval lock poisoned").len()
    }
}

/// Await a resolution; a dropped hub counts as a canceled denial.
pub async fn wait(rx: oneshot::Receiver<ApprovalResolution>) -> ApprovalResolution {
    rx.await.unwrap_or(ApprovalResolution::canceled())
}

//! Exec approval flow
//!
//! An agent asks permission to run a command; operators holding the
//! approvals scope are notified and one of them resolves the request. The
//! requester blocks (bounded by a timeout) until a decision arrives. No
//! decision within the window means no approval.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::protocol::{ExecApprovalDecision, ExecApprovalRequestParams};

/// A command waiting for an operator decision
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingApproval {
    /// Approval id (used by exec.approval.resolve)
    pub id: String,
    /// Command awaiting approval
    pub command: String,
    /// Working directory
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    /// Requesting agent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    /// Session the command belongs to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
    /// When the request arrived
    pub requested_at: DateTime<Utc>,
}

struct PendingSlot {
    approval: PendingApproval,
    decide: oneshot::Sender<ExecApprovalDecision>,
}

/// Tracks approvals awaiting an operator decision
#[derive(Default)]
pub struct ApprovalManager {
    pending: Mutex<HashMap<String, PendingSlot>>,
}

impl ApprovalManager {
    /// Create an empty manager
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new approval request. Returns the pending record (for the
    /// notification event) and the channel the decision will arrive on.
    pub async fn create(
        &self,
        params: &ExecApprovalRequestParams,
    ) -> (PendingApproval, oneshot::Receiver<ExecApprovalDecision>) {
        let approval = PendingApproval {
            id: uuid::Uuid::new_v4().to_string(),
            command: params.command.clone(),
            cwd: params.cwd.clone(),
            agent_id: params.agent_id.clone(),
            session_key: params.session_key.clone(),
            requested_at: Utc::now(),
        };
        info!(id = %approval.id, command = %approval.command, "exec approval requested");
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(
            approval.id.clone(),
            PendingSlot {
                approval: approval.clone(),
                decide: tx,
            },
        );
        (approval, rx)
    }

    /// Pending approvals, oldest first
    pub async fn pending(&self) -> Vec<PendingApproval> {
        let mut approvals: Vec<_> = self
            .pending
            .lock()
            .await
            .values()
            .map(|slot| slot.approval.clone())
            .collect();
        approvals.sort_by_key(|a| a.requested_at);
        approvals
    }

    /// Resolve a pending approval. Consumes the record; a second resolve for
    /// the same id fails with not-found.
    pub async fn resolve(
        &self,
        id: &str,
        decision: ExecApprovalDecision,
    ) -> Result<PendingApproval> {
        let slot = self
            .pending
            .lock()
            .await
            .remove(id)
            .ok_or_else(|| Error::NotFound(format!("no pending approval: {id}")))?;
        info!(id = %id, ?decision, "exec approval resolved");
        // Requester may have timed out already; the decision still counts as
        // resolved for the operators watching.
        let _ = slot.decide.send(decision);
        Ok(slot.approval)
    }

    /// Wait for a decision, bounded by `timeout`. `None` means no decision
    /// arrived in time; the pending record is dropped so a late resolve
    /// reports not-found.
    pub async fn wait_for_decision(
        &self,
        id: &str,
        rx: oneshot::Receiver<ExecApprovalDecision>,
        timeout: Duration,
    ) -> Option<ExecApprovalDecision> {
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(decision)) => Some(decision),
            Ok(Err(_)) => None,
            Err(_) => {
                debug!(id = %id, "exec approval timed out without decision");
                self.pending.lock().await.remove(id);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(command: &str) -> ExecApprovalRequestParams {
        ExecApprovalRequestParams {
            command: command.to_string(),
            cwd: Some("/tmp".to_string()),
            agent_id: Some("agent-1".to_string()),
            session_key: None,
            timeout_ms: None,
        }
    }

    #[tokio::test]
    async fn test_resolve_delivers_decision() {
        let approvals = ApprovalManager::new();
        let (pending, rx) = approvals.create(&request("rm -rf ./build")).await;
        assert_eq!(approvals.pending().await.len(), 1);

        let resolved = approvals
            .resolve(&pending.id, ExecApprovalDecision::AllowOnce)
            .await
            .unwrap();
        assert_eq!(resolved.command, "rm -rf ./build");

        let decision = approvals
            .wait_for_decision(&pending.id, rx, Duration::from_secs(1))
            .await;
        assert_eq!(decision, Some(ExecApprovalDecision::AllowOnce));
        assert!(approvals.pending().await.is_empty());
    }

    #[tokio::test]
    async fn test_resolve_is_terminal() {
        let approvals = ApprovalManager::new();
        let (pending, _rx) = approvals.create(&request("ls")).await;
        approvals
            .resolve(&pending.id, ExecApprovalDecision::Deny)
            .await
            .unwrap();
        assert!(matches!(
            approvals
                .resolve(&pending.id, ExecApprovalDecision::AllowOnce)
                .await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_id_not_found() {
        let approvals = ApprovalManager::new();
        assert!(matches!(
            approvals
                .resolve("nope", ExecApprovalDecision::Deny)
                .await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_yields_no_decision_and_clears_pending() {
        let approvals = ApprovalManager::new();
        let (pending, rx) = approvals.create(&request("make deploy")).await;

        let decision = approvals
            .wait_for_decision(&pending.id, rx, Duration::from_secs(120))
            .await;
        assert_eq!(decision, None);

        // Late resolve after the timeout: the record is gone.
        assert!(matches!(
            approvals
                .resolve(&pending.id, ExecApprovalDecision::AllowOnce)
                .await,
            Err(Error::NotFound(_))
        ));
    }
}

//! Approval broker: holds pending permission requests and resolves them
//! from out-of-band operator decisions.
//!
//! Each approval pairs the request record with the `oneshot` sender that
//! unblocks the suspended `session/request_permission` handler. Resolution
//! removes the entry before sending, so a decision reaches the handler at
//! most once; a second resolution attempt finds nothing and reports "not
//! pending". All state lives behind a single lock.

use std::collections::HashMap;

use chrono::Utc;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info};

use crate::hub::{EventHub, StreamItem};
use crate::models::approval::{ApprovalDecision, ApprovalRequest, ApprovalStatus};
use crate::{AppError, Result};

/// One parked approval: the record plus its resolution channel.
struct PendingApproval {
    request: ApprovalRequest,
    decide: oneshot::Sender<ApprovalDecision>,
}

/// Broker over all pending approvals in the process.
pub struct ApprovalBroker {
    pending: Mutex<HashMap<String, PendingApproval>>,
    hub: EventHub,
}

impl ApprovalBroker {
    /// Create a broker that announces new approvals through `hub`.
    #[must_use]
    pub fn new(hub: EventHub) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            hub,
        }
    }

    /// Register a newly received approval and broadcast it.
    ///
    /// Returns the receiver the suspended ACP handler awaits; it resolves
    /// exactly once, when an operator (or session teardown) decides.
    pub async fn create(&self, request: ApprovalRequest) -> oneshot::Receiver<ApprovalDecision> {
        let (tx, rx) = oneshot::channel();
        info!(
            approval_id = %request.id,
            session_id = %request.session_id,
            title = request.tool_call.title.as_deref().unwrap_or(""),
            "approval requested"
        );
        self.hub.publish(StreamItem::Approval(request.clone()));
        self.pending.lock().await.insert(
            request.id.clone(),
            PendingApproval {
                request,
                decide: tx,
            },
        );
        rx
    }

    /// Approve a pending request with the given option.
    ///
    /// # Errors
    ///
    /// Returns `AppError::AlreadyResolved` when the id is unknown or was
    /// already resolved — callers treat that as an idempotent no-op.
    pub async fn approve(&self, approval_id: &str, option_id: &str) -> Result<ApprovalRequest> {
        self.resolve(
            approval_id,
            ApprovalStatus::Approved,
            ApprovalDecision::Selected {
                option_id: option_id.to_owned(),
            },
        )
        .await
    }

    /// Deny a pending request.
    ///
    /// # Errors
    ///
    /// Returns `AppError::AlreadyResolved` when the id is not pending.
    pub async fn deny(&self, approval_id: &str) -> Result<ApprovalRequest> {
        self.resolve(approval_id, ApprovalStatus::Rejected, ApprovalDecision::Cancelled)
            .await
    }

    /// Expire a pending request because its session terminated.
    ///
    /// Deny-equivalent for the broker; the suspended handler returns a
    /// cancelled outcome to the agent.
    ///
    /// # Errors
    ///
    /// Returns `AppError::AlreadyResolved` when the id is not pending.
    pub async fn expire(&self, approval_id: &str) -> Result<ApprovalRequest> {
        self.resolve(approval_id, ApprovalStatus::Expired, ApprovalDecision::Cancelled)
            .await
    }

    /// Expire every pending approval referencing `session_id`.
    ///
    /// Returns the expired records, oldest first.
    pub async fn expire_session(&self, session_id: &str) -> Vec<ApprovalRequest> {
        let drained: Vec<PendingApproval> = {
            let mut pending = self.pending.lock().await;
            let ids: Vec<String> = pending
                .iter()
                .filter(|(_, p)| p.request.session_id == session_id)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter().filter_map(|id| pending.remove(&id)).collect()
        };

        let now = Utc::now();
        let mut expired: Vec<ApprovalRequest> = drained
            .into_iter()
            .map(|mut entry| {
                if entry.decide.send(ApprovalDecision::Cancelled).is_err() {
                    debug!(
                        approval_id = %entry.request.id,
                        "approval handler gone before expiry delivery"
                    );
                }
                entry.request.status = ApprovalStatus::Expired;
                entry.request.resolved_at = Some(now);
                entry.request
            })
            .collect();
        expired.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        expired
    }

    /// Pending approvals in creation order.
    pub async fn list(&self) -> Vec<ApprovalRequest> {
        let pending = self.pending.lock().await;
        let mut requests: Vec<ApprovalRequest> =
            pending.values().map(|p| p.request.clone()).collect();
        requests.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        requests
    }

    /// Whether any approval for `session_id` is pending.
    pub async fn has_pending_for(&self, session_id: &str) -> bool {
        self.pending
            .lock()
            .await
            .values()
            .any(|p| p.request.session_id == session_id)
    }

    /// Remove the entry, deliver the decision, and stamp the resolution.
    async fn resolve(
        &self,
        approval_id: &str,
        status: ApprovalStatus,
        decision: ApprovalDecision,
    ) -> Result<ApprovalRequest> {
        let entry = self.pending.lock().await.remove(approval_id);
        let Some(mut entry) = entry else {
            return Err(AppError::AlreadyResolved(format!(
                "approval {approval_id} is not pending"
            )));
        };

        if entry.decide.send(decision).is_err() {
            debug!(approval_id, "approval handler gone before decision delivery");
        }
        entry.request.status = status;
        entry.request.resolved_at = Some(Utc::now());
        info!(approval_id, status = ?status, "approval resolved");
        Ok(entry.request)
    }
}

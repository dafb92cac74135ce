//! ApprovalGate: approval rows, transitions and payment gating

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, info, warn};
use warden_audit::{AuditLog, AuditRecord, AuditStream};
use warden_types::{Amount, ApprovalId, Clock, Metadata, RowTable, SharedClock, WardenError};

use crate::{
    actions, Approval, ApprovalDecision, ApprovalError, ApprovalStatus, ApprovalTtls,
    GateOutcome, Result, Urgency,
};

/// Actor recorded when the gate itself expires an approval
pub const SYSTEM_ACTOR: &str = "system";

fn stream(id: &ApprovalId) -> AuditStream {
    AuditStream::new("approval", id)
}

/// Approval requests and their decisions
pub struct ApprovalGate {
    rows: RowTable<ApprovalId, Approval>,
    ttls: ApprovalTtls,
    audit: Arc<dyn AuditLog>,
    clock: SharedClock,
}

impl ApprovalGate {
    pub fn new(
        ttls: ApprovalTtls,
        audit: Arc<dyn AuditLog>,
        clock: SharedClock,
        lock_timeout: StdDuration,
    ) -> Self {
        Self {
            rows: RowTable::new("approval", lock_timeout),
            ttls,
            audit,
            clock,
        }
    }

    /// Open a pending approval that expires after the urgency's TTL
    pub async fn create(
        &self,
        action: &str,
        amount: Amount,
        requested_by: &str,
        urgency: Urgency,
    ) -> Result<Approval> {
        self.create_with_metadata(action, amount, requested_by, urgency, Metadata::default())
            .await
    }

    pub async fn create_with_metadata(
        &self,
        action: &str,
        amount: Amount,
        requested_by: &str,
        urgency: Urgency,
        metadata: Metadata,
    ) -> Result<Approval> {
        if action.trim().is_empty() {
            return Err(WardenError::invalid_input("action", "must not be empty").into());
        }
        if amount.is_negative() {
            return Err(WardenError::invalid_input("amount", "must not be negative").into());
        }
        metadata.validate()?;

        let now = self.clock.now();
        let approval = Approval {
            id: ApprovalId::new(),
            action: action.to_string(),
            amount,
            requested_by: requested_by.to_string(),
            urgency,
            status: ApprovalStatus::Pending,
            created_at: now,
            expires_at: now + self.ttls.ttl(urgency),
            reviewer: None,
            decided_at: None,
            metadata,
        };

        let record = AuditRecord::new(stream(&approval.id), actions::APPROVAL_REQUESTED, requested_by, now)
            .with_new(json!({
                "action": approval.action,
                "amount": approval.amount,
                "urgency": approval.urgency,
                "status": approval.status,
                "expires_at": approval.expires_at,
            }));
        self.audit.append(record).await?;

        if !self.rows.insert(approval.id.clone(), approval.clone()) {
            return Err(WardenError::internal(format!("duplicate approval id {}", approval.id)).into());
        }
        info!(
            approval_id = %approval.id,
            urgency = %urgency,
            expires_at = %approval.expires_at,
            "Approval requested"
        );
        Ok(approval)
    }

    /// Approve or deny a pending approval.
    ///
    /// Deciding after the deadline persists `expired` and returns
    /// [`ApprovalError::ApprovalExpired`].
    pub async fn decide(
        &self,
        approval_id: &ApprovalId,
        decision: ApprovalDecision,
        reviewer: &str,
    ) -> Result<Approval> {
        let mut guard = self.lock(approval_id).await?;
        let now = self.clock.now();

        if guard.is_due_to_expire(now) {
            let expired = self.expire(&guard, now).await?;
            let expired_at = expired.expires_at;
            *guard = expired;
            return Err(ApprovalError::ApprovalExpired {
                approval_id: approval_id.to_string(),
                expired_at,
            });
        }
        ensure_pending(&guard)?;

        let (status, action) = match decision {
            ApprovalDecision::Approve => (ApprovalStatus::Approved, actions::APPROVAL_APPROVED),
            ApprovalDecision::Deny => (ApprovalStatus::Denied, actions::APPROVAL_DENIED),
        };
        let mut approval = guard.clone();
        approval.status = status;
        approval.reviewer = Some(reviewer.to_string());
        approval.decided_at = Some(now);

        self.write_transition(&guard, &approval, action, reviewer, now).await?;
        *guard = approval;
        info!(approval_id = %approval_id, status = %status, reviewer = reviewer, "Approval decided");
        Ok(guard.clone())
    }

    /// Withdraw a pending approval
    pub async fn cancel(&self, approval_id: &ApprovalId, actor: &str) -> Result<Approval> {
        let mut guard = self.lock(approval_id).await?;
        let now = self.clock.now();

        if guard.is_due_to_expire(now) {
            *guard = self.expire(&guard, now).await?;
        }
        ensure_pending(&guard)?;

        let mut approval = guard.clone();
        approval.status = ApprovalStatus::Cancelled;
        approval.decided_at = Some(now);

        self.write_transition(&guard, &approval, actions::APPROVAL_CANCELLED, actor, now)
            .await?;
        *guard = approval;
        info!(approval_id = %approval_id, actor = actor, "Approval cancelled");
        Ok(guard.clone())
    }

    /// Current approval, expiring it first if its deadline has passed
    pub async fn get(&self, approval_id: &ApprovalId) -> Result<Option<Approval>> {
        let Some(mut guard) = self.rows.lock(approval_id).await? else {
            return Ok(None);
        };
        let now = self.clock.now();
        if guard.is_due_to_expire(now) {
            match self.expire(&guard, now).await {
                Ok(expired) => *guard = expired,
                Err(err) => {
                    // Report the effective status; the transition is retried on the next read
                    warn!(approval_id = %approval_id, error = %err, "Could not persist approval expiry");
                    let mut view = guard.clone();
                    view.status = ApprovalStatus::Expired;
                    return Ok(Some(view));
                }
            }
        }
        Ok(Some(guard.clone()))
    }

    /// Status of an approval after lazy expiry
    pub async fn status(&self, approval_id: &ApprovalId) -> Result<ApprovalStatus> {
        self.get(approval_id)
            .await?
            .map(|approval| approval.status)
            .ok_or_else(|| ApprovalError::ApprovalNotFound {
                approval_id: approval_id.to_string(),
            })
    }

    /// Whether a payment referencing this approval may debit funds
    pub async fn check_payment(&self, approval_id: &ApprovalId) -> Result<GateOutcome> {
        let status = self.status(approval_id).await?;
        let outcome = GateOutcome::for_status(status);
        if let GateOutcome::Blocked { status } = outcome {
            warn!(approval_id = %approval_id, status = %status, "Payment blocked by approval gate");
        }
        Ok(outcome)
    }

    /// Expire every pending approval past its deadline. Rows busy with
    /// another writer are left for the next sweep.
    pub async fn sweep_expired(&self) -> Result<usize> {
        let now = self.clock.now();
        let mut expired = 0;
        for approval_id in self.rows.keys() {
            let mut guard = match self.rows.lock(&approval_id).await {
                Ok(Some(guard)) => guard,
                Ok(None) => continue,
                Err(err) if err.is_retriable() => {
                    debug!(approval_id = %approval_id, "Approval busy, skipped by sweep");
                    continue;
                }
                Err(err) => return Err(err.into()),
            };
            if guard.is_due_to_expire(now) {
                *guard = self.expire(&guard, now).await?;
                expired += 1;
            }
        }
        if expired > 0 {
            info!(expired, "Expired pending approvals");
        }
        Ok(expired)
    }

    /// Approvals in a given status, oldest first
    pub async fn list(&self, status: Option<ApprovalStatus>) -> Result<Vec<Approval>> {
        let mut approvals = self
            .rows
            .snapshot_where(|a| status.map_or(true, |s| a.status == s))
            .await?;
        approvals.sort_by_key(|a| a.created_at);
        Ok(approvals)
    }

    async fn lock(&self, approval_id: &ApprovalId) -> Result<warden_types::RowGuard<Approval>> {
        self.rows
            .lock(approval_id)
            .await?
            .ok_or_else(|| ApprovalError::ApprovalNotFound {
                approval_id: approval_id.to_string(),
            })
    }

    async fn expire(&self, current: &Approval, now: DateTime<Utc>) -> Result<Approval> {
        let mut approval = current.clone();
        approval.status = ApprovalStatus::Expired;
        self.write_transition(current, &approval, actions::APPROVAL_EXPIRED, SYSTEM_ACTOR, now)
            .await?;
        info!(approval_id = %approval.id, expires_at = %approval.expires_at, "Approval expired");
        Ok(approval)
    }

    async fn write_transition(
        &self,
        old: &Approval,
        new: &Approval,
        action: &str,
        actor: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let record = AuditRecord::new(stream(&new.id), action, actor, now)
            .with_old(json!({ "status": old.status }))
            .with_new(json!({
                "status": new.status,
                "reviewer": new.reviewer,
                "decided_at": new.decided_at,
            }));
        self.audit.append(record).await?;
        Ok(())
    }
}

fn ensure_pending(approval: &Approval) -> Result<()> {
    if approval.status == ApprovalStatus::Pending {
        Ok(())
    } else {
        Err(ApprovalError::NotPending {
            approval_id: approval.id.to_string(),
            status: approval.status.to_string(),
        })
    }
}

//! SpendGuard: atomic evaluate-and-record of proposed spends
//!
//! Evaluation order, short-circuiting on the first failure:
//!
//! 1. policy must exist
//! 2. amount must be positive
//! 3. `amount <= limit_per_tx`
//! 4. `spent_total + amount <= limit_total`
//! 5. every window, after resetting expired ones: `current_spent + amount <= limit_amount`
//! 6. velocity ceilings, when requested
//!
//! The whole evaluation runs under the policy row lock on a working copy of
//! the row. The copy is published only after its audit entry is written, so
//! an audit failure leaves the policy untouched.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, info, warn};
use warden_audit::AuditRecord;
use warden_types::{Amount, HoldId, MerchantId, PolicyId};

use crate::{
    actions, velocity, Decision, Hold, HoldOutcome, HoldStatus, PolicyError, PolicyRow,
    PolicyStore, ReasonCode, Result, VelocityLimits,
};

enum SpendKind {
    Spend,
    Hold,
}

/// Atomic spend enforcement over a [`PolicyStore`]
#[derive(Clone)]
pub struct SpendGuard {
    store: Arc<PolicyStore>,
}

impl SpendGuard {
    pub fn new(store: Arc<PolicyStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<PolicyStore> {
        &self.store
    }

    /// Evaluate and, if allowed, record a spend. Never returns an error:
    /// any failure to evaluate is a decline with `evaluation_failed`.
    pub async fn record_spend(
        &self,
        policy_id: &PolicyId,
        amount: Amount,
        merchant_id: &MerchantId,
    ) -> Decision {
        let result = self.try_record_spend(policy_id, amount, merchant_id, None).await;
        self.fail_closed(policy_id, amount, result)
    }

    /// [`record_spend`](Self::record_spend) with velocity checked in the same unit of work
    pub async fn record_spend_with_velocity(
        &self,
        policy_id: &PolicyId,
        amount: Amount,
        merchant_id: &MerchantId,
        limits: VelocityLimits,
    ) -> Decision {
        let result = self
            .try_record_spend(policy_id, amount, merchant_id, Some(limits))
            .await;
        self.fail_closed(policy_id, amount, result)
    }

    /// Fallible form of [`record_spend`](Self::record_spend), for callers that
    /// retry retriable errors themselves
    pub async fn try_record_spend(
        &self,
        policy_id: &PolicyId,
        amount: Amount,
        merchant_id: &MerchantId,
        velocity: Option<VelocityLimits>,
    ) -> Result<Decision> {
        self.evaluate(policy_id, amount, merchant_id, velocity, SpendKind::Spend)
            .await
            .map(|(decision, _)| decision)
    }

    /// Standalone velocity check; records nothing
    pub async fn check_velocity(
        &self,
        policy_id: &PolicyId,
        max_per_minute: u32,
        max_per_hour: u32,
    ) -> Decision {
        let limits = VelocityLimits::new(max_per_minute, max_per_hour);
        let result = self.try_check_velocity(policy_id, limits).await;
        self.fail_closed(policy_id, Amount::zero(), result)
    }

    async fn try_check_velocity(
        &self,
        policy_id: &PolicyId,
        limits: VelocityLimits,
    ) -> Result<Decision> {
        let row = self.store.lock(policy_id).await?;
        let now = self.store.now();
        let Some(row) = row else {
            return Ok(Decision::decline(
                policy_id.clone(),
                Amount::zero(),
                ReasonCode::PolicyNotFound,
                now,
            ));
        };
        Ok(match row.velocity.check(now, limits) {
            Some(reason) => Decision::decline(policy_id.clone(), Amount::zero(), reason, now),
            None => Decision::allow(policy_id.clone(), Amount::zero(), now),
        })
    }

    /// Reserve allowance for a later capture or release
    pub async fn place_hold(
        &self,
        policy_id: &PolicyId,
        amount: Amount,
        merchant_id: &MerchantId,
    ) -> HoldOutcome {
        match self
            .evaluate(policy_id, amount, merchant_id, None, SpendKind::Hold)
            .await
        {
            Ok((decision, hold)) => HoldOutcome { decision, hold },
            Err(err) => HoldOutcome {
                decision: self.fail_closed(policy_id, amount, Err(err)),
                hold: None,
            },
        }
    }

    /// Convert a hold into a final spend; allowance stays consumed
    pub async fn capture_hold(&self, hold_id: &HoldId) -> Result<Hold> {
        self.settle_hold(hold_id, HoldStatus::Captured).await
    }

    /// Cancel a hold and give its allowance back
    pub async fn release_hold(&self, hold_id: &HoldId) -> Result<Hold> {
        self.settle_hold(hold_id, HoldStatus::Released).await
    }

    /// Compensate an allowed spend whose downstream effect did not happen
    /// (for example a ledger write that failed after the decision)
    pub async fn reverse_spend(&self, decision: &Decision, reason: &str) -> Result<()> {
        if !decision.allowed {
            return Ok(());
        }
        let mut guard = self
            .store
            .lock(&decision.policy_id)
            .await?
            .ok_or_else(|| PolicyError::PolicyNotFound {
                policy_id: decision.policy_id.to_string(),
            })?;

        let now = self.store.now();
        let mut row: PolicyRow = guard.clone();
        let velocity_released = row.compensate(decision.amount, decision.decided_at, now);

        let record = AuditRecord::new(row.stream(), actions::SPEND_REVERSED, "spend_guard", now)
            .with_old(guard.audit_state())
            .with_new(json!({
                "amount": decision.amount,
                "reason": reason,
                "velocity_released": velocity_released,
                "state": row.audit_state(),
            }));
        self.store.audit().append(record).await?;
        *guard = row;

        warn!(policy_id = %decision.policy_id, amount = %decision.amount, reason, "Spend reversed");
        Ok(())
    }

    /// Drop velocity records older than `before`. The cutoff is clamped so
    /// that no record younger than the longest checked window is removed.
    pub async fn prune_velocity(&self, before: DateTime<Utc>) -> Result<usize> {
        let cutoff = before.min(self.store.now() - velocity::min_retention());
        let mut removed = 0;
        for policy_id in self.store.policy_ids() {
            if let Some(mut row) = self.store.lock(&policy_id).await? {
                removed += row.velocity.prune_before(cutoff);
            }
        }
        debug!(removed, cutoff = %cutoff, "Velocity records pruned");
        Ok(removed)
    }

    async fn evaluate(
        &self,
        policy_id: &PolicyId,
        amount: Amount,
        merchant_id: &MerchantId,
        velocity: Option<VelocityLimits>,
        kind: SpendKind,
    ) -> Result<(Decision, Option<Hold>)> {
        let Some(mut guard) = self.store.lock(policy_id).await? else {
            let now = self.store.now();
            warn!(policy_id = %policy_id, "Spend declined: policy not found");
            return Ok((
                Decision::decline(policy_id.clone(), amount, ReasonCode::PolicyNotFound, now),
                None,
            ));
        };

        // Read the clock under the lock so decisions are ordered like commits
        let now = self.store.now();
        if !amount.is_positive() {
            return Ok((
                Decision::decline(policy_id.clone(), amount, ReasonCode::InvalidAmount, now),
                None,
            ));
        }

        let mut row: PolicyRow = guard.clone();
        let resets = row.apply_resets(now);

        let violation = match row.limit_violation(amount)? {
            Some(reason) => Some(reason),
            None => velocity.and_then(|limits| row.velocity.check(now, limits)),
        };

        if let Some(reason) = violation {
            if !resets.is_empty() {
                let record =
                    AuditRecord::new(row.stream(), actions::WINDOW_RESET, "spend_guard", now)
                        .with_old(guard.audit_state())
                        .with_new(json!({ "reset": resets, "state": row.audit_state() }));
                match self.store.audit().append(record).await {
                    Ok(_) => {
                        row.touch(now);
                        *guard = row;
                    }
                    Err(err) => {
                        warn!(policy_id = %policy_id, error = %err, "Window reset not persisted");
                    }
                }
            }
            warn!(policy_id = %policy_id, amount = %amount, reason = %reason, "Spend declined");
            return Ok((
                Decision::decline(policy_id.clone(), amount, reason, now),
                None,
            ));
        }

        row.apply_spend(amount, merchant_id, now)?;

        let hold = match kind {
            SpendKind::Spend => None,
            SpendKind::Hold => {
                let hold = Hold {
                    id: HoldId::new(),
                    policy_id: policy_id.clone(),
                    amount,
                    merchant_id: merchant_id.clone(),
                    status: HoldStatus::Held,
                    placed_at: now,
                    settled_at: None,
                };
                row.holds.insert(hold.id.clone(), hold.clone());
                Some(hold)
            }
        };

        let action = if hold.is_some() {
            actions::HOLD_PLACED
        } else {
            actions::SPEND_RECORDED
        };
        let record = AuditRecord::new(row.stream(), action, row.policy.subject.to_string(), now)
            .with_old(guard.audit_state())
            .with_new(json!({
                "amount": amount,
                "merchant_id": merchant_id,
                "hold_id": hold.as_ref().map(|h| &h.id),
                "state": row.audit_state(),
            }));
        self.store.audit().append(record).await?;

        *guard = row;
        drop(guard);

        if let Some(hold) = &hold {
            self.store.index_hold(hold.id.clone(), policy_id.clone());
        }

        info!(policy_id = %policy_id, amount = %amount, merchant_id = %merchant_id, "Spend approved");
        Ok((Decision::allow(policy_id.clone(), amount, now), hold))
    }

    async fn settle_hold(&self, hold_id: &HoldId, target: HoldStatus) -> Result<Hold> {
        let not_found = || PolicyError::HoldNotFound {
            hold_id: hold_id.to_string(),
        };
        let policy_id = self.store.policy_for_hold(hold_id).ok_or_else(not_found)?;
        let mut guard = self.store.lock(&policy_id).await?.ok_or_else(not_found)?;

        let now = self.store.now();
        let mut row: PolicyRow = guard.clone();
        let hold = row.holds.get_mut(hold_id).ok_or_else(not_found)?;
        if hold.status != HoldStatus::Held {
            return Err(PolicyError::InvalidHoldState {
                hold_id: hold_id.to_string(),
                status: hold.status.to_string(),
            });
        }
        hold.status = target;
        hold.settled_at = Some(now);
        let hold = hold.clone();

        let action = match target {
            HoldStatus::Released => {
                row.compensate(hold.amount, hold.placed_at, now);
                actions::HOLD_RELEASED
            }
            _ => {
                row.touch(now);
                actions::HOLD_CAPTURED
            }
        };

        let record = AuditRecord::new(row.stream(), action, "spend_guard", now)
            .with_old(guard.audit_state())
            .with_new(json!({
                "hold_id": hold.id,
                "amount": hold.amount,
                "state": row.audit_state(),
            }));
        self.store.audit().append(record).await?;
        *guard = row;

        info!(hold_id = %hold_id, status = %target, "Hold settled");
        Ok(hold)
    }

    fn fail_closed(&self, policy_id: &PolicyId, amount: Amount, result: Result<Decision>) -> Decision {
        match result {
            Ok(decision) => decision,
            Err(err) => {
                warn!(
                    policy_id = %policy_id,
                    error = %err,
                    code = err.error_code(),
                    "Spend evaluation failed; declining"
                );
                Decision::decline(
                    policy_id.clone(),
                    amount,
                    ReasonCode::EvaluationFailed,
                    self.store.now(),
                )
            }
        }
    }
}

//! Periodic maintenance: anchoring, velocity pruning, approval expiry and
//! unmatched expectation cleanup
//!
//! Each task runs independently; a failure is reported and the remaining
//! tasks still run. Every task is idempotent, so a run may be repeated or
//! overlap a previous one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use warden_ledger::AnchorRecord;
use warden_types::Clock;

use crate::{EngineError, Warden, WardenEvent};

/// A maintenance task that did not complete
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceFailure {
    pub task: String,
    pub error_code: String,
    pub message: String,
}

/// What one maintenance run did
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub anchors: Vec<AnchorRecord>,
    pub velocity_pruned: usize,
    pub approvals_expired: usize,
    /// Expectations dropped because no provider event ever matched them
    pub expectations_pruned: usize,
    pub failures: Vec<MaintenanceFailure>,
}

impl MaintenanceReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

impl Warden {
    /// Run every maintenance task once
    pub async fn run_maintenance(&self) -> MaintenanceReport {
        let started_at = self.clock.now();
        let settings = &self.config.maintenance;
        let mut failures = Vec::new();
        let mut record = |task: &str, err: EngineError| {
            warn!(task = task, error_code = err.error_code(), error = %err, "Maintenance task failed");
            failures.push(MaintenanceFailure {
                task: task.to_string(),
                error_code: err.error_code().to_string(),
                message: err.to_string(),
            });
        };

        let mut anchors = Vec::new();
        if settings.anchor_enabled {
            loop {
                match self.anchor.anchor_pending(self.config.ledger.anchor_max_leaves).await {
                    Ok(Some(anchor)) => anchors.push(anchor),
                    Ok(None) => break,
                    Err(err) => {
                        record("anchor", err.into());
                        break;
                    }
                }
            }
        }

        let cutoff = started_at - settings.velocity_retention();
        let velocity_pruned = match self.guard.prune_velocity(cutoff).await {
            Ok(removed) => removed,
            Err(err) => {
                record("prune_velocity", err.into());
                0
            }
        };

        let approvals_expired = match self.approvals.sweep_expired().await {
            Ok(expired) => expired,
            Err(err) => {
                record("sweep_approvals", err.into());
                0
            }
        };

        let stale_before = started_at - settings.expectation_retention();
        let expectations_pruned = match self.reconciliation.prune_unpublished(stale_before).await {
            Ok(removed) => removed,
            Err(err) => {
                record("prune_expectations", err.into());
                0
            }
        };

        let report = MaintenanceReport {
            started_at,
            finished_at: self.clock.now(),
            anchors,
            velocity_pruned,
            approvals_expired,
            expectations_pruned,
            failures,
        };
        info!(
            anchors = report.anchors.len(),
            velocity_pruned = report.velocity_pruned,
            approvals_expired = report.approvals_expired,
            expectations_pruned = report.expectations_pruned,
            failures = report.failures.len(),
            "Maintenance run complete"
        );
        self.emit_event(WardenEvent::MaintenanceCompleted {
            anchors_created: report.anchors.len(),
            velocity_pruned: report.velocity_pruned,
            approvals_expired: report.approvals_expired,
            failures: report.failures.len(),
            timestamp: report.finished_at,
        });
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::WardenConfig;
    use chrono::Duration;
    use std::sync::Arc;
    use warden_approval::{ApprovalStatus, Urgency};
    use warden_audit::InMemoryAuditLog;
    use warden_ledger::{verify_anchor, EntryDraft};
    use warden_policy::NewPolicy;
    use warden_reconciliation::Rail;
    use warden_types::{
        AccountId, AgentId, Amount, Currency, ManualClock, MerchantId, OrgId, TransferId,
    };

    fn warden_at(config: WardenConfig) -> (Warden, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_now());
        let warden = Warden::with_parts(config, Arc::new(InMemoryAuditLog::new()), clock.clone()).unwrap();
        (warden, clock)
    }

    async fn commit_transfer(warden: &Warden, amount: i64) {
        let batch = warden.begin_batch(TransferId::new()).await.unwrap();
        warden
            .append_entry(&batch.id, EntryDraft::debit(AccountId::new(), Amount::new(amount), Currency::usd()))
            .await
            .unwrap();
        warden
            .append_entry(&batch.id, EntryDraft::credit(AccountId::new(), Amount::new(amount), Currency::usd()))
            .await
            .unwrap();
        warden.commit_batch(&batch.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_run_is_clean() {
        let (warden, _) = warden_at(WardenConfig::default());
        let report = warden.run_maintenance().await;
        assert!(report.is_clean());
        assert!(report.anchors.is_empty());
        assert_eq!(report.velocity_pruned, 0);
        assert_eq!(report.approvals_expired, 0);
    }

    #[tokio::test]
    async fn test_anchors_in_chunks_until_caught_up() {
        let mut config = WardenConfig::default();
        config.ledger.anchor_max_leaves = 4;
        let (warden, _) = warden_at(config);
        for amount in 1..=5 {
            commit_transfer(&warden, amount).await;
        }

        let report = warden.run_maintenance().await;
        assert!(report.is_clean());
        // 10 entries in chunks of at most 4
        assert_eq!(report.anchors.len(), 3);
        assert_eq!(report.anchors[0].from_seq, 1);
        assert_eq!(report.anchors[2].to_seq, 10);
        assert!(report.anchors.iter().all(verify_anchor));

        let again = warden.run_maintenance().await;
        assert!(again.anchors.is_empty());
    }

    #[tokio::test]
    async fn test_anchoring_can_be_disabled() {
        let mut config = WardenConfig::default();
        config.maintenance.anchor_enabled = false;
        let (warden, _) = warden_at(config);
        commit_transfer(&warden, 10).await;
        let report = warden.run_maintenance().await;
        assert!(report.anchors.is_empty());
        assert_eq!(warden.anchor().last_anchored_sequence().await, 0);
    }

    #[tokio::test]
    async fn test_prunes_velocity_and_expires_approvals() {
        let (warden, clock) = warden_at(WardenConfig::default());
        let policy = warden
            .create_policy(
                NewPolicy::new(AgentId::new(), Currency::usd(), Amount::new(100), Amount::new(10_000)),
                "owner",
            )
            .await
            .unwrap();
        for _ in 0..3 {
            let decision = warden
                .record_spend(&policy.id, Amount::new(1), &MerchantId::new())
                .await;
            assert!(decision.allowed);
        }
        let approval = warden
            .create_approval("payment", Amount::new(50), "agent_1", Urgency::Critical)
            .await
            .unwrap();

        clock.advance(Duration::hours(2));
        let report = warden.run_maintenance().await;
        assert!(report.is_clean());
        assert_eq!(report.velocity_pruned, 3);
        assert_eq!(report.approvals_expired, 1);
        assert_eq!(
            warden.approval_status(&approval.id).await.unwrap(),
            ApprovalStatus::Expired
        );

        let again = warden.run_maintenance().await;
        assert_eq!(again.velocity_pruned, 0);
        assert_eq!(again.approvals_expired, 0);
    }

    #[tokio::test]
    async fn test_unmatched_expectations_are_pruned() {
        let (warden, clock) = warden_at(WardenConfig::default());
        let org = OrgId::new();
        warden
            .reconciliation()
            .expect_transfer(&org, Rail::BankTransfer, "acme-bank", "ach-never", Amount::new(100), Currency::usd())
            .await
            .unwrap();

        let early = warden.run_maintenance().await;
        assert_eq!(early.expectations_pruned, 0);

        clock.advance(Duration::days(7) + Duration::seconds(1));
        let report = warden.run_maintenance().await;
        assert!(report.is_clean());
        assert_eq!(report.expectations_pruned, 1);
        assert_eq!(warden.run_maintenance().await.expectations_pruned, 0);
    }

    #[tokio::test]
    async fn test_recent_velocity_is_kept() {
        let (warden, clock) = warden_at(WardenConfig::default());
        let policy = warden
            .create_policy(
                NewPolicy::new(AgentId::new(), Currency::usd(), Amount::new(100), Amount::new(10_000)),
                "owner",
            )
            .await
            .unwrap();
        warden
            .record_spend(&policy.id, Amount::new(1), &MerchantId::new())
            .await;
        clock.advance(Duration::minutes(30));
        let report = warden.run_maintenance().await;
        assert_eq!(report.velocity_pruned, 0);
    }
}

//! Warden Engine - the facade over spend enforcement, ledger and reconciliation
//!
//! `Warden` owns one instance of every component and shares a single audit
//! log, clock and lock timeout between them:
//!
//! ```text
//! payment attempt ──► ApprovalGate (if referenced)
//!                 ──► SpendGuard (policy row lock, velocity)
//!                 ──► LedgerEngine (balanced batch) ──► AuditAnchor
//!                 ──► ReconciliationEngine (expectation)
//! provider events ──► ReconciliationEngine ──► breaks ──► review queue
//! ```
//!
//! Every state change is audited by the component that makes it. The facade
//! adds best-effort [`WardenEvent`] broadcasting on top.

pub mod config;
pub mod events;
pub mod maintenance;
pub mod payment;

pub use config::*;
pub use events::WardenEvent;
pub use maintenance::*;
pub use payment::*;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use warden_approval::{
    Approval, ApprovalDecision, ApprovalError, ApprovalGate, ApprovalStatus, Urgency,
};
use warden_audit::{AuditError, AuditLog, InMemoryAuditLog};
use warden_crypto::{CryptoError, KeyPair};
use warden_ledger::{AuditAnchor, CommitResult, EntryDraft, LedgerBatch, LedgerEngine, LedgerError};
use warden_policy::{
    Decision, NewPolicy, PolicyError, PolicySnapshot, PolicyStore, SpendGuard, SpendingPolicy,
};
use warden_reconciliation::{
    BreakStatus, EventNormalizer, JourneyUpdate, ManualReviewItem, Rail, ReconciliationBreak,
    ReconciliationEngine, ReconciliationError, ReviewStatus, StatusMapNormalizer,
};
use warden_types::{
    retry_with_backoff, Amount, ApprovalId, BatchId, Clock, MerchantId, OrgId, PolicyId,
    Retriable, SharedClock, SystemClock, TransferId, WardenError,
};

/// Capacity of the event broadcast channel
const EVENT_CHANNEL_CAPACITY: usize = 1_000;

/// Errors surfaced by the facade
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Invalid configuration: {message}")]
    Config { message: String },

    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Reconciliation(#[from] ReconciliationError),

    #[error(transparent)]
    Approval(#[from] ApprovalError),

    #[error("Audit write failed: {0}")]
    Audit(#[from] AuditError),

    #[error("Anchor key: {0}")]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Core(#[from] WardenError),
}

impl EngineError {
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Config { .. } | Self::Crypto(_) => false,
            Self::Policy(err) => err.is_retriable(),
            Self::Ledger(err) => err.is_retriable(),
            Self::Reconciliation(err) => err.is_retriable(),
            Self::Approval(err) => err.is_retriable(),
            Self::Audit(err) => err.is_retriable(),
            Self::Core(err) => err.is_retriable(),
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Config { .. } => "INVALID_CONFIG",
            Self::Policy(err) => err.error_code(),
            Self::Ledger(err) => err.error_code(),
            Self::Reconciliation(err) => err.error_code(),
            Self::Approval(err) => err.error_code(),
            Self::Audit(err) => err.error_code(),
            Self::Crypto(_) => "INVALID_ANCHOR_KEY",
            Self::Core(err) => err.error_code(),
        }
    }
}

impl Retriable for EngineError {
    fn is_retriable(&self) -> bool {
        EngineError::is_retriable(self)
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// The spend-enforcement, ledger and reconciliation engine
pub struct Warden {
    config: WardenConfig,
    audit: Arc<dyn AuditLog>,
    clock: SharedClock,
    policies: Arc<PolicyStore>,
    guard: SpendGuard,
    ledger: Arc<LedgerEngine>,
    anchor: AuditAnchor,
    reconciliation: ReconciliationEngine,
    approvals: ApprovalGate,
    normalizer: Arc<dyn EventNormalizer>,
    events: broadcast::Sender<WardenEvent>,
    started_at: DateTime<Utc>,
}

impl Warden {
    /// Engine over an in-memory audit log and the wall clock
    pub fn new(config: WardenConfig) -> Result<Self> {
        Self::with_parts(config, Arc::new(InMemoryAuditLog::new()), Arc::new(SystemClock))
    }

    /// Engine over a caller-supplied audit log and clock
    pub fn with_parts(
        config: WardenConfig,
        audit: Arc<dyn AuditLog>,
        clock: SharedClock,
    ) -> Result<Self> {
        config.validate()?;
        let lock_timeout = config.spend.lock_timeout();

        let signer = match &config.ledger.anchor_signing_key {
            Some(seed) => KeyPair::from_hex(seed)?,
            None => {
                warn!("No anchor signing key configured, generating an ephemeral one");
                KeyPair::generate()
            }
        };

        let policies = Arc::new(PolicyStore::new(audit.clone(), clock.clone(), lock_timeout));
        let guard = SpendGuard::new(policies.clone());
        let ledger = Arc::new(LedgerEngine::new(audit.clone(), clock.clone(), lock_timeout));
        let anchor = AuditAnchor::new(ledger.clone(), signer);
        let reconciliation = ReconciliationEngine::new(
            config.reconciliation.rules.clone(),
            audit.clone(),
            clock.clone(),
            lock_timeout,
        );
        let approvals = ApprovalGate::new(
            config.approval.ttls.clone(),
            audit.clone(),
            clock.clone(),
            lock_timeout,
        );
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let started_at = clock.now();

        info!(
            anchor_key = %anchor.public_key(),
            lock_timeout_ms = config.spend.lock_timeout_ms,
            "Warden engine started"
        );

        Ok(Self {
            config,
            audit,
            clock,
            policies,
            guard,
            ledger,
            anchor,
            reconciliation,
            approvals,
            normalizer: Arc::new(StatusMapNormalizer::default()),
            events,
            started_at,
        })
    }

    /// Replace the provider payload normalizer
    pub fn with_normalizer(mut self, normalizer: Arc<dyn EventNormalizer>) -> Self {
        self.normalizer = normalizer;
        self
    }

    pub fn config(&self) -> &WardenConfig {
        &self.config
    }

    pub fn audit(&self) -> &Arc<dyn AuditLog> {
        &self.audit
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub fn policies(&self) -> &Arc<PolicyStore> {
        &self.policies
    }

    pub fn guard(&self) -> &SpendGuard {
        &self.guard
    }

    pub fn ledger(&self) -> &Arc<LedgerEngine> {
        &self.ledger
    }

    pub fn anchor(&self) -> &AuditAnchor {
        &self.anchor
    }

    pub fn reconciliation(&self) -> &ReconciliationEngine {
        &self.reconciliation
    }

    pub fn approvals(&self) -> &ApprovalGate {
        &self.approvals
    }

    /// Broadcast an engine event
    pub fn emit_event(&self, event: WardenEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }

    /// Subscribe to engine events
    pub fn subscribe(&self) -> broadcast::Receiver<WardenEvent> {
        self.events.subscribe()
    }

    // ========================================================================
    // Spend enforcement
    // ========================================================================

    pub async fn create_policy(&self, new: NewPolicy, actor: &str) -> Result<SpendingPolicy> {
        Ok(self.policies.create_policy(new, actor).await?)
    }

    pub async fn get_policy(&self, policy_id: &PolicyId) -> Result<Option<PolicySnapshot>> {
        Ok(self.policies.get_policy(policy_id).await?)
    }

    /// Evaluate and record a spend. Always returns a decision.
    pub async fn record_spend(
        &self,
        policy_id: &PolicyId,
        amount: Amount,
        merchant_id: &MerchantId,
    ) -> Decision {
        let decision = self.guard.record_spend(policy_id, amount, merchant_id).await;
        self.emit_event(WardenEvent::spend_decided(&decision));
        decision
    }

    /// Standalone velocity check; records nothing
    pub async fn check_velocity(
        &self,
        policy_id: &PolicyId,
        max_per_minute: u32,
        max_per_hour: u32,
    ) -> Decision {
        self.guard
            .check_velocity(policy_id, max_per_minute, max_per_hour)
            .await
    }

    // ========================================================================
    // Ledger
    // ========================================================================

    pub async fn begin_batch(&self, transfer_id: TransferId) -> Result<LedgerBatch> {
        Ok(self.ledger.begin_batch(transfer_id).await?)
    }

    pub async fn append_entry(&self, batch_id: &BatchId, draft: EntryDraft) -> Result<LedgerBatch> {
        Ok(self.ledger.append_entry(batch_id, draft).await?)
    }

    pub async fn commit_batch(&self, batch_id: &BatchId) -> Result<CommitResult> {
        let result = self.ledger.commit_batch(batch_id).await?;
        self.emit_event(WardenEvent::batch_committed(&result));
        Ok(result)
    }

    pub async fn rollback_batch(&self, batch_id: &BatchId, reason: &str) -> Result<LedgerBatch> {
        let batch = self.ledger.rollback_batch(batch_id, reason).await?;
        self.emit_event(WardenEvent::BatchRolledBack {
            batch_id: batch_id.clone(),
            reason: reason.to_string(),
            timestamp: batch.rolled_back_at.unwrap_or_else(|| self.clock.now()),
        });
        Ok(batch)
    }

    // ========================================================================
    // Reconciliation
    // ========================================================================

    /// Normalize and ingest a raw provider payload.
    ///
    /// Retriable failures are retried under `reconciliation.ingest_retry`.
    /// When the budget runs out a `retry_exhausted` break is raised for the
    /// transfer and the last error is returned.
    pub async fn ingest_provider_event(
        &self,
        organization: &OrgId,
        rail: Rail,
        provider: &str,
        external_reference: &str,
        payload: &Value,
    ) -> Result<JourneyUpdate> {
        let retry = &self.config.reconciliation.ingest_retry;
        let reconciliation = &self.reconciliation;
        let normalizer = self.normalizer.as_ref();

        let result = retry_with_backoff(retry, move || {
            reconciliation.ingest_payload(
                normalizer,
                organization,
                rail,
                provider,
                external_reference,
                payload,
            )
        })
        .await;

        match result {
            Ok(update) => {
                self.emit_event(WardenEvent::journey_updated(&update));
                for item in &update.breaks {
                    self.emit_event(WardenEvent::break_raised(item));
                }
                Ok(update)
            }
            Err(err) if err.is_retriable() => {
                warn!(
                    provider = provider,
                    external_reference = external_reference,
                    attempts = retry.max_attempts,
                    error = %err,
                    "Provider event ingestion exhausted its retries"
                );
                match self
                    .reconciliation
                    .record_ingestion_failure(
                        organization,
                        rail,
                        provider,
                        external_reference,
                        retry.max_attempts,
                        &err.to_string(),
                    )
                    .await
                {
                    Ok(item) => self.emit_event(WardenEvent::break_raised(&item)),
                    Err(record_err) => error!(
                        external_reference = external_reference,
                        error = %record_err,
                        "Could not record ingestion failure"
                    ),
                }
                Err(err.into())
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn query_breaks(
        &self,
        organization: &OrgId,
        status: Option<BreakStatus>,
    ) -> Result<Vec<ReconciliationBreak>> {
        Ok(self.reconciliation.query_breaks(organization, status).await?)
    }

    pub async fn query_review_queue(
        &self,
        organization: &OrgId,
        status: Option<ReviewStatus>,
    ) -> Result<Vec<ManualReviewItem>> {
        Ok(self
            .reconciliation
            .query_review_queue(organization, status)
            .await?)
    }

    // ========================================================================
    // Approvals
    // ========================================================================

    pub async fn create_approval(
        &self,
        action: &str,
        amount: Amount,
        requested_by: &str,
        urgency: Urgency,
    ) -> Result<Approval> {
        let approval = self
            .approvals
            .create(action, amount, requested_by, urgency)
            .await?;
        self.emit_event(WardenEvent::ApprovalRequested {
            approval_id: approval.id.clone(),
            urgency: approval.urgency,
            amount: approval.amount,
            expires_at: approval.expires_at,
            timestamp: approval.created_at,
        });
        Ok(approval)
    }

    pub async fn decide_approval(
        &self,
        approval_id: &ApprovalId,
        decision: ApprovalDecision,
        reviewer: &str,
    ) -> Result<Approval> {
        let approval = self.approvals.decide(approval_id, decision, reviewer).await?;
        self.emit_approval_decided(&approval);
        Ok(approval)
    }

    pub async fn cancel_approval(&self, approval_id: &ApprovalId, actor: &str) -> Result<Approval> {
        let approval = self.approvals.cancel(approval_id, actor).await?;
        self.emit_approval_decided(&approval);
        Ok(approval)
    }

    /// Current status, with lazy expiry applied
    pub async fn approval_status(&self, approval_id: &ApprovalId) -> Result<ApprovalStatus> {
        Ok(self.approvals.status(approval_id).await?)
    }

    fn emit_approval_decided(&self, approval: &Approval) {
        self.emit_event(WardenEvent::ApprovalDecided {
            approval_id: approval.id.clone(),
            status: approval.status,
            reviewer: approval.reviewer.clone(),
            timestamp: approval.decided_at.unwrap_or_else(|| self.clock.now()),
        });
    }

    // ========================================================================
    // Status
    // ========================================================================

    pub async fn status_summary(&self) -> Result<WardenStatusSummary> {
        let now = self.clock.now();
        let pending_approvals = self
            .approvals
            .list(Some(ApprovalStatus::Pending))
            .await?
            .len();
        Ok(WardenStatusSummary {
            policy_count: self.policies.policy_count(),
            last_sequence: self.ledger.last_sequence().await,
            last_anchored_sequence: self.anchor.last_anchored_sequence().await,
            anchor_count: self.anchor.anchors().await.len(),
            pending_approvals,
            uptime_seconds: u64::try_from((now - self.started_at).num_seconds()).unwrap_or(0),
            started_at: self.started_at,
        })
    }
}

/// Engine status for operators
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WardenStatusSummary {
    pub policy_count: usize,
    pub last_sequence: u64,
    pub last_anchored_sequence: u64,
    pub anchor_count: usize,
    pub pending_approvals: usize,
    pub uptime_seconds: u64,
    pub started_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use warden_ledger::EntryType;
    use warden_reconciliation::BreakType;
    use warden_types::{AccountId, AgentId, Currency, ManualClock};

    fn warden() -> Warden {
        Warden::new(WardenConfig::development()).unwrap()
    }

    #[tokio::test]
    async fn test_warden_creation() {
        let warden = warden();
        let summary = warden.status_summary().await.unwrap();
        assert_eq!(summary.policy_count, 0);
        assert_eq!(summary.last_sequence, 0);
        assert_eq!(summary.anchor_count, 0);
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let mut config = WardenConfig::default();
        config.ledger.anchor_max_leaves = 0;
        let err = Warden::new(config).err().unwrap();
        assert_eq!(err.error_code(), "INVALID_CONFIG");

        let mut config = WardenConfig::default();
        config.ledger.anchor_signing_key = Some("not-hex".to_string());
        let err = Warden::new(config).err().unwrap();
        assert_eq!(err.error_code(), "INVALID_ANCHOR_KEY");
    }

    #[tokio::test]
    async fn test_configured_anchor_key_is_used() {
        let seed = "11".repeat(32);
        let mut config = WardenConfig::default();
        config.ledger.anchor_signing_key = Some(seed.clone());
        let a = Warden::new(config.clone()).unwrap();
        let b = Warden::new(config).unwrap();
        assert_eq!(a.anchor().public_key(), b.anchor().public_key());
        assert_eq!(
            a.anchor().public_key(),
            KeyPair::from_hex(&seed).unwrap().public_key()
        );
    }

    #[tokio::test]
    async fn test_spend_emits_event() {
        let warden = warden();
        let mut events = warden.subscribe();
        let policy = warden
            .create_policy(
                NewPolicy::new(AgentId::new(), Currency::usd(), Amount::new(100), Amount::new(500)),
                "owner",
            )
            .await
            .unwrap();

        let decision = warden
            .record_spend(&policy.id, Amount::new(50), &MerchantId::new())
            .await;
        assert!(decision.allowed);

        match events.recv().await.unwrap() {
            WardenEvent::SpendDecided { allowed, amount, .. } => {
                assert!(allowed);
                assert_eq!(amount, Amount::new(50));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_ledger_delegation() {
        let warden = warden();
        let batch = warden.begin_batch(TransferId::new()).await.unwrap();
        let (a, b) = (AccountId::new(), AccountId::new());
        warden
            .append_entry(&batch.id, EntryDraft::new(a.clone(), EntryType::Debit, Amount::new(10), Currency::usd()))
            .await
            .unwrap();
        warden
            .append_entry(&batch.id, EntryDraft::credit(b.clone(), Amount::new(10), Currency::usd()))
            .await
            .unwrap();
        let result = warden.commit_batch(&batch.id).await.unwrap();
        assert_eq!(result.entries.len(), 2);
        assert_eq!(warden.ledger().balance(&b, &Currency::usd()).await, Amount::new(10));
        assert_eq!(warden.ledger().balance(&a, &Currency::usd()).await, Amount::new(-10));
    }

    #[tokio::test]
    async fn test_ingest_provider_event() {
        let warden = warden();
        let org = OrgId::new();
        let payload = json!({
            "event_id": "evt_1",
            "status": "settled",
            "occurred_at": "2024-01-01T00:00:00Z",
            "amount": 1000,
            "currency": "USD",
            "expected_amount": 1000
        });
        let update = warden
            .ingest_provider_event(&org, Rail::Card, "acme-cards", "ch_1", &payload)
            .await
            .unwrap();
        assert!(!update.is_duplicate());
        assert!(update.breaks.is_empty());

        let again = warden
            .ingest_provider_event(&org, Rail::Card, "acme-cards", "ch_1", &payload)
            .await
            .unwrap();
        assert!(again.is_duplicate());
    }

    /// Audit log that is unavailable for the next `failures` writes
    #[derive(Debug, Default)]
    struct FlakyAuditLog {
        inner: InMemoryAuditLog,
        failures: AtomicU32,
    }

    #[async_trait::async_trait]
    impl AuditLog for FlakyAuditLog {
        async fn append_batch(
            &self,
            records: Vec<warden_audit::AuditRecord>,
        ) -> warden_audit::Result<Vec<warden_audit::AuditEntry>> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(AuditError::Unavailable {
                    message: "sink restarting".to_string(),
                });
            }
            self.inner.append_batch(records).await
        }

        async fn stream_entries(
            &self,
            stream: &warden_audit::AuditStream,
        ) -> warden_audit::Result<Vec<warden_audit::AuditEntry>> {
            self.inner.stream_entries(stream).await
        }

        async fn streams(&self) -> warden_audit::Result<Vec<warden_audit::AuditStream>> {
            self.inner.streams().await
        }

        async fn export(
            &self,
            from: Option<DateTime<Utc>>,
            to: Option<DateTime<Utc>>,
        ) -> warden_audit::Result<Vec<warden_audit::AuditEntry>> {
            self.inner.export(from, to).await
        }
    }

    #[tokio::test]
    async fn test_exhausted_ingestion_raises_break() {
        let audit = Arc::new(FlakyAuditLog::default());
        let clock: SharedClock = Arc::new(ManualClock::starting_now());
        let mut config = WardenConfig::default();
        config.reconciliation.ingest_retry.max_attempts = 2;
        config.reconciliation.ingest_retry.base_delay = std::time::Duration::from_millis(1);
        let warden = Warden::with_parts(config, audit.clone(), clock).unwrap();
        let org = OrgId::new();
        let payload = json!({
            "event_id": "evt_1",
            "status": "pending",
            "occurred_at": "2024-01-01T00:00:00Z"
        });

        // Both attempts fail; the failure break is written once the sink is back
        audit.failures.store(2, Ordering::SeqCst);
        let err = warden
            .ingest_provider_event(&org, Rail::BankTransfer, "acme-bank", "ach_9", &payload)
            .await
            .unwrap_err();
        assert!(err.is_retriable());
        assert_eq!(err.error_code(), "AUDIT_UNAVAILABLE");

        let breaks = warden.query_breaks(&org, None).await.unwrap();
        assert_eq!(breaks.len(), 1);
        assert_eq!(breaks[0].break_type, BreakType::RetryExhausted);
        assert_eq!(warden.query_review_queue(&org, None).await.unwrap().len(), 1);

        // The event itself was never recorded, so redelivery applies it
        let update = warden
            .ingest_provider_event(&org, Rail::BankTransfer, "acme-bank", "ach_9", &payload)
            .await
            .unwrap();
        assert!(!update.is_duplicate());
    }

    #[tokio::test]
    async fn test_bad_payload_is_not_retried() {
        let warden = warden();
        let org = OrgId::new();
        let err = warden
            .ingest_provider_event(&org, Rail::Card, "acme-cards", "ch_2", &json!({ "status": 7 }))
            .await
            .unwrap_err();
        assert!(!err.is_retriable());
        assert_eq!(err.error_code(), "INVALID_PAYLOAD");
        assert!(warden.query_breaks(&org, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_approval_lifecycle_events() {
        let warden = warden();
        let mut events = warden.subscribe();
        let approval = warden
            .create_approval("payment", Amount::new(9_000), "agent_7", Urgency::High)
            .await
            .unwrap();
        let decided = warden
            .decide_approval(&approval.id, ApprovalDecision::Deny, "owner")
            .await
            .unwrap();
        assert_eq!(decided.status, ApprovalStatus::Denied);
        assert_eq!(
            warden.approval_status(&approval.id).await.unwrap(),
            ApprovalStatus::Denied
        );

        assert!(matches!(events.recv().await.unwrap(), WardenEvent::ApprovalRequested { .. }));
        match events.recv().await.unwrap() {
            WardenEvent::ApprovalDecided { status, reviewer, .. } => {
                assert_eq!(status, ApprovalStatus::Denied);
                assert_eq!(reviewer.as_deref(), Some("owner"));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}

//! Payment authorization: approval gate, spend limits, ledger and expectation
//!
//! ```text
//! approval_id? ──► check_payment ──► currency check ──► record_spend(amount + fee)
//!     ──► begin / append / commit batch ──► expect_transfer
//! ```
//!
//! A spend that was allowed but whose ledger batch could not be committed is
//! given back with `reverse_spend`, so a failed payment never consumes
//! allowance. The expectation is best effort: the payment is authorized once
//! the ledger commit succeeds.

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use warden_approval::{ApprovalStatus, GateOutcome};
use warden_ledger::{CommitResult, EntryDraft};
use warden_policy::{Decision, VelocityLimits};
use warden_reconciliation::Rail;
use warden_types::{
    AccountId, Amount, ApprovalId, BatchId, Currency, MerchantId, OrgId, PolicyId, TransferId,
    WardenError,
};

use crate::{EngineError, Result, Warden, WardenEvent};

/// Fee charged on top of a payment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentFee {
    /// Account the fee is credited to
    pub account: AccountId,
    pub amount: Amount,
}

/// A payment an agent wants to make
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRequest {
    pub policy_id: PolicyId,
    pub merchant_id: MerchantId,
    pub amount: Amount,
    pub currency: Currency,
    pub source_account: AccountId,
    pub destination_account: AccountId,
    #[serde(default)]
    pub fee: Option<PaymentFee>,
    pub organization: OrgId,
    pub rail: Rail,
    /// Provider that will report settlement events for this payment
    pub provider: String,
    /// Reference the provider will report settlement events under
    pub external_reference: String,
    /// Approval the payment was escalated to, if any
    #[serde(default)]
    pub approval_id: Option<ApprovalId>,
    /// Overrides `spend.default_velocity`
    #[serde(default)]
    pub velocity: Option<VelocityLimits>,
}

impl PaymentRequest {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        policy_id: PolicyId,
        merchant_id: MerchantId,
        amount: Amount,
        currency: Currency,
        source_account: AccountId,
        destination_account: AccountId,
        organization: OrgId,
        rail: Rail,
        provider: impl Into<String>,
        external_reference: impl Into<String>,
    ) -> Self {
        Self {
            policy_id,
            merchant_id,
            amount,
            currency,
            source_account,
            destination_account,
            fee: None,
            organization,
            rail,
            provider: provider.into(),
            external_reference: external_reference.into(),
            approval_id: None,
            velocity: None,
        }
    }

    pub fn with_fee(mut self, account: AccountId, amount: Amount) -> Self {
        self.fee = Some(PaymentFee { account, amount });
        self
    }

    pub fn with_approval(mut self, approval_id: ApprovalId) -> Self {
        self.approval_id = Some(approval_id);
        self
    }

    pub fn with_velocity(mut self, limits: VelocityLimits) -> Self {
        self.velocity = Some(limits);
        self
    }

    /// Amount charged against the policy: the payment plus its fee
    pub fn total(&self) -> Option<Amount> {
        match &self.fee {
            Some(fee) => self.amount.checked_add(fee.amount),
            None => Some(self.amount),
        }
    }

    fn validate(&self) -> std::result::Result<(), WardenError> {
        if self.provider.trim().is_empty() {
            return Err(WardenError::invalid_input("provider", "must not be empty"));
        }
        if self.external_reference.trim().is_empty() {
            return Err(WardenError::invalid_input(
                "external_reference",
                "must not be empty",
            ));
        }
        if self.source_account == self.destination_account {
            return Err(WardenError::invalid_input(
                "destination_account",
                "must differ from source_account",
            ));
        }
        if let Some(fee) = &self.fee {
            if !fee.amount.is_positive() {
                return Err(WardenError::invalid_input("fee.amount", "must be positive"));
            }
        }
        Ok(())
    }
}

/// Result of [`Warden::authorize_payment`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PaymentOutcome {
    /// Spend recorded and ledger batch committed
    Authorized {
        transfer_id: TransferId,
        batch_id: BatchId,
        decision: Decision,
        /// Whether reconciliation now expects the transfer
        expectation_registered: bool,
    },
    /// Declined by the spending policy
    Declined { decision: Decision },
    /// The referenced approval is still pending
    AwaitingApproval { approval_id: ApprovalId },
    /// The referenced approval was denied, expired or cancelled
    Blocked {
        approval_id: ApprovalId,
        status: ApprovalStatus,
    },
    /// The payment could not be carried out; nothing was spent
    Failed { reason_code: String, message: String },
}

impl PaymentOutcome {
    pub fn is_authorized(&self) -> bool {
        matches!(self, Self::Authorized { .. })
    }

    fn failed(err: &EngineError) -> Self {
        Self::Failed {
            reason_code: err.error_code().to_string(),
            message: err.to_string(),
        }
    }
}

impl Warden {
    /// Authorize a payment end to end. Never returns an error: every
    /// failure is a [`PaymentOutcome`].
    pub async fn authorize_payment(&self, request: PaymentRequest) -> PaymentOutcome {
        if let Err(err) = request.validate() {
            return PaymentOutcome::failed(&err.into());
        }
        let Some(total) = request.total() else {
            let err: EngineError = WardenError::invalid_input("fee.amount", "payment total overflows").into();
            return PaymentOutcome::failed(&err);
        };

        if let Some(approval_id) = &request.approval_id {
            match self.approvals.check_payment(approval_id).await {
                Ok(GateOutcome::Proceed) => {}
                Ok(GateOutcome::AwaitingDecision) => {
                    info!(approval_id = %approval_id, "Payment awaiting approval");
                    return PaymentOutcome::AwaitingApproval {
                        approval_id: approval_id.clone(),
                    };
                }
                Ok(GateOutcome::Blocked { status }) => {
                    return PaymentOutcome::Blocked {
                        approval_id: approval_id.clone(),
                        status,
                    };
                }
                Err(err) => return PaymentOutcome::failed(&err.into()),
            }
        }

        match self.policies.get_policy(&request.policy_id).await {
            Ok(Some(snapshot)) if snapshot.policy.currency != request.currency => {
                warn!(
                    policy_id = %request.policy_id,
                    policy_currency = %snapshot.policy.currency,
                    currency = %request.currency,
                    "Payment currency does not match policy"
                );
                return PaymentOutcome::Failed {
                    reason_code: "CURRENCY_MISMATCH".to_string(),
                    message: format!(
                        "policy {} is in {}, payment is in {}",
                        request.policy_id, snapshot.policy.currency, request.currency
                    ),
                };
            }
            // A missing policy is declined by the guard with policy_not_found
            Ok(_) => {}
            Err(err) => return PaymentOutcome::failed(&err.into()),
        }

        let velocity = request.velocity.or(self.config.spend.default_velocity);
        let decision = match velocity {
            Some(limits) => {
                self.guard
                    .record_spend_with_velocity(&request.policy_id, total, &request.merchant_id, limits)
                    .await
            }
            None => {
                self.guard
                    .record_spend(&request.policy_id, total, &request.merchant_id)
                    .await
            }
        };
        self.emit_event(WardenEvent::spend_decided(&decision));
        if !decision.allowed {
            return PaymentOutcome::Declined { decision };
        }

        let transfer_id = TransferId::new();
        let batch = match self.ledger.begin_batch(transfer_id.clone()).await {
            Ok(batch) => batch,
            Err(err) => return self.abandon_payment(&decision, None, err.into()).await,
        };
        let commit = match self.post_transfer(&batch.id, &request).await {
            Ok(commit) => commit,
            Err(err) => return self.abandon_payment(&decision, Some(&batch.id), err).await,
        };
        self.emit_event(WardenEvent::batch_committed(&commit));

        let expectation_registered = match self
            .reconciliation
            .expect_transfer(
                &request.organization,
                request.rail,
                &request.provider,
                &request.external_reference,
                request.amount,
                request.currency.clone(),
            )
            .await
        {
            Ok(_) => true,
            Err(err) => {
                warn!(
                    transfer_id = %transfer_id,
                    external_reference = %request.external_reference,
                    error = %err,
                    "Payment committed without a reconciliation expectation"
                );
                false
            }
        };

        info!(
            transfer_id = %transfer_id,
            batch_id = %batch.id,
            policy_id = %request.policy_id,
            amount = %request.amount,
            total = %total,
            rail = %request.rail,
            "Payment authorized"
        );
        PaymentOutcome::Authorized {
            transfer_id,
            batch_id: batch.id,
            decision,
            expectation_registered,
        }
    }

    /// Stage the payment legs and commit them as one batch
    async fn post_transfer(&self, batch_id: &BatchId, request: &PaymentRequest) -> Result<CommitResult> {
        let reference = request.external_reference.as_str();
        let currency = &request.currency;

        let mut drafts = vec![EntryDraft::debit(
            request.source_account.clone(),
            request.amount,
            currency.clone(),
        )];
        if let Some(fee) = &request.fee {
            drafts.push(EntryDraft::fee(request.source_account.clone(), fee.amount, currency.clone()));
        }
        drafts.push(EntryDraft::credit(
            request.destination_account.clone(),
            request.amount,
            currency.clone(),
        ));
        if let Some(fee) = &request.fee {
            drafts.push(EntryDraft::credit(fee.account.clone(), fee.amount, currency.clone()));
        }

        for draft in drafts {
            self.ledger
                .append_entry(batch_id, draft.with_rail_reference(reference))
                .await?;
        }
        Ok(self.ledger.commit_batch(batch_id).await?)
    }

    /// Undo an allowed spend whose ledger write failed
    async fn abandon_payment(
        &self,
        decision: &Decision,
        batch_id: Option<&BatchId>,
        err: EngineError,
    ) -> PaymentOutcome {
        let reason = format!("ledger write failed: {}", err.error_code());
        warn!(policy_id = %decision.policy_id, error = %err, "Payment ledger write failed");

        if let Some(batch_id) = batch_id {
            match self.ledger.rollback_batch(batch_id, &reason).await {
                Ok(batch) => self.emit_event(WardenEvent::BatchRolledBack {
                    batch_id: batch_id.clone(),
                    reason: reason.clone(),
                    timestamp: batch.rolled_back_at.unwrap_or(decision.decided_at),
                }),
                Err(rollback_err) => {
                    error!(batch_id = %batch_id, error = %rollback_err, "Could not roll back payment batch")
                }
            }
        }

        match self.guard.reverse_spend(decision, &reason).await {
            Ok(()) => self.emit_event(WardenEvent::SpendReversed {
                policy_id: decision.policy_id.clone(),
                amount: decision.amount,
                reason,
                timestamp: decision.decided_at,
            }),
            Err(reverse_err) => error!(
                policy_id = %decision.policy_id,
                amount = %decision.amount,
                error = %reverse_err,
                "Could not reverse spend after failed payment"
            ),
        }
        PaymentOutcome::failed(&err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::WardenConfig;
    use warden_approval::{ApprovalDecision, Urgency};
    use warden_policy::{NewPolicy, ReasonCode};
    use warden_types::AgentId;

    async fn setup() -> (Warden, PolicyId) {
        let warden = Warden::new(WardenConfig::development()).unwrap();
        let policy = warden
            .create_policy(
                NewPolicy::new(AgentId::new(), Currency::usd(), Amount::new(1_000), Amount::new(5_000)),
                "owner",
            )
            .await
            .unwrap();
        (warden, policy.id)
    }

    fn request(policy_id: &PolicyId, amount: i64, reference: &str) -> PaymentRequest {
        PaymentRequest::new(
            policy_id.clone(),
            MerchantId::new(),
            Amount::new(amount),
            Currency::usd(),
            AccountId::new(),
            AccountId::new(),
            OrgId::new(),
            Rail::BankTransfer,
            "acme-bank",
            reference,
        )
    }

    #[tokio::test]
    async fn test_payment_with_fee_is_authorized() {
        let (warden, policy_id) = setup().await;
        let fee_account = AccountId::new();
        let req = request(&policy_id, 400, "ach-1").with_fee(fee_account.clone(), Amount::new(5));
        let (source, destination) = (req.source_account.clone(), req.destination_account.clone());

        let outcome = warden.authorize_payment(req).await;
        let PaymentOutcome::Authorized { transfer_id, decision, expectation_registered, .. } = outcome else {
            panic!("expected authorization, got {:?}", outcome);
        };
        assert_eq!(decision.amount, Amount::new(405));
        assert!(expectation_registered);

        let usd = Currency::usd();
        assert_eq!(warden.ledger().balance(&source, &usd).await, Amount::new(-405));
        assert_eq!(warden.ledger().balance(&destination, &usd).await, Amount::new(400));
        assert_eq!(warden.ledger().balance(&fee_account, &usd).await, Amount::new(5));

        let entries = warden.ledger().transfer_entries(&transfer_id).await;
        assert_eq!(entries.len(), 4);
        assert!(entries.iter().all(|e| e.rail_reference.as_deref() == Some("ach-1")));

        let snapshot = warden.get_policy(&policy_id).await.unwrap().unwrap();
        assert_eq!(snapshot.policy.spent_total, Amount::new(405));
    }

    #[tokio::test]
    async fn test_declined_payment_writes_no_ledger() {
        let (warden, policy_id) = setup().await;
        let outcome = warden.authorize_payment(request(&policy_id, 1_500, "ach-2")).await;
        match outcome {
            PaymentOutcome::Declined { decision } => {
                assert_eq!(decision.reason_code, ReasonCode::PerTransactionLimit)
            }
            other => panic!("expected decline, got {:?}", other),
        }
        assert_eq!(warden.ledger().last_sequence().await, 0);
    }

    #[tokio::test]
    async fn test_currency_mismatch_fails() {
        let (warden, policy_id) = setup().await;
        let mut req = request(&policy_id, 100, "ach-3");
        req.currency = Currency::eur();
        match warden.authorize_payment(req).await {
            PaymentOutcome::Failed { reason_code, .. } => assert_eq!(reason_code, "CURRENCY_MISMATCH"),
            other => panic!("expected failure, got {:?}", other),
        }
        let snapshot = warden.get_policy(&policy_id).await.unwrap().unwrap();
        assert_eq!(snapshot.policy.spent_total, Amount::zero());
    }

    #[tokio::test]
    async fn test_pending_and_denied_approvals_gate_payment() {
        let (warden, policy_id) = setup().await;
        let approval = warden
            .create_approval("payment", Amount::new(900), "agent_1", Urgency::Normal)
            .await
            .unwrap();

        let req = request(&policy_id, 900, "ach-4").with_approval(approval.id.clone());
        assert_eq!(
            warden.authorize_payment(req.clone()).await,
            PaymentOutcome::AwaitingApproval { approval_id: approval.id.clone() }
        );

        warden
            .decide_approval(&approval.id, ApprovalDecision::Deny, "owner")
            .await
            .unwrap();
        assert_eq!(
            warden.authorize_payment(req).await,
            PaymentOutcome::Blocked {
                approval_id: approval.id.clone(),
                status: ApprovalStatus::Denied,
            }
        );
        let snapshot = warden.get_policy(&policy_id).await.unwrap().unwrap();
        assert_eq!(snapshot.policy.spent_total, Amount::zero());
    }

    #[tokio::test]
    async fn test_unknown_approval_fails() {
        let (warden, policy_id) = setup().await;
        let req = request(&policy_id, 100, "ach-5").with_approval(ApprovalId::new());
        match warden.authorize_payment(req).await {
            PaymentOutcome::Failed { reason_code, .. } => assert_eq!(reason_code, "APPROVAL_NOT_FOUND"),
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_invalid_request_fails() {
        let (warden, policy_id) = setup().await;
        let outcome = warden.authorize_payment(request(&policy_id, 100, " ")).await;
        assert!(matches!(outcome, PaymentOutcome::Failed { .. }));

        let req = request(&policy_id, 100, "ach-6").with_fee(AccountId::new(), Amount::zero());
        assert!(!warden.authorize_payment(req).await.is_authorized());
    }

    #[test]
    fn test_outcome_serialization() {
        let outcome = PaymentOutcome::Failed {
            reason_code: "CURRENCY_MISMATCH".to_string(),
            message: "mismatch".to_string(),
        };
        let json = serde_json::to_string(&outcome).unwrap();
        assert!(json.contains("\"outcome\":\"failed\""));
    }
}

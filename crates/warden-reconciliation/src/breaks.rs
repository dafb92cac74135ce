//! Reconciliation breaks, the manual review queue and the rules that raise them

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use warden_types::{Amount, BreakId, JourneyId, OrgId, ReviewItemId, WardenError};

use crate::{CanonicalJourney, JourneyState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakType {
    ExpectedSettledMismatch,
    RetryExhausted,
    ProviderReturnHighRisk,
}

impl BreakType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ExpectedSettledMismatch => "expected_settled_mismatch",
            Self::RetryExhausted => "retry_exhausted",
            Self::ProviderReturnHighRisk => "provider_return_high_risk",
        }
    }
}

impl std::fmt::Display for BreakType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// High and critical breaks go to a human
    pub fn needs_review(self) -> bool {
        self >= Self::High
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakStatus {
    Open,
    Acknowledged,
    Resolved,
}

impl std::fmt::Display for BreakStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Acknowledged => write!(f, "acknowledged"),
            Self::Resolved => write!(f, "resolved"),
        }
    }
}

/// A detected mismatch or anomaly on a journey
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationBreak {
    pub id: BreakId,
    pub organization: OrgId,
    pub journey_id: JourneyId,
    pub break_type: BreakType,
    pub severity: Severity,
    pub expected_amount: Amount,
    pub settled_amount: Amount,
    /// `settled - expected`
    pub delta: Amount,
    pub status: BreakStatus,
    pub detail: String,
    pub review_item_id: Option<ReviewItemId>,
    pub acknowledged_by: Option<String>,
    pub resolved_by: Option<String>,
    pub resolution_note: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ReconciliationBreak {
    pub(crate) fn open(journey: &CanonicalJourney, finding: &BreakFinding, now: DateTime<Utc>) -> Self {
        Self {
            id: BreakId::new(),
            organization: journey.organization.clone(),
            journey_id: journey.id.clone(),
            break_type: finding.break_type,
            severity: finding.severity,
            expected_amount: journey.expected_amount,
            settled_amount: journey.settled_amount,
            delta: finding.delta,
            status: BreakStatus::Open,
            detail: finding.detail.clone(),
            review_item_id: None,
            acknowledged_by: None,
            resolved_by: None,
            resolution_note: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Refresh amounts and severity from a new finding; returns whether anything changed
    pub(crate) fn refresh(&mut self, journey: &CanonicalJourney, finding: &BreakFinding, now: DateTime<Utc>) -> bool {
        let changed = self.severity != finding.severity
            || self.expected_amount != journey.expected_amount
            || self.settled_amount != journey.settled_amount
            || self.delta != finding.delta
            || self.detail != finding.detail;
        if changed {
            self.severity = finding.severity;
            self.expected_amount = journey.expected_amount;
            self.settled_amount = journey.settled_amount;
            self.delta = finding.delta;
            self.detail = finding.detail.clone();
            self.updated_at = now;
        }
        changed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewPriority {
    Normal,
    High,
    Urgent,
}

impl From<Severity> for ReviewPriority {
    fn from(severity: Severity) -> Self {
        match severity {
            Severity::Critical => Self::Urgent,
            Severity::High => Self::High,
            Severity::Medium | Severity::Low => Self::Normal,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    Queued,
    InReview,
    Resolved,
    Dismissed,
}

impl ReviewStatus {
    pub fn is_closed(self) -> bool {
        matches!(self, Self::Resolved | Self::Dismissed)
    }
}

impl std::fmt::Display for ReviewStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::InReview => write!(f, "in_review"),
            Self::Resolved => write!(f, "resolved"),
            Self::Dismissed => write!(f, "dismissed"),
        }
    }
}

/// Work item for a human operator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManualReviewItem {
    pub id: ReviewItemId,
    pub organization: OrgId,
    pub journey_id: Option<JourneyId>,
    pub break_id: Option<BreakId>,
    pub reason_code: String,
    pub priority: ReviewPriority,
    pub status: ReviewStatus,
    pub assignee: Option<String>,
    pub resolution_note: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ManualReviewItem {
    pub(crate) fn for_break(item: &ReconciliationBreak, now: DateTime<Utc>) -> Self {
        Self {
            id: ReviewItemId::new(),
            organization: item.organization.clone(),
            journey_id: Some(item.journey_id.clone()),
            break_id: Some(item.id.clone()),
            reason_code: item.break_type.as_str().to_string(),
            priority: item.severity.into(),
            status: ReviewStatus::Queued,
            assignee: None,
            resolution_note: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Basis-point thresholds on |delta| / expected
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeverityThresholds {
    pub critical_bps: i64,
    pub high_bps: i64,
    pub medium_bps: i64,
}

impl Default for SeverityThresholds {
    fn default() -> Self {
        Self {
            critical_bps: 5_000,
            high_bps: 1_000,
            medium_bps: 100,
        }
    }
}

impl SeverityThresholds {
    pub fn classify(&self, delta: Amount, expected: Amount) -> Severity {
        let Some(bps) = delta.ratio_bps(expected) else {
            // Nothing was expected but money moved
            return Severity::Critical;
        };
        if bps >= self.critical_bps {
            Severity::Critical
        } else if bps >= self.high_bps {
            Severity::High
        } else if bps >= self.medium_bps {
            Severity::Medium
        } else {
            Severity::Low
        }
    }
}

/// Deterministic break rules
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakRules {
    pub severity: SeverityThresholds,
    /// `retry_count` above this with no settlement raises `retry_exhausted`
    pub retry_ceiling: u32,
    /// Return codes that raise `provider_return_high_risk`
    pub high_risk_return_codes: BTreeSet<String>,
}

impl Default for BreakRules {
    fn default() -> Self {
        Self {
            severity: SeverityThresholds::default(),
            retry_ceiling: 3,
            // Unauthorized-debit and revoked-authorization bank return codes
            high_risk_return_codes: ["R05", "R07", "R10", "R29"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

/// One rule that fired on a journey
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakFinding {
    pub break_type: BreakType,
    pub severity: Severity,
    pub delta: Amount,
    pub detail: String,
}

impl BreakRules {
    pub fn validate(&self) -> Result<(), WardenError> {
        let s = &self.severity;
        if s.medium_bps <= 0 || s.high_bps <= s.medium_bps || s.critical_bps <= s.high_bps {
            return Err(WardenError::invalid_input(
                "reconciliation.rules.severity",
                "thresholds must be positive and increase from medium to critical",
            ));
        }
        Ok(())
    }

    /// Every rule that fires on the journey as it stands
    pub fn evaluate(&self, journey: &CanonicalJourney) -> Vec<BreakFinding> {
        let mut findings = Vec::new();
        let delta = journey.delta();

        if journey.canonical_state.is_terminal() && journey.settled_amount != journey.expected_amount {
            // Failed or fully returned with nothing settled is a clean outcome
            let clean = matches!(
                journey.canonical_state,
                JourneyState::Failed | JourneyState::Returned
            ) && journey.settled_amount.is_zero();
            if !clean {
                findings.push(BreakFinding {
                    break_type: BreakType::ExpectedSettledMismatch,
                    severity: self.severity.classify(delta, journey.expected_amount),
                    delta,
                    detail: format!(
                        "{} journey expected {} but settled {}",
                        journey.canonical_state, journey.expected_amount, journey.settled_amount
                    ),
                });
            }
        }

        if journey.retry_count > self.retry_ceiling && journey.canonical_state != JourneyState::Settled {
            findings.push(BreakFinding {
                break_type: BreakType::RetryExhausted,
                severity: Severity::High,
                delta,
                detail: format!(
                    "{} retries exceed ceiling of {}",
                    journey.retry_count, self.retry_ceiling
                ),
            });
        }

        if let Some(code) = &journey.last_return_code {
            if self.high_risk_return_codes.contains(code) {
                findings.push(BreakFinding {
                    break_type: BreakType::ProviderReturnHighRisk,
                    severity: Severity::Critical,
                    delta,
                    detail: format!("provider return code {} is high risk", code),
                });
            }
        }

        findings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{JourneyKey, Rail};

    fn journey(state: JourneyState, expected: i64, settled: i64) -> CanonicalJourney {
        let key = JourneyKey::new(OrgId::new(), Rail::Card, "issuer", "card-1");
        let mut j = CanonicalJourney::new(JourneyId::new(), &key, Utc::now());
        j.canonical_state = state;
        j.expected_amount = Amount::new(expected);
        j.settled_amount = Amount::new(settled);
        j
    }

    #[test]
    fn test_severity_bands() {
        let t = SeverityThresholds::default();
        let expected = Amount::new(10_000);
        assert_eq!(t.classify(Amount::new(-5_000), expected), Severity::Critical);
        assert_eq!(t.classify(Amount::new(1_000), expected), Severity::High);
        assert_eq!(t.classify(Amount::new(-999), expected), Severity::Medium);
        assert_eq!(t.classify(Amount::new(99), expected), Severity::Low);
        assert_eq!(t.classify(Amount::new(1), Amount::zero()), Severity::Critical);
    }

    #[test]
    fn test_mismatch_of_eighty_on_hundred() {
        let rules = BreakRules::default();
        let findings = rules.evaluate(&journey(JourneyState::Settled, 100, 80));
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].break_type, BreakType::ExpectedSettledMismatch);
        assert_eq!(findings[0].delta, Amount::new(-20));
        assert_eq!(findings[0].severity, Severity::High);
    }

    #[test]
    fn test_clean_failure_and_pending_raise_nothing() {
        let rules = BreakRules::default();
        assert!(rules.evaluate(&journey(JourneyState::Failed, 100, 0)).is_empty());
        assert!(rules.evaluate(&journey(JourneyState::Returned, 100, 0)).is_empty());
        assert!(rules.evaluate(&journey(JourneyState::Pending, 100, 0)).is_empty());
        assert!(rules.evaluate(&journey(JourneyState::Settled, 100, 100)).is_empty());
        // Partial return is a mismatch
        assert_eq!(rules.evaluate(&journey(JourneyState::Returned, 100, 40)).len(), 1);
    }

    #[test]
    fn test_retry_and_high_risk_rules() {
        let rules = BreakRules::default();
        let mut j = journey(JourneyState::Pending, 100, 0);
        j.retry_count = 4;
        j.last_return_code = Some("R10".to_string());
        let types: Vec<_> = rules.evaluate(&j).into_iter().map(|f| f.break_type).collect();
        assert_eq!(types, vec![BreakType::RetryExhausted, BreakType::ProviderReturnHighRisk]);

        j.retry_count = 3;
        j.last_return_code = Some("R01".to_string());
        assert!(rules.evaluate(&j).is_empty());
    }

    #[test]
    fn test_rules_validation() {
        assert!(BreakRules::default().validate().is_ok());
        let mut rules = BreakRules::default();
        rules.severity.high_bps = 50;
        assert!(rules.validate().is_err());
    }
}

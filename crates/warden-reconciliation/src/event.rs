//! Provider events: normalization and the canonical event log

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use warden_types::{Amount, Currency, EventId, JourneyId};

use crate::{JourneyState, ReconciliationError, Result};

/// Provider-independent event type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanonicalEventType {
    Pending,
    Settled,
    Failed,
    Returned,
    /// Domain-level retry, e.g. re-presentment of a bank debit
    Retried,
}

impl CanonicalEventType {
    /// State the event drives the journey toward
    pub fn target_state(self) -> JourneyState {
        match self {
            Self::Pending | Self::Retried => JourneyState::Pending,
            Self::Settled => JourneyState::Settled,
            Self::Failed => JourneyState::Failed,
            Self::Returned => JourneyState::Returned,
        }
    }
}

/// A normalized event as handed to the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderEvent {
    pub provider_event_id: String,
    pub event_type: CanonicalEventType,
    pub occurred_at: DateTime<Utc>,
    pub amount: Option<Amount>,
    pub currency: Option<Currency>,
    /// Amount the provider says was instructed, used when nothing was registered
    pub expected_amount: Option<Amount>,
    pub return_code: Option<String>,
}

impl ProviderEvent {
    pub fn new(
        provider_event_id: impl Into<String>,
        event_type: CanonicalEventType,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            provider_event_id: provider_event_id.into(),
            event_type,
            occurred_at,
            amount: None,
            currency: None,
            expected_amount: None,
            return_code: None,
        }
    }

    pub fn with_amount(mut self, amount: Amount) -> Self {
        self.amount = Some(amount);
        self
    }

    pub fn with_currency(mut self, currency: Currency) -> Self {
        self.currency = Some(currency);
        self
    }

    pub fn with_expected_amount(mut self, amount: Amount) -> Self {
        self.expected_amount = Some(amount);
        self
    }

    pub fn with_return_code(mut self, code: impl Into<String>) -> Self {
        self.return_code = Some(code.into());
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.provider_event_id.trim().is_empty() {
            return Err(ReconciliationError::InvalidPayload {
                reason: "provider_event_id must not be empty".to_string(),
            });
        }
        for amount in [self.amount, self.expected_amount].into_iter().flatten() {
            if amount.is_negative() {
                return Err(ReconciliationError::InvalidPayload {
                    reason: format!("amount must not be negative, got {}", amount),
                });
            }
        }
        Ok(())
    }
}

/// An ingested event as recorded on its journey (append-only)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalEvent {
    pub id: EventId,
    pub journey_id: JourneyId,
    pub provider: String,
    pub provider_event_id: String,
    pub event_type: CanonicalEventType,
    pub occurred_at: DateTime<Utc>,
    pub amount: Option<Amount>,
    pub return_code: Option<String>,
    pub out_of_order: bool,
    pub duplicate: bool,
    pub applied: bool,
    pub recorded_at: DateTime<Utc>,
}

/// Turns a raw provider payload into a [`ProviderEvent`]
pub trait EventNormalizer: Send + Sync {
    fn normalize(&self, provider: &str, payload: &Value) -> Result<ProviderEvent>;
}

/// Normalizer for flat JSON webhooks with a provider status string.
///
/// Expected shape:
///
/// ```json
/// { "event_id": "evt_1", "status": "settled", "occurred_at": "2024-01-01T00:00:00Z",
///   "amount": 1000, "currency": "USD", "expected_amount": 1000, "return_code": null }
/// ```
pub struct StatusMapNormalizer {
    statuses: HashMap<String, CanonicalEventType>,
}

impl StatusMapNormalizer {
    pub fn new() -> Self {
        let mut statuses = HashMap::new();
        for (status, event_type) in [
            ("pending", CanonicalEventType::Pending),
            ("processing", CanonicalEventType::Pending),
            ("submitted", CanonicalEventType::Pending),
            ("settled", CanonicalEventType::Settled),
            ("completed", CanonicalEventType::Settled),
            ("succeeded", CanonicalEventType::Settled),
            ("confirmed", CanonicalEventType::Settled),
            ("failed", CanonicalEventType::Failed),
            ("rejected", CanonicalEventType::Failed),
            ("declined", CanonicalEventType::Failed),
            ("returned", CanonicalEventType::Returned),
            ("reversed", CanonicalEventType::Returned),
            ("chargeback", CanonicalEventType::Returned),
            ("retried", CanonicalEventType::Retried),
            ("represented", CanonicalEventType::Retried),
        ] {
            statuses.insert(status.to_string(), event_type);
        }
        Self { statuses }
    }

    /// Map an additional provider status
    pub fn with_status(mut self, status: &str, event_type: CanonicalEventType) -> Self {
        self.statuses.insert(status.to_ascii_lowercase(), event_type);
        self
    }

    fn amount_field(payload: &Value, field: &str) -> Result<Option<Amount>> {
        match payload.get(field) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => value
                .as_i64()
                .map(|minor| Some(Amount::new(minor)))
                .ok_or_else(|| ReconciliationError::InvalidPayload {
                    reason: format!("{} must be an integer amount in minor units", field),
                }),
        }
    }
}

impl Default for StatusMapNormalizer {
    fn default() -> Self {
        Self::new()
    }
}

impl EventNormalizer for StatusMapNormalizer {
    fn normalize(&self, provider: &str, payload: &Value) -> Result<ProviderEvent> {
        let text = |field: &str| payload.get(field).and_then(Value::as_str);
        let invalid = |reason: String| ReconciliationError::InvalidPayload {
            reason: format!("{}: {}", provider, reason),
        };

        let event_id = text("event_id")
            .or_else(|| text("id"))
            .ok_or_else(|| invalid("missing event_id".to_string()))?;
        let status = text("status")
            .ok_or_else(|| invalid("missing status".to_string()))?
            .to_ascii_lowercase();
        let event_type = *self
            .statuses
            .get(&status)
            .ok_or_else(|| invalid(format!("unknown status {}", status)))?;
        let occurred_at = text("occurred_at")
            .ok_or_else(|| invalid("missing occurred_at".to_string()))?;
        let occurred_at = DateTime::parse_from_rfc3339(occurred_at)
            .map_err(|e| invalid(format!("bad occurred_at: {}", e)))?
            .with_timezone(&Utc);

        let mut event = ProviderEvent::new(event_id, event_type, occurred_at);
        event.amount = Self::amount_field(payload, "amount")?;
        event.expected_amount = Self::amount_field(payload, "expected_amount")?;
        if let Some(code) = text("currency") {
            event.currency = Some(Currency::new(code).map_err(|e| invalid(e.to_string()))?);
        }
        event.return_code = text("return_code").map(str::to_string);
        event.validate()?;
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalize_webhook() {
        let normalizer = StatusMapNormalizer::new();
        let event = normalizer
            .normalize(
                "acme-bank",
                &json!({
                    "event_id": "evt_9",
                    "status": "COMPLETED",
                    "occurred_at": "2024-03-01T12:00:00Z",
                    "amount": 1250,
                    "currency": "usd",
                }),
            )
            .unwrap();
        assert_eq!(event.event_type, CanonicalEventType::Settled);
        assert_eq!(event.amount, Some(Amount::new(1250)));
        assert_eq!(event.currency, Some(Currency::usd()));
        assert!(event.return_code.is_none());
    }

    #[test]
    fn test_normalize_rejects_bad_payloads() {
        let normalizer = StatusMapNormalizer::new();
        let base = json!({ "event_id": "e", "status": "settled", "occurred_at": "2024-03-01T12:00:00Z" });

        let mut unknown = base.clone();
        unknown["status"] = json!("teleported");
        assert!(normalizer.normalize("p", &unknown).is_err());

        let mut fractional = base.clone();
        fractional["amount"] = json!(10.5);
        assert!(normalizer.normalize("p", &fractional).is_err());

        let mut negative = base.clone();
        negative["amount"] = json!(-1);
        assert!(normalizer.normalize("p", &negative).is_err());

        assert!(normalizer.normalize("p", &json!({ "status": "settled" })).is_err());
        assert!(normalizer.normalize("p", &base).is_ok());
    }

    #[test]
    fn test_custom_status() {
        let normalizer = StatusMapNormalizer::new().with_status("Cleared", CanonicalEventType::Settled);
        let event = normalizer
            .normalize(
                "chain",
                &json!({ "id": "0xabc", "status": "cleared", "occurred_at": "2024-03-01T12:00:00+02:00" }),
            )
            .unwrap();
        assert_eq!(event.event_type, CanonicalEventType::Settled);
        assert_eq!(event.provider_event_id, "0xabc");
    }
}

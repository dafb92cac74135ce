//! ReconciliationEngine: journey rows, break tracking and the review queue
//!
//! Lock order is journey row, then break row. Review rows are only ever
//! created under a journey lock or locked on their own.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use warden_audit::{AuditLog, AuditRecord, AuditStream};
use warden_types::{
    Amount, BreakId, Clock, Currency, EventId, JourneyId, OrgId, ReviewItemId, RowGuard,
    RowTable, SharedClock, WardenError,
};

use crate::{
    actions, BreakFinding, BreakRules, BreakStatus, BreakType, CanonicalEvent,
    CanonicalEventType, CanonicalJourney, EventNormalizer, JourneyBreakStatus, JourneyKey,
    ManualReviewItem, ProviderEvent, Rail, ReconciliationBreak, ReconciliationError, Result,
    ReviewStatus, Severity,
};

/// Actor recorded for rule-driven changes
pub const RECONCILIATION_ACTOR: &str = "reconciliation";

fn journey_stream(id: &JourneyId) -> AuditStream {
    AuditStream::new("journey", id)
}

fn break_stream(id: &BreakId) -> AuditStream {
    AuditStream::new("reconciliation_break", id)
}

fn review_stream(id: &ReviewItemId) -> AuditStream {
    AuditStream::new("review_item", id)
}

fn break_state(item: &ReconciliationBreak) -> Value {
    json!({
        "break_type": item.break_type,
        "severity": item.severity,
        "status": item.status,
        "expected_amount": item.expected_amount,
        "settled_amount": item.settled_amount,
        "delta": item.delta,
    })
}

fn review_state(item: &ManualReviewItem) -> Value {
    json!({
        "reason_code": item.reason_code,
        "priority": item.priority,
        "status": item.status,
        "assignee": item.assignee,
        "break_id": item.break_id,
    })
}

#[derive(Debug, Clone)]
struct JourneyRow {
    journey: CanonicalJourney,
    events: Vec<CanonicalEvent>,
    /// Unresolved break per type
    open_breaks: BTreeMap<BreakType, BreakId>,
    /// Hidden from reads until its creation is audited
    published: bool,
}

/// Amount a transfer is expected to settle for, registered by the originator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Expectation {
    pub expected_amount: Amount,
    pub currency: Currency,
}

/// What ingesting one event did
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JourneyUpdate {
    pub journey: CanonicalJourney,
    pub event: CanonicalEvent,
    /// Breaks opened or refreshed by this event
    pub breaks: Vec<ReconciliationBreak>,
    /// Review items queued by this event
    pub review_items: Vec<ManualReviewItem>,
}

impl JourneyUpdate {
    pub fn is_duplicate(&self) -> bool {
        self.event.duplicate
    }
}

/// Changes collected under a journey lock, published after one audit write
#[derive(Default)]
struct Staged {
    records: Vec<AuditRecord>,
    touched: Vec<(RowGuard<ReconciliationBreak>, ReconciliationBreak)>,
    opened: Vec<ReconciliationBreak>,
    queued: Vec<ManualReviewItem>,
    /// Current view of every break a finding landed on
    current: Vec<ReconciliationBreak>,
}

/// Canonical journeys, their breaks and the manual review queue
pub struct ReconciliationEngine {
    journeys: RowTable<JourneyId, JourneyRow>,
    index: DashMap<JourneyKey, JourneyId>,
    expectations: DashMap<JourneyKey, Expectation>,
    /// (provider, provider_event_id) -> journey it was applied to
    seen_events: DashMap<(String, String), JourneyId>,
    breaks: RowTable<BreakId, ReconciliationBreak>,
    reviews: RowTable<ReviewItemId, ManualReviewItem>,
    rules: BreakRules,
    audit: Arc<dyn AuditLog>,
    clock: SharedClock,
}

impl ReconciliationEngine {
    pub fn new(
        rules: BreakRules,
        audit: Arc<dyn AuditLog>,
        clock: SharedClock,
        lock_timeout: StdDuration,
    ) -> Self {
        Self {
            journeys: RowTable::new("journey", lock_timeout),
            index: DashMap::new(),
            expectations: DashMap::new(),
            seen_events: DashMap::new(),
            breaks: RowTable::new("reconciliation_break", lock_timeout),
            reviews: RowTable::new("review_item", lock_timeout),
            rules,
            audit,
            clock,
        }
    }

    pub fn rules(&self) -> &BreakRules {
        &self.rules
    }

    /// Fold a normalized provider event into its journey.
    ///
    /// A `(provider, provider_event_id)` seen before returns the journey
    /// unchanged with `event.duplicate` set. An event that would move the
    /// state backward is recorded but not applied.
    pub async fn ingest_event(
        &self,
        organization: &OrgId,
        rail: Rail,
        provider: &str,
        external_reference: &str,
        event: ProviderEvent,
    ) -> Result<JourneyUpdate> {
        if provider.trim().is_empty() {
            return Err(WardenError::invalid_input("provider", "must not be empty").into());
        }
        if external_reference.trim().is_empty() {
            return Err(
                WardenError::invalid_input("external_reference", "must not be empty").into(),
            );
        }
        event.validate()?;

        let dedupe_key = (provider.to_string(), event.provider_event_id.clone());
        if let Some(journey_id) = self.seen_events.get(&dedupe_key).map(|e| e.value().clone()) {
            let mut guard = self.journeys.lock(&journey_id).await?.ok_or_else(|| {
                WardenError::internal(format!("seen event points at missing journey {}", journey_id))
            })?;
            return self
                .record_duplicate(&mut guard, provider, &event, self.clock.now())
                .await;
        }

        let key = JourneyKey::new(organization.clone(), rail, provider, external_reference);
        let now = self.clock.now();
        let mut guard = self.lock_journey_for(&key, now).await?;
        if self.seen_events.contains_key(&dedupe_key) {
            // Lost the race to a concurrent delivery of the same event
            return self.record_duplicate(&mut guard, provider, &event, now).await;
        }

        let mut row = guard.clone();
        let mut staged = Staged::default();
        let was_published = row.published;
        let before = row.journey.audit_state();

        let out_of_order = row
            .journey
            .last_event_at
            .map_or(false, |last| event.occurred_at < last);

        self.stage_creation(&mut row, Some(&event), provider, now, &mut staged);
        let applied = row.journey.apply(&event);
        if applied {
            self.adopt_expected(&mut row.journey, &event);
            row.journey.observe_timestamp(event.occurred_at);
            row.journey.touch(now);
            let findings = self.rules.evaluate(&row.journey);
            self.stage_findings(&mut row, findings, now, &mut staged).await?;
        }

        let canonical = CanonicalEvent {
            id: EventId::new(),
            journey_id: row.journey.id.clone(),
            provider: provider.to_string(),
            provider_event_id: event.provider_event_id.clone(),
            event_type: event.event_type,
            occurred_at: event.occurred_at,
            amount: event.amount,
            return_code: event.return_code.clone(),
            out_of_order,
            duplicate: false,
            applied,
            recorded_at: now,
        };
        let action = if applied {
            actions::EVENT_APPLIED
        } else {
            actions::EVENT_IGNORED
        };
        let mut record = AuditRecord::new(journey_stream(&row.journey.id), action, provider, now)
            .with_new(json!({
                "event_id": canonical.id,
                "provider_event_id": canonical.provider_event_id,
                "event_type": canonical.event_type,
                "occurred_at": canonical.occurred_at,
                "out_of_order": out_of_order,
                "state": row.journey.audit_state(),
            }));
        if was_published {
            record = record.with_old(before);
        }
        staged.records.push(record);
        row.events.push(canonical.clone());

        let (breaks, review_items) = self.publish(staged).await?;
        self.seen_events.insert(dedupe_key, row.journey.id.clone());
        *guard = row;

        if applied {
            info!(
                journey_id = %guard.journey.id,
                provider = provider,
                event_type = ?canonical.event_type,
                state = %guard.journey.canonical_state,
                out_of_order = out_of_order,
                "Provider event applied"
            );
        } else {
            debug!(
                journey_id = %guard.journey.id,
                provider_event_id = %canonical.provider_event_id,
                state = %guard.journey.canonical_state,
                "Provider event did not move the journey"
            );
        }
        if !breaks.is_empty() {
            warn!(
                journey_id = %guard.journey.id,
                breaks = breaks.len(),
                break_status = ?guard.journey.break_status,
                "Reconciliation breaks raised"
            );
        }

        Ok(JourneyUpdate {
            journey: guard.journey.clone(),
            event: canonical,
            breaks,
            review_items,
        })
    }

    /// Normalize a raw payload and ingest it
    pub async fn ingest_payload(
        &self,
        normalizer: &dyn EventNormalizer,
        organization: &OrgId,
        rail: Rail,
        provider: &str,
        external_reference: &str,
        payload: &Value,
    ) -> Result<JourneyUpdate> {
        let event = normalizer.normalize(provider, payload)?;
        self.ingest_event(organization, rail, provider, external_reference, event)
            .await
    }

    /// Register the amount a transfer should settle for.
    ///
    /// Before the first event the expectation is picked up when the journey
    /// is created. For an existing journey the expected amount is updated
    /// and the rules re-run. Returns the journey if one exists.
    pub async fn expect_transfer(
        &self,
        organization: &OrgId,
        rail: Rail,
        provider: &str,
        external_reference: &str,
        expected_amount: Amount,
        currency: Currency,
    ) -> Result<Option<CanonicalJourney>> {
        if !expected_amount.is_positive() {
            return Err(WardenError::invalid_input("expected_amount", "must be positive").into());
        }
        if provider.trim().is_empty() {
            return Err(WardenError::invalid_input("provider", "must not be empty").into());
        }
        let key = JourneyKey::new(organization.clone(), rail, provider, external_reference);
        let now = self.clock.now();
        let mut guard = self.lock_journey_for(&key, now).await?;
        let expectation = Expectation {
            expected_amount,
            currency: currency.clone(),
        };

        if !guard.published {
            self.expectations.insert(key, expectation);
            debug!(
                provider = provider,
                external_reference = external_reference,
                expected = %expected_amount,
                "Expectation registered"
            );
            return Ok(None);
        }
        if guard.journey.expected_amount == expected_amount
            && guard.journey.currency.as_ref() == Some(&currency)
        {
            self.expectations.insert(key, expectation);
            return Ok(Some(guard.journey.clone()));
        }

        let mut row = guard.clone();
        let mut staged = Staged::default();
        let before = row.journey.audit_state();
        row.journey.expected_amount = expected_amount;
        row.journey.currency = Some(currency);
        row.journey.touch(now);
        let findings = self.rules.evaluate(&row.journey);
        self.stage_findings(&mut row, findings, now, &mut staged).await?;
        staged.records.push(
            AuditRecord::new(
                journey_stream(&row.journey.id),
                actions::EXPECTATION_UPDATED,
                RECONCILIATION_ACTOR,
                now,
            )
            .with_old(before)
            .with_new(row.journey.audit_state()),
        );

        self.publish(staged).await?;
        self.expectations.insert(key, expectation);
        *guard = row;
        info!(journey_id = %guard.journey.id, expected = %expected_amount, "Journey expectation updated");
        Ok(Some(guard.journey.clone()))
    }

    /// Raise a high-severity `retry_exhausted` break for a transfer whose
    /// provider feed could not be ingested, and queue it for review.
    pub async fn record_ingestion_failure(
        &self,
        organization: &OrgId,
        rail: Rail,
        provider: &str,
        external_reference: &str,
        attempts: u32,
        reason: &str,
    ) -> Result<ReconciliationBreak> {
        let key = JourneyKey::new(organization.clone(), rail, provider, external_reference);
        let now = self.clock.now();
        let mut guard = self.lock_journey_for(&key, now).await?;
        let mut row = guard.clone();
        let mut staged = Staged::default();

        self.stage_creation(&mut row, None, RECONCILIATION_ACTOR, now, &mut staged);
        let finding = BreakFinding {
            break_type: BreakType::RetryExhausted,
            severity: Severity::High,
            delta: row.journey.delta(),
            detail: format!("ingestion failed after {} attempts: {}", attempts, reason),
        };
        self.stage_findings(&mut row, vec![finding], now, &mut staged)
            .await?;
        row.journey.touch(now);
        staged.records.push(
            AuditRecord::new(
                journey_stream(&row.journey.id),
                actions::INGESTION_FAILED,
                provider,
                now,
            )
            .with_new(json!({
                "attempts": attempts,
                "reason": reason,
                "state": row.journey.audit_state(),
            })),
        );

        let current = staged
            .current
            .last()
            .cloned()
            .ok_or_else(|| WardenError::internal("ingestion failure raised no break"))?;
        self.publish(staged).await?;
        *guard = row;
        warn!(
            journey_id = %guard.journey.id,
            provider = provider,
            attempts = attempts,
            break_id = %current.id,
            "Provider ingestion failed"
        );
        Ok(current)
    }

    /// Mark an open break as seen by an operator
    pub async fn acknowledge_break(
        &self,
        break_id: &BreakId,
        actor: &str,
    ) -> Result<ReconciliationBreak> {
        let mut guard = self.lock_break(break_id).await?;
        if guard.status != BreakStatus::Open {
            return Err(ReconciliationError::InvalidTransition {
                entity: "break",
                id: break_id.to_string(),
                from: guard.status.to_string(),
                to: BreakStatus::Acknowledged.to_string(),
            });
        }
        let now = self.clock.now();
        let mut updated = guard.clone();
        updated.status = BreakStatus::Acknowledged;
        updated.acknowledged_by = Some(actor.to_string());
        updated.updated_at = now;

        self.audit
            .append(
                AuditRecord::new(break_stream(break_id), actions::BREAK_ACKNOWLEDGED, actor, now)
                    .with_old(break_state(&guard))
                    .with_new(break_state(&updated)),
            )
            .await?;
        *guard = updated;
        info!(break_id = %break_id, actor = actor, "Break acknowledged");
        Ok(guard.clone())
    }

    /// Close a break. The journey's break status becomes `resolved` once no
    /// unresolved break remains on it.
    pub async fn resolve_break(
        &self,
        break_id: &BreakId,
        actor: &str,
        note: &str,
    ) -> Result<ReconciliationBreak> {
        let journey_id = self
            .breaks
            .snapshot(break_id)
            .await?
            .ok_or_else(|| ReconciliationError::BreakNotFound {
                break_id: break_id.to_string(),
            })?
            .journey_id;
        let mut journey_guard = self.journeys.lock(&journey_id).await?.ok_or_else(|| {
            WardenError::internal(format!("break {} points at missing journey {}", break_id, journey_id))
        })?;
        let mut break_guard = self.lock_break(break_id).await?;
        if break_guard.status == BreakStatus::Resolved {
            return Err(ReconciliationError::InvalidTransition {
                entity: "break",
                id: break_id.to_string(),
                from: break_guard.status.to_string(),
                to: BreakStatus::Resolved.to_string(),
            });
        }

        let now = self.clock.now();
        let mut resolved = break_guard.clone();
        resolved.status = BreakStatus::Resolved;
        resolved.resolved_by = Some(actor.to_string());
        resolved.resolution_note = Some(note.to_string());
        resolved.updated_at = now;

        let mut records = vec![
            AuditRecord::new(break_stream(break_id), actions::BREAK_RESOLVED, actor, now)
                .with_old(break_state(&break_guard))
                .with_new(json!({ "status": resolved.status, "note": note })),
        ];

        let mut row = journey_guard.clone();
        if row.open_breaks.get(&resolved.break_type) == Some(&resolved.id) {
            row.open_breaks.remove(&resolved.break_type);
        }
        if row.open_breaks.is_empty()
            && matches!(
                row.journey.break_status,
                JourneyBreakStatus::DriftOpen | JourneyBreakStatus::ReviewOpen
            )
        {
            let before = row.journey.audit_state();
            row.journey.break_status = JourneyBreakStatus::Resolved;
            row.journey.touch(now);
            records.push(
                AuditRecord::new(
                    journey_stream(&row.journey.id),
                    actions::JOURNEY_BREAKS_RESOLVED,
                    actor,
                    now,
                )
                .with_old(before)
                .with_new(row.journey.audit_state()),
            );
        }

        self.audit.append_batch(records).await?;
        *break_guard = resolved;
        *journey_guard = row;
        info!(
            break_id = %break_id,
            journey_id = %journey_id,
            actor = actor,
            break_status = ?journey_guard.journey.break_status,
            "Break resolved"
        );
        Ok(break_guard.clone())
    }

    /// Take a queued review item
    pub async fn claim_review_item(
        &self,
        item_id: &ReviewItemId,
        assignee: &str,
    ) -> Result<ManualReviewItem> {
        self.transition_review(item_id, assignee, ReviewStatus::InReview, None)
            .await
    }

    pub async fn resolve_review_item(
        &self,
        item_id: &ReviewItemId,
        actor: &str,
        note: &str,
    ) -> Result<ManualReviewItem> {
        self.transition_review(item_id, actor, ReviewStatus::Resolved, Some(note))
            .await
    }

    pub async fn dismiss_review_item(
        &self,
        item_id: &ReviewItemId,
        actor: &str,
        note: &str,
    ) -> Result<ManualReviewItem> {
        self.transition_review(item_id, actor, ReviewStatus::Dismissed, Some(note))
            .await
    }

    /// Published journey by id
    pub async fn get_journey(&self, journey_id: &JourneyId) -> Result<Option<CanonicalJourney>> {
        Ok(self
            .journeys
            .snapshot(journey_id)
            .await?
            .filter(|row| row.published)
            .map(|row| row.journey))
    }

    pub async fn find_journey(
        &self,
        organization: &OrgId,
        rail: Rail,
        provider: &str,
        external_reference: &str,
    ) -> Result<Option<CanonicalJourney>> {
        let key = JourneyKey::new(organization.clone(), rail, provider, external_reference);
        match self.index.get(&key).map(|e| e.value().clone()) {
            Some(journey_id) => self.get_journey(&journey_id).await,
            None => Ok(None),
        }
    }

    /// Every event recorded on a journey, in arrival order
    pub async fn journey_events(&self, journey_id: &JourneyId) -> Result<Vec<CanonicalEvent>> {
        self.journeys
            .snapshot(journey_id)
            .await?
            .filter(|row| row.published)
            .map(|row| row.events)
            .ok_or_else(|| ReconciliationError::JourneyNotFound {
                journey_id: journey_id.to_string(),
            })
    }

    pub async fn get_break(&self, break_id: &BreakId) -> Result<Option<ReconciliationBreak>> {
        Ok(self.breaks.snapshot(break_id).await?)
    }

    pub async fn get_review_item(&self, item_id: &ReviewItemId) -> Result<Option<ManualReviewItem>> {
        Ok(self.reviews.snapshot(item_id).await?)
    }

    /// Breaks of an organization, oldest first
    pub async fn query_breaks(
        &self,
        organization: &OrgId,
        status: Option<BreakStatus>,
    ) -> Result<Vec<ReconciliationBreak>> {
        let mut breaks = self
            .breaks
            .snapshot_where(|b| {
                &b.organization == organization && status.map_or(true, |s| b.status == s)
            })
            .await?;
        breaks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(breaks)
    }

    /// Review items of an organization, most urgent first, then oldest first
    pub async fn query_review_queue(
        &self,
        organization: &OrgId,
        status: Option<ReviewStatus>,
    ) -> Result<Vec<ManualReviewItem>> {
        let mut items = self
            .reviews
            .snapshot_where(|item| {
                &item.organization == organization && status.map_or(true, |s| item.status == s)
            })
            .await?;
        items.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(items)
    }

    /// Lock the journey row for `key`, creating an unpublished row if none
    /// exists.
    ///
    /// The index is re-checked under the row lock: a row pruned while this
    /// call waited is no longer indexed, and the lookup starts over.
    async fn lock_journey_for(
        &self,
        key: &JourneyKey,
        now: DateTime<Utc>,
    ) -> Result<RowGuard<JourneyRow>> {
        loop {
            let journey_id = self
                .index
                .entry(key.clone())
                .or_insert_with(JourneyId::new)
                .value()
                .clone();
            let (guard, created) = self
                .journeys
                .lock_or_insert_with(&journey_id, || JourneyRow {
                    journey: CanonicalJourney::new(journey_id.clone(), key, now),
                    events: Vec::new(),
                    open_breaks: BTreeMap::new(),
                    published: false,
                })
                .await?;
            let indexed = self
                .index
                .get(key)
                .map_or(false, |entry| entry.value() == &journey_id);
            if !indexed {
                if created {
                    self.journeys.remove(&journey_id);
                }
                continue;
            }
            if created {
                debug!(
                    journey_id = %journey_id,
                    provider = %key.provider,
                    external_reference = %key.external_reference,
                    "Journey row created"
                );
            }
            return Ok(guard);
        }
    }

    /// Drop journeys that were registered or started but never published
    /// and are older than `before`, together with their expectations.
    ///
    /// Covers expectations for transfers no provider ever reported and
    /// rows left behind by a failed first ingestion. Returns how many
    /// journeys were removed.
    pub async fn prune_unpublished(&self, before: DateTime<Utc>) -> Result<usize> {
        let mut removed = 0;
        for journey_id in self.journeys.keys() {
            let Some(guard) = self.journeys.lock(&journey_id).await? else {
                continue;
            };
            if guard.published || guard.journey.created_at >= before {
                continue;
            }
            let key = guard.journey.key();
            self.index.remove_if(&key, |_, id| id == &journey_id);
            self.expectations.remove(&key);
            self.journeys.remove(&journey_id);
            drop(guard);
            removed += 1;
        }
        if removed > 0 {
            info!(removed = removed, "Unmatched journeys pruned");
        }
        Ok(removed)
    }

    async fn lock_break(&self, break_id: &BreakId) -> Result<RowGuard<ReconciliationBreak>> {
        self.breaks
            .lock(break_id)
            .await?
            .ok_or_else(|| ReconciliationError::BreakNotFound {
                break_id: break_id.to_string(),
            })
    }

    /// Stage the creation record of a journey that has not been audited yet
    fn stage_creation(
        &self,
        row: &mut JourneyRow,
        event: Option<&ProviderEvent>,
        actor: &str,
        now: DateTime<Utc>,
        staged: &mut Staged,
    ) {
        if row.published {
            return;
        }
        let expectation = self
            .expectations
            .get(&row.journey.key())
            .map(|e| e.value().clone());
        let journey = &mut row.journey;
        journey.expected_amount = expectation
            .as_ref()
            .map(|e| e.expected_amount)
            .or_else(|| event.and_then(|e| e.expected_amount))
            .unwrap_or_else(Amount::zero);
        journey.currency = expectation
            .map(|e| e.currency)
            .or_else(|| event.and_then(|e| e.currency.clone()));
        journey.touch(now);
        row.published = true;

        staged.records.push(
            AuditRecord::new(journey_stream(&journey.id), actions::JOURNEY_CREATED, actor, now)
                .with_new(json!({
                    "organization": journey.organization,
                    "rail": journey.rail,
                    "provider": journey.provider,
                    "external_reference": journey.external_reference,
                    "currency": journey.currency,
                    "state": journey.audit_state(),
                })),
        );
    }

    /// With nothing registered, take the expected amount from the first
    /// event that states one.
    fn adopt_expected(&self, journey: &mut CanonicalJourney, event: &ProviderEvent) {
        if !journey.expected_amount.is_zero() || self.expectations.contains_key(&journey.key()) {
            return;
        }
        let stated = event.expected_amount.or(match event.event_type {
            CanonicalEventType::Pending | CanonicalEventType::Settled => event.amount,
            _ => None,
        });
        if let Some(amount) = stated.filter(Amount::is_positive) {
            journey.expected_amount = amount;
        }
    }

    /// Open or refresh one break per finding. Caller holds the journey lock.
    async fn stage_findings(
        &self,
        row: &mut JourneyRow,
        findings: Vec<BreakFinding>,
        now: DateTime<Utc>,
        staged: &mut Staged,
    ) -> Result<()> {
        for finding in findings {
            match row.open_breaks.get(&finding.break_type).cloned() {
                Some(break_id) => {
                    let guard = self.breaks.lock(&break_id).await?.ok_or_else(|| {
                        WardenError::internal(format!(
                            "journey {} references missing break {}",
                            row.journey.id, break_id
                        ))
                    })?;
                    let mut updated = guard.clone();
                    if updated.refresh(&row.journey, &finding, now) {
                        if updated.severity.needs_review() && updated.review_item_id.is_none() {
                            let item = ManualReviewItem::for_break(&updated, now);
                            updated.review_item_id = Some(item.id.clone());
                            stage_review(item, now, staged);
                        }
                        staged.records.push(
                            AuditRecord::new(
                                break_stream(&break_id),
                                actions::BREAK_UPDATED,
                                RECONCILIATION_ACTOR,
                                now,
                            )
                            .with_old(break_state(&guard))
                            .with_new(break_state(&updated)),
                        );
                        staged.current.push(updated.clone());
                        staged.touched.push((guard, updated));
                    } else {
                        staged.current.push(updated);
                    }
                }
                None => {
                    let mut opened = ReconciliationBreak::open(&row.journey, &finding, now);
                    if opened.severity.needs_review() {
                        let item = ManualReviewItem::for_break(&opened, now);
                        opened.review_item_id = Some(item.id.clone());
                        stage_review(item, now, staged);
                    }
                    row.open_breaks
                        .insert(finding.break_type, opened.id.clone());
                    staged.records.push(
                        AuditRecord::new(
                            break_stream(&opened.id),
                            actions::BREAK_OPENED,
                            RECONCILIATION_ACTOR,
                            now,
                        )
                        .with_new(json!({
                            "journey_id": opened.journey_id,
                            "detail": opened.detail,
                            "state": break_state(&opened),
                        })),
                    );
                    staged.current.push(opened.clone());
                    staged.opened.push(opened);
                }
            }

            row.journey.break_status = if finding.severity.needs_review()
                || row.journey.break_status == JourneyBreakStatus::ReviewOpen
            {
                JourneyBreakStatus::ReviewOpen
            } else {
                JourneyBreakStatus::DriftOpen
            };
        }
        Ok(())
    }

    /// Write the staged audit records, then apply the staged rows
    async fn publish(
        &self,
        staged: Staged,
    ) -> Result<(Vec<ReconciliationBreak>, Vec<ManualReviewItem>)> {
        let Staged {
            records,
            touched,
            opened,
            queued,
            current,
        } = staged;

        self.audit.append_batch(records).await?;
        for (mut guard, updated) in touched {
            *guard = updated;
        }
        for item in opened {
            let id = item.id.clone();
            if !self.breaks.insert(id.clone(), item) {
                return Err(WardenError::internal(format!("duplicate break id {}", id)).into());
            }
        }
        for item in &queued {
            if !self.reviews.insert(item.id.clone(), item.clone()) {
                return Err(
                    WardenError::internal(format!("duplicate review item id {}", item.id)).into(),
                );
            }
        }
        Ok((current, queued))
    }

    /// Record a redelivered event on its journey without touching the
    /// journey state. Caller holds the journey lock.
    async fn record_duplicate(
        &self,
        row: &mut JourneyRow,
        provider: &str,
        event: &ProviderEvent,
        now: DateTime<Utc>,
    ) -> Result<JourneyUpdate> {
        let replay = duplicate_event(row, provider, event, now);
        self.audit
            .append(
                AuditRecord::new(
                    journey_stream(&row.journey.id),
                    actions::EVENT_DUPLICATE,
                    provider,
                    now,
                )
                .with_new(json!({
                    "event_id": replay.id,
                    "provider_event_id": replay.provider_event_id,
                    "event_type": replay.event_type,
                    "occurred_at": replay.occurred_at,
                })),
            )
            .await?;
        row.events.push(replay.clone());
        debug!(
            journey_id = %row.journey.id,
            provider_event_id = %event.provider_event_id,
            "Duplicate provider event ignored"
        );
        Ok(JourneyUpdate {
            journey: row.journey.clone(),
            event: replay,
            breaks: Vec::new(),
            review_items: Vec::new(),
        })
    }

    async fn transition_review(
        &self,
        item_id: &ReviewItemId,
        actor: &str,
        to: ReviewStatus,
        note: Option<&str>,
    ) -> Result<ManualReviewItem> {
        let mut guard = self.reviews.lock(item_id).await?.ok_or_else(|| {
            ReconciliationError::ReviewItemNotFound {
                item_id: item_id.to_string(),
            }
        })?;
        let allowed = match to {
            ReviewStatus::InReview => guard.status == ReviewStatus::Queued,
            ReviewStatus::Resolved | ReviewStatus::Dismissed => !guard.status.is_closed(),
            ReviewStatus::Queued => false,
        };
        if !allowed {
            return Err(ReconciliationError::InvalidTransition {
                entity: "review_item",
                id: item_id.to_string(),
                from: guard.status.to_string(),
                to: to.to_string(),
            });
        }
        let action = match to {
            ReviewStatus::InReview => actions::REVIEW_CLAIMED,
            ReviewStatus::Resolved => actions::REVIEW_RESOLVED,
            _ => actions::REVIEW_DISMISSED,
        };

        let now = self.clock.now();
        let mut updated = guard.clone();
        updated.status = to;
        if to == ReviewStatus::InReview || updated.assignee.is_none() {
            updated.assignee = Some(actor.to_string());
        }
        if let Some(note) = note {
            updated.resolution_note = Some(note.to_string());
        }
        updated.updated_at = now;

        self.audit
            .append(
                AuditRecord::new(review_stream(item_id), action, actor, now)
                    .with_old(review_state(&guard))
                    .with_new(review_state(&updated)),
            )
            .await?;
        *guard = updated;
        info!(item_id = %item_id, status = %to, actor = actor, "Review item updated");
        Ok(guard.clone())
    }
}

fn stage_review(item: ManualReviewItem, now: DateTime<Utc>, staged: &mut Staged) {
    staged.records.push(
        AuditRecord::new(
            review_stream(&item.id),
            actions::REVIEW_QUEUED,
            RECONCILIATION_ACTOR,
            now,
        )
        .with_new(review_state(&item)),
    );
    staged.queued.push(item);
}

/// Canonical record of a redelivered event
fn duplicate_event(
    row: &JourneyRow,
    provider: &str,
    event: &ProviderEvent,
    now: DateTime<Utc>,
) -> CanonicalEvent {
    CanonicalEvent {
        id: EventId::new(),
        journey_id: row.journey.id.clone(),
        provider: provider.to_string(),
        provider_event_id: event.provider_event_id.clone(),
        event_type: event.event_type,
        occurred_at: event.occurred_at,
        amount: event.amount,
        return_code: event.return_code.clone(),
        out_of_order: false,
        duplicate: true,
        applied: false,
        recorded_at: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ReviewPriority;
    use chrono::Duration;
    use warden_audit::FaultInjectingAuditLog;
    use warden_types::ManualClock;

    struct Fixture {
        engine: Arc<ReconciliationEngine>,
        audit: Arc<FaultInjectingAuditLog>,
        clock: ManualClock,
        org: OrgId,
    }

    fn fixture() -> Fixture {
        let audit = Arc::new(FaultInjectingAuditLog::new());
        let clock = ManualClock::starting_now();
        let engine = ReconciliationEngine::new(
            BreakRules::default(),
            audit.clone(),
            Arc::new(clock.clone()),
            StdDuration::from_millis(200),
        );
        Fixture {
            engine: Arc::new(engine),
            audit,
            clock,
            org: OrgId::new(),
        }
    }

    fn event(id: &str, event_type: CanonicalEventType, at: DateTime<Utc>) -> ProviderEvent {
        ProviderEvent::new(id, event_type, at)
    }

    async fn ingest(f: &Fixture, reference: &str, event: ProviderEvent) -> JourneyUpdate {
        f.engine
            .ingest_event(&f.org, Rail::BankTransfer, "acme-bank", reference, event)
            .await
            .unwrap()
    }

    async fn expect(f: &Fixture, reference: &str, amount: i64) {
        f.engine
            .expect_transfer(
                &f.org,
                Rail::BankTransfer,
                "acme-bank",
                reference,
                Amount::new(amount),
                Currency::usd(),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_replayed_event_changes_nothing() {
        let f = fixture();
        let t0 = f.clock.now();
        let first = ingest(&f, "ach-1", event("evt-1", CanonicalEventType::Pending, t0)).await;
        assert!(first.event.applied);
        assert!(!first.is_duplicate());

        let entries = f.audit.inner().entry_count().await;
        let replay = ingest(&f, "ach-1", event("evt-1", CanonicalEventType::Pending, t0)).await;
        assert!(replay.is_duplicate());
        assert!(!replay.event.applied);
        assert_eq!(replay.journey, first.journey);

        // Only the redelivery itself is written down
        assert_eq!(f.audit.inner().entry_count().await, entries + 1);
        let stream = f
            .audit
            .stream_entries(&journey_stream(&first.journey.id))
            .await
            .unwrap();
        let last = stream.last().unwrap();
        assert_eq!(last.action, actions::EVENT_DUPLICATE);
        assert_eq!(last.actor, "acme-bank");

        let events = f.engine.journey_events(&first.journey.id).await.unwrap();
        assert_eq!(events.len(), 2);
        assert!(!events[0].duplicate);
        assert!(events[1].duplicate);
    }

    #[tokio::test]
    async fn test_duplicate_not_recorded_when_audit_fails() {
        let f = fixture();
        let t0 = f.clock.now();
        let first = ingest(&f, "ach-1", event("evt-1", CanonicalEventType::Pending, t0)).await;

        f.audit.set_failing(true);
        assert!(f
            .engine
            .ingest_event(
                &f.org,
                Rail::BankTransfer,
                "acme-bank",
                "ach-1",
                event("evt-1", CanonicalEventType::Pending, t0),
            )
            .await
            .is_err());
        f.audit.set_failing(false);
        assert_eq!(f.engine.journey_events(&first.journey.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_same_reference_from_two_providers_stays_separate() {
        let f = fixture();
        let t0 = f.clock.now();
        let a = f
            .engine
            .ingest_event(
                &f.org,
                Rail::BankTransfer,
                "bank-a",
                "ref-1",
                event("a1", CanonicalEventType::Settled, t0).with_amount(Amount::new(100)),
            )
            .await
            .unwrap();
        let mut pending = event("b1", CanonicalEventType::Pending, t0);
        pending.expected_amount = Some(Amount::new(500));
        let b = f
            .engine
            .ingest_event(&f.org, Rail::BankTransfer, "bank-b", "ref-1", pending)
            .await
            .unwrap();

        assert_ne!(a.journey.id, b.journey.id);
        assert!(b.event.applied);
        assert_eq!(b.journey.provider, "bank-b");
        assert_eq!(b.journey.canonical_state, crate::JourneyState::Pending);
        assert_eq!(b.journey.expected_amount, Amount::new(500));
        assert_eq!(a.journey.canonical_state, crate::JourneyState::Settled);

        let found = f
            .engine
            .find_journey(&f.org, Rail::BankTransfer, "bank-a", "ref-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, a.journey.id);
    }

    #[tokio::test]
    async fn test_expected_journey_records_real_provider() {
        let f = fixture();
        expect(&f, "ach-p1", 250).await;
        let update = ingest(&f, "ach-p1", event("p1", CanonicalEventType::Pending, f.clock.now())).await;
        assert_eq!(update.journey.provider, "acme-bank");
        assert_eq!(update.journey.expected_amount, Amount::new(250));

        let created = f
            .audit
            .stream_entries(&journey_stream(&update.journey.id))
            .await
            .unwrap()
            .into_iter()
            .find(|e| e.action == actions::JOURNEY_CREATED)
            .unwrap();
        assert_eq!(created.new_value.as_ref().unwrap()["provider"], "acme-bank");
    }

    #[tokio::test]
    async fn test_settlement_without_amount_is_clean() {
        let f = fixture();
        expect(&f, "ach-n1", 100).await;
        let t0 = f.clock.now();
        let settled = ingest(&f, "ach-n1", event("s", CanonicalEventType::Settled, t0)).await;
        assert_eq!(settled.journey.settled_amount, Amount::new(100));
        assert!(settled.breaks.is_empty());
        assert_eq!(settled.journey.break_status, JourneyBreakStatus::Ok);

        // A return without an amount takes everything back
        let returned = ingest(
            &f,
            "ach-n1",
            event("r", CanonicalEventType::Returned, t0 + Duration::minutes(5)),
        )
        .await;
        assert_eq!(returned.journey.canonical_state, crate::JourneyState::Returned);
        assert_eq!(returned.journey.settled_amount, Amount::zero());
        assert!(returned.breaks.is_empty());
    }

    #[tokio::test]
    async fn test_prune_unmatched_expectations() {
        let f = fixture();
        expect(&f, "ach-stale", 100).await;
        f.clock.advance(Duration::days(8));
        expect(&f, "ach-fresh", 100).await;
        let live = ingest(&f, "ach-live", event("l", CanonicalEventType::Pending, f.clock.now())).await;

        let cutoff = f.clock.now() - Duration::days(7);
        assert_eq!(f.engine.prune_unpublished(cutoff).await.unwrap(), 1);
        assert_eq!(f.engine.prune_unpublished(cutoff).await.unwrap(), 0);
        assert!(f.engine.get_journey(&live.journey.id).await.unwrap().is_some());

        // The pruned reference starts over without the old expectation
        let late = ingest(
            &f,
            "ach-stale",
            event("s", CanonicalEventType::Settled, f.clock.now()).with_amount(Amount::new(90)),
        )
        .await;
        assert_eq!(late.journey.expected_amount, Amount::new(90));
        assert!(late.breaks.is_empty());

        // The fresh one still carries its expectation
        let fresh = ingest(
            &f,
            "ach-fresh",
            event("f", CanonicalEventType::Settled, f.clock.now()).with_amount(Amount::new(90)),
        )
        .await;
        assert_eq!(fresh.journey.expected_amount, Amount::new(100));
        assert_eq!(fresh.breaks.len(), 1);
    }

    #[tokio::test]
    async fn test_short_settlement_opens_one_break() {
        let f = fixture();
        expect(&f, "ach-2", 100).await;
        let t0 = f.clock.now();
        ingest(&f, "ach-2", event("e1", CanonicalEventType::Pending, t0)).await;
        let update = ingest(
            &f,
            "ach-2",
            event("e2", CanonicalEventType::Settled, t0 + Duration::seconds(5))
                .with_amount(Amount::new(80)),
        )
        .await;

        assert_eq!(update.journey.expected_amount, Amount::new(100));
        assert_eq!(update.journey.settled_amount, Amount::new(80));
        assert_eq!(update.breaks.len(), 1);
        let item = &update.breaks[0];
        assert_eq!(item.break_type, BreakType::ExpectedSettledMismatch);
        assert_eq!(item.delta, Amount::new(-20));
        assert_eq!(item.severity, Severity::High);
        assert_eq!(update.journey.break_status, JourneyBreakStatus::ReviewOpen);
        assert_eq!(update.review_items.len(), 1);
        assert_eq!(update.review_items[0].priority, ReviewPriority::High);

        // Replaying the settlement does not open a second break
        ingest(
            &f,
            "ach-2",
            event("e2", CanonicalEventType::Settled, t0 + Duration::seconds(5))
                .with_amount(Amount::new(80)),
        )
        .await;
        let open = f.engine.query_breaks(&f.org, Some(BreakStatus::Open)).await.unwrap();
        assert_eq!(open.len(), 1);
    }

    #[tokio::test]
    async fn test_late_event_never_regresses_state() {
        let f = fixture();
        let t0 = f.clock.now();
        ingest(
            &f,
            "card-9",
            event("s", CanonicalEventType::Settled, t0 + Duration::minutes(2))
                .with_amount(Amount::new(500)),
        )
        .await;
        let late = ingest(&f, "card-9", event("p", CanonicalEventType::Pending, t0)).await;

        assert!(late.event.out_of_order);
        assert!(!late.event.applied);
        assert_eq!(late.journey.canonical_state, crate::JourneyState::Settled);
        assert_eq!(late.journey.last_event_at, Some(t0 + Duration::minutes(2)));
        assert_eq!(late.journey.expected_amount, Amount::new(500));
        assert!(late.breaks.is_empty());

        let events = f.engine.journey_events(&late.journey.id).await.unwrap();
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn test_small_drift_stays_out_of_review() {
        let f = fixture();
        expect(&f, "ach-3", 10_000).await;
        let update = ingest(
            &f,
            "ach-3",
            event("s", CanonicalEventType::Settled, f.clock.now()).with_amount(Amount::new(9_950)),
        )
        .await;
        assert_eq!(update.breaks.len(), 1);
        assert_eq!(update.breaks[0].severity, Severity::Low);
        assert!(update.review_items.is_empty());
        assert_eq!(update.journey.break_status, JourneyBreakStatus::DriftOpen);
        assert!(f.engine.query_review_queue(&f.org, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_expectation_after_settlement_reevaluates() {
        let f = fixture();
        let update = ingest(
            &f,
            "ach-4",
            event("s", CanonicalEventType::Settled, f.clock.now()).with_amount(Amount::new(100)),
        )
        .await;
        assert!(update.breaks.is_empty());

        let journey = f
            .engine
            .expect_transfer(
                &f.org,
                Rail::BankTransfer,
                "acme-bank",
                "ach-4",
                Amount::new(400),
                Currency::usd(),
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(journey.expected_amount, Amount::new(400));
        assert_eq!(journey.break_status, JourneyBreakStatus::ReviewOpen);
        let breaks = f.engine.query_breaks(&f.org, None).await.unwrap();
        assert_eq!(breaks.len(), 1);
        assert_eq!(breaks[0].severity, Severity::Critical);
    }

    #[tokio::test]
    async fn test_ingestion_failure_goes_to_review() {
        let f = fixture();
        let raised = f
            .engine
            .record_ingestion_failure(&f.org, Rail::OnChain, "chain-watch", "0xfeed", 5, "rpc timeout")
            .await
            .unwrap();
        assert_eq!(raised.break_type, BreakType::RetryExhausted);
        assert_eq!(raised.severity, Severity::High);
        assert!(raised.review_item_id.is_some());

        let journey = f
            .engine
            .find_journey(&f.org, Rail::OnChain, "chain-watch", "0xfeed")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(journey.break_status, JourneyBreakStatus::ReviewOpen);

        let queue = f.engine.query_review_queue(&f.org, Some(ReviewStatus::Queued)).await.unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].reason_code, "retry_exhausted");

        // A second failure refreshes the same break
        let again = f
            .engine
            .record_ingestion_failure(&f.org, Rail::OnChain, "chain-watch", "0xfeed", 6, "rpc timeout")
            .await
            .unwrap();
        assert_eq!(again.id, raised.id);
        assert_eq!(f.engine.query_review_queue(&f.org, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_break_and_review_lifecycle() {
        let f = fixture();
        expect(&f, "ach-5", 100).await;
        let update = ingest(
            &f,
            "ach-5",
            event("s", CanonicalEventType::Settled, f.clock.now()).with_amount(Amount::new(40)),
        )
        .await;
        let break_id = update.breaks[0].id.clone();
        let item_id = update.review_items[0].id.clone();

        let acked = f.engine.acknowledge_break(&break_id, "ops-1").await.unwrap();
        assert_eq!(acked.status, BreakStatus::Acknowledged);
        let err = f.engine.acknowledge_break(&break_id, "ops-1").await.unwrap_err();
        assert_eq!(err.error_code(), "INVALID_TRANSITION");

        let claimed = f.engine.claim_review_item(&item_id, "ops-2").await.unwrap();
        assert_eq!(claimed.status, ReviewStatus::InReview);
        assert_eq!(claimed.assignee.as_deref(), Some("ops-2"));
        assert!(f.engine.claim_review_item(&item_id, "ops-3").await.is_err());

        let done = f
            .engine
            .resolve_review_item(&item_id, "ops-2", "provider confirmed partial settlement")
            .await
            .unwrap();
        assert_eq!(done.status, ReviewStatus::Resolved);
        assert!(f.engine.dismiss_review_item(&item_id, "ops-2", "late").await.is_err());

        let resolved = f
            .engine
            .resolve_break(&break_id, "ops-2", "written off")
            .await
            .unwrap();
        assert_eq!(resolved.status, BreakStatus::Resolved);
        let journey = f.engine.get_journey(&update.journey.id).await.unwrap().unwrap();
        assert_eq!(journey.break_status, JourneyBreakStatus::Resolved);
        assert!(f.engine.resolve_break(&break_id, "ops-2", "again").await.is_err());
    }

    #[tokio::test]
    async fn test_review_queue_order() {
        let f = fixture();
        expect(&f, "high", 1_000).await;
        expect(&f, "critical", 1_000).await;
        let now = f.clock.now();
        ingest(&f, "high", event("h", CanonicalEventType::Settled, now).with_amount(Amount::new(800))).await;
        f.clock.advance(Duration::seconds(1));
        ingest(&f, "critical", event("c", CanonicalEventType::Settled, now).with_amount(Amount::new(100))).await;

        let queue = f.engine.query_review_queue(&f.org, None).await.unwrap();
        let priorities: Vec<_> = queue.iter().map(|i| i.priority).collect();
        assert_eq!(priorities, vec![ReviewPriority::Urgent, ReviewPriority::High]);

        // Other organizations see nothing
        assert!(f.engine.query_review_queue(&OrgId::new(), None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_audit_failure_leaves_journey_untouched() {
        let f = fixture();
        expect(&f, "ach-6", 100).await;
        let t0 = f.clock.now();
        let first = ingest(&f, "ach-6", event("p", CanonicalEventType::Pending, t0)).await;

        f.audit.set_failing(true);
        let err = f
            .engine
            .ingest_event(
                &f.org,
                Rail::BankTransfer,
                "acme-bank",
                "ach-6",
                event("s", CanonicalEventType::Settled, t0).with_amount(Amount::new(10)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ReconciliationError::Audit(_)));

        let journey = f.engine.get_journey(&first.journey.id).await.unwrap().unwrap();
        assert_eq!(journey, first.journey);
        assert!(f.engine.query_breaks(&f.org, None).await.unwrap().is_empty());
        assert_eq!(f.engine.journey_events(&journey.id).await.unwrap().len(), 1);

        // The event was not marked seen; redelivery applies it
        f.audit.set_failing(false);
        let retry = ingest(
            &f,
            "ach-6",
            event("s", CanonicalEventType::Settled, t0).with_amount(Amount::new(10)),
        )
        .await;
        assert!(retry.event.applied);
        assert_eq!(retry.breaks.len(), 1);
    }

    #[tokio::test]
    async fn test_first_event_audit_failure_hides_journey() {
        let f = fixture();
        f.audit.set_failing(true);
        assert!(f
            .engine
            .ingest_event(
                &f.org,
                Rail::Card,
                "issuer",
                "auth-1",
                event("a", CanonicalEventType::Pending, f.clock.now()),
            )
            .await
            .is_err());
        assert!(f.engine.find_journey(&f.org, Rail::Card, "issuer", "auth-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_ingest_payload() {
        let f = fixture();
        let normalizer = crate::StatusMapNormalizer::new();
        let update = f
            .engine
            .ingest_payload(
                &normalizer,
                &f.org,
                Rail::Card,
                "issuer",
                "auth-7",
                &json!({
                    "event_id": "w1",
                    "status": "succeeded",
                    "occurred_at": "2024-05-01T10:00:00Z",
                    "amount": 2500,
                    "expected_amount": 2500,
                    "currency": "USD",
                }),
            )
            .await
            .unwrap();
        assert_eq!(update.journey.canonical_state, crate::JourneyState::Settled);
        assert_eq!(update.journey.currency, Some(Currency::usd()));
        assert!(update.breaks.is_empty());

        let bad = f
            .engine
            .ingest_payload(&normalizer, &f.org, Rail::Card, "issuer", "auth-7", &json!({}))
            .await
            .unwrap_err();
        assert_eq!(bad.error_code(), "INVALID_PAYLOAD");
    }

    #[tokio::test]
    async fn test_concurrent_deliveries_apply_once() {
        let f = fixture();
        let t0 = f.clock.now();
        let mut handles = Vec::new();
        for _ in 0..8 {
            let engine = f.engine.clone();
            let org = f.org.clone();
            handles.push(tokio::spawn(async move {
                engine
                    .ingest_event(
                        &org,
                        Rail::BankTransfer,
                        "acme-bank",
                        "ach-7",
                        ProviderEvent::new("r1", CanonicalEventType::Retried, t0),
                    )
                    .await
                    .unwrap()
            }));
        }
        let mut applied = 0;
        for handle in handles {
            if handle.await.unwrap().event.applied {
                applied += 1;
            }
        }
        assert_eq!(applied, 1);
        let journey = f
            .engine
            .find_journey(&f.org, Rail::BankTransfer, "acme-bank", "ach-7")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(journey.retry_count, 1);
    }
}

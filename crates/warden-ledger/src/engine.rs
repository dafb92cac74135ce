//! LedgerEngine: pending batches and the committed book
//!
//! Batches are rows of their own, each behind a row lock. The committed book
//! (entries, balances and indexes) sits behind one `RwLock`; a commit holds
//! the batch row and then the book write lock, and publishes nothing unless
//! its audit entries were written.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{info, warn};
use warden_audit::{AuditLog, AuditRecord, AuditStream};
use warden_types::{
    AccountId, Amount, BatchId, Clock, Currency, EntryId, RowTable, SharedClock, TransferId,
};

use crate::{
    actions, BatchStatus, CommitResult, EntryDraft, LedgerBatch, LedgerEntry, LedgerError,
    Result,
};

/// Actor recorded on ledger audit entries
pub const LEDGER_ACTOR: &str = "ledger";

/// Audit stream of one batch
pub fn batch_stream(batch_id: &BatchId) -> AuditStream {
    AuditStream::new("ledger_batch", batch_id)
}

/// Audit stream of one (account, currency) balance
pub fn balance_stream(account_id: &AccountId, currency: &Currency) -> AuditStream {
    AuditStream::new("account_balance", format!("{}/{}", account_id, currency))
}

#[derive(Default)]
struct Book {
    entries: Vec<LedgerEntry>,
    balances: HashMap<(AccountId, Currency), Amount>,
    by_id: HashMap<EntryId, usize>,
    by_account: HashMap<AccountId, Vec<usize>>,
    by_transfer: HashMap<TransferId, Vec<usize>>,
}

impl Book {
    fn balance(&self, account_id: &AccountId, currency: &Currency) -> Amount {
        self.balances
            .get(&(account_id.clone(), currency.clone()))
            .copied()
            .unwrap_or(Amount::zero())
    }

    fn next_sequence(&self) -> u64 {
        self.entries.len() as u64 + 1
    }

    fn push(&mut self, entry: LedgerEntry) {
        let index = self.entries.len();
        self.balances.insert(
            (entry.account_id.clone(), entry.currency.clone()),
            entry.running_balance,
        );
        self.by_id.insert(entry.id.clone(), index);
        self.by_account.entry(entry.account_id.clone()).or_default().push(index);
        self.by_transfer.entry(entry.transfer_id.clone()).or_default().push(index);
        self.entries.push(entry);
    }
}

/// Balance movement of one (account, currency) within a commit
struct Posting {
    before: Amount,
    after: Amount,
    entry_ids: Vec<EntryId>,
}

/// Append-only batched double-entry ledger
pub struct LedgerEngine {
    batches: RowTable<BatchId, LedgerBatch>,
    book: RwLock<Book>,
    audit: Arc<dyn AuditLog>,
    clock: SharedClock,
}

impl LedgerEngine {
    pub fn new(audit: Arc<dyn AuditLog>, clock: SharedClock, lock_timeout: StdDuration) -> Self {
        Self {
            batches: RowTable::new("ledger_batch", lock_timeout),
            book: RwLock::new(Book::default()),
            audit,
            clock,
        }
    }

    /// Open a pending batch for a transfer
    pub async fn begin_batch(&self, transfer_id: TransferId) -> Result<LedgerBatch> {
        let batch = LedgerBatch::new(transfer_id, self.clock.now());
        if !self.batches.insert(batch.id.clone(), batch.clone()) {
            return Err(LedgerError::Core(warden_types::WardenError::internal(format!(
                "duplicate batch id {}",
                batch.id
            ))));
        }
        Ok(batch)
    }

    /// Stage an entry in a pending batch
    pub async fn append_entry(&self, batch_id: &BatchId, draft: EntryDraft) -> Result<LedgerBatch> {
        let mut guard = self.lock_batch(batch_id).await?;
        guard.ensure_pending()?;

        let mut batch = guard.clone();
        batch.stage(draft)?;
        *guard = batch;
        Ok(guard.clone())
    }

    /// Publish a pending batch. An unbalanced batch stays pending.
    pub async fn commit_batch(&self, batch_id: &BatchId) -> Result<CommitResult> {
        let mut guard = self.lock_batch(batch_id).await?;
        guard.ensure_pending()?;
        if let Err(err) = guard.check_balanced() {
            warn!(batch_id = %batch_id, error = %err, "Batch rejected at commit");
            return Err(err);
        }

        let result = self.publish(&guard, Vec::new()).await?;
        guard.complete(&result);
        Ok(result)
    }

    /// Abandon a pending batch; its drafts are kept on the batch record
    pub async fn rollback_batch(&self, batch_id: &BatchId, reason: &str) -> Result<LedgerBatch> {
        let mut guard = self.lock_batch(batch_id).await?;
        guard.ensure_pending()?;

        let now = self.clock.now();
        let mut batch = guard.clone();
        batch.status = BatchStatus::RolledBack;
        batch.rollback_reason = Some(reason.to_string());
        batch.rolled_back_at = Some(now);

        let record = AuditRecord::new(batch_stream(batch_id), actions::BATCH_ROLLED_BACK, LEDGER_ACTOR, now)
            .with_old(json!({ "status": BatchStatus::Pending }))
            .with_new(json!({
                "status": BatchStatus::RolledBack,
                "reason": reason,
                "entry_count": batch.entry_count,
            }));
        self.audit.append(record).await?;

        *guard = batch;
        info!(batch_id = %batch_id, reason = reason, "Batch rolled back");
        Ok(guard.clone())
    }

    /// Reverse a completed batch by committing its mirror image
    pub async fn compensate_batch(&self, batch_id: &BatchId, reason: &str) -> Result<CommitResult> {
        let mut original = self.lock_batch(batch_id).await?;
        match original.status {
            BatchStatus::Completed => {}
            status => {
                return Err(LedgerError::BatchNotPending {
                    batch_id: batch_id.to_string(),
                    status: status.to_string(),
                })
            }
        }
        if let Some(compensated_by) = &original.compensated_by {
            return Err(LedgerError::BatchAlreadyCompensated {
                batch_id: batch_id.to_string(),
                compensated_by: compensated_by.to_string(),
            });
        }

        let now = self.clock.now();
        let mut reversal = LedgerBatch::new(original.transfer_id.clone(), now);
        reversal.compensates = Some(original.id.clone());
        for draft in &original.drafts {
            reversal.stage(draft.reversal())?;
        }
        reversal.check_balanced()?;

        let link = AuditRecord::new(batch_stream(batch_id), actions::BATCH_COMPENSATED, LEDGER_ACTOR, now)
            .with_old(json!({ "compensated_by": null }))
            .with_new(json!({ "compensated_by": reversal.id, "reason": reason }));
        let result = self.publish(&reversal, vec![link]).await?;

        reversal.complete(&result);
        original.compensated_by = Some(reversal.id.clone());
        self.batches.insert(reversal.id.clone(), reversal);
        info!(batch_id = %batch_id, compensation = %result.batch_id, reason = reason, "Batch compensated");
        Ok(result)
    }

    /// Build entries, write the audit entries, then publish to the book
    async fn publish(&self, batch: &LedgerBatch, extra: Vec<AuditRecord>) -> Result<CommitResult> {
        let now = self.clock.now();
        let mut book = self.book.write().await;

        let mut sequence = book.next_sequence();
        let mut postings: BTreeMap<(AccountId, Currency), Posting> = BTreeMap::new();
        let mut entries = Vec::with_capacity(batch.drafts.len());

        for draft in &batch.drafts {
            let key = (draft.account_id.clone(), draft.currency.clone());
            let posting = postings.entry(key).or_insert_with(|| {
                let before = book.balance(&draft.account_id, &draft.currency);
                Posting {
                    before,
                    after: before,
                    entry_ids: Vec::new(),
                }
            });
            posting.after = posting.after.try_add(draft.entry_type.signed(draft.amount)?)?;

            let entry = LedgerEntry {
                id: EntryId::new(),
                sequence,
                batch_id: batch.id.clone(),
                transfer_id: batch.transfer_id.clone(),
                account_id: draft.account_id.clone(),
                entry_type: draft.entry_type,
                amount: draft.amount,
                running_balance: posting.after,
                currency: draft.currency.clone(),
                rail_reference: draft.rail_reference.clone(),
                status: draft.status,
                version: 1,
                created_at: now,
            };
            posting.entry_ids.push(entry.id.clone());
            entries.push(entry);
            sequence += 1;
        }

        let mut records = vec![AuditRecord::new(
            batch_stream(&batch.id),
            actions::BATCH_COMMITTED,
            LEDGER_ACTOR,
            now,
        )
        .with_old(json!({ "status": BatchStatus::Pending }))
        .with_new(json!({
            "status": BatchStatus::Completed,
            "transfer_id": batch.transfer_id,
            "entry_count": entries.len(),
            "total_amount": batch.total_amount,
            "first_sequence": entries.first().map(|e| e.sequence),
            "last_sequence": entries.last().map(|e| e.sequence),
            "compensates": batch.compensates,
        }))];
        for ((account_id, currency), posting) in &postings {
            records.push(
                AuditRecord::new(
                    balance_stream(account_id, currency),
                    actions::BALANCE_POSTED,
                    LEDGER_ACTOR,
                    now,
                )
                .with_old(json!({ "balance": posting.before }))
                .with_new(json!({
                    "balance": posting.after,
                    "batch_id": batch.id,
                    "entries": posting.entry_ids,
                })),
            );
        }
        records.extend(extra);

        if let Err(err) = self.audit.append_batch(records).await {
            warn!(batch_id = %batch.id, error = %err, "Audit write failed, commit discarded");
            return Err(err.into());
        }

        for entry in &entries {
            book.push(entry.clone());
        }
        info!(
            batch_id = %batch.id,
            transfer_id = %batch.transfer_id,
            entries = entries.len(),
            total_amount = %batch.total_amount,
            "Batch committed"
        );

        Ok(CommitResult {
            batch_id: batch.id.clone(),
            transfer_id: batch.transfer_id.clone(),
            entries,
            committed_at: now,
        })
    }

    async fn lock_batch(&self, batch_id: &BatchId) -> Result<warden_types::RowGuard<LedgerBatch>> {
        self.batches
            .lock(batch_id)
            .await?
            .ok_or_else(|| LedgerError::BatchNotFound {
                batch_id: batch_id.to_string(),
            })
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Current balance of an account in one currency
    pub async fn balance(&self, account_id: &AccountId, currency: &Currency) -> Amount {
        self.book.read().await.balance(account_id, currency)
    }

    /// All committed entries of an account, in sequence order
    pub async fn account_entries(&self, account_id: &AccountId) -> Vec<LedgerEntry> {
        let book = self.book.read().await;
        book.by_account
            .get(account_id)
            .map(|indexes| indexes.iter().map(|&i| book.entries[i].clone()).collect())
            .unwrap_or_default()
    }

    /// All committed entries of a transfer, compensations included
    pub async fn transfer_entries(&self, transfer_id: &TransferId) -> Vec<LedgerEntry> {
        let book = self.book.read().await;
        book.by_transfer
            .get(transfer_id)
            .map(|indexes| indexes.iter().map(|&i| book.entries[i].clone()).collect())
            .unwrap_or_default()
    }

    pub async fn get_batch(&self, batch_id: &BatchId) -> Result<Option<LedgerBatch>> {
        Ok(self.batches.snapshot(batch_id).await?)
    }

    /// Up to `limit` entries with a sequence greater than `sequence`
    pub async fn entries_after(&self, sequence: u64, limit: usize) -> Vec<LedgerEntry> {
        let book = self.book.read().await;
        let start = usize::try_from(sequence).unwrap_or(usize::MAX).min(book.entries.len());
        book.entries[start..].iter().take(limit).cloned().collect()
    }

    pub async fn entry(&self, entry_id: &EntryId) -> Option<LedgerEntry> {
        let book = self.book.read().await;
        book.by_id.get(entry_id).map(|&i| book.entries[i].clone())
    }

    pub async fn last_sequence(&self) -> u64 {
        self.book.read().await.entries.len() as u64
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub(crate) fn audit(&self) -> &Arc<dyn AuditLog> {
        &self.audit
    }
}

impl LedgerBatch {
    pub(crate) fn complete(&mut self, result: &CommitResult) {
        self.status = BatchStatus::Completed;
        self.entry_ids = result.entries.iter().map(|e| e.id.clone()).collect();
        self.committed_at = Some(result.committed_at);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EntryStatus, EntryType};
    use warden_audit::{FaultInjectingAuditLog, InMemoryAuditLog};
    use warden_types::SystemClock;

    fn engine_with(audit: Arc<dyn AuditLog>) -> LedgerEngine {
        LedgerEngine::new(audit, Arc::new(SystemClock), StdDuration::from_secs(2))
    }

    fn engine() -> (LedgerEngine, Arc<InMemoryAuditLog>) {
        let audit = Arc::new(InMemoryAuditLog::new());
        (engine_with(audit.clone()), audit)
    }

    async fn transfer(
        ledger: &LedgerEngine,
        from: &AccountId,
        to: &AccountId,
        amount: i64,
    ) -> Result<CommitResult> {
        let batch = ledger.begin_batch(TransferId::new()).await?;
        ledger
            .append_entry(&batch.id, EntryDraft::debit(from.clone(), Amount::new(amount), Currency::usd()))
            .await?;
        ledger
            .append_entry(&batch.id, EntryDraft::credit(to.clone(), Amount::new(amount), Currency::usd()))
            .await?;
        ledger.commit_batch(&batch.id).await
    }

    #[tokio::test]
    async fn test_commit_and_running_balance() {
        let (ledger, _) = engine();
        let (a, b) = (AccountId::new(), AccountId::new());

        let first = transfer(&ledger, &a, &b, 100).await.unwrap();
        assert_eq!(first.first_sequence(), Some(1));
        assert_eq!(first.last_sequence(), Some(2));

        transfer(&ledger, &a, &b, 50).await.unwrap();

        assert_eq!(ledger.balance(&a, &Currency::usd()).await, Amount::new(-150));
        assert_eq!(ledger.balance(&b, &Currency::usd()).await, Amount::new(150));
        let b_entries = ledger.account_entries(&b).await;
        assert_eq!(b_entries.len(), 2);
        assert_eq!(b_entries[1].running_balance, Amount::new(150));
        assert_eq!(ledger.last_sequence().await, 4);
    }

    #[tokio::test]
    async fn test_unbalanced_stays_pending() {
        let (ledger, _) = engine();
        let (a, b) = (AccountId::new(), AccountId::new());
        let batch = ledger.begin_batch(TransferId::new()).await.unwrap();
        ledger
            .append_entry(&batch.id, EntryDraft::debit(a.clone(), Amount::new(100), Currency::usd()))
            .await
            .unwrap();
        ledger
            .append_entry(&batch.id, EntryDraft::credit(b.clone(), Amount::new(97), Currency::usd()))
            .await
            .unwrap();

        let err = ledger.commit_batch(&batch.id).await.unwrap_err();
        assert_eq!(err.error_code(), "UNBALANCED");
        let stored = ledger.get_batch(&batch.id).await.unwrap().unwrap();
        assert_eq!(stored.status, BatchStatus::Pending);
        assert_eq!(ledger.last_sequence().await, 0);

        // Add the missing credit leg and commit
        ledger
            .append_entry(&batch.id, EntryDraft::credit(b.clone(), Amount::new(3), Currency::usd()))
            .await
            .unwrap();
        let result = ledger.commit_batch(&batch.id).await.unwrap();
        assert_eq!(result.entries.len(), 3);
        assert_eq!(ledger.balance(&b, &Currency::usd()).await, Amount::new(100));
    }

    #[tokio::test]
    async fn test_rollback_pending_and_completed() {
        let (ledger, audit) = engine();
        let (a, b) = (AccountId::new(), AccountId::new());

        let batch = ledger.begin_batch(TransferId::new()).await.unwrap();
        ledger
            .append_entry(&batch.id, EntryDraft::debit(a.clone(), Amount::new(10), Currency::usd()))
            .await
            .unwrap();
        let rolled = ledger.rollback_batch(&batch.id, "executor declined").await.unwrap();
        assert_eq!(rolled.status, BatchStatus::RolledBack);
        assert_eq!(rolled.drafts.len(), 1);
        assert_eq!(rolled.rollback_reason.as_deref(), Some("executor declined"));
        assert!(ledger.account_entries(&a).await.is_empty());
        assert!(ledger.commit_batch(&batch.id).await.is_err());

        let stream = audit.stream_entries(&batch_stream(&batch.id)).await.unwrap();
        assert_eq!(stream.len(), 1);
        assert_eq!(stream[0].action, actions::BATCH_ROLLED_BACK);

        let committed = transfer(&ledger, &a, &b, 10).await.unwrap();
        let err = ledger
            .rollback_batch(&committed.batch_id, "too late")
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::BatchAlreadyCommitted { .. }));
    }

    #[tokio::test]
    async fn test_compensate_batch() {
        let (ledger, _) = engine();
        let (a, b, fees) = (AccountId::new(), AccountId::new(), AccountId::new());

        let batch = ledger.begin_batch(TransferId::new()).await.unwrap();
        for draft in [
            EntryDraft::debit(a.clone(), Amount::new(100), Currency::usd()),
            EntryDraft::fee(a.clone(), Amount::new(2), Currency::usd()),
            EntryDraft::credit(b.clone(), Amount::new(100), Currency::usd()),
            EntryDraft::credit(fees.clone(), Amount::new(2), Currency::usd()),
        ] {
            ledger.append_entry(&batch.id, draft).await.unwrap();
        }
        ledger.commit_batch(&batch.id).await.unwrap();

        let reversal = ledger.compensate_batch(&batch.id, "rail failure").await.unwrap();
        assert_eq!(reversal.entries.len(), 4);
        assert!(reversal.entries.iter().all(|e| e.status == EntryStatus::Reversal));
        assert_eq!(reversal.entries[1].entry_type, EntryType::Credit);

        for account in [&a, &b, &fees] {
            assert_eq!(ledger.balance(account, &Currency::usd()).await, Amount::zero());
        }
        let original = ledger.get_batch(&batch.id).await.unwrap().unwrap();
        assert_eq!(original.compensated_by, Some(reversal.batch_id.clone()));
        assert_eq!(ledger.transfer_entries(&batch.transfer_id).await.len(), 8);

        let err = ledger.compensate_batch(&batch.id, "again").await.unwrap_err();
        assert_eq!(err.error_code(), "BATCH_ALREADY_COMPENSATED");
    }

    #[tokio::test]
    async fn test_audit_failure_publishes_nothing() {
        let audit = Arc::new(FaultInjectingAuditLog::new());
        let ledger = engine_with(audit.clone());
        let (a, b) = (AccountId::new(), AccountId::new());

        let batch = ledger.begin_batch(TransferId::new()).await.unwrap();
        ledger
            .append_entry(&batch.id, EntryDraft::debit(a.clone(), Amount::new(40), Currency::usd()))
            .await
            .unwrap();
        ledger
            .append_entry(&batch.id, EntryDraft::credit(b.clone(), Amount::new(40), Currency::usd()))
            .await
            .unwrap();

        audit.set_failing(true);
        let err = ledger.commit_batch(&batch.id).await.unwrap_err();
        assert!(matches!(err, LedgerError::Audit(_)));
        assert_eq!(ledger.last_sequence().await, 0);
        assert_eq!(ledger.balance(&a, &Currency::usd()).await, Amount::zero());
        assert!(ledger.get_batch(&batch.id).await.unwrap().unwrap().is_pending());
        assert_eq!(audit.inner().entry_count().await, 0);

        audit.set_failing(false);
        ledger.commit_batch(&batch.id).await.unwrap();
        assert_eq!(ledger.balance(&b, &Currency::usd()).await, Amount::new(40));
    }

    #[tokio::test]
    async fn test_commit_writes_batch_and_balance_streams() {
        let (ledger, audit) = engine();
        let (a, b) = (AccountId::new(), AccountId::new());
        let result = transfer(&ledger, &a, &b, 25).await.unwrap();

        let batch_entries = audit
            .stream_entries(&batch_stream(&result.batch_id))
            .await
            .unwrap();
        assert_eq!(batch_entries.len(), 1);
        assert_eq!(batch_entries[0].action, actions::BATCH_COMMITTED);

        let balance = audit
            .stream_entries(&balance_stream(&b, &Currency::usd()))
            .await
            .unwrap();
        assert_eq!(balance.len(), 1);
        assert_eq!(balance[0].new_value.as_ref().unwrap()["balance"], 25);
        assert!(audit
            .verify_stream(&balance_stream(&a, &Currency::usd()))
            .await
            .unwrap()
            .is_valid());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_commits_keep_sequence_dense() {
        let (ledger, _) = engine();
        let ledger = Arc::new(ledger);
        let (a, b) = (AccountId::new(), AccountId::new());

        let mut tasks = Vec::new();
        for _ in 0..20 {
            let ledger = ledger.clone();
            let (a, b) = (a.clone(), b.clone());
            tasks.push(tokio::spawn(async move { transfer(&ledger, &a, &b, 5).await }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let entries = ledger.entries_after(0, 1000).await;
        assert_eq!(entries.len(), 40);
        for (i, entry) in entries.iter().enumerate() {
            assert_eq!(entry.sequence, i as u64 + 1);
        }
        assert_eq!(ledger.balance(&b, &Currency::usd()).await, Amount::new(100));
        assert_eq!(ledger.account_entries(&b).await.last().unwrap().running_balance, Amount::new(100));
        assert_eq!(ledger.entries_after(38, 10).await.len(), 2);
    }
}

//! In-memory audit log implementations

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

use crate::{AuditEntry, AuditError, AuditLog, AuditRecord, AuditStream, Result, GENESIS_HASH};

type StreamHandle = Arc<Mutex<Vec<AuditEntry>>>;

/// Audit log held in process memory
///
/// One mutex per stream gives each stream a single ordered writer.
#[derive(Debug, Default)]
pub struct InMemoryAuditLog {
    streams: DashMap<AuditStream, StreamHandle>,
}

impl InMemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn handle(&self, stream: &AuditStream) -> StreamHandle {
        Arc::clone(
            self.streams
                .entry(stream.clone())
                .or_insert_with(|| Arc::new(Mutex::new(Vec::new())))
                .value(),
        )
    }

    /// Total number of entries across all streams
    pub async fn entry_count(&self) -> usize {
        let handles: Vec<StreamHandle> = self
            .streams
            .iter()
            .map(|s| Arc::clone(s.value()))
            .collect();
        let mut total = 0;
        for handle in handles {
            total += handle.lock().await.len();
        }
        total
    }

    /// Overwrite a stored entry in place, bypassing the chain. Used to
    /// exercise tamper detection.
    pub async fn tamper(&self, stream: &AuditStream, sequence: u64, entry: AuditEntry) -> bool {
        let Some(handle) = self.streams.get(stream).map(|s| Arc::clone(s.value())) else {
            return false;
        };
        let mut entries = handle.lock().await;
        match entries.iter_mut().find(|e| e.sequence == sequence) {
            Some(slot) => {
                *slot = entry;
                true
            }
            None => false,
        }
    }
}

#[async_trait::async_trait]
impl AuditLog for InMemoryAuditLog {
    async fn append_batch(&self, records: Vec<AuditRecord>) -> Result<Vec<AuditEntry>> {
        if records.is_empty() {
            return Ok(Vec::new());
        }

        // Lock every touched stream in sorted order
        let mut guards: BTreeMap<AuditStream, OwnedMutexGuard<Vec<AuditEntry>>> = BTreeMap::new();
        let mut touched: Vec<AuditStream> = records.iter().map(|r| r.stream.clone()).collect();
        touched.sort();
        touched.dedup();
        for stream in touched {
            let guard = self.handle(&stream).lock_owned().await;
            guards.insert(stream, guard);
        }

        // Link everything before publishing anything
        let mut staged: BTreeMap<AuditStream, Vec<AuditEntry>> = BTreeMap::new();
        let mut linked = Vec::with_capacity(records.len());
        for record in records {
            let stream = record.stream.clone();
            let pending = staged.entry(stream.clone()).or_default();
            let committed = guards.get(&stream).map(|g| g.as_slice()).unwrap_or(&[]);

            let (sequence, previous_hash) = match pending.last().or_else(|| committed.last()) {
                Some(tip) => (tip.sequence + 1, tip.entry_hash.clone()),
                None => (1, GENESIS_HASH.to_string()),
            };

            let entry = AuditEntry::chain(record, sequence, previous_hash)?;
            pending.push(entry.clone());
            linked.push(entry);
        }

        for (stream, entries) in staged {
            if let Some(guard) = guards.get_mut(&stream) {
                guard.extend(entries);
            }
        }

        debug!(entries = linked.len(), "Audit entries appended");
        Ok(linked)
    }

    async fn stream_entries(&self, stream: &AuditStream) -> Result<Vec<AuditEntry>> {
        match self.streams.get(stream).map(|s| Arc::clone(s.value())) {
            Some(handle) => Ok(handle.lock().await.clone()),
            None => Ok(Vec::new()),
        }
    }

    async fn streams(&self) -> Result<Vec<AuditStream>> {
        let mut streams: Vec<AuditStream> = self.streams.iter().map(|s| s.key().clone()).collect();
        streams.sort();
        Ok(streams)
    }

    async fn export(
        &self,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<AuditEntry>> {
        let mut out = Vec::new();
        for stream in self.streams().await? {
            out.extend(
                self.stream_entries(&stream)
                    .await?
                    .into_iter()
                    .filter(|e| from.map_or(true, |f| e.timestamp >= f))
                    .filter(|e| to.map_or(true, |t| e.timestamp <= t)),
            );
        }
        out.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.stream.cmp(&b.stream))
                .then_with(|| a.sequence.cmp(&b.sequence))
        });
        Ok(out)
    }
}

/// Audit log whose writes can be switched to fail
///
/// Used to prove that a failed audit write rolls back the state change it
/// was meant to record.
#[derive(Debug, Default)]
pub struct FaultInjectingAuditLog {
    inner: InMemoryAuditLog,
    failing: AtomicBool,
}

impl FaultInjectingAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn inner(&self) -> &InMemoryAuditLog {
        &self.inner
    }
}

#[async_trait::async_trait]
impl AuditLog for FaultInjectingAuditLog {
    async fn append_batch(&self, records: Vec<AuditRecord>) -> Result<Vec<AuditEntry>> {
        if self.failing.load(Ordering::SeqCst) {
            warn!(records = records.len(), "Audit sink rejecting writes");
            return Err(AuditError::WriteFailed {
                message: "audit sink rejected write".to_string(),
            });
        }
        self.inner.append_batch(records).await
    }

    async fn stream_entries(&self, stream: &AuditStream) -> Result<Vec<AuditEntry>> {
        self.inner.stream_entries(stream).await
    }

    async fn streams(&self) -> Result<Vec<AuditStream>> {
        self.inner.streams().await
    }

    async fn export(
        &self,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<AuditEntry>> {
        self.inner.export(from, to).await
    }
}

//! Warden Audit - Hash-chained audit log
//!
//! Every consequential state change produces an audit entry on the stream of
//! the entity it touched (a policy, a ledger batch, an account balance, a
//! journey, an approval). Each stream is an independent hash chain:
//!
//! ```text
//! entry_hash = SHA-256(previous_hash ‖ canonical_json(old, new, actor, action, timestamp))
//! ```
//!
//! The first entry of a stream links to [`GENESIS_HASH`]. Appends to one
//! stream are serialized; a batch touching several streams locks them in
//! sorted order and is published all-or-nothing.

pub mod memory;

pub use memory::{FaultInjectingAuditLog, InMemoryAuditLog};
pub use warden_crypto::GENESIS_HASH;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use thiserror::Error;
use warden_crypto::{chain_hash, CryptoError};
use warden_types::{AuditEntryId, Retriable, WardenError};

/// Errors from the audit log
#[derive(Debug, Clone, Error)]
pub enum AuditError {
    #[error("Audit sink rejected write: {message}")]
    WriteFailed { message: String },

    #[error("Audit sink unavailable: {message}")]
    Unavailable { message: String },

    #[error("Hashing failed: {0}")]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Core(#[from] WardenError),
}

impl AuditError {
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Unavailable { .. } => true,
            Self::Core(inner) => inner.is_retriable(),
            _ => false,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Self::WriteFailed { .. } => "AUDIT_WRITE_FAILED",
            Self::Unavailable { .. } => "AUDIT_UNAVAILABLE",
            Self::Crypto(_) => "AUDIT_HASH_FAILED",
            Self::Core(inner) => inner.error_code(),
        }
    }
}

impl Retriable for AuditError {
    fn is_retriable(&self) -> bool {
        AuditError::is_retriable(self)
    }
}

pub type Result<T> = std::result::Result<T, AuditError>;

/// The entity an audit stream belongs to
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AuditStream {
    pub entity_type: String,
    pub entity_id: String,
}

impl AuditStream {
    pub fn new(entity_type: impl Into<String>, entity_id: impl ToString) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.to_string(),
        }
    }
}

impl fmt::Display for AuditStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity_type, self.entity_id)
    }
}

/// A state change to be appended
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub stream: AuditStream,
    pub action: String,
    pub actor: String,
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

impl AuditRecord {
    pub fn new(
        stream: AuditStream,
        action: impl Into<String>,
        actor: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            stream,
            action: action.into(),
            actor: actor.into(),
            old_value: None,
            new_value: None,
            timestamp,
        }
    }

    pub fn with_old(mut self, value: Value) -> Self {
        self.old_value = Some(value);
        self
    }

    pub fn with_new(mut self, value: Value) -> Self {
        self.new_value = Some(value);
        self
    }
}

/// An appended, hash-linked audit entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: AuditEntryId,
    pub stream: AuditStream,
    /// 1-based position within the stream
    pub sequence: u64,
    pub action: String,
    pub actor: String,
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
    pub timestamp: DateTime<Utc>,
    pub previous_hash: String,
    pub entry_hash: String,
}

impl AuditEntry {
    /// Link a record onto the chain after `previous_hash`
    pub fn chain(record: AuditRecord, sequence: u64, previous_hash: String) -> Result<Self> {
        let entry_hash = compute_entry_hash(&previous_hash, &record)?;
        Ok(Self {
            id: AuditEntryId::new(),
            stream: record.stream,
            sequence,
            action: record.action,
            actor: record.actor,
            old_value: record.old_value,
            new_value: record.new_value,
            timestamp: record.timestamp,
            previous_hash,
            entry_hash,
        })
    }

    /// Recompute this entry's hash from its contents
    pub fn compute_hash(&self) -> Result<String> {
        hash_fields(
            &self.previous_hash,
            &self.old_value,
            &self.new_value,
            &self.actor,
            &self.action,
            &self.timestamp,
        )
    }

    /// Verify the entry hash
    pub fn verify(&self) -> bool {
        matches!(self.compute_hash(), Ok(hash) if hash == self.entry_hash)
    }
}

fn compute_entry_hash(previous_hash: &str, record: &AuditRecord) -> Result<String> {
    hash_fields(
        previous_hash,
        &record.old_value,
        &record.new_value,
        &record.actor,
        &record.action,
        &record.timestamp,
    )
}

fn hash_fields(
    previous_hash: &str,
    old_value: &Option<Value>,
    new_value: &Option<Value>,
    actor: &str,
    action: &str,
    timestamp: &DateTime<Utc>,
) -> Result<String> {
    let payload = json!({
        "old": old_value,
        "new": new_value,
        "actor": actor,
        "action": action,
        "timestamp": timestamp.to_rfc3339_opts(SecondsFormat::Micros, true),
    });
    Ok(chain_hash(previous_hash, &payload)?)
}

/// Outcome of walking a stream's hash chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainVerification {
    pub stream: AuditStream,
    pub entries_checked: usize,
    /// Sequence of the first entry whose link or hash does not verify
    pub first_invalid_sequence: Option<u64>,
}

impl ChainVerification {
    pub fn is_valid(&self) -> bool {
        self.first_invalid_sequence.is_none()
    }
}

/// Walk a stream's entries in order and check every link
pub fn verify_entries(stream: &AuditStream, entries: &[AuditEntry]) -> ChainVerification {
    let mut expected_previous = GENESIS_HASH.to_string();
    let mut first_invalid_sequence = None;

    for (i, entry) in entries.iter().enumerate() {
        let expected_sequence = i as u64 + 1;
        if entry.sequence != expected_sequence
            || entry.previous_hash != expected_previous
            || !entry.verify()
        {
            first_invalid_sequence = Some(expected_sequence);
            break;
        }
        expected_previous = entry.entry_hash.clone();
    }

    ChainVerification {
        stream: stream.clone(),
        entries_checked: entries.len(),
        first_invalid_sequence,
    }
}

/// Audit log trait
#[async_trait::async_trait]
pub trait AuditLog: Send + Sync {
    /// Append records atomically: either every record is linked and
    /// published, or none is.
    async fn append_batch(&self, records: Vec<AuditRecord>) -> Result<Vec<AuditEntry>>;

    /// Append a single record
    async fn append(&self, record: AuditRecord) -> Result<AuditEntry> {
        let mut entries = self.append_batch(vec![record]).await?;
        entries.pop().ok_or_else(|| AuditError::WriteFailed {
            message: "append returned no entry".to_string(),
        })
    }

    /// All entries of a stream, in sequence order
    async fn stream_entries(&self, stream: &AuditStream) -> Result<Vec<AuditEntry>>;

    /// Verify one stream's chain
    async fn verify_stream(&self, stream: &AuditStream) -> Result<ChainVerification> {
        let entries = self.stream_entries(stream).await?;
        Ok(verify_entries(stream, &entries))
    }

    /// Every known stream
    async fn streams(&self) -> Result<Vec<AuditStream>>;

    /// Export for compliance, ordered by timestamp then stream sequence
    async fn export(
        &self,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<AuditEntry>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(action: &str) -> AuditRecord {
        AuditRecord::new(
            AuditStream::new("policy", "p1"),
            action,
            "agent_1",
            Utc::now(),
        )
        .with_new(json!({"spent_total": 100}))
    }

    #[test]
    fn test_entry_hash_roundtrip() {
        let entry = AuditEntry::chain(record("spend_recorded"), 1, GENESIS_HASH.to_string()).unwrap();
        assert!(entry.verify());
        assert_eq!(entry.entry_hash.len(), 64);
    }

    #[test]
    fn test_tampering_detected() {
        let mut entry =
            AuditEntry::chain(record("spend_recorded"), 1, GENESIS_HASH.to_string()).unwrap();
        entry.new_value = Some(json!({"spent_total": 1}));
        assert!(!entry.verify());
    }

    #[test]
    fn test_verify_entries_finds_broken_link() {
        let stream = AuditStream::new("policy", "p1");
        let first = AuditEntry::chain(record("a"), 1, GENESIS_HASH.to_string()).unwrap();
        let second = AuditEntry::chain(record("b"), 2, first.entry_hash.clone()).unwrap();
        let third = AuditEntry::chain(record("c"), 3, "f".repeat(64)).unwrap();

        let ok = verify_entries(&stream, &[first.clone(), second.clone()]);
        assert!(ok.is_valid());

        let broken = verify_entries(&stream, &[first, second, third]);
        assert_eq!(broken.first_invalid_sequence, Some(3));
    }
}

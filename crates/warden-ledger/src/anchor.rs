//! AuditAnchor: signed Merkle roots over committed ledger entries
//!
//! Each anchor covers a contiguous sequence range. Leaves are
//! `SHA-256(canonical_json(entry))`; the root is signed with the anchor
//! Ed25519 key. The anchor id is derived from the range and the root, so
//! anchoring the same range again yields the same record.
//!
//! Proofs and records can be checked with [`verify_inclusion`] and
//! [`verify_anchor`] without access to the ledger.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Builder;
use warden_audit::{AuditRecord, AuditStream};
use warden_crypto::{
    decode_digest, hash_canonical, merkle_path, merkle_root, sha256, verify_merkle_path, KeyPair,
    ProofStep, PublicKey, Signature,
};
use warden_types::{AnchorId, EntryId, WardenError};

use crate::{actions, LedgerEngine, LedgerEntry, LedgerError, Result, LEDGER_ACTOR};

/// A signed Merkle root over a sequence range
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnchorRecord {
    pub anchor_id: AnchorId,
    pub from_seq: u64,
    pub to_seq: u64,
    pub leaf_count: usize,
    /// Hex-encoded root
    pub merkle_root: String,
    /// Hex-encoded Ed25519 signature over [`anchor_message`]
    pub signature: String,
    pub signer_public_key: PublicKey,
    pub created_at: DateTime<Utc>,
}

impl AnchorRecord {
    pub fn covers(&self, sequence: u64) -> bool {
        self.from_seq <= sequence && sequence <= self.to_seq
    }
}

/// Proof that one entry is included under an anchor root
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InclusionProof {
    pub entry_id: EntryId,
    pub sequence: u64,
    pub anchor_id: AnchorId,
    /// Hex-encoded leaf hash
    pub leaf: String,
    pub path: Vec<ProofStep>,
    /// Hex-encoded root
    pub merkle_root: String,
}

/// Leaf hash of a committed entry
pub fn leaf_hash(entry: &LedgerEntry) -> Result<[u8; 32]> {
    Ok(hash_canonical(entry)?)
}

/// Bytes signed for an anchor
pub fn anchor_message(from_seq: u64, to_seq: u64, merkle_root: &str) -> Vec<u8> {
    format!("warden-anchor:{}:{}:{}", from_seq, to_seq, merkle_root).into_bytes()
}

/// Deterministic anchor id for a range and root
pub fn derive_anchor_id(from_seq: u64, to_seq: u64, merkle_root: &str) -> AnchorId {
    let digest = sha256(&anchor_message(from_seq, to_seq, merkle_root));
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    AnchorId::from_uuid(Builder::from_random_bytes(bytes).into_uuid())
}

/// Check an anchor's id, shape and signature
pub fn verify_anchor(record: &AnchorRecord) -> bool {
    if record.to_seq < record.from_seq
        || record.leaf_count as u64 != record.to_seq - record.from_seq + 1
    {
        return false;
    }
    if derive_anchor_id(record.from_seq, record.to_seq, &record.merkle_root) != record.anchor_id {
        return false;
    }
    let signature = Signature {
        signature: record.signature.clone(),
        public_key: record.signer_public_key.clone(),
    };
    signature
        .verify(&anchor_message(record.from_seq, record.to_seq, &record.merkle_root))
        .unwrap_or(false)
}

/// Recompute the root from a proof's leaf and path
pub fn verify_inclusion(proof: &InclusionProof) -> bool {
    match (decode_digest(&proof.leaf), decode_digest(&proof.merkle_root)) {
        (Ok(leaf), Ok(root)) => verify_merkle_path(leaf, &proof.path, root),
        _ => false,
    }
}

#[derive(Default)]
struct AnchorState {
    records: Vec<AnchorRecord>,
    last_anchored: u64,
}

/// Periodic anchoring of the ledger
pub struct AuditAnchor {
    ledger: Arc<LedgerEngine>,
    signer: KeyPair,
    state: Mutex<AnchorState>,
}

impl AuditAnchor {
    pub fn new(ledger: Arc<LedgerEngine>, signer: KeyPair) -> Self {
        Self {
            ledger,
            signer,
            state: Mutex::new(AnchorState::default()),
        }
    }

    pub fn public_key(&self) -> PublicKey {
        self.signer.public_key()
    }

    /// Anchor up to `max_leaves` entries past the last anchored sequence.
    /// `Ok(None)` when there is nothing new.
    pub async fn anchor_pending(&self, max_leaves: usize) -> Result<Option<AnchorRecord>> {
        let mut state = self.state.lock().await;
        if max_leaves == 0 {
            return Ok(None);
        }
        let entries = self.ledger.entries_after(state.last_anchored, max_leaves).await;
        if entries.is_empty() {
            debug!(last_anchored = state.last_anchored, "No entries to anchor");
            return Ok(None);
        }
        self.store(&mut state, &entries).await.map(Some)
    }

    /// Anchor an explicit, already committed range `[from_seq, to_seq]`
    pub async fn anchor_range(&self, from_seq: u64, to_seq: u64) -> Result<AnchorRecord> {
        if from_seq == 0 || to_seq < from_seq {
            return Err(WardenError::invalid_input("range", "expected 1 <= from_seq <= to_seq").into());
        }
        let mut state = self.state.lock().await;
        let wanted = usize::try_from(to_seq - from_seq + 1)
            .map_err(|_| WardenError::invalid_input("range", "range too large"))?;
        let entries = self.ledger.entries_after(from_seq - 1, wanted).await;
        if entries.len() != wanted {
            return Err(WardenError::invalid_input(
                "range",
                format!("entries {}..={} are not all committed", from_seq, to_seq),
            )
            .into());
        }
        self.store(&mut state, &entries).await
    }

    async fn store(&self, state: &mut AnchorState, entries: &[LedgerEntry]) -> Result<AnchorRecord> {
        let record = self.build(entries)?;
        if let Some(existing) = state.records.iter().find(|r| r.anchor_id == record.anchor_id) {
            debug!(anchor_id = %existing.anchor_id, "Range already anchored");
            return Ok(existing.clone());
        }

        let audit_entry = AuditRecord::new(
            AuditStream::new("anchor", &record.anchor_id),
            actions::ANCHOR_CREATED,
            LEDGER_ACTOR,
            record.created_at,
        )
        .with_new(json!({
            "from_seq": record.from_seq,
            "to_seq": record.to_seq,
            "leaf_count": record.leaf_count,
            "merkle_root": record.merkle_root,
            "signer_public_key": record.signer_public_key,
        }));
        self.ledger.audit().append(audit_entry).await?;

        state.last_anchored = state.last_anchored.max(record.to_seq);
        state.records.push(record.clone());
        info!(
            anchor_id = %record.anchor_id,
            from_seq = record.from_seq,
            to_seq = record.to_seq,
            merkle_root = %record.merkle_root,
            "Ledger range anchored"
        );
        Ok(record)
    }

    fn build(&self, entries: &[LedgerEntry]) -> Result<AnchorRecord> {
        let leaves = entries.iter().map(leaf_hash).collect::<Result<Vec<_>>>()?;
        let root = merkle_root(&leaves)
            .ok_or_else(|| WardenError::internal("cannot anchor an empty range"))?;
        let merkle_root = hex::encode(&root);
        let (from_seq, to_seq) = match (entries.first(), entries.last()) {
            (Some(first), Some(last)) => (first.sequence, last.sequence),
            _ => return Err(WardenError::internal("cannot anchor an empty range").into()),
        };
        let signature = Signature::sign(&self.signer, &anchor_message(from_seq, to_seq, &merkle_root))?;

        Ok(AnchorRecord {
            anchor_id: derive_anchor_id(from_seq, to_seq, &merkle_root),
            from_seq,
            to_seq,
            leaf_count: entries.len(),
            merkle_root,
            signature: signature.signature,
            signer_public_key: signature.public_key,
            created_at: self.ledger.now(),
        })
    }

    /// Inclusion proof for an entry. `Ok(None)` while the entry is not anchored yet.
    pub async fn inclusion_proof(&self, entry_id: &EntryId) -> Result<Option<InclusionProof>> {
        let entry = self
            .ledger
            .entry(entry_id)
            .await
            .ok_or_else(|| LedgerError::EntryNotFound {
                entry_id: entry_id.to_string(),
            })?;

        let record = {
            let state = self.state.lock().await;
            match state.records.iter().find(|r| r.covers(entry.sequence)) {
                Some(record) => record.clone(),
                None => return Ok(None),
            }
        };

        let entries = self
            .ledger
            .entries_after(record.from_seq - 1, record.leaf_count)
            .await;
        let leaves = entries.iter().map(leaf_hash).collect::<Result<Vec<_>>>()?;
        let index = (entry.sequence - record.from_seq) as usize;
        let path = merkle_path(&leaves, index)
            .ok_or_else(|| WardenError::internal("entry outside anchored range"))?;

        Ok(Some(InclusionProof {
            entry_id: entry.id.clone(),
            sequence: entry.sequence,
            anchor_id: record.anchor_id,
            leaf: hex::encode(&leaves[index]),
            path,
            merkle_root: record.merkle_root,
        }))
    }

    pub async fn anchors(&self) -> Vec<AnchorRecord> {
        self.state.lock().await.records.clone()
    }

    pub async fn last_anchored_sequence(&self) -> u64 {
        self.state.lock().await.last_anchored
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EntryDraft;
    use std::time::Duration;
    use warden_audit::{AuditLog, InMemoryAuditLog};
    use warden_types::{AccountId, Amount, Currency, SystemClock, TransferId};

    async fn ledger_with_entries(transfers: usize) -> (Arc<LedgerEngine>, Arc<InMemoryAuditLog>) {
        let audit = Arc::new(InMemoryAuditLog::new());
        let ledger = Arc::new(LedgerEngine::new(
            audit.clone(),
            Arc::new(SystemClock),
            Duration::from_secs(2),
        ));
        let (a, b, fees) = (AccountId::new(), AccountId::new(), AccountId::new());
        for _ in 0..transfers {
            // Three legs per batch so leaf counts are odd
            let batch = ledger.begin_batch(TransferId::new()).await.unwrap();
            for draft in [
                EntryDraft::debit(a.clone(), Amount::new(12), Currency::usd()),
                EntryDraft::credit(b.clone(), Amount::new(10), Currency::usd()),
                EntryDraft::credit(fees.clone(), Amount::new(2), Currency::usd()),
            ] {
                ledger.append_entry(&batch.id, draft).await.unwrap();
            }
            ledger.commit_batch(&batch.id).await.unwrap();
        }
        (ledger, audit)
    }

    #[tokio::test]
    async fn test_anchor_pending_signs_root() {
        let (ledger, audit) = ledger_with_entries(3).await;
        let anchor = AuditAnchor::new(ledger, KeyPair::generate());

        let record = anchor.anchor_pending(100).await.unwrap().unwrap();
        assert_eq!((record.from_seq, record.to_seq, record.leaf_count), (1, 9, 9));
        assert!(verify_anchor(&record));
        assert_eq!(record.signer_public_key, anchor.public_key());

        assert!(anchor.anchor_pending(100).await.unwrap().is_none());
        let stream = AuditStream::new("anchor", &record.anchor_id);
        assert_eq!(audit.stream_entries(&stream).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_max_leaves_splits_ranges() {
        let (ledger, _) = ledger_with_entries(2).await;
        let anchor = AuditAnchor::new(ledger, KeyPair::generate());

        let first = anchor.anchor_pending(4).await.unwrap().unwrap();
        let second = anchor.anchor_pending(4).await.unwrap().unwrap();
        assert_eq!((first.from_seq, first.to_seq), (1, 4));
        assert_eq!((second.from_seq, second.to_seq), (5, 6));
        assert_eq!(anchor.last_anchored_sequence().await, 6);
    }

    #[tokio::test]
    async fn test_same_range_is_idempotent() {
        let (ledger, _) = ledger_with_entries(1).await;
        let anchor = AuditAnchor::new(ledger, KeyPair::generate());

        let first = anchor.anchor_range(1, 3).await.unwrap();
        let again = anchor.anchor_range(1, 3).await.unwrap();
        assert_eq!(first, again);
        assert_eq!(anchor.anchors().await.len(), 1);
        assert!(anchor.anchor_pending(10).await.unwrap().is_none());
        assert!(anchor.anchor_range(2, 9).await.is_err());
    }

    #[tokio::test]
    async fn test_inclusion_proof_verifies() {
        let (ledger, _) = ledger_with_entries(3).await;
        let anchor = AuditAnchor::new(ledger.clone(), KeyPair::generate());
        let entries = ledger.entries_after(0, 100).await;

        assert!(anchor.inclusion_proof(&entries[4].id).await.unwrap().is_none());
        anchor.anchor_pending(100).await.unwrap();

        for entry in &entries {
            let proof = anchor.inclusion_proof(&entry.id).await.unwrap().unwrap();
            assert!(verify_inclusion(&proof));
            assert_eq!(decode_digest(&proof.leaf).unwrap(), leaf_hash(entry).unwrap());
        }

        let mut forged = anchor.inclusion_proof(&entries[8].id).await.unwrap().unwrap();
        forged.leaf = hex::encode(&sha256(b"forged entry"));
        assert!(!verify_inclusion(&forged));
    }

    #[tokio::test]
    async fn test_tampered_anchor_rejected() {
        let (ledger, _) = ledger_with_entries(1).await;
        let anchor = AuditAnchor::new(ledger, KeyPair::generate());
        let record = anchor.anchor_pending(10).await.unwrap().unwrap();

        let mut moved = record.clone();
        moved.to_seq = 2;
        assert!(!verify_anchor(&moved));

        let mut resigned = record.clone();
        resigned.signer_public_key = KeyPair::generate().public_key();
        assert!(!verify_anchor(&resigned));

        let mut swapped_root = record;
        swapped_root.merkle_root = hex::encode(&sha256(b"other"));
        assert!(!verify_anchor(&swapped_root));
    }

    #[tokio::test]
    async fn test_unknown_entry() {
        let (ledger, _) = ledger_with_entries(1).await;
        let anchor = AuditAnchor::new(ledger, KeyPair::generate());
        let err = anchor.inclusion_proof(&EntryId::new()).await.unwrap_err();
        assert_eq!(err.error_code(), "ENTRY_NOT_FOUND");
    }
}

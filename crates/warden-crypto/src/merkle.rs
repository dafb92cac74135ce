//! Merkle trees over ledger entry hashes
//!
//! Callers pass leaf digests; the tree hashes them again with a domain
//! prefix so a leaf can never be mistaken for an interior node:
//!
//! - leaf node: `SHA-256(0x00 ‖ digest)`
//! - interior node: `SHA-256(0x01 ‖ left ‖ right)`
//!
//! A level with an odd number of nodes pairs its last node with itself.

use crate::{decode_digest, hash_all, CryptoResult};
use serde::{Deserialize, Serialize};

/// Which side the sibling sits on when recombining
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SiblingSide {
    Left,
    Right,
}

/// One step of an inclusion path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofStep {
    pub side: SiblingSide,
    /// Hex-encoded sibling hash
    pub hash: String,
}

const LEAF_PREFIX: [u8; 1] = [0x00];
const NODE_PREFIX: [u8; 1] = [0x01];

/// Tree node for a leaf digest
pub fn leaf_node(digest: &[u8; 32]) -> [u8; 32] {
    hash_all(&[&LEAF_PREFIX, digest])
}

/// Parent of two tree nodes
pub fn interior_node(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    hash_all(&[&NODE_PREFIX, left, right])
}

fn leaf_level(leaves: &[[u8; 32]]) -> Vec<[u8; 32]> {
    leaves.iter().map(leaf_node).collect()
}

fn next_level(level: &[[u8; 32]]) -> Vec<[u8; 32]> {
    level
        .chunks(2)
        .map(|pair| {
            let left = pair[0];
            let right = pair.get(1).copied().unwrap_or(left);
            interior_node(&left, &right)
        })
        .collect()
}

/// Merkle root of the given leaves; `None` for an empty set
pub fn merkle_root(leaves: &[[u8; 32]]) -> Option<[u8; 32]> {
    if leaves.is_empty() {
        return None;
    }
    let mut level = leaf_level(leaves);
    while level.len() > 1 {
        level = next_level(&level);
    }
    level.first().copied()
}

/// Sibling path from leaf `index` up to the root
pub fn merkle_path(leaves: &[[u8; 32]], index: usize) -> Option<Vec<ProofStep>> {
    if index >= leaves.len() {
        return None;
    }

    let mut path = Vec::new();
    let mut level = leaf_level(leaves);
    let mut position = index;

    while level.len() > 1 {
        let step = if position % 2 == 1 {
            ProofStep {
                side: SiblingSide::Left,
                hash: hex::encode(level[position - 1]),
            }
        } else {
            // Last node of an odd level is its own sibling
            let sibling = level.get(position + 1).copied().unwrap_or(level[position]);
            ProofStep {
                side: SiblingSide::Right,
                hash: hex::encode(sibling),
            }
        };
        path.push(step);
        level = next_level(&level);
        position /= 2;
    }

    Some(path)
}

/// Recompute the root from a leaf digest and its path
pub fn root_from_path(leaf: [u8; 32], path: &[ProofStep]) -> CryptoResult<[u8; 32]> {
    let mut current = leaf_node(&leaf);
    for step in path {
        let sibling = decode_digest(&step.hash)?;
        current = match step.side {
            SiblingSide::Left => interior_node(&sibling, &current),
            SiblingSide::Right => interior_node(&current, &sibling),
        };
    }
    Ok(current)
}

/// Check that `leaf` is included under `root`
pub fn verify_merkle_path(leaf: [u8; 32], path: &[ProofStep], root: [u8; 32]) -> bool {
    matches!(root_from_path(leaf, path), Ok(computed) if computed == root)
}

//! Warden Crypto - Hashing, Merkle proofs and anchor signatures
//!
//! This crate provides:
//! - SHA-256 helpers and canonical JSON hashing for audit chains
//! - Merkle roots and inclusion paths over ledger entries
//! - Ed25519 key pairs and detached signatures for anchor roots

pub mod hash;
pub mod merkle;
pub mod keys;
pub mod signature;

pub use hash::*;
pub use merkle::*;
pub use keys::*;
pub use signature::*;

use thiserror::Error;

/// Cryptographic errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("Signing failed: {0}")]
    SigningFailed(String),

    #[error("Verification failed: {0}")]
    VerificationFailed(String),

    #[error("Invalid key format: {0}")]
    InvalidKeyFormat(String),

    #[error("Invalid digest: {0}")]
    InvalidDigest(String),

    #[error("Serialization failed: {0}")]
    Serialization(String),
}

pub type CryptoResult<T> = Result<T, CryptoError>;

//! Anchor signing keys

use crate::{CryptoError, CryptoResult};
use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Ed25519 key pair used to sign anchor roots
#[derive(Clone)]
pub struct KeyPair {
    signing_key: SigningKey,
}

impl KeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Create from a 32-byte secret seed
    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(bytes),
        }
    }

    /// Create from a hex-encoded 32-byte secret seed (as stored in config)
    pub fn from_hex(seed_hex: &str) -> CryptoResult<Self> {
        let bytes = hex::decode(seed_hex.trim())
            .map_err(|e| CryptoError::InvalidKeyFormat(e.to_string()))?;
        let seed: [u8; 32] = bytes.try_into().map_err(|_| {
            CryptoError::InvalidKeyFormat("Signing seed must be 32 bytes".to_string())
        })?;
        Ok(Self::from_bytes(&seed))
    }

    pub(crate) fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(hex::encode(self.verifying_key().as_bytes()))
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key().0)
            .finish_non_exhaustive()
    }
}

/// Hex-encoded Ed25519 public key (safe to share)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PublicKey(pub String);

impl PublicKey {
    /// Parse the verifying key
    pub fn to_verifying_key(&self) -> CryptoResult<VerifyingKey> {
        let bytes =
            hex::decode(&self.0).map_err(|e| CryptoError::InvalidKeyFormat(e.to_string()))?;
        let key_bytes: [u8; 32] = bytes.try_into().map_err(|_| {
            CryptoError::InvalidKeyFormat("Public key must be 32 bytes".to_string())
        })?;
        VerifyingKey::from_bytes(&key_bytes)
            .map_err(|e| CryptoError::InvalidKeyFormat(e.to_string()))
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keypair_generation() {
        let keypair = KeyPair::generate();
        assert_eq!(keypair.public_key().0.len(), 64);
    }

    #[test]
    fn test_keypair_from_hex_seed() {
        let seed = "11".repeat(32);
        let a = KeyPair::from_hex(&seed).unwrap();
        let b = KeyPair::from_bytes(&[0x11; 32]);
        assert_eq!(a.public_key(), b.public_key());
        assert!(KeyPair::from_hex("abcd").is_err());
    }

    #[test]
    fn test_public_key_roundtrip() {
        let keypair = KeyPair::generate();
        let verifying = keypair.public_key().to_verifying_key().unwrap();
        assert_eq!(keypair.verifying_key(), verifying);
    }
}

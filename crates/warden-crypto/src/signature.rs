//! Detached Ed25519 signatures

use crate::{CryptoError, CryptoResult, KeyPair, PublicKey};
use ed25519_dalek::{Signature as Ed25519Signature, Signer, Verifier};
use serde::{Deserialize, Serialize};

/// A detached signature together with the signer's public key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    /// Hex-encoded signature bytes
    pub signature: String,
    /// Public key of the signer
    pub public_key: PublicKey,
}

impl Signature {
    /// Sign a message
    pub fn sign(keypair: &KeyPair, message: &[u8]) -> CryptoResult<Self> {
        let signature = keypair
            .signing_key()
            .try_sign(message)
            .map_err(|e| CryptoError::SigningFailed(e.to_string()))?;

        Ok(Self {
            signature: hex::encode(signature.to_bytes()),
            public_key: keypair.public_key(),
        })
    }

    /// Verify the signature; malformed input is an error, a mismatch is `Ok(false)`
    pub fn verify(&self, message: &[u8]) -> CryptoResult<bool> {
        let signature_bytes = hex::decode(&self.signature)
            .map_err(|e| CryptoError::VerificationFailed(e.to_string()))?;
        let sig_array: [u8; 64] = signature_bytes.try_into().map_err(|_| {
            CryptoError::VerificationFailed("Signature must be 64 bytes".to_string())
        })?;

        let signature = Ed25519Signature::from_bytes(&sig_array);
        let verifying_key = self.public_key.to_verifying_key()?;

        Ok(verifying_key.verify(message, &signature).is_ok())
    }
}

use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};

use crate::checksum::sha256_hex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKey {
    key: VerifyingKey,
}

impl PublicKey {
    pub fn from_hex(public_key_hex: &str) -> Result<Self> {
        let bytes = hex::decode(public_key_hex.trim())
            .context("failed to decode Ed25519 public key hex")?;
        let len = bytes.len();
        let array: [u8; 32] = bytes.try_into().map_err(|_| {
            anyhow!("invalid Ed25519 public key length: expected 32 bytes, got {len}")
        })?;
        let key = VerifyingKey::from_bytes(&array).context("invalid Ed25519 public key bytes")?;
        Ok(Self { key })
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        self.key.as_bytes()
    }

    pub fn fingerprint(&self) -> String {
        sha256_hex(self.as_bytes())
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.as_bytes())
    }

    /// Returns `Ok(false)` for a well-formed signature that does not match.
    pub fn verify_hex(&self, payload: &[u8], signature_hex: &str) -> Result<bool> {
        let bytes =
            hex::decode(signature_hex.trim()).context("failed to decode Ed25519 signature hex")?;
        let len = bytes.len();
        let array: [u8; 64] = bytes.try_into().map_err(|_| {
            anyhow!("invalid Ed25519 signature length: expected 64 bytes, got {len}")
        })?;
        let signature = Signature::from_bytes(&array);
        Ok(self.key.verify(payload, &signature).is_ok())
    }
}

//! AES-256-GCM payload encryption. Stored layout: 12-byte random nonce followed by the
//! ciphertext and its 16-byte tag.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use getrandom::getrandom;

use super::{DriverError, DriverResult};

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

#[derive(Clone)]
pub struct Cipher {
    aead: Aes256Gcm,
}

impl std::fmt::Debug for Cipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Cipher(aes-256-gcm)")
    }
}

impl Cipher {
    pub fn from_key(key: &[u8; 32]) -> Self {
        let key = Key::<Aes256Gcm>::from_slice(key);
        Self { aead: Aes256Gcm::new(key) }
    }

    /// Key from its hex encoding; must decode to exactly 32 bytes.
    pub fn from_hex(hex_key: &str) -> DriverResult<Self> {
        let bytes = hex::decode(hex_key.trim())
            .map_err(|e| DriverError::Encryption(format!("ENCRYPTION_KEY is not valid hex: {}", e)))?;
        let key: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| DriverError::Encryption(format!("ENCRYPTION_KEY must be 32 bytes, got {}", bytes.len())))?;
        Ok(Self::from_key(&key))
    }

    /// Fresh random 32-byte key, hex encoded.
    pub fn generate_hex_key() -> DriverResult<String> {
        let mut key = [0u8; 32];
        getrandom(&mut key).map_err(|e| DriverError::Encryption(format!("failed to generate key: {}", e)))?;
        Ok(hex::encode(key))
    }

    pub fn encrypt(&self, plain: &[u8]) -> DriverResult<Vec<u8>> {
        let mut nonce = [0u8; NONCE_LEN];
        getrandom(&mut nonce).map_err(|e| DriverError::Encryption(format!("failed to generate nonce: {}", e)))?;
        let ct = self
            .aead
            .encrypt(Nonce::from_slice(&nonce), plain)
            .map_err(|e| DriverError::Encryption(format!("AES-GCM encryption failed: {}", e)))?;
        let mut out = Vec::with_capacity(NONCE_LEN + ct.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ct);
        Ok(out)
    }

    pub fn decrypt(&self, data: &[u8]) -> DriverResult<Vec<u8>> {
        if data.len() < NONCE_LEN + TAG_LEN {
            return Err(DriverError::Encryption(format!(
                "ciphertext too short: {} bytes",
                data.len()
            )));
        }
        let (nonce, ct) = data.split_at(NONCE_LEN);
        self.aead
            .decrypt(Nonce::from_slice(nonce), ct)
            .map_err(|e| DriverError::Encryption(format!("AES-GCM decryption failed: {}", e)))
    }
}

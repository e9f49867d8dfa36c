//! Credential vault
//!
//! Encrypts gateway access credentials at rest with AES-256-GCM. The wire
//! format is `base64(nonce || ciphertext)` with a random 96-bit nonce per
//! encryption. The key is a 64-hex-character string supplied through
//! configuration and is never persisted alongside the ciphertext.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::RngCore;

use crate::error::{RecoveryError, RecoveryResult};

const NONCE_LEN: usize = 12;

#[derive(Clone)]
pub struct CredentialVault {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for CredentialVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialVault").finish_non_exhaustive()
    }
}

impl CredentialVault {
    /// Build a vault from a 64-hex-character key (32 bytes).
    pub fn from_hex_key(hex_key: &str) -> RecoveryResult<Self> {
        let key_bytes = hex::decode(hex_key)
            .map_err(|_| RecoveryError::Config("vault key is not valid hex".to_string()))?;
        if key_bytes.len() != 32 {
            return Err(RecoveryError::Config(format!(
                "vault key must be 32 bytes, got {}",
                key_bytes.len()
            )));
        }
        let cipher = Aes256Gcm::new_from_slice(&key_bytes)
            .map_err(|_| RecoveryError::Config("vault key rejected by cipher".to_string()))?;
        Ok(Self { cipher })
    }

    pub fn encrypt(&self, plaintext: &str) -> RecoveryResult<String> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| RecoveryError::Vault("encryption failed".to_string()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(out))
    }

    pub fn decrypt(&self, encoded: &str) -> RecoveryResult<String> {
        let raw = BASE64
            .decode(encoded)
            .map_err(|_| RecoveryError::Vault("ciphertext is not valid base64".to_string()))?;
        if raw.len() <= NONCE_LEN {
            return Err(RecoveryError::Vault("ciphertext too short".to_string()));
        }
        let (nonce_bytes, ciphertext) = raw.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| RecoveryError::Vault("decryption failed (wrong key or tampered ciphertext)".to_string()))?;

        String::from_utf8(plaintext)
            .map_err(|_| RecoveryError::Vault("decrypted credential is not UTF-8".to_string()))
    }
}

//! Encryption of stored outbound-transport secrets
//!
//! Mailbox SMTP secrets are kept as `base64(nonce || ciphertext)` sealed with
//! AES-256-GCM under the key from `security.secret_key`.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::RngCore;

use crate::{Error, Result};

const NONCE_LENGTH: usize = 12;
const KEY_LENGTH: usize = 32;

/// AES-256-GCM cipher for mailbox secrets
#[derive(Clone)]
pub struct SecretCipher {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for SecretCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretCipher").finish_non_exhaustive()
    }
}

impl SecretCipher {
    /// Build a cipher from raw key bytes (must be 32 bytes)
    pub fn new(key: &[u8]) -> Result<Self> {
        if key.len() != KEY_LENGTH {
            return Err(Error::Config(format!(
                "Secret key must be {} bytes, got {}",
                KEY_LENGTH,
                key.len()
            )));
        }
        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|e| Error::Crypto(format!("Failed to create cipher: {}", e)))?;
        Ok(Self { cipher })
    }

    /// Build a cipher from a base64-encoded key
    pub fn from_base64(key_b64: &str) -> Result<Self> {
        let key = BASE64
            .decode(key_b64.trim())
            .map_err(|e| Error::Config(format!("Invalid secret key encoding: {}", e)))?;
        Self::new(&key)
    }

    /// Encrypt a secret
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let mut nonce_bytes = [0u8; NONCE_LENGTH];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| Error::Crypto(format!("Encryption failed: {}", e)))?;

        let mut sealed = Vec::with_capacity(NONCE_LENGTH + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(sealed))
    }

    /// Decrypt a secret produced by [`SecretCipher::encrypt`]
    pub fn decrypt(&self, sealed_b64: &str) -> Result<String> {
        let sealed = BASE64
            .decode(sealed_b64.trim())
            .map_err(|e| Error::Crypto(format!("Invalid secret encoding: {}", e)))?;
        if sealed.len() <= NONCE_LENGTH {
            return Err(Error::Crypto("Sealed secret is too short".to_string()));
        }

        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LENGTH);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| Error::Crypto("Decryption failed: wrong key or corrupted data".to_string()))?;

        String::from_utf8(plaintext)
            .map_err(|e| Error::Crypto(format!("Secret is not valid UTF-8: {}", e)))
    }
}

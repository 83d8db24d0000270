//! AES-256-GCM secrets-at-rest, keyed by a PBKDF2-derived key rather than a
//! raw passphrase. Used to encrypt configuration secrets (HMAC signing key,
//! local credentials) when no external KMS is configured — see
//! [`crate::config::LocalSecretsConfig`].

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Key, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;

use crate::error::{ErrorCode, Result};
use crate::Error;

pub struct EncryptionService {
    cipher: Aes256Gcm,
}

impl EncryptionService {
    /// Derives a 256-bit AES key from `passphrase` and `salt` via
    /// PBKDF2-HMAC-SHA256. `iterations` should track OWASP's current
    /// recommendation (600,000 as of this writing); see
    /// [`crate::config::LocalSecretsConfig::pbkdf2_iterations`].
    pub fn from_passphrase(passphrase: &str, salt: &[u8], iterations: u32) -> Result<Self> {
        let mut key_bytes = [0u8; 32];
        pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), salt, iterations, &mut key_bytes);
        Self::from_key_bytes(&key_bytes)
    }

    /// Builds the service from an already-derived 32-byte key. Exposed for
    /// callers that manage their own key material (e.g. tests, or a KMS
    /// response already unwrapped to raw key bytes).
    pub fn from_key_bytes(key_bytes: &[u8]) -> Result<Self> {
        if key_bytes.len() != 32 {
            return Err(Error::new(ErrorCode::EncryptionError, "AES key must be exactly 32 bytes"));
        }

        let key = Key::<Aes256Gcm>::from_slice(key_bytes);
        let cipher = Aes256Gcm::new(key);

        Ok(Self { cipher })
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|e| Error::new(ErrorCode::EncryptionError, format!("encryption failed: {}", e)))?;

        let mut result = nonce.to_vec();
        result.extend_from_slice(&ciphertext);

        Ok(result)
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() < 12 {
            return Err(Error::new(ErrorCode::DecryptionError, "ciphertext shorter than the nonce prefix"));
        }

        let (nonce_bytes, encrypted_data) = ciphertext.split_at(12);
        let nonce = Nonce::from_slice(nonce_bytes);

        self.cipher
            .decrypt(nonce, encrypted_data)
            .map_err(|e| Error::new(ErrorCode::DecryptionError, format!("decryption failed: {}", e)))
    }

    pub fn encrypt_string(&self, plaintext: &str) -> Result<String> {
        let encrypted = self.encrypt(plaintext.as_bytes())?;
        Ok(STANDARD.encode(&encrypted))
    }

    pub fn decrypt_string(&self, ciphertext: &str) -> Result<String> {
        let decoded = STANDARD
            .decode(ciphertext)
            .map_err(|e| Error::new(ErrorCode::DecryptionError, format!("invalid base64: {}", e)))?;

        let decrypted = self.decrypt(&decoded)?;

        String::from_utf8(decrypted)
            .map_err(|e| Error::new(ErrorCode::DecryptionError, format!("invalid utf-8: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_passphrase_derivation() {
        let service = EncryptionService::from_passphrase("correct horse battery staple", b"fixed-test-salt", 1_000).unwrap();
        let encrypted = service.encrypt_string("hmac-signing-key-material").unwrap();
        assert_ne!(encrypted, "hmac-signing-key-material");
        assert_eq!(service.decrypt_string(&encrypted).unwrap(), "hmac-signing-key-material");
    }

    #[test]
    fn rejects_short_key_bytes() {
        assert!(EncryptionService::from_key_bytes(&[0u8; 16]).is_err());
    }

    #[test]
    fn rejects_truncated_ciphertext() {
        let service = EncryptionService::from_key_bytes(&[7u8; 32]).unwrap();
        assert!(service.decrypt(&[1, 2, 3]).is_err());
    }
}

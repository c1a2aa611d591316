//! AES-256-GCM encryption for private plans and stored credentials.

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, KeyInit},
};
use sha2::{Digest, Sha256};
use skyway_core::ports::EncryptionStrategy;
use skyway_core::{Error, Result};
use tracing::debug;

/// Plaintext encrypted at startup and compared on the next boot to detect
/// a changed key.
const CANARY: &[u8] = b"skyway-encryption-canary";

/// Encryption with a 256-bit key and a random 96-bit nonce per value.
pub struct AesGcmStrategy {
    cipher: Aes256Gcm,
}

impl AesGcmStrategy {
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
        }
    }

    /// Derive the key from an operator-supplied passphrase.
    pub fn from_master_key(master_key: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(master_key.as_bytes());
        let key: [u8; 32] = hasher.finalize().into();
        Self::new(&key)
    }
}

impl EncryptionStrategy for AesGcmStrategy {
    fn encrypt(&self, plaintext: &[u8]) -> Result<(Vec<u8>, Option<Vec<u8>>)> {
        let nonce_bytes: [u8; 12] = rand::random();
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|e| Error::Encryption(format!("encryption failed: {e}")))?;
        Ok((ciphertext, Some(nonce_bytes.to_vec())))
    }

    fn decrypt(&self, ciphertext: &[u8], nonce: Option<&[u8]>) -> Result<Vec<u8>> {
        // Rows written before a key was configured are stored in the clear.
        let Some(nonce) = nonce else {
            return Ok(ciphertext.to_vec());
        };
        if nonce.len() != 12 {
            return Err(Error::Encryption(format!("invalid nonce length {}", nonce.len())));
        }
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| Error::EncryptionKeyMismatch)
    }
}

/// Stores values as-is.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoEncryption;

impl EncryptionStrategy for NoEncryption {
    fn encrypt(&self, plaintext: &[u8]) -> Result<(Vec<u8>, Option<Vec<u8>>)> {
        Ok((plaintext.to_vec(), None))
    }

    fn decrypt(&self, ciphertext: &[u8], nonce: Option<&[u8]>) -> Result<Vec<u8>> {
        if nonce.is_some() {
            return Err(Error::EncryptionKeyMismatch);
        }
        Ok(ciphertext.to_vec())
    }
}

/// A canary value to persist alongside encrypted data.
pub fn seal_canary(strategy: &dyn EncryptionStrategy) -> Result<(Vec<u8>, Option<Vec<u8>>)> {
    strategy.encrypt(CANARY)
}

/// Fails with [`Error::EncryptionKeyMismatch`] unless `strategy` opens the
/// canary stored by a previous boot.
pub fn verify_canary(strategy: &dyn EncryptionStrategy, ciphertext: &[u8], nonce: Option<&[u8]>) -> Result<()> {
    let plaintext = strategy.decrypt(ciphertext, nonce)?;
    if plaintext != CANARY {
        return Err(Error::EncryptionKeyMismatch);
    }
    debug!("encryption canary verified");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let strategy = AesGcmStrategy::from_master_key("test-master-key");
        let (ciphertext, nonce) = strategy.encrypt(b"{\"plan\":1}").unwrap();
        assert_ne!(ciphertext, b"{\"plan\":1}");
        let plaintext = strategy.decrypt(&ciphertext, nonce.as_deref()).unwrap();
        assert_eq!(plaintext, b"{\"plan\":1}");
    }

    #[test]
    fn test_wrong_key_is_fatal() {
        let (ciphertext, nonce) = AesGcmStrategy::from_master_key("one").encrypt(b"secret").unwrap();
        let err = AesGcmStrategy::from_master_key("two")
            .decrypt(&ciphertext, nonce.as_deref())
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_canary_detects_key_change() {
        let original = AesGcmStrategy::from_master_key("one");
        let (ciphertext, nonce) = seal_canary(&original).unwrap();
        verify_canary(&original, &ciphertext, nonce.as_deref()).unwrap();

        let rotated = AesGcmStrategy::from_master_key("two");
        assert!(matches!(
            verify_canary(&rotated, &ciphertext, nonce.as_deref()),
            Err(Error::EncryptionKeyMismatch)
        ));
        assert!(matches!(
            verify_canary(&NoEncryption, &ciphertext, nonce.as_deref()),
            Err(Error::EncryptionKeyMismatch)
        ));
    }

    #[test]
    fn test_plaintext_rows_still_readable() {
        let strategy = AesGcmStrategy::from_master_key("key");
        assert_eq!(strategy.decrypt(b"legacy", None).unwrap(), b"legacy");
    }
}

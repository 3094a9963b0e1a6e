// Encrypted-at-rest wrapper over a StorageBackend
//
// Values are stored as nonce || XChaCha20-Poly1305 ciphertext with the key
// name bound as AAD, so a row copied under another key fails to open.

use super::backend::{StorageBackend, StorageError};
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;
use std::sync::Arc;
use zeroize::Zeroizing;

const NONCE_LEN: usize = 24;
const PBKDF2_ROUNDS: u32 = 100_000;

/// 32-byte storage key, wiped on drop
pub struct StorageKey(Zeroizing<[u8; 32]>);

impl StorageKey {
    /// Derive a storage key from a device secret with PBKDF2-HMAC-SHA256
    pub fn derive(secret: &[u8], salt: &[u8]) -> Self {
        let mut key = Zeroizing::new([0u8; 32]);
        pbkdf2::pbkdf2_hmac::<sha2::Sha256>(secret, salt, PBKDF2_ROUNDS, key.as_mut());
        Self(key)
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(Zeroizing::new(bytes))
    }

    /// Fresh random key, used for throwaway stores
    pub fn random() -> Self {
        let mut key = Zeroizing::new([0u8; 32]);
        rand::rngs::OsRng.fill_bytes(key.as_mut());
        Self(key)
    }
}

pub struct SealedStorage {
    inner: Arc<dyn StorageBackend>,
    key: StorageKey,
}

impl SealedStorage {
    pub fn new(inner: Arc<dyn StorageBackend>, key: StorageKey) -> Self {
        Self { inner, key }
    }

    fn cipher(&self) -> Result<XChaCha20Poly1305, StorageError> {
        XChaCha20Poly1305::new_from_slice(self.key.0.as_ref())
            .map_err(|e| StorageError::Encryption(e.to_string()))
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher()?
            .encrypt(XNonce::from_slice(&nonce), Payload { msg: value, aad: key })
            .map_err(|e| StorageError::Encryption(e.to_string()))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        self.inner.put(key, &sealed)?;
        self.inner.flush()
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Zeroizing<Vec<u8>>>, StorageError> {
        let Some(sealed) = self.inner.get(key)? else {
            return Ok(None);
        };
        if sealed.len() < NONCE_LEN {
            return Err(StorageError::Encryption("sealed value truncated".to_string()));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        let plaintext = self
            .cipher()?
            .decrypt(XNonce::from_slice(nonce), Payload { msg: ciphertext, aad: key })
            .map_err(|_| StorageError::Encryption("sealed value failed authentication".to_string()))?;
        Ok(Some(Zeroizing::new(plaintext)))
    }

    pub fn remove(&self, key: &[u8]) -> Result<(), StorageError> {
        self.inner.remove(key)?;
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::backend::MemoryStorage;

    #[test]
    fn test_sealed_roundtrip() {
        let backend = Arc::new(MemoryStorage::new());
        let sealed = SealedStorage::new(backend.clone(), StorageKey::random());

        sealed.put(b"connections", b"{\"a\":1}").unwrap();
        let value = sealed.get(b"connections").unwrap().unwrap();
        assert_eq!(value.as_slice(), b"{\"a\":1}");

        // Raw bytes on the backend are not the plaintext
        let raw = backend.get(b"connections").unwrap().unwrap();
        assert!(!raw.windows(7).any(|w| w == b"{\"a\":1}"));
    }

    #[test]
    fn test_wrong_key_fails_to_open() {
        let backend = Arc::new(MemoryStorage::new());
        SealedStorage::new(backend.clone(), StorageKey::derive(b"secret-a", b"salt"))
            .put(b"k", b"v")
            .unwrap();

        let other = SealedStorage::new(backend, StorageKey::derive(b"secret-b", b"salt"));
        assert!(other.get(b"k").is_err());
    }

    #[test]
    fn test_derive_is_deterministic() {
        let backend = Arc::new(MemoryStorage::new());
        SealedStorage::new(backend.clone(), StorageKey::derive(b"device", b"salt"))
            .put(b"k", b"v")
            .unwrap();
        let again = SealedStorage::new(backend, StorageKey::derive(b"device", b"salt"));
        assert_eq!(again.get(b"k").unwrap().unwrap().as_slice(), b"v");
    }
}

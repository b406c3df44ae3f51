//! At-rest encryption for stored face embeddings (AES-256-GCM).
//!
//! Blob layout: 12-byte nonce ‖ ciphertext ‖ 16-byte tag.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::path::Path;
use thiserror::Error;

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("key file {path}: {source}")]
    KeyFile {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("key file {0} must contain exactly 32 bytes")]
    BadKeyLength(String),
    #[error("embedding encryption failed")]
    Encrypt,
    #[error("embedding decryption failed (wrong key or corrupted data)")]
    Decrypt,
}

/// Symmetric cipher for embedding blobs.
#[derive(Clone)]
pub struct EmbeddingCipher {
    cipher: Aes256Gcm,
}

impl EmbeddingCipher {
    pub fn from_key(key: &[u8; KEY_LEN]) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
        }
    }

    /// Derive the key as SHA-256 of a passphrase.
    pub fn from_passphrase(passphrase: &str) -> Self {
        let key: [u8; KEY_LEN] = Sha256::digest(passphrase.as_bytes()).into();
        Self::from_key(&key)
    }

    /// Load the key from `path`, creating it with random bytes on first use.
    pub fn load_or_create(path: &Path) -> Result<Self, CryptoError> {
        let key_err = |source| CryptoError::KeyFile {
            path: path.display().to_string(),
            source,
        };

        if path.exists() {
            let bytes = std::fs::read(path).map_err(key_err)?;
            let key: [u8; KEY_LEN] = bytes
                .try_into()
                .map_err(|_| CryptoError::BadKeyLength(path.display().to_string()))?;
            return Ok(Self::from_key(&key));
        }

        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(key_err)?;
        }
        let mut key = [0u8; KEY_LEN];
        rand::rngs::OsRng.fill_bytes(&mut key);
        write_private(path, &key).map_err(key_err)?;
        tracing::info!(path = %path.display(), "generated new embedding key");
        Ok(Self::from_key(&key))
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| CryptoError::Encrypt)?;
        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    pub fn decrypt(&self, blob: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if blob.len() < NONCE_LEN {
            return Err(CryptoError::Decrypt);
        }
        let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::Decrypt)
    }
}

#[cfg(unix)]
fn write_private(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(bytes)
}

#[cfg(not(unix))]
fn write_private(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    std::fs::write(path, bytes)
}

//! Payload confidentiality for `aes` envelopes.
//!
//! The shared token is stretched into an AES-256 key with HKDF-SHA256. Each
//! sealed payload is `base64(nonce || ciphertext)` with a fresh random
//! 96-bit nonce, so sealing the same record twice gives different strings.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Key, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use hkdf::Hkdf;
use sha2::Sha256;

use crate::error::CryptError;
use crate::job::JobRecord;

const NONCE_SIZE: usize = 12;
const KEY_INFO: &[u8] = b"fleetcast-envelope-v1";

/// Symmetric cipher keyed by the shared dispatcher/agent token.
#[derive(Clone)]
pub struct Cipher {
    aead: Aes256Gcm,
}

impl std::fmt::Debug for Cipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cipher").finish_non_exhaustive()
    }
}

impl Cipher {
    pub fn new(token: &str) -> Result<Self, CryptError> {
        if token.is_empty() {
            return Err(CryptError::EmptyKey);
        }
        let hk = Hkdf::<Sha256>::new(None, token.as_bytes());
        let mut okm = [0u8; 32];
        hk.expand(KEY_INFO, &mut okm).map_err(|_| CryptError::Seal)?;
        let key = Key::<Aes256Gcm>::from_slice(&okm);
        Ok(Self {
            aead: Aes256Gcm::new(key),
        })
    }

    /// Serialize and encrypt a record.
    pub fn seal(&self, record: &JobRecord) -> Result<String, CryptError> {
        let plaintext = serde_json::to_vec(record)?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .aead
            .encrypt(&nonce, plaintext.as_ref())
            .map_err(|_| CryptError::Seal)?;

        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(sealed))
    }

    /// Decrypt and deserialize a record produced by [`Cipher::seal`].
    pub fn open(&self, sealed: &str) -> Result<JobRecord, CryptError> {
        let raw = BASE64.decode(sealed)?;
        if raw.len() < NONCE_SIZE {
            return Err(CryptError::Truncated);
        }
        let (nonce, ciphertext) = raw.split_at(NONCE_SIZE);
        let plaintext = self
            .aead
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptError::Open)?;
        Ok(serde_json::from_slice(&plaintext)?)
    }
}

//! Optional sealing of outgoing archives.
//!
//! XChaCha20-Poly1305 with a random 24-byte nonce prepended to the
//! ciphertext. The integrity digest is computed on the plaintext archive
//! before sealing, so the receiver decrypts and then verifies.

use chacha20poly1305::{
    XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit},
};
use rand::RngCore;

use crate::error::CryptoError;

const NONCE_LEN: usize = 24;

#[derive(Clone)]
pub struct ArchiveCipher {
    key: [u8; 32],
}

impl ArchiveCipher {
    /// Parses a 64-hex-character key from configuration.
    pub fn from_hex(key_hex: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(key_hex.trim())
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;

        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|b: Vec<u8>| CryptoError::InvalidKey(format!("{} bytes", b.len())))?;

        Ok(Self { key })
    }

    /// Seals `plaintext`, returning `nonce || ciphertext`.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher = XChaCha20Poly1305::new((&self.key).into());

        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let ciphertext = cipher
            .encrypt(XNonce::from_slice(&nonce), plaintext)
            .map_err(|e| CryptoError::SealFailed(e.to_string()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Opens `nonce || ciphertext`. The relay itself never decrypts in
    /// production; this mirrors the receiver for tests.
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < NONCE_LEN {
            return Err(CryptoError::OpenFailed("sealed data too short".into()));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);

        let cipher = XChaCha20Poly1305::new((&self.key).into());
        cipher
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|e| CryptoError::OpenFailed(e.to_string()))
    }
}

impl std::fmt::Debug for ArchiveCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never log key material.
        f.debug_struct("ArchiveCipher").finish_non_exhaustive()
    }
}

//! AES-CBC payload sealing for sensitive kinds.
//!
//! # Purpose
//! The remote config backend stores sensitive payloads encrypted. A sealed
//! payload is the literal `enc|` followed by the URL-safe base64 of
//! `IV || AES-CBC(PKCS#7, plaintext)`. The IV is random per message and
//! carried as the ciphertext prefix. Key length selects the cipher:
//! 16, 24 or 32 bytes for AES-128/192/256.
//!
//! Plaintext payloads pass through untouched; [`is_sealed`] tells the two
//! apart.

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes::{Aes128, Aes192, Aes256};
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use thiserror::Error;

/// Prefix marking a sealed payload.
pub const ENCRYPTION_MARK: &str = "enc|";

const IV_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid encryption key length: {0} (want 16, 24 or 32 bytes)")]
    InvalidKeyLength(usize),
    #[error("payload is not a sealed payload")]
    NotSealed,
    #[error("sealed payload is malformed: {0}")]
    Malformed(String),
    #[error("failed to decode sealed payload: {0}")]
    Decode(#[from] base64::DecodeError),
    #[error("decryption failed")]
    Decrypt,
    #[error("failed to draw random bytes: {0}")]
    Random(#[from] getrandom::Error),
}

/// `true` when the payload carries the `enc|` mark.
pub fn is_sealed(payload: &str) -> bool {
    payload.starts_with(ENCRYPTION_MARK)
}

/// AES-CBC cipher bound to one key.
#[derive(Clone)]
pub struct PayloadCipher {
    key: Vec<u8>,
}

impl PayloadCipher {
    pub fn new(key: &[u8]) -> Result<Self, CryptoError> {
        match key.len() {
            16 | 24 | 32 => Ok(Self { key: key.to_vec() }),
            len => Err(CryptoError::InvalidKeyLength(len)),
        }
    }

    /// Encrypts `plaintext` into a sealed payload string.
    pub fn seal(&self, plaintext: &[u8]) -> Result<String, CryptoError> {
        let mut iv = [0u8; IV_LEN];
        getrandom::getrandom(&mut iv)?;

        let invalid_key = |_| CryptoError::InvalidKeyLength(self.key.len());
        let ciphertext = match self.key.len() {
            16 => cbc::Encryptor::<Aes128>::new_from_slices(&self.key, &iv)
                .map_err(invalid_key)?
                .encrypt_padded_vec_mut::<Pkcs7>(plaintext),
            24 => cbc::Encryptor::<Aes192>::new_from_slices(&self.key, &iv)
                .map_err(invalid_key)?
                .encrypt_padded_vec_mut::<Pkcs7>(plaintext),
            _ => cbc::Encryptor::<Aes256>::new_from_slices(&self.key, &iv)
                .map_err(invalid_key)?
                .encrypt_padded_vec_mut::<Pkcs7>(plaintext),
        };

        let mut combined = iv.to_vec();
        combined.extend_from_slice(&ciphertext);
        Ok(format!("{ENCRYPTION_MARK}{}", URL_SAFE.encode(combined)))
    }

    /// Decrypts a sealed payload produced by [`PayloadCipher::seal`].
    pub fn open(&self, payload: &str) -> Result<Vec<u8>, CryptoError> {
        let encoded = payload
            .strip_prefix(ENCRYPTION_MARK)
            .ok_or(CryptoError::NotSealed)?;
        let combined = URL_SAFE.decode(encoded)?;
        if combined.len() < IV_LEN {
            return Err(CryptoError::Malformed(format!(
                "sealed payload shorter than the IV: {} bytes",
                combined.len()
            )));
        }
        let (iv, ciphertext) = combined.split_at(IV_LEN);

        let invalid_key = |_| CryptoError::InvalidKeyLength(self.key.len());
        let plaintext = match self.key.len() {
            16 => cbc::Decryptor::<Aes128>::new_from_slices(&self.key, iv)
                .map_err(invalid_key)?
                .decrypt_padded_vec_mut::<Pkcs7>(ciphertext),
            24 => cbc::Decryptor::<Aes192>::new_from_slices(&self.key, iv)
                .map_err(invalid_key)?
                .decrypt_padded_vec_mut::<Pkcs7>(ciphertext),
            _ => cbc::Decryptor::<Aes256>::new_from_slices(&self.key, iv)
                .map_err(invalid_key)?
                .decrypt_padded_vec_mut::<Pkcs7>(ciphertext),
        }
        .map_err(|_| CryptoError::Decrypt)?;

        Ok(plaintext)
    }
}

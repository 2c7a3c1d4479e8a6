use chacha20poly1305::{
    aead::{Aead, KeyInit, OsRng},
    XChaCha20Poly1305, XNonce,
};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;

use crate::config::Namespace;

#[derive(Error, Debug)]
pub enum EncryptionError {
    #[error("Encryption failed")]
    EncryptionFailed,
    #[error("Decryption failed")]
    DecryptionFailed,
    #[error("Invalid key length")]
    InvalidKeyLength,
}

pub type Result<T> = std::result::Result<T, EncryptionError>;

/// Encryption adds a 24-byte nonce and a 16-byte Poly1305 tag to every payload.
pub const ENCRYPTION_OVERHEAD_BYTES: usize = 24 + 16;

/// Encrypt a config payload using XChaCha20-Poly1305.
///
/// # Returns
/// Ciphertext with prepended nonce (24 bytes + ciphertext + tag)
pub fn encrypt_config(plaintext: &[u8], key: &[u8; 32]) -> Result<Vec<u8>> {
    let cipher =
        XChaCha20Poly1305::new_from_slice(key).map_err(|_| EncryptionError::InvalidKeyLength)?;

    let mut nonce_bytes = [0u8; 24];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = XNonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| EncryptionError::EncryptionFailed)?;

    let mut result = Vec::with_capacity(24 + ciphertext.len());
    result.extend_from_slice(&nonce_bytes);
    result.extend_from_slice(&ciphertext);

    Ok(result)
}

/// Decrypt a config payload using XChaCha20-Poly1305.
///
/// # Arguments
/// * `encrypted_data` - Ciphertext with prepended nonce (24 bytes + ciphertext + tag)
/// * `key` - 32-byte symmetric key
pub fn decrypt_config(encrypted_data: &[u8], key: &[u8; 32]) -> Result<Vec<u8>> {
    if encrypted_data.len() < ENCRYPTION_OVERHEAD_BYTES {
        return Err(EncryptionError::DecryptionFailed);
    }

    let (nonce_bytes, ciphertext) = encrypted_data.split_at(24);
    let nonce = XNonce::from_slice(nonce_bytes);

    let cipher =
        XChaCha20Poly1305::new_from_slice(key).map_err(|_| EncryptionError::InvalidKeyLength)?;

    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| EncryptionError::DecryptionFailed)
}

/// Derive the symmetric key protecting one namespace's config payloads.
///
/// HKDF-SHA256 over the owner's signing seed, domain-separated per namespace
/// so that a leaked key for one namespace never exposes another.
pub fn derive_namespace_key(seed: &[u8; 32], namespace: Namespace) -> [u8; 32] {
    let hk = Hkdf::<Sha256>::new(Some(b"quilt-namespace-key"), seed);
    let mut okm = [0u8; 32];
    hk.expand(namespace.as_str().as_bytes(), &mut okm)
        .expect("32 bytes is a valid HKDF-SHA256 output length");
    okm
}

/// Derive a per-generation message key from a group's generation key material.
///
/// Used so that message encryption never touches the raw generation key.
pub fn derive_generation_key(key_material: &[u8; 32], generation: u64) -> [u8; 32] {
    let hk = Hkdf::<Sha256>::new(Some(b"quilt-generation-key"), key_material);
    let mut okm = [0u8; 32];
    hk.expand(&generation.to_le_bytes(), &mut okm)
        .expect("32 bytes is a valid HKDF-SHA256 output length");
    okm
}

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SigningError {
    #[error("Verification failed")]
    VerificationFailed,
    #[error("Invalid key")]
    InvalidKey,
    #[error("Invalid signature length")]
    InvalidSignature,
}

pub type Result<T> = std::result::Result<T, SigningError>;

/// Generate an Ed25519 keypair.
///
/// # Returns
/// (public_key, private_key) - Both as 32-byte arrays
pub fn generate_keypair() -> ([u8; 32], [u8; 32]) {
    let signing_key = SigningKey::generate(&mut OsRng);

    let secret_key = signing_key.to_bytes();
    let public_key = signing_key.verifying_key().to_bytes();

    (public_key, secret_key)
}

/// Derive the public key from an Ed25519 private key.
pub fn derive_public_key(private_key: &[u8; 32]) -> [u8; 32] {
    SigningKey::from_bytes(private_key).verifying_key().to_bytes()
}

/// Sign a message with Ed25519 over its BLAKE3 digest.
///
/// Signing the digest rather than the raw bytes keeps signatures over large
/// config payloads cheap and length-independent.
pub fn sign_digest(data: &[u8], private_key: &[u8; 32]) -> [u8; 64] {
    let signing_key = SigningKey::from_bytes(private_key);
    let digest = blake3::hash(data);
    signing_key.sign(digest.as_bytes()).to_bytes()
}

/// Verify an Ed25519 signature produced by [`sign_digest`].
///
/// Returns `Ok(true)` if valid, `Ok(false)` on signature mismatch, `Err` on
/// a malformed public key.
pub fn verify_digest(data: &[u8], signature: &[u8; 64], public_key: &[u8; 32]) -> Result<bool> {
    let verifying_key =
        VerifyingKey::from_bytes(public_key).map_err(|_| SigningError::InvalidKey)?;
    let sig = Signature::from_bytes(signature);
    let digest = blake3::hash(data);
    Ok(verifying_key.verify(digest.as_bytes(), &sig).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let (pub_k, priv_k) = generate_keypair();
        let sig = sign_digest(b"config payload", &priv_k);
        assert!(verify_digest(b"config payload", &sig, &pub_k).unwrap());
    }

    #[test]
    fn test_verify_rejects_tampered_data() {
        let (pub_k, priv_k) = generate_keypair();
        let sig = sign_digest(b"original", &priv_k);
        assert!(!verify_digest(b"tampered", &sig, &pub_k).unwrap());
    }

    #[test]
    fn test_verify_rejects_wrong_key() {
        let (_, priv_k) = generate_keypair();
        let (other_pub, _) = generate_keypair();
        let sig = sign_digest(b"payload", &priv_k);
        assert!(!verify_digest(b"payload", &sig, &other_pub).unwrap());
    }

    #[test]
    fn test_derive_public_key_matches_keypair() {
        let (pub_k, priv_k) = generate_keypair();
        assert_eq!(derive_public_key(&priv_k), pub_k);
    }
}

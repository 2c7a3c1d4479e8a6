/// Cryptographic primitives for config encryption and admin authority.
///
/// # Module structure
/// - `encryption` — XChaCha20-Poly1305 sealing of config payloads, HKDF key derivation
/// - `signing` — Ed25519 keypairs, sign/verify over BLAKE3 digests

pub mod encryption;
pub mod signing;

pub use encryption::{
    decrypt_config, derive_generation_key, derive_namespace_key, encrypt_config, EncryptionError,
};
pub use signing::{
    derive_public_key, generate_keypair, sign_digest, verify_digest, SigningError,
};

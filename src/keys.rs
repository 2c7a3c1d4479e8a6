/// Group keys sub-engine — symmetric key material as a monotonically
/// advancing generation counter.
///
/// Every rekey advances the generation and distributes fresh material, signed
/// by the group's admin key (the private half of the group id itself — holding
/// it IS admin authority, enforced here rather than assumed of callers). Two
/// concurrent admin rekeys that land on the same generation are a collision:
/// both keys are retained, the winner is picked by a deterministic hash order
/// so every member decrypts the same way, and `needs_rekey` stays set until a
/// strictly higher single-key generation converges the group. Supplemental
/// messages wrap historic generations to newly invited members without
/// advancing the generation for anyone else.
use std::collections::BTreeMap;

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_big_array::BigArray;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::encryption::{decrypt_config, encrypt_config};
use crate::crypto::signing::{derive_public_key, sign_digest, verify_digest};
use crate::ids::{AccountId, GroupId};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum KeysError {
    #[error("Operation requires the group admin key")]
    AdminRequired,

    #[error("Failed to rekey group: {0}")]
    RekeyFailed(String),

    #[error("No valid key material for the current generation")]
    NoValidGeneration,

    #[error("Key message signature invalid")]
    InvalidSignature,

    #[error("Key message targets wrong group")]
    WrongGroup,

    #[error("Key material could not be unwrapped")]
    UnwrapFailed,

    #[error("Encoding failed: {0}")]
    Encode(String),
}

pub type Result<T> = std::result::Result<T, KeysError>;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// Key material for one generation, wrapped to one member's X25519 key.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct WrappedKey {
    pub member: AccountId,
    pub ephemeral_pub: [u8; 32],
    pub sealed: Vec<u8>,
}

/// Admin-signed key distribution message.
///
/// A rekey message carries one `(generation, material)` pair per member; a
/// supplemental message carries every historic pair, for members who need to
/// read history. The signature covers everything else in the message.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct KeyMessage {
    pub group: GroupId,
    pub generation: u64,
    pub supplement: bool,
    pub wrapped: Vec<WrappedKey>,
    #[serde(with = "BigArray")]
    pub signature: [u8; 64],
}

impl KeyMessage {
    fn signable_bytes(&self) -> Result<Vec<u8>> {
        let signable = (&self.group, self.generation, self.supplement, &self.wrapped);
        bincode::serialize(&signable).map_err(|e| KeysError::Encode(e.to_string()))
    }

    /// Verify the admin signature against the group's public key.
    pub fn verify(&self, group: &GroupId) -> Result<()> {
        if self.group != *group {
            return Err(KeysError::WrongGroup);
        }
        let signable = self.signable_bytes()?;
        match verify_digest(&signable, &self.signature, group.as_bytes()) {
            Ok(true) => Ok(()),
            _ => Err(KeysError::InvalidSignature),
        }
    }
}

// ---------------------------------------------------------------------------
// GroupKeys
// ---------------------------------------------------------------------------

#[derive(Clone, Zeroize, ZeroizeOnDrop)]
struct KeyEntry {
    material: [u8; 32],
}

/// Per-group key state: generation counter plus the material seen for each
/// generation. More than one entry at the top generation means concurrent
/// admin rekeys collided.
pub struct GroupKeys {
    group: GroupId,
    generations: BTreeMap<u64, Vec<KeyEntry>>,
}

impl GroupKeys {
    pub fn new(group: GroupId) -> Self {
        GroupKeys {
            group,
            generations: BTreeMap::new(),
        }
    }

    pub fn group(&self) -> GroupId {
        self.group
    }

    /// The current (highest known) generation. Zero before any key exists.
    pub fn current_generation(&self) -> u64 {
        self.generations.keys().next_back().copied().unwrap_or(0)
    }

    /// The current generation's key material. Where a collision left several
    /// candidates, the one with the smallest BLAKE3 hash wins on every
    /// replica.
    pub fn group_key(&self) -> Result<[u8; 32]> {
        let entries = self
            .generations
            .values()
            .next_back()
            .ok_or(KeysError::NoValidGeneration)?;
        entries
            .iter()
            .min_by_key(|e| *blake3::hash(&e.material).as_bytes())
            .map(|e| e.material)
            .ok_or(KeysError::NoValidGeneration)
    }

    /// Key material for a specific generation (historic decryption).
    pub fn key_for_generation(&self, generation: u64) -> Result<[u8; 32]> {
        let entries = self
            .generations
            .get(&generation)
            .ok_or(KeysError::NoValidGeneration)?;
        entries
            .iter()
            .min_by_key(|e| *blake3::hash(&e.material).as_bytes())
            .map(|e| e.material)
            .ok_or(KeysError::NoValidGeneration)
    }

    /// True while the current generation carries more than one key — i.e.
    /// concurrent admin rekeys collided and one further rekey is required to
    /// converge.
    pub fn needs_rekey(&self) -> bool {
        self.generations
            .values()
            .next_back()
            .map(|entries| entries.len() > 1)
            .unwrap_or(false)
    }

    /// Whether this account is the one that should perform the converging
    /// rekey. Exactly one admin is designated — the smallest admin account id
    /// — so colliding admins do not ping-pong further rekeys at each other.
    pub fn should_rekey(&self, ours: &AccountId, admins: &[AccountId]) -> bool {
        self.needs_rekey() && admins.iter().min() == Some(ours)
    }

    fn check_admin(&self, admin_secret: &[u8; 32]) -> Result<()> {
        if derive_public_key(admin_secret) != *self.group.as_bytes() {
            return Err(KeysError::AdminRequired);
        }
        Ok(())
    }

    /// Advance the generation with fresh material and wrap it to every
    /// current member. Admin only.
    pub fn rekey(
        &mut self,
        admin_secret: &[u8; 32],
        members: &[(AccountId, [u8; 32])],
    ) -> Result<KeyMessage> {
        self.check_admin(admin_secret)?;

        let generation = self.current_generation() + 1;
        let mut material = [0u8; 32];
        getrandom::getrandom(&mut material)
            .map_err(|e| KeysError::RekeyFailed(e.to_string()))?;

        let pairs = vec![(generation, material)];
        let wrapped = wrap_to_members(&pairs, members)?;

        let mut msg = KeyMessage {
            group: self.group,
            generation,
            supplement: false,
            wrapped,
            signature: [0u8; 64],
        };
        msg.signature = sign_digest(&msg.signable_bytes()?, admin_secret);

        self.insert_material(generation, material);
        log::debug!("{:?}: rekeyed to generation {}", self.group, generation);
        Ok(msg)
    }

    /// Wrap every known generation's winning key to the listed (newly added)
    /// members, without advancing the generation for anyone else. Admin only.
    pub fn key_supplement(
        &self,
        admin_secret: &[u8; 32],
        members: &[(AccountId, [u8; 32])],
    ) -> Result<KeyMessage> {
        self.check_admin(admin_secret)?;
        if self.generations.is_empty() {
            return Err(KeysError::NoValidGeneration);
        }

        let mut pairs = Vec::with_capacity(self.generations.len());
        for generation in self.generations.keys() {
            pairs.push((*generation, self.key_for_generation(*generation)?));
        }

        let wrapped = wrap_to_members(&pairs, members)?;
        let mut msg = KeyMessage {
            group: self.group,
            generation: self.current_generation(),
            supplement: true,
            wrapped,
            signature: [0u8; 64],
        };
        msg.signature = sign_digest(&msg.signable_bytes()?, admin_secret);
        Ok(msg)
    }

    /// Fold a received key message into local state. The member's X25519
    /// secret unwraps the material addressed to them.
    ///
    /// A second, different key arriving for an existing generation is a
    /// collision from concurrent admin operations: it is retained (never an
    /// error — the deterministic winner keeps everyone decrypting alike) and
    /// `needs_rekey` reports it until a higher generation lands.
    pub fn merge_key_message(
        &mut self,
        msg: &KeyMessage,
        member: &AccountId,
        member_secret: &[u8; 32],
    ) -> Result<bool> {
        msg.verify(&self.group)?;

        let wrapped = msg
            .wrapped
            .iter()
            .find(|w| w.member == *member)
            .ok_or(KeysError::UnwrapFailed)?;

        let pairs = unwrap_pairs(wrapped, member_secret)?;
        let mut changed = false;
        for (generation, material) in pairs {
            if self.insert_material(generation, material) {
                changed = true;
            }
        }

        if self.needs_rekey() {
            log::warn!(
                "{:?}: key collision at generation {}",
                self.group,
                self.current_generation()
            );
        }
        Ok(changed)
    }

    /// Insert material for a generation. Returns true if it was new.
    fn insert_material(&mut self, generation: u64, material: [u8; 32]) -> bool {
        let entries = self.generations.entry(generation).or_default();
        if entries.iter().any(|e| e.material == material) {
            return false;
        }
        entries.push(KeyEntry { material });
        true
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    /// Serialize the generation map for the group-keys dump.
    pub fn dump_state(&self) -> Result<Vec<u8>> {
        let flat: Vec<(u64, Vec<[u8; 32]>)> = self
            .generations
            .iter()
            .map(|(generation, entries)| {
                (*generation, entries.iter().map(|e| e.material).collect())
            })
            .collect();
        bincode::serialize(&flat).map_err(|e| KeysError::Encode(e.to_string()))
    }

    /// Restore key state from a persisted dump blob.
    pub fn load_state(group: GroupId, blob: &[u8]) -> Result<Self> {
        let flat: Vec<(u64, Vec<[u8; 32]>)> =
            bincode::deserialize(blob).map_err(|e| KeysError::Encode(e.to_string()))?;
        let mut keys = GroupKeys::new(group);
        for (generation, materials) in flat {
            for material in materials {
                keys.insert_material(generation, material);
            }
        }
        Ok(keys)
    }
}

// ---------------------------------------------------------------------------
// Member wrapping (X25519 + XChaCha20-Poly1305)
// ---------------------------------------------------------------------------

fn wrap_key_from_shared(shared: &[u8; 32]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new_derive_key("quilt-key-wrap");
    hasher.update(shared);
    *hasher.finalize().as_bytes()
}

fn wrap_to_members(
    pairs: &[(u64, [u8; 32])],
    members: &[(AccountId, [u8; 32])],
) -> Result<Vec<WrappedKey>> {
    let plaintext = bincode::serialize(pairs).map_err(|e| KeysError::Encode(e.to_string()))?;

    let mut wrapped = Vec::with_capacity(members.len());
    for (member, member_pub) in members {
        let ephemeral = StaticSecret::random_from_rng(rand_core::OsRng);
        let ephemeral_pub = PublicKey::from(&ephemeral).to_bytes();
        let shared = ephemeral.diffie_hellman(&PublicKey::from(*member_pub));
        let wrap_key = wrap_key_from_shared(shared.as_bytes());

        let sealed =
            encrypt_config(&plaintext, &wrap_key).map_err(|_| KeysError::UnwrapFailed)?;
        wrapped.push(WrappedKey {
            member: *member,
            ephemeral_pub,
            sealed,
        });
    }
    Ok(wrapped)
}

fn unwrap_pairs(wrapped: &WrappedKey, member_secret: &[u8; 32]) -> Result<Vec<(u64, [u8; 32])>> {
    let secret = StaticSecret::from(*member_secret);
    let shared = secret.diffie_hellman(&PublicKey::from(wrapped.ephemeral_pub));
    let wrap_key = wrap_key_from_shared(shared.as_bytes());

    let plaintext =
        decrypt_config(&wrapped.sealed, &wrap_key).map_err(|_| KeysError::UnwrapFailed)?;
    bincode::deserialize(&plaintext).map_err(|_| KeysError::UnwrapFailed)
}

// ---------------------------------------------------------------------------
// Subaccount tokens
// ---------------------------------------------------------------------------

type HmacSha256 = Hmac<Sha256>;

/// Issue a member's subaccount token: derived non-admin auth material that
/// lets the member authenticate to the swarm without the admin key.
pub fn subaccount_token(admin_secret: &[u8; 32], member: &AccountId) -> Result<[u8; 32]> {
    let mut mac = HmacSha256::new_from_slice(admin_secret)
        .map_err(|e| KeysError::Encode(e.to_string()))?;
    mac.update(b"quilt-subaccount");
    mac.update(member.as_bytes());
    let out = mac.finalize().into_bytes();
    let mut token = [0u8; 32];
    token.copy_from_slice(&out);
    Ok(token)
}

/// Constant-time check of a member's subaccount token.
pub fn verify_subaccount_token(
    admin_secret: &[u8; 32],
    member: &AccountId,
    token: &[u8; 32],
) -> bool {
    match subaccount_token(admin_secret, member) {
        Ok(expected) => expected.ct_eq(token).into(),
        Err(_) => false,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

/// Core identity types for the config sync engine.
///
/// - `AccountId`: 32-byte stable account identity (Ed25519 public key)
/// - `GroupId`: 32-byte group identifier (the group's Ed25519 public key)
/// - `ConvoKey`: conversation identity — account, group, or community room

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum IdError {
    #[error("Identity must be {expected} hex characters, got {got}")]
    InvalidLength { expected: usize, got: usize },

    #[error("Identity is not valid hex")]
    InvalidHex,
}

// ---------------------------------------------------------------------------
// AccountId
// ---------------------------------------------------------------------------

/// Stable account identity — the account's Ed25519 public key.
///
/// Rendered as 64 lowercase hex characters everywhere a string identity is
/// needed (store keys, dump owners, push job owners).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccountId(pub [u8; 32]);

impl AccountId {
    /// Create from raw public key bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        AccountId(bytes)
    }

    /// Return the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Hex-encode for display/storage.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Decode from a 64-character hex string. Malformed input is rejected
    /// with a typed error; no partial identity is ever produced.
    pub fn from_hex(s: &str) -> Result<Self, IdError> {
        if s.len() != 64 {
            return Err(IdError::InvalidLength {
                expected: 64,
                got: s.len(),
            });
        }
        let bytes = hex::decode(s).map_err(|_| IdError::InvalidHex)?;
        let mut id = [0u8; 32];
        id.copy_from_slice(&bytes);
        Ok(AccountId(id))
    }
}

impl Ord for AccountId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

impl PartialOrd for AccountId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AccountId({})", &self.to_hex()[..8])
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

// ---------------------------------------------------------------------------
// GroupId
// ---------------------------------------------------------------------------

/// Unique group identifier — the group's own Ed25519 public key.
///
/// The matching private key is the group admin secret: holding it is what
/// authorizes rekeys and membership rotation.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupId(pub [u8; 32]);

impl GroupId {
    /// Create from raw public key bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        GroupId(bytes)
    }

    /// Return the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Hex-encode for display/storage.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Decode from a 64-character hex string.
    pub fn from_hex(s: &str) -> Result<Self, IdError> {
        if s.len() != 64 {
            return Err(IdError::InvalidLength {
                expected: 64,
                got: s.len(),
            });
        }
        let bytes = hex::decode(s).map_err(|_| IdError::InvalidHex)?;
        let mut id = [0u8; 32];
        id.copy_from_slice(&bytes);
        Ok(GroupId(id))
    }
}

impl Ord for GroupId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

impl PartialOrd for GroupId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GroupId({}..)", &self.to_hex()[..12])
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

// ---------------------------------------------------------------------------
// ConvoKey
// ---------------------------------------------------------------------------

/// Conversation identity for volatile read-state records.
///
/// Communities are keyed by `(server, room)`; the room token is lowercased in
/// the key so that two casings of the same room converge to one record, while
/// the display casing lives in the user-groups record.
#[derive(Clone, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub enum ConvoKey {
    Contact(AccountId),
    Group(GroupId),
    Community { server: String, room: String },
}

impl ConvoKey {
    /// Canonical string key for the namespace store.
    pub fn to_key_string(&self) -> String {
        match self {
            ConvoKey::Contact(id) => id.to_hex(),
            ConvoKey::Group(id) => format!("g.{}", id.to_hex()),
            ConvoKey::Community { server, room } => {
                format!("c.{}/{}", server.to_lowercase(), room.to_lowercase())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

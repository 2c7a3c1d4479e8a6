/// Typed config records — one shape per namespace.
///
/// Records are the unit of replication inside a namespace: CBOR-encoded via
/// ciborium (compact, serde-native), validated against the byte limits before
/// they enter a store, and merged record-against-record with commutative
/// semantics (LWW on the embedded `updated_ms` timestamp with a BLAKE3
/// tie-break, max-merge for monotonic fields).
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

use crate::config::limits::{
    MAX_AUTH_DATA_BYTES, MAX_COMMUNITY_URL_BYTES, MAX_DESCRIPTION_BYTES, MAX_NAME_BYTES,
    MAX_NICKNAME_BYTES, MAX_ROOM_BYTES, MAX_URL_BYTES,
};
use crate::ids::{AccountId, ConvoKey, GroupId};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum RecordError {
    #[error("Field `{field}` exceeds max size ({size} > {max} bytes)")]
    FieldTooLarge {
        field: &'static str,
        size: usize,
        max: usize,
    },

    #[error("Malformed record key: {0}")]
    MalformedKey(String),

    #[error("CBOR encoding failed: {0}")]
    Encode(String),

    #[error("CBOR decoding failed: {0}")]
    Decode(String),
}

// ---------------------------------------------------------------------------
// CBOR helpers
// ---------------------------------------------------------------------------

/// CBOR-encode a record to bytes.
pub fn encode_record<T: Serialize>(value: &T) -> Result<Vec<u8>, RecordError> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| RecordError::Encode(e.to_string()))?;
    Ok(buf)
}

/// CBOR-decode a record from bytes.
pub fn decode_record<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, RecordError> {
    ciborium::from_reader(bytes).map_err(|e| RecordError::Decode(e.to_string()))
}

fn check_len(field: &'static str, value: &str, max: usize) -> Result<(), RecordError> {
    if value.len() > max {
        return Err(RecordError::FieldTooLarge {
            field,
            size: value.len(),
            max,
        });
    }
    Ok(())
}

/// Deterministic LWW winner: true if `remote` supersedes `local`.
///
/// Higher `updated_ms` wins; on a tie the record with the larger BLAKE3 hash
/// of its encoding wins, so every replica picks the same side regardless of
/// arrival order.
pub(crate) fn remote_wins<T: Serialize>(
    local: &T,
    local_ms: u64,
    remote: &T,
    remote_ms: u64,
) -> bool {
    if remote_ms != local_ms {
        return remote_ms > local_ms;
    }
    let local_hash = encode_record(local).map(|b| *blake3::hash(&b).as_bytes());
    let remote_hash = encode_record(remote).map(|b| *blake3::hash(&b).as_bytes());
    match (local_hash, remote_hash) {
        (Ok(l), Ok(r)) => r > l,
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// ConfigRecord trait
// ---------------------------------------------------------------------------

/// The contract every namespace record satisfies.
pub trait ConfigRecord: Clone + Serialize + DeserializeOwned {
    /// Canonical store key (a stable string identity).
    fn key(&self) -> String;

    /// Zero-valued record with the key populated — the get-or-construct path.
    /// Fails only on a malformed key, never on absence.
    fn construct(key: &str) -> Result<Self, RecordError>;

    /// Enforce field byte limits. Called before a record enters a store.
    fn validate(&self) -> Result<(), RecordError>;

    /// Embedded logical change timestamp used for LWW reconciliation.
    fn updated_ms(&self) -> u64;

    /// Merge a remote copy of the same record into self.
    /// Returns true if self changed. Must be commutative and idempotent.
    fn merge_remote(&mut self, remote: &Self) -> bool {
        if remote_wins(self, self.updated_ms(), remote, remote.updated_ms()) {
            *self = remote.clone();
            true
        } else {
            false
        }
    }
}

// ---------------------------------------------------------------------------
// Shared field types
// ---------------------------------------------------------------------------

/// Encrypted display picture: where it lives and how to decrypt it.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct DisplayPic {
    pub url: String,
    pub key: [u8; 32],
}

impl DisplayPic {
    fn validate(&self) -> Result<(), RecordError> {
        check_len("display_pic.url", &self.url, MAX_URL_BYTES)
    }
}

/// Disappearing-message mode.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ExpiryMode {
    #[default]
    None = 0,
    AfterSend = 1,
    AfterRead = 2,
}

/// Per-conversation disappearing-message policy.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub struct DisappearingPolicy {
    pub enabled: bool,
    pub duration_secs: u32,
    pub mode: ExpiryMode,
    /// Timestamp of the last policy change, for LWW across devices.
    pub last_changed_ms: u64,
}

/// Priority semantics shared by every pinnable conversation record:
/// negative = hidden, zero = visible unpinned, positive = pinned rank.
pub fn should_be_visible(priority: i32) -> bool {
    priority >= 0
}

/// The pin rank, if the priority pins the conversation.
pub fn pinned_rank(priority: i32) -> Option<u32> {
    (priority > 0).then_some(priority as u32)
}

// ---------------------------------------------------------------------------
// ContactRecord
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ContactRecord {
    pub account: AccountId,
    pub name: String,
    pub nickname: String,
    pub approved: bool,
    pub approved_me: bool,
    pub blocked: bool,
    pub display_pic: Option<DisplayPic>,
    pub expiry: DisappearingPolicy,
    pub priority: i32,
    pub created_ms: u64,
    pub updated_ms: u64,
}

impl ContactRecord {
    pub fn should_be_visible(&self) -> bool {
        should_be_visible(self.priority)
    }
}

impl ConfigRecord for ContactRecord {
    fn key(&self) -> String {
        self.account.to_hex()
    }

    fn construct(key: &str) -> Result<Self, RecordError> {
        let account =
            AccountId::from_hex(key).map_err(|e| RecordError::MalformedKey(e.to_string()))?;
        Ok(ContactRecord {
            account,
            name: String::new(),
            nickname: String::new(),
            approved: false,
            approved_me: false,
            blocked: false,
            display_pic: None,
            expiry: DisappearingPolicy::default(),
            priority: 0,
            created_ms: 0,
            updated_ms: 0,
        })
    }

    fn validate(&self) -> Result<(), RecordError> {
        check_len("name", &self.name, MAX_NAME_BYTES)?;
        check_len("nickname", &self.nickname, MAX_NICKNAME_BYTES)?;
        if let Some(pic) = &self.display_pic {
            pic.validate()?;
        }
        Ok(())
    }

    fn updated_ms(&self) -> u64 {
        self.updated_ms
    }
}

// ---------------------------------------------------------------------------
// UserProfileRecord
// ---------------------------------------------------------------------------

/// The user's own synced profile. A single-record namespace keyed by the
/// constant `"profile"`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct UserProfileRecord {
    pub name: String,
    pub display_pic: Option<DisplayPic>,
    /// Note-to-self visibility/pin ordering.
    pub nts_priority: i32,
    /// Note-to-self disappearing-message expiry.
    pub nts_expiry_secs: u32,
    pub blinded_message_requests: bool,
    pub community_message_requests: bool,
    pub updated_ms: u64,
}

pub const USER_PROFILE_KEY: &str = "profile";

impl ConfigRecord for UserProfileRecord {
    fn key(&self) -> String {
        USER_PROFILE_KEY.to_string()
    }

    fn construct(key: &str) -> Result<Self, RecordError> {
        if key != USER_PROFILE_KEY {
            return Err(RecordError::MalformedKey(key.to_string()));
        }
        Ok(UserProfileRecord {
            name: String::new(),
            display_pic: None,
            nts_priority: 0,
            nts_expiry_secs: 0,
            blinded_message_requests: false,
            community_message_requests: false,
            updated_ms: 0,
        })
    }

    fn validate(&self) -> Result<(), RecordError> {
        check_len("name", &self.name, MAX_NAME_BYTES)?;
        if let Some(pic) = &self.display_pic {
            pic.validate()?;
        }
        Ok(())
    }

    fn updated_ms(&self) -> u64 {
        self.updated_ms
    }
}

// ---------------------------------------------------------------------------
// GroupInfoRecord
// ---------------------------------------------------------------------------

/// Shared group metadata. A single-record namespace per group, keyed by the
/// group id.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct GroupInfoRecord {
    pub group: GroupId,
    pub name: String,
    pub description: String,
    pub display_pic: Option<DisplayPic>,
    pub created_ms: u64,
    pub expiry: DisappearingPolicy,
    /// Retention cutoff: messages older than this are purged on merge.
    pub delete_before_ms: u64,
    /// Retention cutoff for attachments, independent of messages.
    pub attach_delete_before_ms: u64,
    pub destroyed: bool,
    pub updated_ms: u64,
}

impl ConfigRecord for GroupInfoRecord {
    fn key(&self) -> String {
        self.group.to_hex()
    }

    fn construct(key: &str) -> Result<Self, RecordError> {
        let group =
            GroupId::from_hex(key).map_err(|e| RecordError::MalformedKey(e.to_string()))?;
        Ok(GroupInfoRecord {
            group,
            name: String::new(),
            description: String::new(),
            display_pic: None,
            created_ms: 0,
            expiry: DisappearingPolicy::default(),
            delete_before_ms: 0,
            attach_delete_before_ms: 0,
            destroyed: false,
            updated_ms: 0,
        })
    }

    fn validate(&self) -> Result<(), RecordError> {
        check_len("name", &self.name, MAX_NAME_BYTES)?;
        check_len("description", &self.description, MAX_DESCRIPTION_BYTES)?;
        if let Some(pic) = &self.display_pic {
            pic.validate()?;
        }
        Ok(())
    }

    fn updated_ms(&self) -> u64 {
        self.updated_ms
    }

    /// LWW on the record body, but retention cutoffs only ever advance and a
    /// destroyed group stays destroyed, whichever side said so.
    fn merge_remote(&mut self, remote: &Self) -> bool {
        let delete_before = self.delete_before_ms.max(remote.delete_before_ms);
        let attach_delete_before = self
            .attach_delete_before_ms
            .max(remote.attach_delete_before_ms);
        let destroyed = self.destroyed || remote.destroyed;

        let mut changed = if remote_wins(self, self.updated_ms, remote, remote.updated_ms) {
            *self = remote.clone();
            true
        } else {
            false
        };

        if self.delete_before_ms != delete_before
            || self.attach_delete_before_ms != attach_delete_before
            || self.destroyed != destroyed
        {
            self.delete_before_ms = delete_before;
            self.attach_delete_before_ms = attach_delete_before;
            self.destroyed = destroyed;
            changed = true;
        }
        changed
    }
}

// ---------------------------------------------------------------------------
// GroupMemberRecord
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum MemberRole {
    #[default]
    Standard = 0,
    Admin = 1,
}

/// Tri-state tracking for the invitation and promotion workflows.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum PendingStatus {
    #[default]
    NotPending = 0,
    Pending = 1,
    Failed = 2,
}

/// Tri-state removal marker. `RemovedWithMessages` additionally purges the
/// member's message history; `Removed` only hides the member.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum RemovedStatus {
    #[default]
    NotRemoved = 0,
    Removed = 1,
    RemovedWithMessages = 2,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct GroupMemberRecord {
    pub account: AccountId,
    pub name: String,
    pub display_pic: Option<DisplayPic>,
    pub role: MemberRole,
    /// Invitation workflow state, independent of promotion and removal.
    pub invited: PendingStatus,
    /// Promotion (to admin) workflow state.
    pub promoted: PendingStatus,
    pub removed: RemovedStatus,
    pub updated_ms: u64,
}

impl GroupMemberRecord {
    /// Whether the member currently counts as present in the group.
    pub fn is_active(&self) -> bool {
        self.removed == RemovedStatus::NotRemoved && self.invited != PendingStatus::Failed
    }
}

impl ConfigRecord for GroupMemberRecord {
    fn key(&self) -> String {
        self.account.to_hex()
    }

    fn construct(key: &str) -> Result<Self, RecordError> {
        let account =
            AccountId::from_hex(key).map_err(|e| RecordError::MalformedKey(e.to_string()))?;
        Ok(GroupMemberRecord {
            account,
            name: String::new(),
            display_pic: None,
            role: MemberRole::Standard,
            invited: PendingStatus::NotPending,
            promoted: PendingStatus::NotPending,
            removed: RemovedStatus::NotRemoved,
            updated_ms: 0,
        })
    }

    fn validate(&self) -> Result<(), RecordError> {
        check_len("name", &self.name, MAX_NAME_BYTES)?;
        if let Some(pic) = &self.display_pic {
            pic.validate()?;
        }
        Ok(())
    }

    fn updated_ms(&self) -> u64 {
        self.updated_ms
    }
}

// ---------------------------------------------------------------------------
// VolatileRecord
// ---------------------------------------------------------------------------

/// Per-conversation read-state, synchronized separately from the message
/// history itself.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct VolatileRecord {
    pub convo: ConvoKey,
    /// Monotonic under merge: max-merge, never regresses.
    pub last_read_ms: u64,
    /// Manual unread override.
    pub unread: bool,
    pub updated_ms: u64,
}

impl ConfigRecord for VolatileRecord {
    fn key(&self) -> String {
        self.convo.to_key_string()
    }

    fn construct(key: &str) -> Result<Self, RecordError> {
        let convo = if let Some(rest) = key.strip_prefix("g.") {
            ConvoKey::Group(
                GroupId::from_hex(rest).map_err(|e| RecordError::MalformedKey(e.to_string()))?,
            )
        } else if let Some(rest) = key.strip_prefix("c.") {
            let (server, room) = rest
                .rsplit_once('/')
                .ok_or_else(|| RecordError::MalformedKey(key.to_string()))?;
            ConvoKey::Community {
                server: server.to_string(),
                room: room.to_string(),
            }
        } else {
            ConvoKey::Contact(
                AccountId::from_hex(key).map_err(|e| RecordError::MalformedKey(e.to_string()))?,
            )
        };
        Ok(VolatileRecord {
            convo,
            last_read_ms: 0,
            unread: false,
            updated_ms: 0,
        })
    }

    fn validate(&self) -> Result<(), RecordError> {
        if let ConvoKey::Community { server, room } = &self.convo {
            check_len("server", server, MAX_COMMUNITY_URL_BYTES)?;
            check_len("room", room, MAX_ROOM_BYTES)?;
        }
        Ok(())
    }

    fn updated_ms(&self) -> u64 {
        self.updated_ms
    }

    /// Field-wise merge: `last_read_ms` takes the max, `unread` follows the
    /// newer write (OR on an exact tie, which is commutative).
    fn merge_remote(&mut self, remote: &Self) -> bool {
        let mut changed = false;

        if remote.last_read_ms > self.last_read_ms {
            self.last_read_ms = remote.last_read_ms;
            changed = true;
        }

        let unread = if remote.updated_ms > self.updated_ms {
            remote.unread
        } else if remote.updated_ms == self.updated_ms {
            self.unread || remote.unread
        } else {
            self.unread
        };
        if unread != self.unread {
            self.unread = unread;
            changed = true;
        }

        if remote.updated_ms > self.updated_ms {
            self.updated_ms = remote.updated_ms;
            changed = true;
        }

        changed
    }
}

// ---------------------------------------------------------------------------
// UserGroupRecord
// ---------------------------------------------------------------------------

/// What the record points at: a group, a community room, or a legacy group.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum GroupTarget {
    Group { id: GroupId, auth: GroupAuth },
    Community {
        server: String,
        room: String,
        pubkey: [u8; 32],
    },
    LegacyGroup { id: AccountId },
}

/// Group membership/auth material. The raw admin secret outranks derived
/// member auth data: once either side of a merge has seen the secret, the
/// merged record keeps it.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum GroupAuth {
    Admin { group_secret: [u8; 32] },
    Member { auth_data: Vec<u8> },
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct UserGroupRecord {
    pub target: GroupTarget,
    pub priority: i32,
    pub joined_ms: u64,
    pub updated_ms: u64,
}

impl UserGroupRecord {
    pub fn should_be_visible(&self) -> bool {
        should_be_visible(self.priority)
    }

    pub fn pinned_rank(&self) -> Option<u32> {
        pinned_rank(self.priority)
    }
}

impl ConfigRecord for UserGroupRecord {
    fn key(&self) -> String {
        match &self.target {
            GroupTarget::Group { id, .. } => format!("g.{}", id.to_hex()),
            GroupTarget::Community { server, room, .. } => {
                format!("c.{}/{}", server.to_lowercase(), room.to_lowercase())
            }
            GroupTarget::LegacyGroup { id } => format!("l.{}", id.to_hex()),
        }
    }

    fn construct(key: &str) -> Result<Self, RecordError> {
        let target = if let Some(rest) = key.strip_prefix("g.") {
            GroupTarget::Group {
                id: GroupId::from_hex(rest)
                    .map_err(|e| RecordError::MalformedKey(e.to_string()))?,
                auth: GroupAuth::Member { auth_data: vec![] },
            }
        } else if let Some(rest) = key.strip_prefix("c.") {
            let (server, room) = rest
                .rsplit_once('/')
                .ok_or_else(|| RecordError::MalformedKey(key.to_string()))?;
            GroupTarget::Community {
                server: server.to_string(),
                room: room.to_string(),
                pubkey: [0u8; 32],
            }
        } else if let Some(rest) = key.strip_prefix("l.") {
            GroupTarget::LegacyGroup {
                id: AccountId::from_hex(rest)
                    .map_err(|e| RecordError::MalformedKey(e.to_string()))?,
            }
        } else {
            return Err(RecordError::MalformedKey(key.to_string()));
        };
        Ok(UserGroupRecord {
            target,
            priority: 0,
            joined_ms: 0,
            updated_ms: 0,
        })
    }

    fn validate(&self) -> Result<(), RecordError> {
        match &self.target {
            GroupTarget::Community { server, room, .. } => {
                check_len("server", server, MAX_COMMUNITY_URL_BYTES)?;
                check_len("room", room, MAX_ROOM_BYTES)?;
            }
            GroupTarget::Group { auth, .. } => {
                if let GroupAuth::Member { auth_data } = auth {
                    if auth_data.len() > MAX_AUTH_DATA_BYTES {
                        return Err(RecordError::FieldTooLarge {
                            field: "auth_data",
                            size: auth_data.len(),
                            max: MAX_AUTH_DATA_BYTES,
                        });
                    }
                }
            }
            GroupTarget::LegacyGroup { .. } => {}
        }
        Ok(())
    }

    fn updated_ms(&self) -> u64 {
        self.updated_ms
    }

    /// LWW on the record body, except that an admin secret survives the merge
    /// no matter which side carried it.
    fn merge_remote(&mut self, remote: &Self) -> bool {
        let admin_auth = match (&self.target, &remote.target) {
            (GroupTarget::Group { auth, .. }, _) if matches!(auth, GroupAuth::Admin { .. }) => {
                Some(auth.clone())
            }
            (_, GroupTarget::Group { auth, .. }) if matches!(auth, GroupAuth::Admin { .. }) => {
                Some(auth.clone())
            }
            _ => None,
        };

        let mut changed = if remote_wins(self, self.updated_ms, remote, remote.updated_ms) {
            *self = remote.clone();
            true
        } else {
            false
        };

        if let (GroupTarget::Group { auth, .. }, Some(admin)) = (&mut self.target, admin_auth) {
            if !matches!(auth, GroupAuth::Admin { .. }) {
                *auth = admin;
                changed = true;
            }
        }
        changed
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

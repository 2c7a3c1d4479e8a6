/// Config namespaces — independently-mergeable replicated state categories.
///
/// Every synchronized category (user profile, contacts, read-state, group
/// list, per-group info/members/keys) is one namespace: its own store, its own
/// encryption key, its own dump, its own push cadence. A corrupt or missing
/// namespace never blocks the others.
///
/// # Module structure
/// - `limits` — byte budgets and the defensive iteration ceiling
/// - `records` — one typed record shape per namespace, CBOR-encoded
/// - `store` — generic keyed store with single-commit mutation scopes
/// - `merge` — remote-config reconciliation, dumps, and push bookkeeping

pub mod limits;
pub mod merge;
pub mod records;
pub mod store;

use serde::{Deserialize, Serialize};

pub use limits::{check_budget, BudgetStatus, CIPHERTEXT_BUDGET_BYTES, LOOP_LIMIT};
pub use merge::{Dump, MergeReport, PushPayload, RemoteConfig};
pub use records::{
    ConfigRecord, ContactRecord, DisappearingPolicy, DisplayPic, ExpiryMode, GroupAuth,
    GroupInfoRecord, GroupMemberRecord, GroupTarget, MemberRole, PendingStatus, RecordError,
    RemovedStatus, UserGroupRecord, UserProfileRecord, VolatileRecord, USER_PROFILE_KEY,
};
pub use store::{MutationScope, NamespaceStore, RecordIter, StoreError};

// ---------------------------------------------------------------------------
// Namespace
// ---------------------------------------------------------------------------

/// The independently-mergeable config categories.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Namespace {
    UserProfile = 0,
    Contacts = 1,
    ConvoInfoVolatile = 2,
    UserGroups = 3,
    GroupInfo = 4,
    GroupMembers = 5,
    GroupKeys = 6,
}

impl Namespace {
    /// String name for key derivation, dump tagging, and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Namespace::UserProfile => "UserProfile",
            Namespace::Contacts => "Contacts",
            Namespace::ConvoInfoVolatile => "ConvoInfoVolatile",
            Namespace::UserGroups => "UserGroups",
            Namespace::GroupInfo => "GroupInfo",
            Namespace::GroupMembers => "GroupMembers",
            Namespace::GroupKeys => "GroupKeys",
        }
    }

    /// Returns true for namespaces scoped to one group rather than the user.
    pub fn is_group_namespace(&self) -> bool {
        matches!(
            self,
            Namespace::GroupInfo | Namespace::GroupMembers | Namespace::GroupKeys
        )
    }

    /// All user-level namespaces, in dump order.
    pub fn user_namespaces() -> [Namespace; 4] {
        [
            Namespace::UserProfile,
            Namespace::Contacts,
            Namespace::ConvoInfoVolatile,
            Namespace::UserGroups,
        ]
    }
}

//! # Quilt
//!
//! **A conflict-free multi-device configuration sync engine for decentralized
//! messengers.**
//!
//! Quilt keeps a user's configuration — profile, contacts, read-state, group
//! list, and per-group info/members/keys — converged across any number of
//! devices without a coordinating server. Each category is an independently
//! mergeable namespace: devices mutate locally, push encrypted snapshots to a
//! swarm of storage servers, and fold every snapshot they fetch back in.
//! Merging is deterministic and commutative, so any arrival order of the same
//! messages produces the same state on every device.
//!
//! ## Quick Start
//!
//! ```rust
//! use quilt::context::EngineContext;
//! use quilt::engine::ConfigEngine;
//!
//! let ctx = EngineContext::system();
//! let engine = ConfigEngine::new([7u8; 32]);
//! let (group_id, _admin_key) = engine.create_group(&ctx, "Reading club").unwrap();
//! assert!(!engine.group_ids().is_empty());
//! # let _ = group_id;
//! ```
//!
//! ## Architecture
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`ids`] | Account/group/conversation identity types |
//! | [`config`] | Namespaces, typed records, stores, merge & dump engine |
//! | [`keys`] | Group key generations, rekeying, supplemental key issuance |
//! | [`crypto`] | Config encryption, key derivation, admin signing |
//! | [`community`] | Community join-URL codec |
//! | [`push`] | Push scheduling and the swarm transport contract |
//! | [`reconcile`] | Database reconciliation interface and retention policy |
//! | [`engine`] | The per-account engine handle, locking, group lifecycle |
//! | [`context`] | Explicit engine context (clock injection) |

pub mod community;
pub mod config;
pub mod context;
pub mod crypto;
pub mod engine;
pub mod ids;
pub mod keys;
pub mod push;
pub mod reconcile;

// Re-export the main types for convenience
pub use community::{community_url, parse_community, CommunityAddress};
pub use config::{
    ConfigRecord, ContactRecord, Dump, GroupInfoRecord, GroupMemberRecord, MergeReport, Namespace,
    NamespaceStore, PushPayload, RemoteConfig, StoreError, UserGroupRecord, UserProfileRecord,
    VolatileRecord,
};
pub use context::{Clock, EngineContext, SystemClock};
pub use engine::{ConfigEngine, EngineError, GroupConfig, UserConfigs};
pub use ids::{AccountId, ConvoKey, GroupId, IdError};
pub use keys::{GroupKeys, KeyMessage, KeysError};
pub use push::{PushQueue, PushReceipt, SwarmTransport, TransportError};
pub use reconcile::{ConfigObserver, MessageStore, RetentionOutcome, CHANGE_BUFFER_MS};

// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get library version
pub fn get_version() -> &'static str {
    VERSION
}

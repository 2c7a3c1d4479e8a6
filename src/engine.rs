/// The config engine — one opaque handle per account, owning every namespace
/// store behind per-identity locks.
///
/// Locking model: one exclusive lock for the user-level namespaces, one per
/// group for the group namespaces. Every mutation scope is a blocking
/// critical section; read accessors take the lock briefly; network I/O never
/// runs while a lock is held (push payloads are built under the lock, sent
/// outside it, and confirmed under the lock again).
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;
use zeroize::Zeroize;

use crate::config::merge::{Dump, PushPayload, RemoteConfig};
use crate::config::records::{
    ConfigRecord, ContactRecord, GroupAuth, GroupInfoRecord, GroupMemberRecord, GroupTarget,
    MemberRole, PendingStatus, RecordError, UserGroupRecord, UserProfileRecord, VolatileRecord,
};
use crate::config::store::{NamespaceStore, StoreError};
use crate::config::Namespace;
use crate::context::EngineContext;
use crate::crypto::encryption::derive_namespace_key;
use crate::crypto::signing::{derive_public_key, generate_keypair};
use crate::ids::{AccountId, ConvoKey, GroupId, IdError};
use crate::keys::{GroupKeys, KeyMessage, KeysError};
use crate::push::{PushQueue, SwarmTransport, TransportError};
use crate::reconcile::ConfigObserver;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Record error: {0}")]
    Record(#[from] RecordError),

    #[error("Keys error: {0}")]
    Keys(#[from] KeysError),

    #[error("Identity error: {0}")]
    Id(#[from] IdError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Unknown group {0:?}")]
    GroupNotFound(GroupId),

    #[error("Namespace {0:?} is not valid for this operation")]
    InvalidNamespace(Namespace),
}

pub type Result<T> = std::result::Result<T, EngineError>;

// ---------------------------------------------------------------------------
// Namespace bundles
// ---------------------------------------------------------------------------

/// The user-level namespaces, guarded together by one lock.
pub struct UserConfigs {
    pub profile: NamespaceStore<UserProfileRecord>,
    pub contacts: NamespaceStore<ContactRecord>,
    pub volatile: NamespaceStore<VolatileRecord>,
    pub user_groups: NamespaceStore<UserGroupRecord>,
}

impl UserConfigs {
    fn new() -> Self {
        UserConfigs {
            profile: NamespaceStore::new(Namespace::UserProfile),
            contacts: NamespaceStore::new(Namespace::Contacts),
            volatile: NamespaceStore::new(Namespace::ConvoInfoVolatile),
            user_groups: NamespaceStore::new(Namespace::UserGroups),
        }
    }
}

/// One group's namespaces, guarded together by the group's lock.
pub struct GroupConfig {
    pub info: NamespaceStore<GroupInfoRecord>,
    pub members: NamespaceStore<GroupMemberRecord>,
    pub keys: GroupKeys,
}

impl GroupConfig {
    fn new(group: GroupId) -> Self {
        GroupConfig {
            info: NamespaceStore::new(Namespace::GroupInfo),
            members: NamespaceStore::new(Namespace::GroupMembers),
            keys: GroupKeys::new(group),
        }
    }

    /// Symmetric key protecting this group's info/member configs. Only
    /// derivable once key material for the current generation exists —
    /// plaintext group records are meaningless without it.
    pub fn namespace_key(&self, namespace: Namespace) -> Result<[u8; 32]> {
        let group_key = self.keys.group_key()?;
        Ok(derive_namespace_key(&group_key, namespace))
    }
}

// ---------------------------------------------------------------------------
// ConfigEngine
// ---------------------------------------------------------------------------

pub struct ConfigEngine {
    account: AccountId,
    seed: [u8; 32],
    /// X25519 secret for receiving wrapped group keys.
    enc_secret: [u8; 32],
    user: Mutex<UserConfigs>,
    groups: Mutex<BTreeMap<GroupId, Arc<Mutex<GroupConfig>>>>,
    push_queue: Mutex<PushQueue>,
}

fn lock_recovering<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Drop for ConfigEngine {
    fn drop(&mut self) {
        self.seed.zeroize();
        self.enc_secret.zeroize();
    }
}

impl ConfigEngine {
    /// Create the engine handle from the account's 32-byte signing seed.
    pub fn new(seed: [u8; 32]) -> Self {
        let account = AccountId::from_bytes(derive_public_key(&seed));
        let enc_secret = *blake3::Hasher::new_derive_key("quilt-enc-key")
            .update(&seed)
            .finalize()
            .as_bytes();
        ConfigEngine {
            account,
            seed,
            enc_secret,
            user: Mutex::new(UserConfigs::new()),
            groups: Mutex::new(BTreeMap::new()),
            push_queue: Mutex::new(PushQueue::new()),
        }
    }

    pub fn account(&self) -> AccountId {
        self.account
    }

    /// X25519 public key other members wrap group keys to.
    pub fn encryption_public_key(&self) -> [u8; 32] {
        x25519_dalek::PublicKey::from(&x25519_dalek::StaticSecret::from(self.enc_secret))
            .to_bytes()
    }

    /// Symmetric key for one of this account's own namespaces.
    pub fn user_namespace_key(&self, namespace: Namespace) -> [u8; 32] {
        derive_namespace_key(&self.seed, namespace)
    }

    /// Run a closure against the user-level namespaces under their lock.
    /// The closure is a blocking critical section: no I/O inside.
    pub fn with_user<T>(&self, f: impl FnOnce(&mut UserConfigs) -> Result<T>) -> Result<T> {
        let mut guard = lock_recovering(&self.user);
        f(&mut guard)
    }

    /// Run a closure against one group's namespaces under the group's lock.
    pub fn with_group<T>(
        &self,
        group: GroupId,
        f: impl FnOnce(&mut GroupConfig) -> Result<T>,
    ) -> Result<T> {
        let entry = {
            let groups = lock_recovering(&self.groups);
            groups
                .get(&group)
                .cloned()
                .ok_or(EngineError::GroupNotFound(group))?
        };
        let mut guard = lock_recovering(&entry);
        f(&mut guard)
    }

    // -----------------------------------------------------------------------
    // Typed setters (the reconciliation layer's write-through path)
    // -----------------------------------------------------------------------

    /// Update (or create) a contact inside one mutation scope, stamping the
    /// record's timestamp from the context clock.
    pub fn update_contact(
        &self,
        ctx: &EngineContext,
        account: &AccountId,
        f: impl FnOnce(&mut ContactRecord),
    ) -> Result<()> {
        self.with_user(|user| {
            user.contacts.mutate(ctx, |tx| {
                let now = tx.now_ms();
                let record = tx.get_or_construct(&account.to_hex())?;
                f(record);
                record.updated_ms = now;
                if record.created_ms == 0 {
                    record.created_ms = now;
                }
                Ok(())
            })?;
            Ok(())
        })?;
        self.schedule_user_pushes();
        Ok(())
    }

    /// Update the user's own profile inside one mutation scope.
    pub fn update_profile(
        &self,
        ctx: &EngineContext,
        f: impl FnOnce(&mut UserProfileRecord),
    ) -> Result<()> {
        self.with_user(|user| {
            user.profile.mutate(ctx, |tx| {
                let now = tx.now_ms();
                let record = tx.get_or_construct(crate::config::records::USER_PROFILE_KEY)?;
                f(record);
                record.updated_ms = now;
                Ok(())
            })?;
            Ok(())
        })?;
        self.schedule_user_pushes();
        Ok(())
    }

    /// Advance a conversation's read marker. Monotonic: an older timestamp is
    /// a no-op rather than a regression.
    pub fn mark_read(&self, ctx: &EngineContext, convo: &ConvoKey, read_ms: u64) -> Result<()> {
        self.with_user(|user| {
            user.volatile.mutate(ctx, |tx| {
                let now = tx.now_ms();
                let record = tx.get_or_construct(&convo.to_key_string())?;
                if read_ms > record.last_read_ms {
                    record.last_read_ms = read_ms;
                }
                record.unread = false;
                record.updated_ms = now;
                Ok(())
            })?;
            Ok(())
        })?;
        self.schedule_user_pushes();
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Merging
    // -----------------------------------------------------------------------

    /// Merge remote configs into a user-level namespace. Returns how many
    /// configs were folded in; the observer hears about changed records once
    /// per successful merge.
    pub fn merge_user(
        &self,
        namespace: Namespace,
        incoming: &[RemoteConfig],
        observer: Option<&mut dyn ConfigObserver>,
    ) -> Result<usize> {
        if namespace.is_group_namespace() {
            return Err(EngineError::InvalidNamespace(namespace));
        }
        let key = self.user_namespace_key(namespace);
        let report = self.with_user(|user| {
            Ok(match namespace {
                Namespace::UserProfile => user.profile.merge(&key, incoming),
                Namespace::Contacts => user.contacts.merge(&key, incoming),
                Namespace::ConvoInfoVolatile => user.volatile.merge(&key, incoming),
                Namespace::UserGroups => user.user_groups.merge(&key, incoming),
                _ => unreachable!("group namespaces rejected above"),
            })
        })?;

        if let Some(observer) = observer {
            if !report.changed_keys.is_empty() {
                observer.on_namespace_merged(namespace, &report.changed_keys);
            }
        }
        Ok(report.configs_merged)
    }

    /// Merge remote configs into a group's info or members namespace.
    /// Requires valid key material for the group's current generation.
    pub fn merge_group(
        &self,
        group: GroupId,
        namespace: Namespace,
        incoming: &[RemoteConfig],
        observer: Option<&mut dyn ConfigObserver>,
    ) -> Result<usize> {
        let report = self.with_group(group, |gc| {
            let key = gc.namespace_key(namespace)?;
            Ok(match namespace {
                Namespace::GroupInfo => gc.info.merge(&key, incoming),
                Namespace::GroupMembers => gc.members.merge(&key, incoming),
                other => return Err(EngineError::InvalidNamespace(other)),
            })
        })?;

        if let Some(observer) = observer {
            if !report.changed_keys.is_empty() {
                observer.on_namespace_merged(namespace, &report.changed_keys);
            }
        }
        Ok(report.configs_merged)
    }

    /// Fold a received group key message into the group's key state.
    pub fn merge_group_keys(&self, group: GroupId, msg: &KeyMessage) -> Result<bool> {
        let account = self.account;
        let enc_secret = self.enc_secret;
        self.with_group(group, |gc| {
            Ok(gc.keys.merge_key_message(msg, &account, &enc_secret)?)
        })
    }

    // -----------------------------------------------------------------------
    // Group lifecycle
    // -----------------------------------------------------------------------

    /// Create a brand-new group: its info, members, and keys namespaces plus
    /// the first admin membership record, registered atomically. Returns the
    /// group id and its private admin key.
    pub fn create_group(&self, ctx: &EngineContext, name: &str) -> Result<(GroupId, [u8; 32])> {
        let (group_pub, group_secret) = generate_keypair();
        let group = GroupId::from_bytes(group_pub);

        // Build the whole group config before anything becomes visible.
        let mut gc = GroupConfig::new(group);
        let first_key =
            gc.keys
                .rekey(&group_secret, &[(self.account, self.encryption_public_key())])?;
        debug_assert!(!first_key.supplement);

        let now = ctx.clock.now_ms();
        gc.info.mutate(ctx, |tx| {
            let info = tx.get_or_construct(&group.to_hex())?;
            info.name = name.to_string();
            info.created_ms = now;
            info.updated_ms = now;
            // Re-validate with the caller-provided name.
            let checked = info.clone();
            checked.validate()?;
            Ok(())
        })?;
        gc.members.mutate(ctx, |tx| {
            let member = tx.get_or_construct(&self.account.to_hex())?;
            member.role = MemberRole::Admin;
            member.invited = PendingStatus::NotPending;
            member.promoted = PendingStatus::NotPending;
            member.updated_ms = now;
            Ok(())
        })?;

        // Register in user-groups with the admin secret.
        self.with_user(|user| {
            user.user_groups.mutate(ctx, |tx| {
                let record = tx.get_or_construct(&format!("g.{}", group.to_hex()))?;
                record.target = GroupTarget::Group {
                    id: group,
                    auth: GroupAuth::Admin { group_secret },
                };
                record.joined_ms = now;
                record.updated_ms = now;
                Ok(())
            })?;
            Ok(())
        })?;

        lock_recovering(&self.groups).insert(group, Arc::new(Mutex::new(gc)));
        self.schedule_user_pushes();
        self.schedule_group_pushes(group);

        log::debug!("created group {:?}", group);
        Ok((group, group_secret))
    }

    /// The group admin secret, if this account holds it.
    fn admin_secret(&self, group: GroupId) -> Result<[u8; 32]> {
        self.with_user(|user| {
            let key = format!("g.{}", group.to_hex());
            match user.user_groups.get(&key).map(|r| &r.target) {
                Some(GroupTarget::Group {
                    auth: GroupAuth::Admin { group_secret },
                    ..
                }) => Ok(*group_secret),
                _ => Err(EngineError::Keys(KeysError::AdminRequired)),
            }
        })
    }

    /// Advance the group's key generation and distribute the new material.
    /// Admin only; a transport failure surfaces as a typed rekey failure and
    /// is retried by the caller's own policy.
    pub fn rekey_group(
        &self,
        group: GroupId,
        members: &[(AccountId, [u8; 32])],
        transport: &dyn SwarmTransport,
    ) -> Result<u64> {
        let admin_secret = self.admin_secret(group)?;

        // Build and locally apply the key message under the group lock.
        let msg = self.with_group(group, |gc| Ok(gc.keys.rekey(&admin_secret, members)?))?;

        // Network send happens outside any lock.
        let payload = key_message_payload(&msg)?;
        transport
            .send_config(&group.to_hex(), &payload)
            .map_err(|e| EngineError::Keys(KeysError::RekeyFailed(e.to_string())))?;

        Ok(msg.generation)
    }

    /// Issue supplemental key material so newly added members can decrypt
    /// history, without advancing the generation for existing members.
    pub fn key_supplement(
        &self,
        group: GroupId,
        members: &[(AccountId, [u8; 32])],
        transport: &dyn SwarmTransport,
    ) -> Result<()> {
        let admin_secret = self.admin_secret(group)?;
        let msg =
            self.with_group(group, |gc| Ok(gc.keys.key_supplement(&admin_secret, members)?))?;

        let payload = key_message_payload(&msg)?;
        transport
            .send_config(&group.to_hex(), &payload)
            .map_err(|e| EngineError::Keys(KeysError::RekeyFailed(e.to_string())))?;
        Ok(())
    }

    /// Register a group we were invited to (non-admin auth material).
    pub fn add_group(
        &self,
        ctx: &EngineContext,
        group: GroupId,
        auth_data: Vec<u8>,
    ) -> Result<()> {
        self.with_user(|user| {
            user.user_groups.mutate(ctx, |tx| {
                let now = tx.now_ms();
                let record = tx.get_or_construct(&format!("g.{}", group.to_hex()))?;
                record.target = GroupTarget::Group {
                    id: group,
                    auth: GroupAuth::Member { auth_data },
                };
                if record.joined_ms == 0 {
                    record.joined_ms = now;
                }
                record.updated_ms = now;
                Ok(())
            })?;
            Ok(())
        })?;

        let mut groups = lock_recovering(&self.groups);
        groups
            .entry(group)
            .or_insert_with(|| Arc::new(Mutex::new(GroupConfig::new(group))));
        drop(groups);

        self.schedule_user_pushes();
        Ok(())
    }

    /// Tear down a group's info/members/keys namespaces together and remove
    /// it from the user's group list.
    pub fn destroy_group(&self, ctx: &EngineContext, group: GroupId) -> Result<()> {
        lock_recovering(&self.groups).remove(&group);
        self.with_user(|user| {
            user.user_groups.mutate(ctx, |tx| {
                tx.erase(&format!("g.{}", group.to_hex()));
                Ok(())
            })?;
            Ok(())
        })?;
        self.schedule_user_pushes();
        log::debug!("destroyed group {:?}", group);
        Ok(())
    }

    pub fn group_ids(&self) -> Vec<GroupId> {
        lock_recovering(&self.groups).keys().copied().collect()
    }

    // -----------------------------------------------------------------------
    // Push pipeline
    // -----------------------------------------------------------------------

    /// Schedule pushes for every user namespace that diverged. Deduplicated
    /// per owner, so any number of calls inside one logical transaction
    /// yields one job per namespace.
    pub fn schedule_user_pushes(&self) {
        let owner = self.account.to_hex();
        let user = lock_recovering(&self.user);
        let mut queue = lock_recovering(&self.push_queue);
        if user.profile.needs_push() {
            queue.schedule(&owner, Namespace::UserProfile);
        }
        if user.contacts.needs_push() {
            queue.schedule(&owner, Namespace::Contacts);
        }
        if user.volatile.needs_push() {
            queue.schedule(&owner, Namespace::ConvoInfoVolatile);
        }
        if user.user_groups.needs_push() {
            queue.schedule(&owner, Namespace::UserGroups);
        }
    }

    /// Schedule pushes for one group's diverged namespaces.
    pub fn schedule_group_pushes(&self, group: GroupId) {
        let owner = group.to_hex();
        let entry = {
            let groups = lock_recovering(&self.groups);
            match groups.get(&group) {
                Some(e) => e.clone(),
                None => return,
            }
        };
        let gc = lock_recovering(&entry);
        let mut queue = lock_recovering(&self.push_queue);
        if gc.info.needs_push() {
            queue.schedule(&owner, Namespace::GroupInfo);
        }
        if gc.members.needs_push() {
            queue.schedule(&owner, Namespace::GroupMembers);
        }
    }

    /// Drain the push queue against the transport. Payloads are built under
    /// the owning lock, sent with no lock held, and confirmed under the lock.
    /// Failed pushes are reported by count only and stay subject to the
    /// caller's retry policy (re-schedule + call again).
    pub fn process_pushes(&self, transport: &dyn SwarmTransport) -> usize {
        let mut pushed = 0;
        loop {
            let job = {
                let mut queue = lock_recovering(&self.push_queue);
                queue.next_job()
            };
            let Some((owner, namespace)) = job else { break };

            let result = self.push_one(&owner, namespace, transport);
            let success = result.is_ok();
            if let Err(e) = result {
                log::warn!("push {} {} failed: {}", owner, namespace.as_str(), e);
            } else {
                pushed += 1;
            }
            lock_recovering(&self.push_queue).complete(&owner, namespace, success);
        }
        pushed
    }

    fn push_one(
        &self,
        owner: &str,
        namespace: Namespace,
        transport: &dyn SwarmTransport,
    ) -> Result<()> {
        let payload = self.build_payload(owner, namespace)?;
        let receipt = transport.send_config(owner, &payload)?;
        self.confirm_payload(owner, namespace, payload.seqno, &receipt.hash)?;
        Ok(())
    }

    fn build_payload(&self, owner: &str, namespace: Namespace) -> Result<PushPayload> {
        if namespace.is_group_namespace() {
            let group = GroupId::from_hex(owner)?;
            self.with_group(group, |gc| {
                let key = gc.namespace_key(namespace)?;
                Ok(match namespace {
                    Namespace::GroupInfo => gc.info.push(&key)?,
                    Namespace::GroupMembers => gc.members.push(&key)?,
                    other => return Err(EngineError::InvalidNamespace(other)),
                })
            })
        } else {
            let key = self.user_namespace_key(namespace);
            self.with_user(|user| {
                Ok(match namespace {
                    Namespace::UserProfile => user.profile.push(&key)?,
                    Namespace::Contacts => user.contacts.push(&key)?,
                    Namespace::ConvoInfoVolatile => user.volatile.push(&key)?,
                    Namespace::UserGroups => user.user_groups.push(&key)?,
                    other => return Err(EngineError::InvalidNamespace(other)),
                })
            })
        }
    }

    fn confirm_payload(
        &self,
        owner: &str,
        namespace: Namespace,
        seqno: u64,
        hash: &str,
    ) -> Result<()> {
        if namespace.is_group_namespace() {
            let group = GroupId::from_hex(owner)?;
            self.with_group(group, |gc| {
                match namespace {
                    Namespace::GroupInfo => gc.info.confirm_pushed(seqno, hash),
                    Namespace::GroupMembers => gc.members.confirm_pushed(seqno, hash),
                    other => return Err(EngineError::InvalidNamespace(other)),
                }
                Ok(())
            })
        } else {
            self.with_user(|user| {
                match namespace {
                    Namespace::UserProfile => user.profile.confirm_pushed(seqno, hash),
                    Namespace::Contacts => user.contacts.confirm_pushed(seqno, hash),
                    Namespace::ConvoInfoVolatile => user.volatile.confirm_pushed(seqno, hash),
                    Namespace::UserGroups => user.user_groups.confirm_pushed(seqno, hash),
                    other => return Err(EngineError::InvalidNamespace(other)),
                }
                Ok(())
            })
        }
    }

    // -----------------------------------------------------------------------
    // Dumps
    // -----------------------------------------------------------------------

    /// Dump every namespace that needs persisting. A namespace that fails to
    /// serialize is logged and skipped; it never blocks the others.
    pub fn dump_all(&self, ctx: &EngineContext) -> Vec<Dump> {
        let mut dumps = Vec::new();
        let owner = self.account.to_hex();

        {
            let mut user = lock_recovering(&self.user);
            for result in [
                user.profile.dump(ctx, &owner),
                user.contacts.dump(ctx, &owner),
                user.volatile.dump(ctx, &owner),
                user.user_groups.dump(ctx, &owner),
            ] {
                match result {
                    Ok(dump) => dumps.push(dump),
                    Err(e) => log::warn!("dump failed: {}", e),
                }
            }
        }

        let entries: Vec<(GroupId, Arc<Mutex<GroupConfig>>)> = lock_recovering(&self.groups)
            .iter()
            .map(|(k, v)| (*k, v.clone()))
            .collect();
        for (group, entry) in entries {
            let group_owner = group.to_hex();
            let mut gc = lock_recovering(&entry);
            match gc.info.dump(ctx, &group_owner) {
                Ok(dump) => dumps.push(dump),
                Err(e) => log::warn!("group info dump failed: {}", e),
            }
            match gc.members.dump(ctx, &group_owner) {
                Ok(dump) => dumps.push(dump),
                Err(e) => log::warn!("group members dump failed: {}", e),
            }
            match gc.keys.dump_state() {
                Ok(blob) => dumps.push(Dump {
                    namespace: Namespace::GroupKeys,
                    owner: group_owner,
                    timestamp_ms: ctx.clock.now_ms(),
                    blob,
                }),
                Err(e) => log::warn!("group keys dump failed: {}", e),
            }
        }

        dumps
    }

    /// Restore namespaces from persisted dumps. Each dump recovers
    /// independently; failures are returned, not propagated, so one corrupt
    /// namespace never blocks the rest.
    pub fn load_dumps(&self, dumps: &[Dump]) -> Vec<(Namespace, String, EngineError)> {
        let mut failures = Vec::new();
        for dump in dumps {
            if let Err(e) = self.load_one(dump) {
                log::warn!(
                    "failed to restore {} for {}: {}",
                    dump.namespace.as_str(),
                    dump.owner,
                    e
                );
                failures.push((dump.namespace, dump.owner.clone(), e));
            }
        }
        failures
    }

    fn load_one(&self, dump: &Dump) -> Result<()> {
        if dump.namespace.is_group_namespace() {
            let group = GroupId::from_hex(&dump.owner)?;
            let entry = {
                let mut groups = lock_recovering(&self.groups);
                groups
                    .entry(group)
                    .or_insert_with(|| Arc::new(Mutex::new(GroupConfig::new(group))))
                    .clone()
            };
            let mut gc = lock_recovering(&entry);
            match dump.namespace {
                Namespace::GroupInfo => {
                    gc.info = NamespaceStore::load_dump(Namespace::GroupInfo, &dump.blob)?;
                }
                Namespace::GroupMembers => {
                    gc.members = NamespaceStore::load_dump(Namespace::GroupMembers, &dump.blob)?;
                }
                Namespace::GroupKeys => {
                    gc.keys = GroupKeys::load_state(group, &dump.blob)?;
                }
                other => return Err(EngineError::InvalidNamespace(other)),
            }
            Ok(())
        } else {
            self.with_user(|user| {
                match dump.namespace {
                    Namespace::UserProfile => {
                        user.profile = NamespaceStore::load_dump(Namespace::UserProfile, &dump.blob)?;
                    }
                    Namespace::Contacts => {
                        user.contacts = NamespaceStore::load_dump(Namespace::Contacts, &dump.blob)?;
                    }
                    Namespace::ConvoInfoVolatile => {
                        user.volatile =
                            NamespaceStore::load_dump(Namespace::ConvoInfoVolatile, &dump.blob)?;
                    }
                    Namespace::UserGroups => {
                        user.user_groups =
                            NamespaceStore::load_dump(Namespace::UserGroups, &dump.blob)?;
                    }
                    other => return Err(EngineError::InvalidNamespace(other)),
                }
                Ok(())
            })
        }
    }
}

/// A key message rides the group-keys namespace as-is: it is self-protecting
/// (per-member wrapping plus the admin signature), so new members can read it
/// before they hold any namespace key.
fn key_message_payload(msg: &KeyMessage) -> Result<PushPayload> {
    let bytes = bincode::serialize(msg)
        .map_err(|e| EngineError::Keys(KeysError::Encode(e.to_string())))?;
    Ok(PushPayload {
        namespace: Namespace::GroupKeys,
        seqno: msg.generation,
        ciphertext: bytes,
        obsolete_hashes: Vec::new(),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::push::PushReceipt;
    use std::cell::RefCell;

    fn ctx() -> EngineContext {
        EngineContext::for_tests(1_000_000)
    }

    fn engine() -> ConfigEngine {
        ConfigEngine::new([0x55u8; 32])
    }

    #[derive(Default)]
    struct RecordingTransport {
        sent: RefCell<Vec<(String, Namespace)>>,
        fail: bool,
    }

    impl SwarmTransport for RecordingTransport {
        fn send_config(
            &self,
            owner: &str,
            payload: &PushPayload,
        ) -> std::result::Result<PushReceipt, TransportError> {
            if self.fail {
                return Err(TransportError::Unreachable("offline".into()));
            }
            self.sent
                .borrow_mut()
                .push((owner.to_string(), payload.namespace));
            Ok(PushReceipt {
                hash: format!("hash-{}", self.sent.borrow().len()),
            })
        }

        fn delete_messages(
            &self,
            _owner: &str,
            _hashes: &[String],
        ) -> std::result::Result<(), TransportError> {
            Ok(())
        }
    }

    struct RecordingObserver {
        calls: Vec<(Namespace, Vec<String>)>,
    }

    impl ConfigObserver for RecordingObserver {
        fn on_namespace_merged(&mut self, namespace: Namespace, changed: &[String]) {
            self.calls.push((namespace, changed.to_vec()));
        }
    }

    #[test]
    fn test_create_group_initializes_all_namespaces() {
        let ctx = ctx();
        let eng = engine();
        let (group, secret) = eng.create_group(&ctx, "Test").unwrap();

        assert_eq!(derive_public_key(&secret), *group.as_bytes());

        eng.with_group(group, |gc| {
            let info = gc.info.get(&group.to_hex()).unwrap();
            assert_eq!(info.name, "Test");
            assert_eq!(info.created_ms, 1_000_000);

            let me = gc.members.get(&eng.account().to_hex()).unwrap();
            assert_eq!(me.role, MemberRole::Admin);

            assert_eq!(gc.keys.current_generation(), 1);
            assert!(gc.keys.group_key().is_ok());
            Ok(())
        })
        .unwrap();

        // Registered in user-groups with the admin secret.
        eng.with_user(|user| {
            let record = user.user_groups.get(&format!("g.{}", group.to_hex())).unwrap();
            match &record.target {
                GroupTarget::Group { auth, .. } => {
                    assert!(matches!(auth, GroupAuth::Admin { .. }))
                }
                other => panic!("unexpected target {:?}", other),
            }
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_group_namespaces_need_key_material() {
        let ctx = ctx();
        let eng = engine();
        let group = GroupId::from_bytes([7u8; 32]);
        eng.add_group(&ctx, group, vec![1, 2, 3]).unwrap();

        // No key material yet: group configs are not constructible.
        let err = eng
            .merge_group(group, Namespace::GroupInfo, &[], None)
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Keys(KeysError::NoValidGeneration)
        ));
    }

    #[test]
    fn test_mutation_schedules_single_push_and_confirm_clears() {
        let ctx = ctx();
        let eng = engine();
        let contact = AccountId::from_bytes([9u8; 32]);

        eng.update_contact(&ctx, &contact, |c| {
            c.name = "Ada".into();
            c.approved = true;
        })
        .unwrap();
        // Two edits in the same logical transaction: still one job.
        eng.update_contact(&ctx, &contact, |c| c.priority = 2)
            .unwrap();

        let transport = RecordingTransport::default();
        let pushed = eng.process_pushes(&transport);
        assert_eq!(pushed, 1);
        assert_eq!(
            transport.sent.borrow().as_slice(),
            &[(eng.account().to_hex(), Namespace::Contacts)]
        );

        eng.with_user(|user| {
            assert!(!user.contacts.needs_push());
            Ok(())
        })
        .unwrap();

        // Nothing further to push.
        assert_eq!(eng.process_pushes(&transport), 0);
    }

    #[test]
    fn test_pure_remote_merge_triggers_no_push() {
        let ctx = ctx();
        let remote_engine = engine();
        let contact = AccountId::from_bytes([9u8; 32]);
        remote_engine
            .update_contact(&ctx, &contact, |c| c.name = "Remote".into())
            .unwrap();
        let key = remote_engine.user_namespace_key(Namespace::Contacts);
        let payload = remote_engine
            .with_user(|user| Ok(user.contacts.push(&key)?))
            .unwrap();

        // Same seed on the "other device" so namespace keys line up.
        let local = ConfigEngine::new([0x55u8; 32]);
        let mut observer = RecordingObserver { calls: vec![] };
        let merged = local
            .merge_user(
                Namespace::Contacts,
                &[RemoteConfig {
                    hash: "h1".into(),
                    server_timestamp_ms: 5_000,
                    ciphertext: payload.ciphertext,
                }],
                Some(&mut observer),
            )
            .unwrap();
        assert_eq!(merged, 1);
        assert_eq!(observer.calls.len(), 1);
        assert_eq!(observer.calls[0].0, Namespace::Contacts);
        assert_eq!(observer.calls[0].1, vec![contact.to_hex()]);

        local.schedule_user_pushes();
        let transport = RecordingTransport::default();
        assert_eq!(local.process_pushes(&transport), 0, "no push storm");
    }

    #[test]
    fn test_rekey_transport_failure_is_typed() {
        let ctx = ctx();
        let eng = engine();
        let (group, _) = eng.create_group(&ctx, "Test").unwrap();

        let offline = RecordingTransport {
            fail: true,
            ..Default::default()
        };
        let err = eng
            .rekey_group(
                group,
                &[(eng.account(), eng.encryption_public_key())],
                &offline,
            )
            .unwrap_err();
        assert!(matches!(err, EngineError::Keys(KeysError::RekeyFailed(_))));
    }

    #[test]
    fn test_rekey_requires_admin_auth() {
        let ctx = ctx();
        let eng = engine();
        let group = GroupId::from_bytes([7u8; 32]);
        eng.add_group(&ctx, group, vec![1, 2, 3]).unwrap(); // member auth only

        let transport = RecordingTransport::default();
        let err = eng
            .rekey_group(
                group,
                &[(eng.account(), eng.encryption_public_key())],
                &transport,
            )
            .unwrap_err();
        assert!(matches!(err, EngineError::Keys(KeysError::AdminRequired)));
    }

    #[test]
    fn test_destroy_group_removes_namespace_set() {
        let ctx = ctx();
        let eng = engine();
        let (group, _) = eng.create_group(&ctx, "Doomed").unwrap();
        assert_eq!(eng.group_ids(), vec![group]);

        eng.destroy_group(&ctx, group).unwrap();
        assert!(eng.group_ids().is_empty());
        assert!(matches!(
            eng.with_group(group, |_| Ok(())),
            Err(EngineError::GroupNotFound(_))
        ));
        eng.with_user(|user| {
            assert!(user.user_groups.get(&format!("g.{}", group.to_hex())).is_none());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_dump_and_restore_independent_recovery() {
        let ctx = ctx();
        let eng = engine();
        let contact = AccountId::from_bytes([9u8; 32]);
        eng.update_contact(&ctx, &contact, |c| c.name = "Ada".into())
            .unwrap();
        let (group, _) = eng.create_group(&ctx, "Test").unwrap();

        let mut dumps = eng.dump_all(&ctx);
        // 4 user namespaces + info, members, keys for the group.
        assert_eq!(dumps.len(), 7);

        // Corrupt one namespace's blob.
        let corrupt_idx = dumps
            .iter()
            .position(|d| d.namespace == Namespace::UserProfile)
            .unwrap();
        dumps[corrupt_idx].blob = vec![0xFF, 0x00, 0xFF];

        let fresh = ConfigEngine::new([0x55u8; 32]);
        let failures = fresh.load_dumps(&dumps);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, Namespace::UserProfile);

        // Everything else came back.
        fresh
            .with_user(|user| {
                assert_eq!(user.contacts.get(&contact.to_hex()).unwrap().name, "Ada");
                Ok(())
            })
            .unwrap();
        fresh
            .with_group(group, |gc| {
                assert_eq!(gc.info.get(&group.to_hex()).unwrap().name, "Test");
                assert_eq!(gc.keys.current_generation(), 1);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_mark_read_is_monotonic() {
        let ctx = ctx();
        let eng = engine();
        let convo = ConvoKey::Contact(AccountId::from_bytes([3u8; 32]));

        eng.mark_read(&ctx, &convo, 9_000).unwrap();
        eng.mark_read(&ctx, &convo, 4_000).unwrap(); // older: no regression

        eng.with_user(|user| {
            let v = user.volatile.get(&convo.to_key_string()).unwrap();
            assert_eq!(v.last_read_ms, 9_000);
            Ok(())
        })
        .unwrap();
    }

    /// End to end: a group named "Test" merges a remote info update that sets
    /// a retention cutoff; the older message goes (locally and, for an admin,
    /// from the swarm via one deletion request), the newer one stays.
    #[test]
    fn test_merged_retention_cutoff_applies_to_messages() {
        use crate::reconcile::{apply_retention, MessageRef, MessageStore};

        let ctx = ctx();
        let eng = engine();
        let (group, _) = eng.create_group(&ctx, "Test").unwrap();

        // A second admin device (same keys) sets delete_before remotely.
        let remote = eng
            .with_group(group, |gc| {
                let key = gc.namespace_key(Namespace::GroupInfo)?;
                let mut scratch = NamespaceStore::<GroupInfoRecord>::new(Namespace::GroupInfo);
                scratch.mutate(&EngineContext::for_tests(2_000_000), |tx| {
                    let info = tx.get_or_construct(&group.to_hex())?;
                    info.name = "Test".into();
                    info.delete_before_ms = 123_456_000;
                    info.updated_ms = 2_000_000;
                    Ok(())
                })?;
                Ok(RemoteConfig {
                    hash: "info-update".into(),
                    server_timestamp_ms: 2_000_000,
                    ciphertext: scratch.push(&key)?.ciphertext,
                })
            })
            .unwrap();

        let merged = eng
            .merge_group(group, Namespace::GroupInfo, &[remote], None)
            .unwrap();
        assert_eq!(merged, 1);

        struct TwoMessages {
            rows: Vec<MessageRef>,
        }
        impl MessageStore for TwoMessages {
            fn messages_before(&self, _c: &str, cutoff: u64) -> Vec<MessageRef> {
                self.rows
                    .iter()
                    .filter(|m| m.timestamp_ms < cutoff)
                    .cloned()
                    .collect()
            }
            fn delete_messages_before(&mut self, _c: &str, cutoff: u64) -> usize {
                let n = self.rows.len();
                self.rows.retain(|m| m.timestamp_ms >= cutoff);
                n - self.rows.len()
            }
            fn delete_attachments_before(&mut self, _c: &str, _cutoff: u64) -> usize {
                0
            }
        }

        let mut messages = TwoMessages {
            rows: vec![
                MessageRef {
                    timestamp_ms: 100_000_000,
                    server_hash: Some("hash-old".into()),
                    has_attachment: false,
                },
                MessageRef {
                    timestamp_ms: 200_000_000,
                    server_hash: Some("hash-new".into()),
                    has_attachment: false,
                },
            ],
        };

        #[derive(Default)]
        struct CountingTransport {
            deletes: RefCell<Vec<Vec<String>>>,
        }
        impl SwarmTransport for CountingTransport {
            fn send_config(
                &self,
                _o: &str,
                _p: &PushPayload,
            ) -> std::result::Result<PushReceipt, TransportError> {
                Ok(PushReceipt { hash: "h".into() })
            }
            fn delete_messages(
                &self,
                _o: &str,
                hashes: &[String],
            ) -> std::result::Result<(), TransportError> {
                self.deletes.borrow_mut().push(hashes.to_vec());
                Ok(())
            }
        }

        let transport = CountingTransport::default();
        let info = eng
            .with_group(group, |gc| Ok(gc.info.get(&group.to_hex()).cloned()))
            .unwrap()
            .unwrap();
        assert_eq!(info.delete_before_ms, 123_456_000);

        let outcome = apply_retention(&info, &mut messages, &transport, true).unwrap();
        assert_eq!(outcome.messages_deleted, 1);
        assert_eq!(messages.rows.len(), 1);
        assert_eq!(messages.rows[0].timestamp_ms, 200_000_000);
        assert_eq!(transport.deletes.borrow().len(), 1);
        assert_eq!(
            transport.deletes.borrow()[0],
            vec!["hash-old".to_string()]
        );
    }

    #[test]
    fn test_update_profile_sets_name() {
        let ctx = ctx();
        let eng = engine();
        eng.update_profile(&ctx, |p| {
            p.name = "Me".into();
            p.nts_priority = -1;
        })
        .unwrap();

        eng.with_user(|user| {
            let p = user
                .profile
                .get(crate::config::records::USER_PROFILE_KEY)
                .unwrap();
            assert_eq!(p.name, "Me");
            assert!(!crate::config::records::should_be_visible(p.nts_priority));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_merge_user_rejects_group_namespace() {
        let eng = engine();
        let err = eng
            .merge_user(Namespace::GroupInfo, &[], None)
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidNamespace(_)));
    }
}

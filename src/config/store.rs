/// Per-namespace config store — keyed typed records with single-commit
/// mutation scopes.
///
/// All mutation happens inside one explicit scope per namespace: field writes
/// within a scope land as a single merge unit, the sequence number advances
/// once, and the push/dump flags are evaluated at scope exit rather than per
/// write. A scope that fails (oversize, malformed key) leaves the store
/// untouched — no partial mutation is ever visible.
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

use crate::config::limits::{check_budget, BudgetStatus, CIPHERTEXT_BUDGET_BYTES, LOOP_LIMIT};
use crate::config::records::{ConfigRecord, RecordError};
use crate::config::Namespace;
use crate::context::EngineContext;
use crate::crypto::encryption::EncryptionError;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Config data is too large ({size} > {max} bytes)")]
    ConfigTooLarge { size: usize, max: usize },

    #[error("Iteration exceeded the processing loop limit ({LOOP_LIMIT})")]
    LoopLimitReached,

    #[error("Record error: {0}")]
    Record(#[from] RecordError),

    #[error("Dump decode failed: {0}")]
    DumpDecode(String),

    #[error("Dump encode failed: {0}")]
    DumpEncode(String),

    #[error("Dump targets namespace {got:?}, expected {expected:?}")]
    WrongNamespace { expected: Namespace, got: Namespace },

    #[error("Encryption error: {0}")]
    Encryption(#[from] EncryptionError),
}

// ---------------------------------------------------------------------------
// NamespaceStore
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct NamespaceStore<R: ConfigRecord> {
    namespace: Namespace,
    pub(crate) records: BTreeMap<String, R>,
    /// Erase markers with erase timestamps, so deletions replicate and a
    /// re-added identity starts from a fresh default record.
    pub(crate) tombstones: BTreeMap<String, u64>,
    /// Advances once per committed mutation scope.
    pub(crate) seqno: u64,
    /// State changed since the last persisted dump.
    pub(crate) dirty: bool,
    /// Local state diverges from the last-known-pushed state.
    pub(crate) pending_push: bool,
    /// Highest server timestamp among successfully applied remote configs.
    pub(crate) last_applied_config_ms: u64,
    /// Hashes of remote configs folded into local state; superseded on push.
    pub(crate) known_hashes: BTreeSet<String>,
    /// Seqno handed to the transport and not yet confirmed.
    pub(crate) in_flight_seqno: Option<u64>,
}

impl<R: ConfigRecord> NamespaceStore<R> {
    pub fn new(namespace: Namespace) -> Self {
        NamespaceStore {
            namespace,
            records: BTreeMap::new(),
            tombstones: BTreeMap::new(),
            seqno: 0,
            dirty: false,
            pending_push: false,
            last_applied_config_ms: 0,
            known_hashes: BTreeSet::new(),
            in_flight_seqno: None,
        }
    }

    pub fn namespace(&self) -> Namespace {
        self.namespace
    }

    /// Read a record. Never creates.
    pub fn get(&self, key: &str) -> Option<&R> {
        self.records.get(key)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn seqno(&self) -> u64 {
        self.seqno
    }

    /// Local state diverges from the last pushed state.
    pub fn needs_push(&self) -> bool {
        self.pending_push
    }

    /// In-memory state changed since the last persisted dump.
    pub fn needs_dump(&self) -> bool {
        self.dirty
    }

    /// A push payload has been produced and not yet confirmed.
    pub fn push_in_flight(&self) -> bool {
        self.in_flight_seqno.is_some()
    }

    /// Highest server timestamp among applied remote configs — the reference
    /// point for the reconciliation buffering window.
    pub fn last_applied_config_ms(&self) -> u64 {
        self.last_applied_config_ms
    }

    /// Loop-guarded record iteration. The sequence is finite and restartable
    /// from scratch (not resumable mid-iteration after a mutation).
    pub fn iter(&self) -> RecordIter<'_, R> {
        RecordIter {
            inner: self.records.values(),
            steps: 0,
            limit: LOOP_LIMIT,
            tripped: false,
        }
    }

    #[cfg(test)]
    fn iter_with_limit(&self, limit: usize) -> RecordIter<'_, R> {
        RecordIter {
            inner: self.records.values(),
            steps: 0,
            limit,
            tripped: false,
        }
    }

    /// Run a mutation scope. All writes inside `f` commit as one merge unit;
    /// on any error the store is left exactly as it was.
    pub fn mutate<T>(
        &mut self,
        ctx: &EngineContext,
        f: impl FnOnce(&mut MutationScope<R>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut scope = MutationScope {
            records: self.records.clone(),
            tombstones: self.tombstones.clone(),
            now_ms: ctx.clock.now_ms(),
            changed: false,
        };

        let out = f(&mut scope)?;

        if !scope.changed {
            return Ok(out);
        }

        // Budget check over the would-be committed state.
        let encoded = super::merge::state_plaintext_len(
            self.seqno + 1,
            &scope.records,
            &scope.tombstones,
        )?;
        match check_budget(encoded) {
            BudgetStatus::OverBudget => {
                return Err(StoreError::ConfigTooLarge {
                    size: encoded,
                    max: CIPHERTEXT_BUDGET_BYTES,
                });
            }
            BudgetStatus::NearBudget => {
                log::warn!(
                    "{} config at {} of {} budget bytes",
                    self.namespace.as_str(),
                    encoded,
                    CIPHERTEXT_BUDGET_BYTES
                );
            }
            BudgetStatus::Ok => {}
        }

        self.records = scope.records;
        self.tombstones = scope.tombstones;
        self.seqno += 1;
        self.dirty = true;
        self.pending_push = true;
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// MutationScope
// ---------------------------------------------------------------------------

/// One open mutation scope. Works on a private copy of the namespace state;
/// the store commits it atomically when the scope closes cleanly.
pub struct MutationScope<R: ConfigRecord> {
    records: BTreeMap<String, R>,
    tombstones: BTreeMap<String, u64>,
    now_ms: u64,
    changed: bool,
}

impl<R: ConfigRecord> MutationScope<R> {
    /// Read a record inside the scope. Never creates.
    pub fn get(&self, key: &str) -> Option<&R> {
        self.records.get(key)
    }

    /// Fetch a record for mutation, constructing a zero-valued one (with the
    /// key populated) if absent. Fails only on a malformed key.
    pub fn get_or_construct(&mut self, key: &str) -> Result<&mut R, StoreError> {
        use std::collections::btree_map::Entry;
        self.changed = true;
        match self.records.entry(key.to_string()) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => Ok(entry.insert(R::construct(key)?)),
        }
    }

    /// Validate and store a record.
    pub fn set(&mut self, record: R) -> Result<(), StoreError> {
        record.validate()?;
        self.records.insert(record.key(), record);
        self.changed = true;
        Ok(())
    }

    /// Erase a record. Idempotent: erasing an absent key is not an error and
    /// does not dirty the scope. Returns whether a record was removed.
    pub fn erase(&mut self, key: &str) -> bool {
        if self.records.remove(key).is_some() {
            self.tombstones.insert(key.to_string(), self.now_ms);
            self.changed = true;
            true
        } else {
            false
        }
    }

    /// The scope's wall-clock, for stamping `updated_ms` fields.
    pub fn now_ms(&self) -> u64 {
        self.now_ms
    }
}

// ---------------------------------------------------------------------------
// RecordIter
// ---------------------------------------------------------------------------

/// Finite, loop-guarded iterator over a namespace's records.
pub struct RecordIter<'a, R> {
    inner: std::collections::btree_map::Values<'a, String, R>,
    steps: usize,
    limit: usize,
    tripped: bool,
}

impl<'a, R> Iterator for RecordIter<'a, R> {
    type Item = Result<&'a R, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.tripped {
            return None;
        }
        if self.steps >= self.limit {
            self.tripped = true;
            return Some(Err(StoreError::LoopLimitReached));
        }
        self.steps += 1;
        self.inner.next().map(Ok)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

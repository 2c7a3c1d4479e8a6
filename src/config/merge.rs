/// Merge & push engine — reconciles local namespace state against remote
/// config ciphertexts and produces dumps and push payloads.
///
/// Merging is deterministic and commutative: the same set of remote configs
/// produces the same final state regardless of arrival order, because every
/// per-record operation is a join (LWW with a total-order tie-break, max for
/// monotonic fields, max for tombstones, max for seqnos). Routine divergent
/// data is the CRDT's job to reconcile and never raises an error; a config
/// that fails to decrypt or decode is logged and skipped without affecting
/// the rest of the batch.
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::records::{decode_record, encode_record, ConfigRecord};
use crate::config::store::{NamespaceStore, StoreError};
use crate::config::Namespace;
use crate::context::EngineContext;
use crate::crypto::encryption::{decrypt_config, encrypt_config};

// ---------------------------------------------------------------------------
// Wire & persistence types
// ---------------------------------------------------------------------------

/// One remote-fetched config message, as handed over by the transport layer.
#[derive(Clone, Debug)]
pub struct RemoteConfig {
    /// Storage-server hash of the message — becomes obsolete after a push.
    pub hash: String,
    pub server_timestamp_ms: u64,
    pub ciphertext: Vec<u8>,
}

/// Outcome of one merge call.
#[derive(Clone, Debug, Default)]
pub struct MergeReport {
    /// How many remote configs were successfully decrypted and folded in.
    pub configs_merged: usize,
    /// Keys whose records changed — handed to the reconciliation layer.
    pub changed_keys: Vec<String>,
}

/// Encrypted namespace state ready for the swarm transport.
#[derive(Clone, Debug)]
pub struct PushPayload {
    pub namespace: Namespace,
    pub seqno: u64,
    pub ciphertext: Vec<u8>,
    /// Remote config hashes superseded by this push.
    pub obsolete_hashes: Vec<String>,
}

/// A persisted namespace snapshot. Dumps are independent per namespace: a
/// corrupt or missing dump for one must never block recovery of the others.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Dump {
    pub namespace: Namespace,
    /// Hex identity of the owning account or group.
    pub owner: String,
    pub timestamp_ms: u64,
    pub blob: Vec<u8>,
}

/// The serialized state shared by pushes and dumps: bincode envelope with
/// CBOR-encoded records inside, mirroring the outer/inner split used for
/// signed operation envelopes.
#[derive(Serialize, Deserialize)]
struct StateEnvelope {
    namespace: Namespace,
    seqno: u64,
    records: Vec<Vec<u8>>,
    tombstones: Vec<(String, u64)>,
}

/// Dump adds local-only bookkeeping so recovery restores push state too.
#[derive(Serialize, Deserialize)]
struct DumpEnvelope {
    state: StateEnvelope,
    pending_push: bool,
    last_applied_config_ms: u64,
    known_hashes: Vec<String>,
}

fn state_envelope<R: ConfigRecord>(
    namespace: Namespace,
    seqno: u64,
    records: &BTreeMap<String, R>,
    tombstones: &BTreeMap<String, u64>,
) -> Result<StateEnvelope, StoreError> {
    let mut encoded = Vec::with_capacity(records.len());
    for record in records.values() {
        encoded.push(encode_record(record)?);
    }
    Ok(StateEnvelope {
        namespace,
        seqno,
        records: encoded,
        tombstones: tombstones.iter().map(|(k, v)| (k.clone(), *v)).collect(),
    })
}

/// Encoded size of the would-be serialized state, for budget checks at
/// mutation-scope exit. The namespace tag has fixed encoded width, so any
/// namespace value gives the same length.
pub(crate) fn state_plaintext_len<R: ConfigRecord>(
    seqno: u64,
    records: &BTreeMap<String, R>,
    tombstones: &BTreeMap<String, u64>,
) -> Result<usize, StoreError> {
    let envelope = state_envelope(Namespace::UserProfile, seqno, records, tombstones)?;
    let bytes =
        bincode::serialize(&envelope).map_err(|e| StoreError::DumpEncode(e.to_string()))?;
    Ok(bytes.len())
}

// ---------------------------------------------------------------------------
// Merge / push / dump on NamespaceStore
// ---------------------------------------------------------------------------

impl<R: ConfigRecord> NamespaceStore<R> {
    /// Fold a batch of remote config ciphertexts into local state.
    ///
    /// Pure remote merges never set `needs_push`; they only mark the store as
    /// needing a dump when something actually changed.
    pub fn merge(&mut self, key: &[u8; 32], incoming: &[RemoteConfig]) -> MergeReport {
        let mut report = MergeReport::default();

        for remote in incoming {
            let plaintext = match decrypt_config(&remote.ciphertext, key) {
                Ok(p) => p,
                Err(_) => {
                    log::warn!(
                        "{}: skipping undecryptable config {}",
                        self.namespace().as_str(),
                        remote.hash
                    );
                    continue;
                }
            };

            let envelope: StateEnvelope = match bincode::deserialize(&plaintext) {
                Ok(e) => e,
                Err(e) => {
                    log::warn!(
                        "{}: skipping undecodable config {}: {}",
                        self.namespace().as_str(),
                        remote.hash,
                        e
                    );
                    continue;
                }
            };

            if envelope.namespace != self.namespace() {
                log::warn!(
                    "{}: skipping config {} tagged for {}",
                    self.namespace().as_str(),
                    remote.hash,
                    envelope.namespace.as_str()
                );
                continue;
            }

            // Decode every record up front so a bad one rejects the whole
            // config rather than applying half of it.
            let mut decoded = Vec::with_capacity(envelope.records.len());
            let mut bad = false;
            for bytes in &envelope.records {
                match decode_record::<R>(bytes) {
                    Ok(r) => decoded.push(r),
                    Err(e) => {
                        log::warn!(
                            "{}: skipping config {} with undecodable record: {}",
                            self.namespace().as_str(),
                            remote.hash,
                            e
                        );
                        bad = true;
                        break;
                    }
                }
            }
            if bad {
                continue;
            }

            let mut changed = false;

            // Remote tombstones: erase local records they supersede.
            for (key_str, erased_ms) in &envelope.tombstones {
                if let Some(local) = self.records.get(key_str) {
                    if local.updated_ms() <= *erased_ms {
                        self.records.remove(key_str);
                        changed = true;
                        report.changed_keys.push(key_str.clone());
                    }
                }
                let entry = self.tombstones.entry(key_str.clone()).or_insert(0);
                if *erased_ms > *entry {
                    *entry = *erased_ms;
                    changed = true;
                }
            }

            // Remote records: join against local state.
            for record in decoded {
                let record_key = record.key();
                if let Some(erased_ms) = self.tombstones.get(&record_key) {
                    if record.updated_ms() <= *erased_ms {
                        continue; // deleted locally after the remote write
                    }
                }
                match self.records.get_mut(&record_key) {
                    Some(local) => {
                        if local.merge_remote(&record) {
                            changed = true;
                            report.changed_keys.push(record_key);
                        }
                    }
                    None => {
                        self.records.insert(record_key.clone(), record);
                        changed = true;
                        report.changed_keys.push(record_key);
                    }
                }
            }

            if envelope.seqno > self.seqno {
                self.seqno = envelope.seqno;
                changed = true;
            }
            if remote.server_timestamp_ms > self.last_applied_config_ms {
                self.last_applied_config_ms = remote.server_timestamp_ms;
            }
            self.known_hashes.insert(remote.hash.clone());
            if changed {
                self.dirty = true;
            }
            report.configs_merged += 1;
        }

        report.changed_keys.sort();
        report.changed_keys.dedup();
        report
    }

    /// Serialize and encrypt the current state for the swarm transport.
    ///
    /// The returned seqno must be echoed back through [`confirm_pushed`]
    /// once the transport acks; a mutation committed in between keeps
    /// `needs_push` set so the next dump carries it.
    ///
    /// [`confirm_pushed`]: NamespaceStore::confirm_pushed
    pub fn push(&mut self, key: &[u8; 32]) -> Result<PushPayload, StoreError> {
        let envelope =
            state_envelope(self.namespace(), self.seqno, &self.records, &self.tombstones)?;
        let plaintext =
            bincode::serialize(&envelope).map_err(|e| StoreError::DumpEncode(e.to_string()))?;
        let ciphertext = encrypt_config(&plaintext, key)?;

        self.in_flight_seqno = Some(self.seqno);
        Ok(PushPayload {
            namespace: self.namespace(),
            seqno: self.seqno,
            ciphertext,
            obsolete_hashes: self.known_hashes.iter().cloned().collect(),
        })
    }

    /// Record a transport-acked push. Clears `needs_push` only if no mutation
    /// landed since the payload was produced.
    pub fn confirm_pushed(&mut self, seqno: u64, hash: &str) {
        if self.seqno == seqno {
            self.pending_push = false;
        }
        self.in_flight_seqno = None;
        self.known_hashes.clear();
        self.known_hashes.insert(hash.to_string());
        self.dirty = true;
    }

    /// Serialize the full store (state plus push bookkeeping) for local
    /// persistence. Clears `needs_dump`.
    pub fn dump(&mut self, ctx: &EngineContext, owner: &str) -> Result<Dump, StoreError> {
        let envelope = DumpEnvelope {
            state: state_envelope(
                self.namespace(),
                self.seqno,
                &self.records,
                &self.tombstones,
            )?,
            pending_push: self.pending_push,
            last_applied_config_ms: self.last_applied_config_ms,
            known_hashes: self.known_hashes.iter().cloned().collect(),
        };
        let blob =
            bincode::serialize(&envelope).map_err(|e| StoreError::DumpEncode(e.to_string()))?;
        self.dirty = false;
        Ok(Dump {
            namespace: self.namespace(),
            owner: owner.to_string(),
            timestamp_ms: ctx.clock.now_ms(),
            blob,
        })
    }

    /// Rebuild a store from a persisted dump.
    pub fn load_dump(namespace: Namespace, blob: &[u8]) -> Result<Self, StoreError> {
        let envelope: DumpEnvelope =
            bincode::deserialize(blob).map_err(|e| StoreError::DumpDecode(e.to_string()))?;
        if envelope.state.namespace != namespace {
            return Err(StoreError::WrongNamespace {
                expected: namespace,
                got: envelope.state.namespace,
            });
        }

        let mut store = NamespaceStore::new(namespace);
        for bytes in &envelope.state.records {
            let record: R = decode_record(bytes)?;
            store.records.insert(record.key(), record);
        }
        store.tombstones = envelope.state.tombstones.into_iter().collect();
        store.seqno = envelope.state.seqno;
        store.pending_push = envelope.pending_push;
        store.last_applied_config_ms = envelope.last_applied_config_ms;
        store.known_hashes = envelope.known_hashes.into_iter().collect();
        Ok(store)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

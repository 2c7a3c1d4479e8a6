/// Database reconciliation interface — the seam between the config engine
/// and the relational store that mirrors it.
///
/// The relational side is an external collaborator: it consumes merge
/// callbacks and writes back through the typed setters, batching its changes
/// into one mutation scope per upstream identity. This module defines that
/// contract plus the two pieces of engine-side policy it depends on: the
/// change buffering window and retention application.
use thiserror::Error;

use crate::config::records::GroupInfoRecord;
use crate::config::Namespace;
use crate::push::{SwarmTransport, TransportError};

// ---------------------------------------------------------------------------
// Merge observer
// ---------------------------------------------------------------------------

/// Invoked once per successful namespace merge. Consumers update relational
/// rows using last-write-wins on the records' embedded timestamps — never a
/// blind overwrite.
pub trait ConfigObserver {
    fn on_namespace_merged(&mut self, namespace: Namespace, changed_keys: &[String]);
}

// ---------------------------------------------------------------------------
// Buffering window
// ---------------------------------------------------------------------------

/// Grace window for locally observed changes, relative to the last applied
/// config timestamp. Tolerates clock and network jitter without letting a
/// long-delayed local edit win against a marginally newer remote update.
pub const CHANGE_BUFFER_MS: u64 = 2 * 60 * 1000;

/// Whether a locally observed change should be written back into config.
///
/// Changes older than `last_applied_config_ms - CHANGE_BUFFER_MS` are still
/// applied to the local database (info messages and the like must render) but
/// are NOT re-pushed into config. Two devices editing inside the window both
/// repush; the record-level LWW merge picks one winner deterministically.
pub fn should_repush(change_ts_ms: u64, last_applied_config_ms: u64) -> bool {
    change_ts_ms + CHANGE_BUFFER_MS >= last_applied_config_ms
}

// ---------------------------------------------------------------------------
// Retention
// ---------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum RetentionError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// A message row as the relational store sees it, reduced to what retention
/// needs.
#[derive(Clone, Debug)]
pub struct MessageRef {
    pub timestamp_ms: u64,
    /// Storage-server hash, when the sender recorded one.
    pub server_hash: Option<String>,
    pub has_attachment: bool,
}

/// Narrow contract onto the relational message store.
pub trait MessageStore {
    /// Messages in a conversation strictly older than the cutoff.
    fn messages_before(&self, convo: &str, cutoff_ms: u64) -> Vec<MessageRef>;

    /// Delete those messages locally. Returns how many went.
    fn delete_messages_before(&mut self, convo: &str, cutoff_ms: u64) -> usize;

    /// Delete attachments on messages older than the cutoff.
    fn delete_attachments_before(&mut self, convo: &str, cutoff_ms: u64) -> usize;
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RetentionOutcome {
    pub messages_deleted: usize,
    pub attachments_deleted: usize,
    /// Server hashes named in the swarm deletion request, if one was issued.
    pub swarm_deleted_hashes: Vec<String>,
}

/// Apply a merged group-info record's retention cutoffs to the local message
/// store.
///
/// If the local party is an admin and any purged message has a known server
/// hash, exactly one deletion request naming those hashes goes to the swarm.
/// Non-admins only delete locally.
pub fn apply_retention(
    info: &GroupInfoRecord,
    store: &mut dyn MessageStore,
    transport: &dyn SwarmTransport,
    is_admin: bool,
) -> Result<RetentionOutcome, RetentionError> {
    let convo = info.group.to_hex();
    let mut outcome = RetentionOutcome::default();

    if info.delete_before_ms > 0 {
        let hashes: Vec<String> = store
            .messages_before(&convo, info.delete_before_ms)
            .into_iter()
            .filter_map(|m| m.server_hash)
            .collect();

        outcome.messages_deleted = store.delete_messages_before(&convo, info.delete_before_ms);

        if is_admin && !hashes.is_empty() {
            transport.delete_messages(&convo, &hashes)?;
            outcome.swarm_deleted_hashes = hashes;
        }
    }

    if info.attach_delete_before_ms > 0 {
        outcome.attachments_deleted =
            store.delete_attachments_before(&convo, info.attach_delete_before_ms);
    }

    Ok(outcome)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::merge::PushPayload;
    use crate::config::records::ConfigRecord;
    use crate::ids::GroupId;
    use crate::push::PushReceipt;
    use std::cell::RefCell;

    // -----------------------------------------------------------------------
    // Buffering window
    // -----------------------------------------------------------------------

    #[test]
    fn test_recent_change_repushed() {
        let last_applied = 10 * 60 * 1000;
        assert!(should_repush(last_applied - 1_000, last_applied));
        assert!(should_repush(last_applied, last_applied));
        assert!(should_repush(last_applied + 5_000, last_applied));
    }

    #[test]
    fn test_change_inside_buffer_still_repushed() {
        let last_applied = 10 * 60 * 1000;
        // 1:59 older than the last applied config — inside the grace window.
        assert!(should_repush(last_applied - CHANGE_BUFFER_MS + 1_000, last_applied));
        // Exactly at the boundary.
        assert!(should_repush(last_applied - CHANGE_BUFFER_MS, last_applied));
    }

    #[test]
    fn test_stale_change_not_repushed() {
        let last_applied = 10 * 60 * 1000;
        assert!(!should_repush(last_applied - CHANGE_BUFFER_MS - 1, last_applied));
        assert!(!should_repush(0, last_applied));
    }

    // -----------------------------------------------------------------------
    // Retention — the delete_before scenario
    // -----------------------------------------------------------------------

    struct FakeMessages {
        rows: Vec<MessageRef>,
    }

    impl MessageStore for FakeMessages {
        fn messages_before(&self, _convo: &str, cutoff_ms: u64) -> Vec<MessageRef> {
            self.rows
                .iter()
                .filter(|m| m.timestamp_ms < cutoff_ms)
                .cloned()
                .collect()
        }

        fn delete_messages_before(&mut self, _convo: &str, cutoff_ms: u64) -> usize {
            let before = self.rows.len();
            self.rows.retain(|m| m.timestamp_ms >= cutoff_ms);
            before - self.rows.len()
        }

        fn delete_attachments_before(&mut self, _convo: &str, cutoff_ms: u64) -> usize {
            let mut n = 0;
            for m in &mut self.rows {
                if m.timestamp_ms < cutoff_ms && m.has_attachment {
                    m.has_attachment = false;
                    n += 1;
                }
            }
            n
        }
    }

    #[derive(Default)]
    struct FakeTransport {
        delete_calls: RefCell<Vec<Vec<String>>>,
    }

    impl SwarmTransport for FakeTransport {
        fn send_config(
            &self,
            _owner: &str,
            _payload: &PushPayload,
        ) -> Result<PushReceipt, TransportError> {
            Ok(PushReceipt {
                hash: "stored".into(),
            })
        }

        fn delete_messages(
            &self,
            _owner: &str,
            hashes: &[String],
        ) -> Result<(), TransportError> {
            self.delete_calls.borrow_mut().push(hashes.to_vec());
            Ok(())
        }
    }

    fn group_info(delete_before_ms: u64) -> GroupInfoRecord {
        let gid = GroupId::from_bytes([5u8; 32]);
        let mut info = GroupInfoRecord::construct(&gid.to_hex()).unwrap();
        info.name = "Test".into();
        info.delete_before_ms = delete_before_ms;
        info
    }

    /// Merged delete_before = 123,456,000 ms; a message at 100,000,000 ms is
    /// purged, one at 200,000,000 ms survives, and the admin issues exactly
    /// one swarm deletion naming the purged message's hash.
    #[test]
    fn test_delete_before_scenario_as_admin() {
        let mut store = FakeMessages {
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
        let transport = FakeTransport::default();
        let info = group_info(123_456_000);

        let outcome = apply_retention(&info, &mut store, &transport, true).unwrap();

        assert_eq!(outcome.messages_deleted, 1);
        assert_eq!(store.rows.len(), 1);
        assert_eq!(store.rows[0].timestamp_ms, 200_000_000);

        let calls = transport.delete_calls.borrow();
        assert_eq!(calls.len(), 1, "exactly one deletion request");
        assert_eq!(calls[0], vec!["hash-old".to_string()]);
    }

    #[test]
    fn test_non_admin_deletes_locally_only() {
        let mut store = FakeMessages {
            rows: vec![MessageRef {
                timestamp_ms: 100_000_000,
                server_hash: Some("hash-old".into()),
                has_attachment: false,
            }],
        };
        let transport = FakeTransport::default();
        let info = group_info(123_456_000);

        let outcome = apply_retention(&info, &mut store, &transport, false).unwrap();
        assert_eq!(outcome.messages_deleted, 1);
        assert!(outcome.swarm_deleted_hashes.is_empty());
        assert!(transport.delete_calls.borrow().is_empty());
    }

    #[test]
    fn test_no_hash_no_swarm_request() {
        let mut store = FakeMessages {
            rows: vec![MessageRef {
                timestamp_ms: 100_000_000,
                server_hash: None,
                has_attachment: false,
            }],
        };
        let transport = FakeTransport::default();
        let info = group_info(123_456_000);

        apply_retention(&info, &mut store, &transport, true).unwrap();
        assert!(transport.delete_calls.borrow().is_empty());
    }

    #[test]
    fn test_attachment_cutoff_independent() {
        let mut store = FakeMessages {
            rows: vec![
                MessageRef {
                    timestamp_ms: 100,
                    server_hash: None,
                    has_attachment: true,
                },
                MessageRef {
                    timestamp_ms: 5_000,
                    server_hash: None,
                    has_attachment: true,
                },
            ],
        };
        let transport = FakeTransport::default();
        let mut info = group_info(0); // no message cutoff
        info.attach_delete_before_ms = 1_000;

        let outcome = apply_retention(&info, &mut store, &transport, true).unwrap();
        assert_eq!(outcome.messages_deleted, 0);
        assert_eq!(outcome.attachments_deleted, 1);
        assert!(store.rows[1].has_attachment);
    }

    #[test]
    fn test_zero_cutoffs_are_noops() {
        let mut store = FakeMessages { rows: vec![] };
        let transport = FakeTransport::default();
        let info = group_info(0);
        let outcome = apply_retention(&info, &mut store, &transport, true).unwrap();
        assert_eq!(outcome, RetentionOutcome::default());
    }
}

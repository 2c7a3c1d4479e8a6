/// Network push scheduling — deduplicated, debounced, serialized.
///
/// The engine never talks to the swarm itself; it hands payloads to a
/// [`SwarmTransport`] and tracks one outstanding push per `(owner, namespace)`
/// pair. A second local mutation arriving mid-push stays queued and rides the
/// next dump — it is never interleaved into the in-flight payload. A failed
/// push is reported to the caller and retried by the caller's own policy, not
/// here.
use std::collections::BTreeSet;
use thiserror::Error;

use crate::config::merge::PushPayload;
use crate::config::Namespace;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Swarm unreachable: {0}")]
    Unreachable(String),

    #[error("Swarm rejected the request: {0}")]
    Rejected(String),
}

// ---------------------------------------------------------------------------
// Transport contract (the swarm network layer implements this)
// ---------------------------------------------------------------------------

/// Ack for a stored config message.
#[derive(Clone, Debug)]
pub struct PushReceipt {
    /// Storage-server hash of the stored message.
    pub hash: String,
}

/// Narrow interface to the swarm storage network. Completion is delivered by
/// return value; implementations wrap their own async machinery behind it.
pub trait SwarmTransport {
    fn send_config(
        &self,
        owner: &str,
        payload: &PushPayload,
    ) -> Result<PushReceipt, TransportError>;

    /// Request deletion of stored messages by server hash (admin operation).
    fn delete_messages(&self, owner: &str, hashes: &[String]) -> Result<(), TransportError>;
}

// ---------------------------------------------------------------------------
// PushQueue
// ---------------------------------------------------------------------------

/// Pending push bookkeeping. `schedule` may be called any number of times per
/// logical transaction; a given `(owner, namespace)` yields one job, and a
/// second job for the same pair is withheld until the first completes.
#[derive(Debug, Default)]
pub struct PushQueue {
    pending: BTreeSet<(String, Namespace)>,
    in_flight: BTreeSet<(String, Namespace)>,
}

impl PushQueue {
    pub fn new() -> Self {
        PushQueue::default()
    }

    /// Mark a namespace as needing a push. Deduplicated per owner identity.
    pub fn schedule(&mut self, owner: &str, namespace: Namespace) {
        self.pending.insert((owner.to_string(), namespace));
    }

    /// Take the next job whose `(owner, namespace)` has no outstanding push.
    /// The job is considered in flight until [`complete`] is called.
    ///
    /// [`complete`]: PushQueue::complete
    pub fn next_job(&mut self) -> Option<(String, Namespace)> {
        let job = self
            .pending
            .iter()
            .find(|key| !self.in_flight.contains(*key))
            .cloned()?;
        self.pending.remove(&job);
        self.in_flight.insert(job.clone());
        Some(job)
    }

    /// Record completion of an in-flight push. On failure the job is NOT
    /// rescheduled here — retry policy belongs to the caller.
    pub fn complete(&mut self, owner: &str, namespace: Namespace, success: bool) {
        self.in_flight.remove(&(owner.to_string(), namespace));
        if !success {
            log::debug!("push for {} {} failed", owner, namespace.as_str());
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn has_in_flight(&self, owner: &str, namespace: Namespace) -> bool {
        self.in_flight.contains(&(owner.to_string(), namespace))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

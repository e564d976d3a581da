//! Significance filter for Secret notifications
//!
//! The source watch fires for every Secret write in scope, including
//! metadata-only churn and the operator's own output. Only notifications that
//! can change a merged Secret are let through:
//!
//! - Secrets owned by a CertMerge are dropped before anything else, so writing
//!   an output Secret never feeds back into the source path.
//! - Deletions are dropped. Merged entries of a deleted source stay until a
//!   later pass rewrites the output.
//! - Updates pass only if the payload bytes changed, or if the object carries
//!   a deletion grace period (a deletion in progress, observed once).
//!
//! kube's watcher only delivers the new object, so [`SecretEventFilter`]
//! remembers a SHA-256 digest of the last payload seen for each Secret and
//! uses that as the "old" side of the comparison.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::runtime::reflector::ObjectRef;
use kube::Resource;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::crd::CertMerge;
use crate::{CREATOR_NAME, LABEL_CREATOR};

type Payload = BTreeMap<String, ByteString>;
type PayloadDigest = [u8; 32];

/// Returns true if any owner reference points at a CertMerge
pub fn is_owned_by_cert_merge(secret: &Secret) -> bool {
    let kind = CertMerge::kind(&());
    secret
        .metadata
        .owner_references
        .as_ref()
        .is_some_and(|refs| refs.iter().any(|r| r.kind == kind))
}

/// Returns true if the Secret is an output written by this operator
///
/// Outputs in another namespace than their CertMerge carry no owner
/// reference, so the creator label is checked as well.
pub fn is_merge_output(secret: &Secret) -> bool {
    is_owned_by_cert_merge(secret)
        || secret
            .metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(LABEL_CREATOR))
            .is_some_and(|v| v == CREATOR_NAME)
}

/// Returns true if the update from `old` to `new` warrants a reconcile
pub fn is_significant(old: &Secret, new: &Secret) -> bool {
    is_deleting(new) || payload_digest(old.data.as_ref()) != payload_digest(new.data.as_ref())
}

fn is_deleting(secret: &Secret) -> bool {
    secret.metadata.deletion_grace_period_seconds.is_some()
}

/// Length-prefixed digest over the payload in key order
///
/// Absent and empty payloads hash the same.
fn payload_digest(data: Option<&Payload>) -> PayloadDigest {
    let mut hasher = Sha256::new();
    for (key, value) in data.into_iter().flatten() {
        hasher.update((key.len() as u64).to_le_bytes());
        hasher.update(key.as_bytes());
        hasher.update((value.0.len() as u64).to_le_bytes());
        hasher.update(&value.0);
    }
    hasher.finalize().into()
}

#[derive(Debug)]
struct Seen {
    digest: PayloadDigest,
    deleting: bool,
    /// Listing generation that last reported this Secret
    epoch: u64,
}

/// Stateful event filter for the Secret watch
///
/// Safe to share between tasks. State is one digest per Secret in scope,
/// pruned to the listed set whenever the watcher relists.
#[derive(Debug, Default)]
pub struct SecretEventFilter {
    seen: DashMap<ObjectRef<Secret>, Seen>,
    epoch: AtomicU64,
}

impl SecretEventFilter {
    /// Create an empty filter
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle a created/updated Secret; returns true if it is significant
    ///
    /// The first sighting of a Secret counts as a creation and always passes.
    pub fn on_applied(&self, secret: &Secret) -> bool {
        if is_merge_output(secret) {
            debug!(
                secret = %secret.metadata.name.as_deref().unwrap_or_default(),
                namespace = %secret.metadata.namespace.as_deref().unwrap_or_default(),
                "Secret is managed by CertMerge, dropping event"
            );
            return false;
        }

        let key = ObjectRef::from_obj(secret);
        let digest = payload_digest(secret.data.as_ref());
        let deleting = is_deleting(secret);
        let significant = match self.seen.get(&key) {
            // The grace marker stays set until the object is gone; pass it once
            Some(old) => old.digest != digest || (deleting && !old.deleting),
            None => true,
        };
        self.seen.insert(
            key,
            Seen {
                digest,
                deleting,
                epoch: self.epoch.load(Ordering::Acquire),
            },
        );
        if !significant {
            debug!(
                secret = %secret.metadata.name.as_deref().unwrap_or_default(),
                namespace = %secret.metadata.namespace.as_deref().unwrap_or_default(),
                "Secret payload unchanged, dropping event"
            );
        }
        significant
    }

    /// Handle a deleted Secret; always returns false
    pub fn on_deleted(&self, secret: &Secret) -> bool {
        self.seen.remove(&ObjectRef::from_obj(secret));
        debug!(
            secret = %secret.metadata.name.as_deref().unwrap_or_default(),
            namespace = %secret.metadata.namespace.as_deref().unwrap_or_default(),
            "Secret deleted, not reconciling"
        );
        false
    }

    /// The watcher started a fresh listing
    pub fn on_relist_started(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
    }

    /// The listing finished; forget every Secret it did not report
    ///
    /// Secrets deleted while the watch was down never produce a delete event,
    /// so this is where their state goes.
    pub fn on_relist_done(&self) {
        let epoch = self.epoch.load(Ordering::Acquire);
        let before = self.seen.len();
        self.seen.retain(|_, seen| seen.epoch == epoch);
        let pruned = before.saturating_sub(self.seen.len());
        if pruned > 0 {
            debug!(pruned, "Relist complete, forgot Secrets no longer present");
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.seen.len()
    }

    #[cfg(test)]
    fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

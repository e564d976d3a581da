//! Secret-side entry point
//!
//! A source Secret changing does not reconcile anything by itself; it maps to
//! the CertMerges that reference it, and those are reconciled. The mapping
//! consults every CertMerge in scope and uses [`crate::matcher::matches`], so
//! no persistent reverse index has to be kept consistent with spec edits.

use std::sync::Arc;

use k8s_openapi::api::core::v1::Secret;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::watcher;
use tracing::{debug, info, instrument, warn};

use super::cert_merge::{reconcile_pass, Context, PassOutcome};
use crate::crd::CertMerge;
use crate::filter::{is_merge_output, SecretEventFilter};
use crate::matcher::matches;
use crate::Error;

/// Every CertMerge that lists or selects `secret`
///
/// Duplicates cannot occur: each CertMerge is tested once.
pub fn find_cert_merges_for<'a>(
    cert_merges: impl IntoIterator<Item = &'a CertMerge>,
    secret: &Secret,
) -> Vec<ObjectRef<CertMerge>> {
    cert_merges
        .into_iter()
        .filter(|cm| matches(cm, secret))
        .map(ObjectRef::from_obj)
        .collect()
}

/// Maps Secret watch events to CertMerge reconcile requests
///
/// Reads CertMerges from the controller's reflector store, so the mapping
/// never hits the API server.
pub struct SecretTrigger {
    filter: SecretEventFilter,
    cert_merges: Store<CertMerge>,
}

impl SecretTrigger {
    /// Create a trigger backed by the controller's CertMerge store
    pub fn new(cert_merges: Store<CertMerge>) -> Self {
        Self {
            filter: SecretEventFilter::new(),
            cert_merges,
        }
    }

    /// Requests caused by one watch event; empty when the event is noise
    pub fn requests_for(&self, event: watcher::Event<Secret>) -> Vec<ObjectRef<CertMerge>> {
        match event {
            watcher::Event::Apply(secret) | watcher::Event::InitApply(secret) => {
                if !self.filter.on_applied(&secret) {
                    return Vec::new();
                }
                self.map_secret(&secret)
            }
            watcher::Event::Delete(secret) => {
                self.filter.on_deleted(&secret);
                Vec::new()
            }
            watcher::Event::Init => {
                self.filter.on_relist_started();
                Vec::new()
            }
            watcher::Event::InitDone => {
                self.filter.on_relist_done();
                Vec::new()
            }
        }
    }

    fn map_secret(&self, secret: &Secret) -> Vec<ObjectRef<CertMerge>> {
        let state = self.cert_merges.state();
        let requests = find_cert_merges_for(state.iter().map(Arc::as_ref), secret);
        for request in &requests {
            info!(
                secret = %secret.metadata.name.as_deref().unwrap_or_default(),
                namespace = %secret.metadata.namespace.as_deref().unwrap_or_default(),
                certmerge = %request,
                "Secret changed, reconciling CertMerge"
            );
        }
        requests
    }
}

/// Reconcile a Secret by identity
///
/// Reads the Secret and every CertMerge from the API, then runs a pass for
/// each CertMerge that references it. A missing Secret, or one written by
/// this operator, is a successful no-op. Returns the CertMerges reconciled.
///
/// Every matched CertMerge gets its pass even when an earlier one fails; the
/// first failure is returned once all passes have run.
#[instrument(skip(ctx))]
pub async fn reconcile_secret(
    ctx: &Context,
    namespace: &str,
    name: &str,
) -> Result<Vec<ObjectRef<CertMerge>>, Error> {
    let Some(secret) = ctx.kube.get_secret(namespace, name).await? else {
        info!(secret = %name, namespace = %namespace, "Secret not found, nothing to do");
        return Ok(Vec::new());
    };

    if is_merge_output(&secret) {
        debug!(secret = %name, namespace = %namespace, "Secret is a merge output, ignoring");
        return Ok(Vec::new());
    }

    let cert_merges = ctx.kube.list_cert_merges().await?;
    let requests = find_cert_merges_for(&cert_merges, &secret);

    let mut first_error = None;
    for request in &requests {
        let cm_namespace = request.namespace.as_deref().unwrap_or_default();
        match reconcile_pass(ctx, cm_namespace, &request.name).await {
            Ok(PassOutcome::Unchanged) => {}
            Ok(outcome) => {
                info!(certmerge = %request, ?outcome, "CertMerge reconciled for Secret change");
            }
            Err(error) => {
                warn!(certmerge = %request, %error, "CertMerge pass failed, continuing");
                if first_error.is_none() {
                    first_error = Some(error);
                }
            }
        }
    }

    match first_error {
        Some(error) => Err(error),
        None => Ok(requests),
    }
}

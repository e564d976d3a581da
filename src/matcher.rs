//! Source membership test
//!
//! Decides whether a Secret belongs to a CertMerge, either because it is
//! listed by identity or because its labels satisfy one of the
//! namespace-scoped selectors. Pure: no I/O, no logging.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;

use crate::crd::{CertMerge, SecretSelector};

/// Returns true if `secret` is a source of `cm`
///
/// Explicit-list membership is checked first, then the selectors; the first
/// hit short-circuits.
pub fn matches(cm: &CertMerge, secret: &Secret) -> bool {
    let name = secret.metadata.name.as_deref().unwrap_or_default();
    let namespace = secret.metadata.namespace.as_deref().unwrap_or_default();

    listed(cm, namespace, name) || selected(cm, namespace, secret.metadata.labels.as_ref())
}

/// True if `(namespace, name)` equals an entry of the explicit list
pub fn listed(cm: &CertMerge, namespace: &str, name: &str) -> bool {
    cm.spec
        .secret_list
        .iter()
        .any(|d| d.name == name && d.namespace == namespace)
}

/// True if some selector scoped to `namespace` matches `labels`
pub fn selected(cm: &CertMerge, namespace: &str, labels: Option<&BTreeMap<String, String>>) -> bool {
    cm.spec
        .selector
        .iter()
        .filter(|sel| sel.namespace == namespace)
        .any(|sel| selector_matches(sel, labels))
}

/// Subset match of a selector's label set against an object's labels
///
/// An empty match set never matches: it would otherwise select every Secret in
/// the namespace.
pub fn selector_matches(sel: &SecretSelector, labels: Option<&BTreeMap<String, String>>) -> bool {
    if sel.is_empty() {
        return false;
    }
    let Some(labels) = labels else {
        return false;
    };
    sel.label_selector
        .match_labels
        .iter()
        .all(|(k, v)| labels.get(k) == Some(v))
}

//! CertMerge Custom Resource Definition
//!
//! A CertMerge describes one aggregated output Secret and the TLS Secrets
//! whose certificate and key should be copied into it.

use std::collections::BTreeMap;

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Specification for a CertMerge
///
/// Sources are selected two ways, both optional and unioned:
/// - `secretlist`: explicit `(name, namespace)` references
/// - `selector`: label match sets, each scoped to one namespace
///
/// Example:
/// ```yaml
/// apiVersion: certmerge.lecentre.net/v1alpha1
/// kind: CertMerge
/// metadata:
///   name: ingress-bundle
///   namespace: ingress
/// spec:
///   name: merged-tls
///   namespace: ingress
///   secretlist:
///     - name: tls-a
///       namespace: team-a
///   selector:
///     - namespace: team-b
///       labelselector:
///         matchLabels:
///           certmerge: "true"
/// ```
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "certmerge.lecentre.net",
    version = "v1alpha1",
    kind = "CertMerge",
    plural = "certmerges",
    namespaced,
    status = "CertMergeStatus",
    printcolumn = r#"{"name":"Secret","type":"string","jsonPath":".spec.name"}"#,
    printcolumn = r#"{"name":"Target","type":"string","jsonPath":".spec.namespace"}"#,
    printcolumn = r#"{"name":"UpToDate","type":"boolean","jsonPath":".status.uptodate"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
pub struct CertMergeSpec {
    /// Name of the merged output Secret
    #[serde(rename = "name")]
    pub secret_name: String,

    /// Namespace of the merged output Secret (defaults to the CertMerge's own)
    #[serde(rename = "namespace", default)]
    pub secret_namespace: String,

    /// Label selectors, each evaluated in a single namespace
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub selector: Vec<SecretSelector>,

    /// Explicitly listed source Secrets
    #[serde(rename = "secretlist", default, skip_serializing_if = "Vec::is_empty")]
    pub secret_list: Vec<SecretDefinition>,
}

/// Selects Secrets by label inside one namespace
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct SecretSelector {
    /// Label match set; an empty set selects nothing
    #[serde(rename = "labelselector", default)]
    pub label_selector: LabelSelector,

    /// Namespace the selector is evaluated in
    pub namespace: String,
}

/// Equality-based label match set
///
/// Only `matchLabels` is honoured. Every pair must be present on a Secret for
/// it to match.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct LabelSelector {
    /// Required label key/value pairs
    #[serde(rename = "matchLabels", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub match_labels: BTreeMap<String, String>,
}

/// Explicit reference to a source Secret
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub struct SecretDefinition {
    /// Secret name
    pub name: String,
    /// Secret namespace
    pub namespace: String,
}

/// Observed state of a CertMerge
///
/// Purely diagnostic: the reconciler writes it after a successful pass and
/// never reads it back as an input.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct CertMergeStatus {
    /// True once the output Secret reflects the latest pass
    #[serde(rename = "uptodate", default)]
    pub up_to_date: bool,

    /// resourceVersion of the output Secret written by the last pass
    #[serde(default)]
    pub version: Option<String>,

    /// `namespace/name` of every source merged by the last pass
    ///
    /// Always serialized, so a merge patch clears a previously longer list.
    #[serde(default)]
    pub items: Vec<String>,

    /// RFC 3339 time of the last status change
    #[serde(
        rename = "updatedTimestamp",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub updated_timestamp: Option<String>,
}

impl SecretSelector {
    /// Returns true if this selector has no labels and must be ignored
    pub fn is_empty(&self) -> bool {
        self.label_selector.match_labels.is_empty()
    }
}

impl CertMerge {
    /// `namespace/name` identity used in logs and errors
    pub fn key(&self) -> String {
        format!(
            "{}/{}",
            self.namespace().unwrap_or_default(),
            self.name_any()
        )
    }

    /// Namespace the output Secret is written to
    pub fn output_namespace(&self) -> String {
        if self.spec.secret_namespace.is_empty() {
            self.namespace().unwrap_or_else(|| "default".to_string())
        } else {
            self.spec.secret_namespace.clone()
        }
    }

    /// Name of the output Secret
    pub fn output_name(&self) -> &str {
        &self.spec.secret_name
    }

    /// Validate the spec before any API call is made
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.spec.secret_name.trim().is_empty() {
            return Err(crate::Error::validation(
                self.key(),
                "spec.name must name the output Secret",
            ));
        }
        if let Some(entry) = self
            .spec
            .secret_list
            .iter()
            .find(|d| d.name.is_empty() || d.namespace.is_empty())
        {
            return Err(crate::Error::validation(
                self.key(),
                format!(
                    "spec.secretlist entry '{}/{}' needs both name and namespace",
                    entry.namespace, entry.name
                ),
            ));
        }
        Ok(())
    }
}

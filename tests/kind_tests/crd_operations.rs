//! Integration tests for CRD operations
//!
//! These tests tell the story of how users interact with CertMerge resources
//! through the Kubernetes API, before any controller is involved.

use std::collections::BTreeMap;

use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};

use certmerge::crd::{
    CertMerge, CertMergeSpec, CertMergeStatus, LabelSelector, SecretDefinition, SecretSelector,
};

use super::helpers::{cleanup_namespace, ensure_namespace, ensure_test_cluster};

// =============================================================================
// Test Fixtures
// =============================================================================

fn sample_cert_merge(namespace: &str, name: &str) -> CertMerge {
    let mut cm = CertMerge::new(
        name,
        CertMergeSpec {
            secret_name: "bundle".to_string(),
            secret_namespace: namespace.to_string(),
            selector: vec![SecretSelector {
                namespace: namespace.to_string(),
                label_selector: LabelSelector {
                    match_labels: BTreeMap::from([("team".to_string(), "x".to_string())]),
                },
            }],
            secret_list: vec![SecretDefinition {
                name: "tls-a".to_string(),
                namespace: namespace.to_string(),
            }],
        },
    );
    cm.metadata.namespace = Some(namespace.to_string());
    cm
}

// =============================================================================
// Stories
// =============================================================================

/// Story: A user applies a CertMerge and reads it back unchanged
///
/// The API server must accept the wire names (`secretlist`, `labelselector`,
/// `matchLabels`) and return them as written.
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_user_creates_and_reads_cert_merge() {
    let client = ensure_test_cluster()
        .await
        .expect("failed to setup cluster");
    let namespace = "certmerge-crd-create";
    ensure_namespace(&client, namespace)
        .await
        .expect("failed to create namespace");

    let api: Api<CertMerge> = Api::namespaced(client.clone(), namespace);
    let cm = sample_cert_merge(namespace, "roundtrip");

    api.create(&PostParams::default(), &cm)
        .await
        .expect("failed to create CertMerge");

    let fetched = api.get("roundtrip").await.expect("failed to get CertMerge");
    assert_eq!(fetched.spec, cm.spec);
    assert!(fetched.metadata.uid.is_some());

    cleanup_namespace(&client, namespace).await;
}

/// Story: Status is a subresource, so a status patch leaves the spec alone
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_status_is_written_through_subresource() {
    let client = ensure_test_cluster()
        .await
        .expect("failed to setup cluster");
    let namespace = "certmerge-crd-status";
    ensure_namespace(&client, namespace)
        .await
        .expect("failed to create namespace");

    let api: Api<CertMerge> = Api::namespaced(client.clone(), namespace);
    api.create(&PostParams::default(), &sample_cert_merge(namespace, "with-status"))
        .await
        .expect("failed to create CertMerge");

    let status = CertMergeStatus {
        up_to_date: true,
        version: Some("1".to_string()),
        items: vec![format!("{namespace}/tls-a")],
        updated_timestamp: None,
    };
    api.patch_status(
        "with-status",
        &PatchParams::default(),
        &Patch::Merge(serde_json::json!({ "status": status })),
    )
    .await
    .expect("failed to patch status");

    let fetched = api.get("with-status").await.expect("failed to get CertMerge");
    assert_eq!(fetched.status, Some(status));
    assert_eq!(fetched.spec.secret_name, "bundle");

    api.delete("with-status", &DeleteParams::default())
        .await
        .expect("failed to delete CertMerge");
    cleanup_namespace(&client, namespace).await;
}

//! Integration tests for the CertMerge controller
//!
//! Each story runs the controller in-process against a namespace of its own
//! and watches the merged Secret converge.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::Client;

use certmerge::crd::{CertMerge, CertMergeSpec, LabelSelector, SecretDefinition, SecretSelector};
use certmerge::{CREATOR_NAME, LABEL_CERTMERGE, LABEL_CREATOR, OUTPUT_SECRET_TYPE};

use super::helpers::{
    apply_secret, cleanup_namespace, ensure_namespace, ensure_test_cluster, entry,
    start_controller, tls_secret, wait_for, wait_for_secret, CONVERGE_TIMEOUT,
};

// =============================================================================
// Test Fixtures
// =============================================================================

fn cert_merge(
    namespace: &str,
    name: &str,
    output: &str,
    list: &[&str],
    selector: Option<(&str, &str)>,
) -> CertMerge {
    let mut cm = CertMerge::new(
        name,
        CertMergeSpec {
            secret_name: output.to_string(),
            secret_namespace: String::new(),
            selector: selector
                .map(|(k, v)| SecretSelector {
                    namespace: namespace.to_string(),
                    label_selector: LabelSelector {
                        match_labels: BTreeMap::from([(k.to_string(), v.to_string())]),
                    },
                })
                .into_iter()
                .collect(),
            secret_list: list
                .iter()
                .map(|n| SecretDefinition {
                    name: n.to_string(),
                    namespace: namespace.to_string(),
                })
                .collect(),
        },
    );
    cm.metadata.namespace = Some(namespace.to_string());
    cm
}

async fn setup(namespace: &str) -> Client {
    let client = ensure_test_cluster()
        .await
        .expect("failed to setup cluster");
    ensure_namespace(&client, namespace)
        .await
        .expect("failed to create namespace");
    client
}

async fn create_cert_merge(client: &Client, cm: &CertMerge) {
    let namespace = cm.metadata.namespace.as_deref().unwrap_or("default");
    let api: Api<CertMerge> = Api::namespaced(client.clone(), namespace);
    api.create(&PostParams::default(), cm)
        .await
        .expect("failed to create CertMerge");
}

// =============================================================================
// Stories
// =============================================================================

/// Story: An operator bundles two listed TLS Secrets
///
/// Expected behavior:
/// - The output Secret appears with `<name>.crt` / `<name>.key` entries
/// - It is Opaque, labelled, and owned by the CertMerge
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_listed_sources_are_bundled() {
    let namespace = "certmerge-listed";
    let client = setup(namespace).await;
    let controller = start_controller(client.clone(), namespace);

    apply_secret(&client, &tls_secret(namespace, "tls-a", "CA", "KA", &[]))
        .await
        .expect("failed to create tls-a");
    apply_secret(&client, &tls_secret(namespace, "tls-b", "CB", "KB", &[]))
        .await
        .expect("failed to create tls-b");
    create_cert_merge(
        &client,
        &cert_merge(namespace, "listed", "bundle", &["tls-a", "tls-b"], None),
    )
    .await;

    let output = wait_for_secret(&client, namespace, "bundle", |s| {
        entry(s, "tls-b.key").is_some()
    })
    .await
    .expect("output Secret never converged");

    assert_eq!(entry(&output, "tls-a.crt").as_deref(), Some("CA"));
    assert_eq!(entry(&output, "tls-a.key").as_deref(), Some("KA"));
    assert_eq!(entry(&output, "tls-b.crt").as_deref(), Some("CB"));
    assert_eq!(output.type_.as_deref(), Some(OUTPUT_SECRET_TYPE));
    let labels = output.metadata.labels.clone().unwrap_or_default();
    assert_eq!(labels.get(LABEL_CERTMERGE).map(String::as_str), Some("listed"));
    assert_eq!(labels.get(LABEL_CREATOR).map(String::as_str), Some(CREATOR_NAME));
    let owners = output.metadata.owner_references.unwrap_or_default();
    assert!(owners.iter().any(|o| o.kind == "CertMerge" && o.name == "listed"));

    controller.abort();
    cleanup_namespace(&client, namespace).await;
}

/// Story: A certificate is rotated and the bundle follows
///
/// A new Secret matching the selector joins the bundle, and rewriting an
/// existing source's bytes replaces its entries.
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_rotation_and_new_sources_propagate() {
    let namespace = "certmerge-rotation";
    let client = setup(namespace).await;
    let controller = start_controller(client.clone(), namespace);

    apply_secret(
        &client,
        &tls_secret(namespace, "edge", "C1", "K1", &[("team", "x")]),
    )
    .await
    .expect("failed to create edge");
    create_cert_merge(
        &client,
        &cert_merge(namespace, "team-x", "team-x-bundle", &[], Some(("team", "x"))),
    )
    .await;

    wait_for_secret(&client, namespace, "team-x-bundle", |s| {
        entry(s, "edge.crt").as_deref() == Some("C1")
    })
    .await
    .expect("initial bundle never converged");

    apply_secret(
        &client,
        &tls_secret(namespace, "edge", "C2", "K2", &[("team", "x")]),
    )
    .await
    .expect("failed to rotate edge");
    apply_secret(
        &client,
        &tls_secret(namespace, "api", "C3", "K3", &[("team", "x")]),
    )
    .await
    .expect("failed to create api");
    apply_secret(
        &client,
        &tls_secret(namespace, "other", "C4", "K4", &[("team", "y")]),
    )
    .await
    .expect("failed to create other");

    let output = wait_for_secret(&client, namespace, "team-x-bundle", |s| {
        entry(s, "edge.crt").as_deref() == Some("C2") && entry(s, "api.crt").is_some()
    })
    .await
    .expect("rotation never propagated");

    assert_eq!(entry(&output, "edge.key").as_deref(), Some("K2"));
    assert!(entry(&output, "other.crt").is_none());

    controller.abort();
    cleanup_namespace(&client, namespace).await;
}

/// Story: Someone edits the merged Secret by hand
///
/// The controller owns the output, so the edit is reverted to the merged
/// content.
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_tampered_output_is_reverted() {
    let namespace = "certmerge-tamper";
    let client = setup(namespace).await;
    let controller = start_controller(client.clone(), namespace);

    apply_secret(&client, &tls_secret(namespace, "tls-a", "CA", "KA", &[]))
        .await
        .expect("failed to create tls-a");
    create_cert_merge(
        &client,
        &cert_merge(namespace, "guarded", "guarded-bundle", &["tls-a"], None),
    )
    .await;
    wait_for_secret(&client, namespace, "guarded-bundle", |s| {
        entry(s, "tls-a.crt").is_some()
    })
    .await
    .expect("bundle never converged");

    let secrets: Api<Secret> = Api::namespaced(client.clone(), namespace);
    secrets
        .patch(
            "guarded-bundle",
            &PatchParams::default(),
            &Patch::Merge(serde_json::json!({ "stringData": { "injected.crt": "X" } })),
        )
        .await
        .expect("failed to tamper with bundle");

    let output = wait_for_secret(&client, namespace, "guarded-bundle", |s| {
        entry(s, "injected.crt").is_none()
    })
    .await
    .expect("tampering was never reverted");
    assert_eq!(entry(&output, "tls-a.crt").as_deref(), Some("CA"));

    controller.abort();
    cleanup_namespace(&client, namespace).await;
}

/// Story: Deleting the CertMerge removes the merged Secret
///
/// The controller does nothing itself; garbage collection follows the owner
/// reference.
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_deleting_cert_merge_collects_output() {
    let namespace = "certmerge-gc";
    let client = setup(namespace).await;
    let controller = start_controller(client.clone(), namespace);

    apply_secret(&client, &tls_secret(namespace, "tls-a", "CA", "KA", &[]))
        .await
        .expect("failed to create tls-a");
    create_cert_merge(
        &client,
        &cert_merge(namespace, "short-lived", "short-lived-bundle", &["tls-a"], None),
    )
    .await;
    wait_for_secret(&client, namespace, "short-lived-bundle", |s| {
        entry(s, "tls-a.crt").is_some()
    })
    .await
    .expect("bundle never converged");

    let cms: Api<CertMerge> = Api::namespaced(client.clone(), namespace);
    cms.delete("short-lived", &DeleteParams::foreground())
        .await
        .expect("failed to delete CertMerge");

    let secrets: Api<Secret> = Api::namespaced(client.clone(), namespace);
    let gone = wait_for(CONVERGE_TIMEOUT, || {
        let secrets = secrets.clone();
        async move {
            match secrets.get_opt("short-lived-bundle").await {
                Ok(None) => Some(()),
                _ => None,
            }
        }
    })
    .await;
    assert!(gone.is_some(), "output Secret was not garbage collected");

    // The source itself is never touched
    assert!(secrets.get_opt("tls-a").await.expect("get tls-a").is_some());

    controller.abort();
    cleanup_namespace(&client, namespace).await;
}

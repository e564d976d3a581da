//! CertMerge controller implementation
//!
//! One pass recomputes the merged Secret from scratch: fetch the CertMerge,
//! resolve its sources, aggregate them and write the output Secret in full.
//! Nothing from a previous pass (including the CertMerge status) is trusted,
//! so a retried or duplicated pass converges to the same bytes.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::controller::Action;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use crate::aggregate::aggregate;
use crate::crd::{CertMerge, CertMergeStatus};
use crate::retry::{FailureTracker, RetryConfig};
use crate::{
    Error, CREATOR_NAME, FIELD_MANAGER, LABEL_CERTMERGE, LABEL_CREATOR, OUTPUT_SECRET_TYPE,
};

/// Default deadline for a single API call
pub const DEFAULT_API_TIMEOUT: Duration = Duration::from_secs(10);

/// Trait abstracting the Kubernetes API operations a pass needs
///
/// This trait allows mocking the Kubernetes client in tests while using
/// the real client in production. Reads return `Ok(None)` for a 404.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Fetch a CertMerge by identity
    async fn get_cert_merge(&self, namespace: &str, name: &str)
        -> Result<Option<CertMerge>, Error>;

    /// List every CertMerge in scope
    async fn list_cert_merges(&self) -> Result<Vec<CertMerge>, Error>;

    /// Fetch a Secret by identity
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error>;

    /// List Secrets in `namespace` carrying every label in `match_labels`
    async fn list_secrets(
        &self,
        namespace: &str,
        match_labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Secret>, Error>;

    /// Create a Secret
    async fn create_secret(&self, secret: &Secret) -> Result<Secret, Error>;

    /// Replace a Secret wholesale (PUT), honouring its resourceVersion
    async fn replace_secret(&self, secret: &Secret) -> Result<Secret, Error>;

    /// Merge-patch the status subresource of a CertMerge
    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &CertMergeStatus,
    ) -> Result<(), Error>;
}

/// Render a label map as an equality selector (`k1=v1,k2=v2`)
pub fn label_selector(match_labels: &BTreeMap<String, String>) -> String {
    match_labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Real Kubernetes client implementation
pub struct KubeClientImpl {
    client: Client,
    timeout: Duration,
    watch_namespace: Option<String>,
}

impl KubeClientImpl {
    /// Create a new KubeClientImpl wrapping the given kube Client
    pub fn new(client: Client, timeout: Duration, watch_namespace: Option<String>) -> Self {
        Self {
            client,
            timeout,
            watch_namespace,
        }
    }

    /// Bound a single API call by the configured deadline
    async fn bounded<T, F>(&self, operation: impl FnOnce() -> String, call: F) -> Result<T, Error>
    where
        F: Future<Output = Result<T, kube::Error>>,
    {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result.map_err(Error::from),
            Err(_) => Err(Error::timeout(operation(), self.timeout)),
        }
    }

    fn secret_identity(secret: &Secret) -> Result<(String, String), Error> {
        let name = secret
            .metadata
            .name
            .clone()
            .ok_or_else(|| Error::internal("secret has no name"))?;
        let namespace = secret
            .metadata
            .namespace
            .clone()
            .ok_or_else(|| Error::internal(format!("secret {name} has no namespace")))?;
        Ok((namespace, name))
    }

    fn post_params() -> PostParams {
        PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        }
    }
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn get_cert_merge(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<CertMerge>, Error> {
        let api: Api<CertMerge> = Api::namespaced(self.client.clone(), namespace);
        self.bounded(|| format!("get certmerge {namespace}/{name}"), api.get_opt(name))
            .await
    }

    async fn list_cert_merges(&self) -> Result<Vec<CertMerge>, Error> {
        let api: Api<CertMerge> = match &self.watch_namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };
        let list = self
            .bounded(
                || "list certmerges".to_string(),
                api.list(&ListParams::default()),
            )
            .await?;
        Ok(list.items)
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        self.bounded(|| format!("get secret {namespace}/{name}"), api.get_opt(name))
            .await
    }

    async fn list_secrets(
        &self,
        namespace: &str,
        match_labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Secret>, Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let selector = label_selector(match_labels);
        let params = ListParams::default().labels(&selector);
        let list = self
            .bounded(
                || format!("list secrets in {namespace} matching {selector}"),
                api.list(&params),
            )
            .await?;
        Ok(list.items)
    }

    async fn create_secret(&self, secret: &Secret) -> Result<Secret, Error> {
        let (namespace, name) = Self::secret_identity(secret)?;
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &namespace);
        self.bounded(
            || format!("create secret {namespace}/{name}"),
            api.create(&Self::post_params(), secret),
        )
        .await
    }

    async fn replace_secret(&self, secret: &Secret) -> Result<Secret, Error> {
        let (namespace, name) = Self::secret_identity(secret)?;
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &namespace);
        self.bounded(
            || format!("replace secret {namespace}/{name}"),
            api.replace(&name, &Self::post_params(), secret),
        )
        .await
    }

    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &CertMergeStatus,
    ) -> Result<(), Error> {
        let api: Api<CertMerge> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({ "status": status });
        self.bounded(
            || format!("patch certmerge status {namespace}/{name}"),
            api.patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch)),
        )
        .await?;
        Ok(())
    }
}

/// Controller context containing shared state
///
/// Built once at startup and handed to every pass; there is no global
/// client lookup.
pub struct Context {
    /// Kubernetes client for API operations (trait object for testability)
    pub kube: Arc<dyn KubeClient>,
    /// Backoff applied by [`error_policy`]
    pub retry: RetryConfig,
    /// Consecutive failures per CertMerge
    pub failures: FailureTracker,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client) -> ContextBuilder {
        ContextBuilder::new(client)
    }

    /// Create a context for testing with a custom mock client
    #[cfg(test)]
    pub fn for_testing(kube: Arc<dyn KubeClient>) -> Self {
        Self {
            kube,
            retry: RetryConfig::default(),
            failures: FailureTracker::new(),
        }
    }
}

/// Builder for constructing [`Context`] instances
///
/// ```ignore
/// let ctx = Context::builder(client)
///     .api_timeout(Duration::from_secs(5))
///     .watch_namespace(Some("certs".to_string()))
///     .build();
/// ```
pub struct ContextBuilder {
    client: Client,
    api_timeout: Duration,
    watch_namespace: Option<String>,
    retry: RetryConfig,
}

impl ContextBuilder {
    fn new(client: Client) -> Self {
        Self {
            client,
            api_timeout: DEFAULT_API_TIMEOUT,
            watch_namespace: None,
            retry: RetryConfig::default(),
        }
    }

    /// Deadline for each API call made by the default client
    pub fn api_timeout(mut self, timeout: Duration) -> Self {
        self.api_timeout = timeout;
        self
    }

    /// Restrict CertMerge listing to one namespace
    pub fn watch_namespace(mut self, namespace: Option<String>) -> Self {
        self.watch_namespace = namespace;
        self
    }

    /// Backoff used by the error policy
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        Context {
            kube: Arc::new(KubeClientImpl::new(
                self.client,
                self.api_timeout,
                self.watch_namespace,
            )),
            retry: self.retry,
            failures: FailureTracker::new(),
        }
    }
}

/// Result of one successful pass
#[derive(Clone, Debug, PartialEq)]
pub enum PassOutcome {
    /// The CertMerge no longer exists; garbage collection handles the output
    NotFound,
    /// The spec cannot be acted on until the user edits it
    Invalid,
    /// The output Secret was created
    Created,
    /// The output Secret was overwritten
    Updated,
    /// The output Secret already held the desired content
    Unchanged,
}

/// Reconcile a CertMerge resource
///
/// Entry point for the kube-rs controller. The cached object only supplies
/// the identity; the pass itself re-reads the CertMerge.
#[instrument(skip(cm, ctx), fields(certmerge = %cm.key()))]
pub async fn reconcile(cm: Arc<CertMerge>, ctx: Arc<Context>) -> Result<Action, Error> {
    let namespace = cm.namespace().unwrap_or_default();
    let name = cm.name_any();

    let outcome = reconcile_pass(&ctx, &namespace, &name).await?;
    ctx.failures.reset(&cm.key());

    debug!(?outcome, "pass finished");
    Ok(Action::await_change())
}

/// Run one full convergence pass for the CertMerge `namespace/name`
pub async fn reconcile_pass(
    ctx: &Context,
    namespace: &str,
    name: &str,
) -> Result<PassOutcome, Error> {
    info!(certmerge = %name, namespace = %namespace, "Reconciling CertMerge");

    let Some(cm) = ctx.kube.get_cert_merge(namespace, name).await? else {
        info!(certmerge = %name, namespace = %namespace, "CertMerge not found, nothing to do");
        return Ok(PassOutcome::NotFound);
    };

    if let Err(e) = cm.validate() {
        warn!(error = %e, "CertMerge spec is invalid, waiting for a change");
        return Ok(PassOutcome::Invalid);
    }

    let mut desired = output_secret_for(&cm)?;

    let sources = resolve_sources(ctx, &cm).await;
    let merged = aggregate(&cm.key(), &sources);
    if merged.skipped > 0 {
        info!(
            certmerge = %cm.key(),
            skipped = merged.skipped,
            "Some sources were not TLS Secrets"
        );
    }
    desired.data = Some(merged.data);

    let out_ns = cm.output_namespace();
    let out_name = cm.output_name();

    let (written, outcome) = match ctx.kube.get_secret(&out_ns, out_name).await? {
        None => {
            info!(
                certmerge = %cm.key(),
                "Creating a new Secret {}/{}", out_ns, out_name
            );
            let created = ctx.kube.create_secret(&desired).await.inspect_err(|e| {
                error!(
                    certmerge = %cm.key(),
                    error = %e,
                    "Error creating new Secret {}/{}", out_ns, out_name
                );
            })?;
            (created, PassOutcome::Created)
        }
        Some(found) if output_up_to_date(&found, &desired) => {
            debug!(
                certmerge = %cm.key(),
                "Secret {}/{} already up to date", out_ns, out_name
            );
            (found, PassOutcome::Unchanged)
        }
        Some(found) => {
            info!(
                certmerge = %cm.key(),
                "Updating Secret {}/{}", out_ns, out_name
            );
            desired.metadata.resource_version = found.metadata.resource_version.clone();
            let updated = ctx.kube.replace_secret(&desired).await.inspect_err(|e| {
                error!(
                    certmerge = %cm.key(),
                    error = %e,
                    "Error updating Secret {}/{}", out_ns, out_name
                );
            })?;
            (updated, PassOutcome::Updated)
        }
    };

    update_status(ctx, &cm, &written, merged.merged).await;
    Ok(outcome)
}

/// Build the empty output Secret for a CertMerge
///
/// Carries the fixed labels and, when the output shares the CertMerge's
/// namespace, a controller owner reference so deleting the CertMerge garbage
/// collects the output. Owner references cannot cross namespaces.
pub fn output_secret_for(cm: &CertMerge) -> Result<Secret, Error> {
    let out_ns = cm.output_namespace();

    let owner_references = if cm.namespace().as_deref() == Some(out_ns.as_str()) {
        let owner = cm.controller_owner_ref(&()).ok_or_else(|| {
            Error::ownership(cm.key(), "CertMerge has no uid, cannot own the output Secret")
        })?;
        Some(vec![owner])
    } else {
        warn!(
            certmerge = %cm.key(),
            output_namespace = %out_ns,
            "Output Secret is in another namespace, it will not be garbage collected"
        );
        None
    };

    let labels = BTreeMap::from([
        (LABEL_CERTMERGE.to_string(), cm.name_any()),
        (LABEL_CREATOR.to_string(), CREATOR_NAME.to_string()),
    ]);

    Ok(Secret {
        metadata: ObjectMeta {
            name: Some(cm.output_name().to_string()),
            namespace: Some(out_ns),
            labels: Some(labels),
            owner_references,
            ..Default::default()
        },
        type_: Some(OUTPUT_SECRET_TYPE.to_string()),
        ..Default::default()
    })
}

/// Resolve sources in merge order: explicit list, then each selector
///
/// Per-source failures are logged and skipped; they never fail the pass.
async fn resolve_sources(ctx: &Context, cm: &CertMerge) -> Vec<Secret> {
    let key = cm.key();
    let mut sources = Vec::new();

    for def in &cm.spec.secret_list {
        match ctx.kube.get_secret(&def.namespace, &def.name).await {
            Ok(Some(secret)) => sources.push(secret),
            Ok(None) => warn!(
                certmerge = %key,
                "requested certificate {}/{} not found, skipping", def.namespace, def.name
            ),
            Err(e) => warn!(
                certmerge = %key,
                error = %e,
                "failed to fetch certificate {}/{}, skipping", def.namespace, def.name
            ),
        }
    }

    for sel in &cm.spec.selector {
        if sel.is_empty() {
            warn!(
                certmerge = %key,
                namespace = %sel.namespace,
                "no labels defined in selector, nothing to merge"
            );
            continue;
        }

        let labels = &sel.label_selector.match_labels;
        match ctx.kube.list_secrets(&sel.namespace, labels).await {
            Ok(found) => {
                info!(
                    certmerge = %key,
                    namespace = %sel.namespace,
                    labels = %label_selector(labels),
                    count = found.len(),
                    "found certificates to merge"
                );
                sources.extend(found);
            }
            Err(e) => warn!(
                certmerge = %key,
                namespace = %sel.namespace,
                labels = %label_selector(labels),
                error = %e,
                "failed to list certificates, skipping selector"
            ),
        }
    }

    sources
}

/// True if `found` already holds everything `desired` would write
fn output_up_to_date(found: &Secret, desired: &Secret) -> bool {
    let data_eq = found.data.clone().unwrap_or_default() == desired.data.clone().unwrap_or_default();

    let labels_present = desired.metadata.labels.iter().flatten().all(|(k, v)| {
        found
            .metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(k))
            == Some(v)
    });

    let owners_present = desired
        .metadata
        .owner_references
        .iter()
        .flatten()
        .all(|want| {
            found
                .metadata
                .owner_references
                .iter()
                .flatten()
                .any(|have| have.uid == want.uid && have.controller == want.controller)
        });

    data_eq && found.type_ == desired.type_ && labels_present && owners_present
}

/// Record the outcome on the CertMerge status
///
/// Skipped when nothing but the timestamp would change; otherwise every
/// status write would trigger another pass. Failures are logged only.
async fn update_status(ctx: &Context, cm: &CertMerge, written: &Secret, items: Vec<String>) {
    let version = written.metadata.resource_version.clone();

    if let Some(current) = &cm.status {
        if current.up_to_date && current.version == version && current.items == items {
            debug!(certmerge = %cm.key(), "Status unchanged, skipping update");
            return;
        }
    }

    let status = CertMergeStatus {
        up_to_date: true,
        version,
        items,
        updated_timestamp: Some(chrono::Utc::now().to_rfc3339()),
    };

    let namespace = cm.namespace().unwrap_or_default();
    if let Err(e) = ctx
        .kube
        .patch_status(&namespace, &cm.name_any(), &status)
        .await
    {
        warn!(certmerge = %cm.key(), error = %e, "Failed to update CertMerge status");
    }
}

/// Error policy for the controller
///
/// Consecutive failures of the same CertMerge back off exponentially.
/// Errors that cannot clear without a spec or RBAC change wait the maximum
/// delay.
pub fn error_policy(cm: Arc<CertMerge>, error: &Error, ctx: Arc<Context>) -> Action {
    let key = cm.key();
    let failures = ctx.failures.record_failure(&key);

    let delay = if error.is_retryable() {
        ctx.retry.jittered(ctx.retry.delay_for_attempt(failures))
    } else {
        ctx.retry.max_delay
    };

    error!(
        ?error,
        certmerge = %key,
        failures = failures,
        requeue_secs = delay.as_secs(),
        "reconciliation failed"
    );

    Action::requeue(delay)
}

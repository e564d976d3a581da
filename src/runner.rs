//! Controller runner - wires the CertMerge controller together
//!
//! The controller watches CertMerges (primary), the Secrets they own (so a
//! tampered output is rewritten) and every Secret in scope through
//! [`SecretTrigger`], which turns significant source changes into requests
//! for the CertMerges that reference them.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::{stream, StreamExt};
use k8s_openapi::api::core::v1::Secret;
use kube::runtime::watcher::{self, Config as WatcherConfig};
use kube::runtime::{Controller, WatchStreamExt};
use kube::{Api, Client};
use tracing::{info, warn};

use crate::controller::{error_policy, reconcile, Context, SecretTrigger, DEFAULT_API_TIMEOUT};
use crate::crd::CertMerge;
use crate::retry::RetryConfig;

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
/// This forces the API server to close the watch before the client times out,
/// preventing "body read timed out" errors on idle watches.
const WATCH_TIMEOUT_SECS: u32 = 25;

/// A controller future, ready to be awaited
pub type ControllerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Settings for [`build_controller`]
#[derive(Clone, Debug)]
pub struct RunnerConfig {
    /// Only watch this namespace; all namespaces when `None`
    pub watch_namespace: Option<String>,
    /// Deadline for each API call made during a pass
    pub api_timeout: Duration,
    /// Backoff for failed passes
    pub retry: RetryConfig,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            watch_namespace: None,
            api_timeout: DEFAULT_API_TIMEOUT,
            retry: RetryConfig::default(),
        }
    }
}

impl RunnerConfig {
    fn api<K>(&self, client: Client) -> Api<K>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        K::DynamicType: Default,
    {
        match &self.watch_namespace {
            Some(ns) => Api::namespaced(client, ns),
            None => Api::all(client),
        }
    }
}

fn watcher_config() -> WatcherConfig {
    WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS)
}

/// Build the CertMerge controller future
///
/// Resolves when the process receives SIGTERM or SIGINT.
pub fn build_controller(client: Client, config: RunnerConfig) -> ControllerFuture {
    let ctx = Arc::new(
        Context::builder(client.clone())
            .api_timeout(config.api_timeout)
            .watch_namespace(config.watch_namespace.clone())
            .retry(config.retry.clone())
            .build(),
    );

    let cert_merges: Api<CertMerge> = config.api(client.clone());
    let secrets: Api<Secret> = config.api(client);

    match &config.watch_namespace {
        Some(ns) => info!(namespace = %ns, "- CertMerge controller (single namespace)"),
        None => info!("- CertMerge controller (all namespaces)"),
    }

    let controller = Controller::new(cert_merges, watcher_config());
    let trigger = Arc::new(SecretTrigger::new(controller.store()));

    let source_requests = watcher::watcher(secrets.clone(), watcher_config())
        .default_backoff()
        .filter_map(move |event| {
            let trigger = trigger.clone();
            async move {
                match event {
                    Ok(event) => Some(stream::iter(trigger.requests_for(event))),
                    Err(e) => {
                        warn!(error = %e, "Secret watch error");
                        None
                    }
                }
            }
        })
        .flatten();

    Box::pin(
        controller
            .owns(secrets, watcher_config())
            .reconcile_on(source_requests)
            .shutdown_on_signal()
            .run(reconcile, error_policy, ctx)
            .for_each(log_reconcile_result("CertMerge")),
    )
}

/// Log each reconcile result from a controller stream
fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}

//! CertMerge operator - merges TLS Secrets into a single Secret

use std::str::FromStr;
use std::time::Duration;

use clap::{ArgAction, Args, Parser, Subcommand};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, CustomResourceExt};

use certmerge::controller::{reconcile_pass, reconcile_secret, Context};
use certmerge::crd::CertMerge;
use certmerge::retry::{retry_with_backoff, RetryConfig};
use certmerge::runner::{build_controller, RunnerConfig};
use certmerge::telemetry::{init_telemetry, TelemetryConfig};
use certmerge::FIELD_MANAGER;

/// CertMerge - merges selected TLS Secrets into one Opaque Secret
#[derive(Parser, Debug)]
#[command(name = "certmerge-operator", version, about, long_about = None)]
struct Cli {
    /// Generate the CRD manifest and exit
    #[arg(long)]
    crd: bool,

    /// Log level used when RUST_LOG is unset
    #[arg(long, global = true, env = "CERTMERGE_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Emit JSON log lines
    #[arg(
        long,
        global = true,
        env = "CERTMERGE_LOG_JSON",
        default_value_t = true,
        action = ArgAction::Set
    )]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run as controller (default mode)
    ///
    /// Watches CertMerges and Secrets and keeps every merged Secret in sync
    /// with its sources until terminated.
    Controller(ControllerArgs),

    /// Run one pass now and exit
    ///
    /// With --certmerge, reconciles that CertMerge. With --secret, reconciles
    /// every CertMerge that lists or selects that Secret.
    Reconcile(ReconcileArgs),
}

/// Controller mode arguments
#[derive(Parser, Debug)]
struct ControllerArgs {
    /// Only watch this namespace (all namespaces when unset)
    #[arg(long, env = "WATCH_NAMESPACE")]
    watch_namespace: Option<String>,

    /// Deadline for each Kubernetes API call, in seconds
    #[arg(long, env = "CERTMERGE_API_TIMEOUT_SECS", default_value = "10")]
    api_timeout_secs: u64,

    /// Requeue delay after the first failed pass, in seconds
    #[arg(long, default_value = "1")]
    backoff_initial_secs: u64,

    /// Upper bound for the requeue delay, in seconds
    #[arg(long, default_value = "300")]
    backoff_max_secs: u64,

    /// Do not server-side apply the CRD on startup
    #[arg(long)]
    skip_crd_install: bool,
}

/// One-shot reconcile arguments
#[derive(Args, Debug)]
struct ReconcileArgs {
    /// CertMerge to reconcile, as namespace/name
    #[arg(long, required_unless_present = "secret", conflicts_with = "secret")]
    certmerge: Option<Identity>,

    /// Source Secret whose CertMerges should be reconciled, as namespace/name
    #[arg(long)]
    secret: Option<Identity>,

    /// Deadline for each Kubernetes API call, in seconds
    #[arg(long, default_value = "10")]
    api_timeout_secs: u64,
}

/// `namespace/name` on the command line
#[derive(Clone, Debug, PartialEq)]
struct Identity {
    namespace: String,
    name: String,
}

impl FromStr for Identity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((ns, name)) if !ns.is_empty() && !name.is_empty() && !name.contains('/') => {
                Ok(Self {
                    namespace: ns.to_string(),
                    name: name.to_string(),
                })
            }
            _ => Err(format!("expected namespace/name, got {s:?}")),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install crypto provider - aws-lc-rs
    // Failure here means no TLS connection to the API server can be made.
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!(
            "CRITICAL: Failed to install crypto provider: {:?}. \
             The operator cannot reach the API server without a working TLS implementation.",
            e
        );
        std::process::exit(1);
    }

    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&CertMerge::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    init_telemetry(TelemetryConfig {
        level: cli.log_level.clone(),
        json: cli.log_json,
    })?;

    match cli.command {
        Some(Commands::Reconcile(args)) => run_reconcile(args).await,
        Some(Commands::Controller(args)) => run_controller(args).await,
        // Bare invocation runs the controller with its defaults and env
        None => run_controller(ControllerArgs::parse_from(["certmerge-operator"])).await,
    }
}

/// Run the controller until SIGTERM/SIGINT
async fn run_controller(args: ControllerArgs) -> anyhow::Result<()> {
    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting CertMerge controller");

    if args.skip_crd_install {
        tracing::info!("Skipping CRD installation");
    } else {
        retry_with_backoff(
            &RetryConfig::with_max_attempts(5),
            "install CertMerge CRD",
            || ensure_crd_installed(&client),
        )
        .await?;
    }

    let config = RunnerConfig {
        watch_namespace: args.watch_namespace,
        api_timeout: Duration::from_secs(args.api_timeout_secs),
        retry: RetryConfig {
            initial_delay: Duration::from_secs(args.backoff_initial_secs),
            max_delay: Duration::from_secs(args.backoff_max_secs),
            ..Default::default()
        },
    };

    build_controller(client, config).await;

    tracing::info!("Shutting down");
    Ok(())
}

/// Run a single pass and report what it did
async fn run_reconcile(args: ReconcileArgs) -> anyhow::Result<()> {
    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;
    let ctx = Context::builder(client)
        .api_timeout(Duration::from_secs(args.api_timeout_secs))
        .build();

    if let Some(cm) = args.certmerge {
        let outcome = reconcile_pass(&ctx, &cm.namespace, &cm.name).await?;
        tracing::info!(
            certmerge = %format!("{}/{}", cm.namespace, cm.name),
            ?outcome,
            "Reconcile finished"
        );
    } else if let Some(secret) = args.secret {
        let reconciled = reconcile_secret(&ctx, &secret.namespace, &secret.name).await?;
        tracing::info!(
            secret = %secret.name,
            namespace = %secret.namespace,
            certmerges = reconciled.len(),
            "Reconcile finished"
        );
    }

    Ok(())
}

/// Server-side apply the CertMerge CRD
async fn ensure_crd_installed(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    tracing::info!("Installing CertMerge CRD...");
    crds.patch(CertMerge::crd_name(), &params, &Patch::Apply(&CertMerge::crd()))
        .await
        .map_err(|e| anyhow::anyhow!("Failed to install CertMerge CRD: {}", e))?;

    Ok(())
}

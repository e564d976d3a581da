//! Controller implementations for CertMerge
//!
//! Two entry points share one convergence pass: [`reconcile`] is keyed by a
//! CertMerge, [`reconcile_secret`] by a source Secret and fans out to every
//! CertMerge that references it.

mod cert_merge;
mod secret;

pub use cert_merge::{
    error_policy, label_selector, output_secret_for, reconcile, reconcile_pass, Context,
    ContextBuilder, KubeClient, KubeClientImpl, PassOutcome, DEFAULT_API_TIMEOUT,
};
pub use secret::{find_cert_merges_for, reconcile_secret, SecretTrigger};

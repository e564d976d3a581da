//! CertMerge - Kubernetes operator that merges TLS Secrets into one Secret
//!
//! A `CertMerge` resource names a set of TLS Secrets, either explicitly by
//! namespace and name or through per-namespace label selectors. The operator
//! keeps a single Opaque Secret up to date with the certificate and key of
//! every selected source, written as `<source>.crt` / `<source>.key`.
//!
//! # Modules
//!
//! - [`crd`] - The `CertMerge` Custom Resource Definition
//! - [`matcher`] - Pure membership test: does a Secret belong to a CertMerge?
//! - [`aggregate`] - Pure merge of resolved sources into the output byte map
//! - [`filter`] - Decides which Secret notifications are worth reconciling
//! - [`controller`] - Reconciliation logic and the reverse Secret index
//! - [`runner`] - Wires watches, filters and the reconciler into a controller
//! - [`retry`] - Backoff policies for failed passes and startup calls
//! - [`telemetry`] - Tracing subscriber setup
//! - [`error`] - Error types for the operator

#![deny(missing_docs)]

pub mod aggregate;
pub mod controller;
pub mod crd;
pub mod error;
pub mod filter;
pub mod matcher;
pub mod retry;
pub mod runner;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Wire Constants
// =============================================================================
// Consumers of the merged Secret depend on these names, so they live in one
// place and are shared by the reconciler, the filter and the tests.

/// Secret type tag of an eligible source (a certificate + private key pair)
pub const CREDENTIAL_PAIR_TYPE: &str = "kubernetes.io/tls";

/// Secret type of the merged output
pub const OUTPUT_SECRET_TYPE: &str = "Opaque";

/// Source payload key holding the certificate
pub const TLS_CERT_KEY: &str = "tls.crt";

/// Source payload key holding the private key
pub const TLS_PRIVATE_KEY_KEY: &str = "tls.key";

/// Suffix of the merged certificate entry (`<source>.crt`)
pub const MERGED_CERT_SUFFIX: &str = ".crt";

/// Suffix of the merged private key entry (`<source>.key`)
pub const MERGED_KEY_SUFFIX: &str = ".key";

/// Label on the output Secret naming the owning CertMerge
pub const LABEL_CERTMERGE: &str = "certmerge";

/// Label on the output Secret naming its creator
pub const LABEL_CREATOR: &str = "creator";

/// Value of [`LABEL_CREATOR`]
pub const CREATOR_NAME: &str = "certmerge-operator";

/// Field manager used for server-side apply and status patches
pub const FIELD_MANAGER: &str = "certmerge-operator";

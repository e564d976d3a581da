//! Integration tests for the CertMerge operator
//!
//! These tests require a Kubernetes cluster (kind) to run and tell the story
//! of how platform operators use CertMerge to bundle TLS Secrets.
//!
//! # Test Organization
//!
//! - `crd_operations`: Stories about creating and reading CertMerge resources
//!   through the Kubernetes API
//!
//! - `cert_merge_lifecycle`: Stories about the controller keeping a merged
//!   Secret in sync as sources and specs change
//!
//! # Running These Tests
//!
//! These tests are ignored by default because they require a kind cluster:
//!
//! ```bash
//! cargo test --test kind -- --ignored
//! ```

mod cert_merge_lifecycle;
mod crd_operations;

//! Custom Resource Definitions for CertMerge
//!
//! This module contains the CRD watched by the operator.

mod cert_merge;

pub use cert_merge::{
    CertMerge, CertMergeSpec, CertMergeStatus, LabelSelector, SecretDefinition, SecretSelector,
};

//! Merge of resolved source Secrets into the output byte map
//!
//! Sources are folded in resolution order (explicit list first, then each
//! selector's results in the order the API returned them). Each eligible
//! source contributes exactly two entries, `<name>.crt` and `<name>.key`.
//! Entry names ignore the source namespace, so two sources sharing a name
//! collide and the later one wins.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use tracing::{debug, info};

use crate::{
    CREDENTIAL_PAIR_TYPE, MERGED_CERT_SUFFIX, MERGED_KEY_SUFFIX, TLS_CERT_KEY, TLS_PRIVATE_KEY_KEY,
};

/// Desired content of the output Secret for one pass
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Aggregate {
    /// Output payload, keyed `<source>.crt` / `<source>.key`
    pub data: BTreeMap<String, ByteString>,
    /// `namespace/name` of every source that contributed, in merge order
    pub merged: Vec<String>,
    /// Number of sources skipped because they are not TLS Secrets
    pub skipped: usize,
}

/// Output entry name holding a source's certificate
pub fn cert_entry(source_name: &str) -> String {
    format!("{source_name}{MERGED_CERT_SUFFIX}")
}

/// Output entry name holding a source's private key
pub fn key_entry(source_name: &str) -> String {
    format!("{source_name}{MERGED_KEY_SUFFIX}")
}

/// Returns true if the Secret carries the credential-pair type tag
pub fn is_credential_pair(secret: &Secret) -> bool {
    secret.type_.as_deref() == Some(CREDENTIAL_PAIR_TYPE)
}

/// Build the output payload from sources in resolution order
///
/// Never fails: a source with the wrong type is skipped and counted, a TLS
/// Secret missing one of its keys contributes an empty value for it.
pub fn aggregate<'a>(certmerge: &str, sources: impl IntoIterator<Item = &'a Secret>) -> Aggregate {
    let mut out = Aggregate::default();

    for secret in sources {
        let name = secret.metadata.name.as_deref().unwrap_or_default();
        let namespace = secret.metadata.namespace.as_deref().unwrap_or_default();

        if !is_credential_pair(secret) {
            info!(
                certmerge = %certmerge,
                secret = %name,
                namespace = %namespace,
                secret_type = ?secret.type_,
                "Secret is not of TLS type, skipping"
            );
            out.skipped += 1;
            continue;
        }

        let payload = secret.data.as_ref();
        let field = |key: &str| {
            payload
                .and_then(|d| d.get(key))
                .cloned()
                .unwrap_or_else(|| ByteString(Vec::new()))
        };

        let cert_key = cert_entry(name);
        if out.data.contains_key(&cert_key) {
            debug!(
                certmerge = %certmerge,
                secret = %name,
                namespace = %namespace,
                "Source name already merged from another namespace, overwriting"
            );
        }

        out.data.insert(cert_key, field(TLS_CERT_KEY));
        out.data.insert(key_entry(name), field(TLS_PRIVATE_KEY_KEY));
        out.merged.push(format!("{namespace}/{name}"));

        debug!(
            certmerge = %certmerge,
            secret = %name,
            namespace = %namespace,
            "Added certificate to merge list"
        );
    }

    out
}

//! Sidecar injection
//!
//! The injector is a mutating admission webhook. For every Pod creation it:
//!
//! - decides whether the Pod belongs in the mesh (`eligibility`);
//! - provisions a bootstrap identity for a freshly minted proxy UUID (`identity`);
//! - merges pod-level overrides with mesh-wide defaults (`config`);
//! - builds the ordered JSON Patch that adds the proxy (`patch`).
//!
//! ```text
//! [ Received ] -> [ Evaluated ] -> [ Skipped ] ------------------> [ Responded ]
//!                       |                                              ^
//!                       +-------> [ Provisioning ] -> [ Patched ] -----+
//! ```
//!
//! Any failure after `Evaluated` denies the Pod rather than admitting it unpatched.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod config;
pub mod eligibility;
pub mod identity;
pub mod inject;
pub mod namespaces;
pub mod patch;
pub mod ports;


pub use self::{
    config::{merge_exclusion_list, EffectiveConfig},
    eligibility::should_inject,
    identity::{
        bootstrap_secret_name, CertificateIssuer, ProxyIdGenerator, ProxyIdentity, Provisioner,
        RandomProxyIds, WorkloadIdentity,
    },
    inject::{Injector, MeshConfigSource, NamespaceReader},
    namespaces::NonInjectNamespaces,
    patch::{build_patch, MetadataOp},
};
pub use ipnet::IpNet;
pub use uuid::Uuid;

use std::time::Duration;
use thiserror::Error;

/// Holds mesh-wide metadata that does not change at runtime.
#[derive(Clone, Debug)]
pub struct ClusterInfo {
    /// The name namespaces use to enroll in this mesh.
    pub mesh_name: String,

    /// The namespace where the control plane is deployed.
    pub control_plane_ns: String,

    /// The mesh identity trust domain.
    pub identity_domain: String,
}

/// Reasons an admission request is denied.
#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed admission request: {0}")]
    Malformed(String),

    #[error("failed to look up namespace {ns}: {source}")]
    NamespaceLookup {
        ns: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("namespace {0} not found")]
    NamespaceNotFound(String),

    #[error("cannot determine injection eligibility: {0}")]
    Eligibility(#[from] mesh_injector_k8s_api::meta::InvalidInjection),

    #[error("failed to read mesh configuration: {0}")]
    MeshConfig(#[source] anyhow::Error),

    #[error("invalid {annotation} annotation: {reason}")]
    Override {
        annotation: &'static str,
        reason: String,
    },

    #[error("failed to issue proxy bootstrap identity: {0}")]
    Issuance(#[source] anyhow::Error),

    #[error("failed to build patch: {0}")]
    Patch(String),

    #[error("injection did not complete within {0:?}")]
    Timeout(Duration),
}

// === impl ClusterInfo ===

impl ClusterInfo {
    pub fn service_account_identity(&self, ns: &str, sa: &str) -> String {
        format!(
            "{}.{}.serviceaccount.identity.{}.{}",
            sa, ns, self.control_plane_ns, self.identity_domain
        )
    }
}

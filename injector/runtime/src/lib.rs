#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use mesh_injector_core as core;
pub use mesh_injector_k8s_api as k8s;

mod admission;
mod args;
mod issuer;
mod mesh_config;
mod metrics;
mod namespaces;

pub use self::{
    admission::Admission,
    args::Args,
    issuer::{SecretIssuer, XdsAddress},
    mesh_config::{MeshConfigIndex, SharedMeshConfig},
    metrics::AdmissionMetrics,
    namespaces::{ApiNamespaces, NamespaceIndex},
};

/// The injector as served by the webhook.
pub type MeshInjector = core::Injector<SecretIssuer, ApiNamespaces, SharedMeshConfig>;

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod access;
pub mod config;
pub mod meta;

pub use self::{
    access::{IdentityBindingSubject, TrafficTarget, TrafficTargetSpec},
    config::{MeshConfig, MeshConfigSpec, ObservabilitySpec},
};
pub use k8s_openapi::{
    api::{
        self,
        core::v1::{
            Capabilities, Container, ContainerPort, EnvVar, Namespace, Pod, PodSpec,
            ResourceRequirements, Secret, SecretVolumeSource, SecurityContext, Volume, VolumeMount,
        },
    },
    apimachinery::pkg::api::resource::Quantity,
};
pub use kube::{
    api::{Api, ObjectMeta, ResourceExt},
    Client, Error, Resource,
};

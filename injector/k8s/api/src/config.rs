use crate::ResourceRequirements;
use ipnet::IpNet;
use std::num::NonZeroU16;

/// Mesh-wide configuration, read by the injector and the policy tooling.
#[derive(
    Clone,
    Debug,
    Default,
    PartialEq,
    kube::CustomResource,
    serde::Deserialize,
    serde::Serialize,
    schemars::JsonSchema,
)]
#[kube(
    group = "config.mesh.io",
    version = "v1alpha1",
    kind = "MeshConfig",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct MeshConfigSpec {
    #[serde(default)]
    pub sidecar: SidecarSpec,

    #[serde(default)]
    pub traffic: TrafficSpec,

    #[serde(default)]
    pub observability: ObservabilitySpec,
}

#[derive(
    Clone, Debug, Default, PartialEq, serde::Deserialize, serde::Serialize, schemars::JsonSchema,
)]
#[serde(rename_all = "camelCase")]
pub struct SidecarSpec {
    #[serde(default)]
    pub log_level: String,

    #[serde(default)]
    pub envoy_image: String,

    #[serde(default)]
    pub init_container_image: String,

    #[serde(default)]
    pub enable_privileged_init_container: bool,

    pub resources: Option<ResourceRequirements>,
}

#[derive(
    Clone, Debug, Default, PartialEq, serde::Deserialize, serde::Serialize, schemars::JsonSchema,
)]
#[serde(rename_all = "camelCase")]
pub struct TrafficSpec {
    #[serde(default)]
    pub enable_permissive_traffic_policy_mode: bool,

    #[serde(rename = "outboundIPRangeExclusionList")]
    pub outbound_ip_range_exclusion_list: Option<Vec<IpNet>>,

    pub outbound_port_exclusion_list: Option<Vec<NonZeroU16>>,
}

#[derive(Clone, Debug, PartialEq, serde::Deserialize, serde::Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ObservabilitySpec {
    #[serde(default = "enabled")]
    pub enable_prometheus_scraping: bool,
}

fn enabled() -> bool {
    true
}

impl Default for ObservabilitySpec {
    fn default() -> Self {
        Self {
            enable_prometheus_scraping: true,
        }
    }
}

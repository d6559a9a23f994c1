use crate::{ports::parse_portset, Error};
use ipnet::IpNet;
use mesh_injector_k8s_api::{
    meta::{
        OUTBOUND_IP_RANGE_EXCLUSION_LIST_ANNOTATION, OUTBOUND_PORT_EXCLUSION_LIST_ANNOTATION,
        PROXY_CPU_LIMIT_ANNOTATION, PROXY_CPU_REQUEST_ANNOTATION, PROXY_LOG_LEVEL_ANNOTATION,
        PROXY_MEMORY_LIMIT_ANNOTATION, PROXY_MEMORY_REQUEST_ANNOTATION,
    },
    MeshConfigSpec, ObjectMeta, ObservabilitySpec, Quantity, ResourceRequirements,
};
use std::{
    collections::{BTreeMap, BTreeSet},
    num::NonZeroU16,
};

const LOG_LEVELS: &[&str] = &[
    "trace", "debug", "info", "warn", "warning", "error", "critical", "off",
];

/// The configuration a single injection is performed with.
#[derive(Clone, Debug, PartialEq)]
pub struct EffectiveConfig {
    pub proxy_image: String,
    pub init_image: String,
    pub log_level: String,
    pub privileged_init: bool,

    /// `None` when neither the pod nor the mesh configures exclusions.
    pub outbound_ip_range_exclusions: Option<Vec<IpNet>>,

    /// `None` when neither the pod nor the mesh configures exclusions.
    pub outbound_port_exclusions: Option<Vec<NonZeroU16>>,

    pub resources: ResourceRequirements,
    pub prometheus_scraping: bool,
}

/// Merges a pod-level exclusion list into the mesh-level one.
///
/// Pod settings augment mesh settings: the result is the union of both lists with duplicates
/// removed. Two absent lists stay absent.
pub fn merge_exclusion_list<T: Ord>(pod: Option<Vec<T>>, mesh: Option<Vec<T>>) -> Option<Vec<T>> {
    match (pod, mesh) {
        (None, None) => None,
        (pod, mesh) => Some(
            pod.into_iter()
                .flatten()
                .chain(mesh.into_iter().flatten())
                .collect::<BTreeSet<T>>()
                .into_iter()
                .collect(),
        ),
    }
}

// === impl EffectiveConfig ===

/// Matches a pod without overrides in a mesh using the default `MeshConfig`.
impl Default for EffectiveConfig {
    fn default() -> Self {
        Self {
            proxy_image: String::new(),
            init_image: String::new(),
            log_level: String::new(),
            privileged_init: false,
            outbound_ip_range_exclusions: None,
            outbound_port_exclusions: None,
            resources: ResourceRequirements::default(),
            prometheus_scraping: ObservabilitySpec::default().enable_prometheus_scraping,
        }
    }
}

impl EffectiveConfig {
    /// Combines the pod's override annotations with the mesh-wide defaults.
    pub fn merge(pod: &ObjectMeta, mesh: &MeshConfigSpec) -> Result<Self, Error> {
        let empty = BTreeMap::new();
        let annotations = pod.annotations.as_ref().unwrap_or(&empty);

        let pod_ports = annotations
            .get(OUTBOUND_PORT_EXCLUSION_LIST_ANNOTATION)
            .map(|v| {
                parse_portset(v)
                    .map(|ports| ports.into_iter().collect::<Vec<_>>())
                    .map_err(|error| Error::Override {
                        annotation: OUTBOUND_PORT_EXCLUSION_LIST_ANNOTATION,
                        reason: format!("{error:#}"),
                    })
            })
            .transpose()?;

        let pod_nets = annotations
            .get(OUTBOUND_IP_RANGE_EXCLUSION_LIST_ANNOTATION)
            .map(|v| parse_nets(v))
            .transpose()?;

        let log_level = match annotations.get(PROXY_LOG_LEVEL_ANNOTATION) {
            Some(level) => {
                let level = level.trim().to_ascii_lowercase();
                if !LOG_LEVELS.contains(&level.as_str()) {
                    return Err(Error::Override {
                        annotation: PROXY_LOG_LEVEL_ANNOTATION,
                        reason: format!("unknown log level {level:?}"),
                    });
                }
                level
            }
            None => mesh.sidecar.log_level.clone(),
        };

        let mut resources = mesh.sidecar.resources.clone().unwrap_or_default();
        for (annotation, field, resource) in [
            (PROXY_CPU_REQUEST_ANNOTATION, Field::Requests, "cpu"),
            (PROXY_CPU_LIMIT_ANNOTATION, Field::Limits, "cpu"),
            (PROXY_MEMORY_REQUEST_ANNOTATION, Field::Requests, "memory"),
            (PROXY_MEMORY_LIMIT_ANNOTATION, Field::Limits, "memory"),
        ] {
            if let Some(value) = annotations.get(annotation) {
                let quantity = parse_quantity(annotation, value)?;
                let map = match field {
                    Field::Requests => resources.requests.get_or_insert_with(Default::default),
                    Field::Limits => resources.limits.get_or_insert_with(Default::default),
                };
                map.insert(resource.to_string(), quantity);
            }
        }

        Ok(Self {
            proxy_image: mesh.sidecar.envoy_image.clone(),
            init_image: mesh.sidecar.init_container_image.clone(),
            log_level,
            privileged_init: mesh.sidecar.enable_privileged_init_container,
            outbound_ip_range_exclusions: merge_exclusion_list(
                pod_nets,
                mesh.traffic.outbound_ip_range_exclusion_list.clone(),
            ),
            outbound_port_exclusions: merge_exclusion_list(
                pod_ports,
                mesh.traffic.outbound_port_exclusion_list.clone(),
            ),
            resources,
            prometheus_scraping: mesh.observability.enable_prometheus_scraping,
        })
    }
}

enum Field {
    Requests,
    Limits,
}

fn parse_nets(s: &str) -> Result<Vec<IpNet>, Error> {
    s.split(',')
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .map(|n| {
            n.parse::<IpNet>().map_err(|error| Error::Override {
                annotation: OUTBOUND_IP_RANGE_EXCLUSION_LIST_ANNOTATION,
                reason: format!("{n:?}: {error}"),
            })
        })
        .collect()
}

/// Checks that `value` looks like a Kubernetes quantity, e.g. `100m`, `1.5`, `64Mi` or `1e3`.
fn parse_quantity(annotation: &'static str, value: &str) -> Result<Quantity, Error> {
    const SUFFIXES: &[&str] = &[
        "", "n", "u", "m", "k", "M", "G", "T", "P", "E", "Ki", "Mi", "Gi", "Ti", "Pi", "Ei",
    ];

    let value = value.trim();
    let split = value
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(value.len());
    let (number, suffix) = value.split_at(split);
    let valid_suffix = SUFFIXES.contains(&suffix)
        || suffix
            .strip_prefix(['e', 'E'])
            .map(|exp| {
                let exp = exp.strip_prefix(['+', '-']).unwrap_or(exp);
                !exp.is_empty() && exp.chars().all(|c| c.is_ascii_digit())
            })
            .unwrap_or(false);

    if number.is_empty() || number.parse::<f64>().is_err() || !valid_suffix {
        return Err(Error::Override {
            annotation,
            reason: format!("invalid quantity {value:?}"),
        });
    }

    Ok(Quantity(value.to_string()))
}

use crate::{ports::format_portset, EffectiveConfig, Error, ProxyIdentity};
use json_patch::{
    jsonptr::PointerBuf, AddOperation, Patch, PatchOperation, ReplaceOperation,
};
use mesh_injector_k8s_api::{
    meta::{
        PROMETHEUS_PATH_ANNOTATION, PROMETHEUS_PORT_ANNOTATION, PROMETHEUS_SCRAPE_ANNOTATION,
        PROXY_UUID_LABEL,
    },
    Capabilities, Container, ContainerPort, EnvVar, Pod, SecretVolumeSource, SecurityContext,
    Volume, VolumeMount,
};
use serde_json::Value;
use std::collections::BTreeMap;

pub const SIDECAR_CONTAINER_NAME: &str = "envoy";
pub const INIT_CONTAINER_NAME: &str = "mesh-init";
pub const BOOTSTRAP_VOLUME_NAME: &str = "envoy-bootstrap-config-volume";

pub const PROXY_UID: i64 = 1500;
pub const PROXY_ADMIN_PORT: i32 = 15000;
pub const PROXY_OUTBOUND_PORT: i32 = 15001;
pub const PROXY_INBOUND_PORT: i32 = 15003;
pub const PROXY_METRICS_PORT: i32 = 15010;
pub const PROXY_METRICS_PATH: &str = "/stats/prometheus";

const BOOTSTRAP_MOUNT_PATH: &str = "/etc/envoy";
const BOOTSTRAP_FILE: &str = "bootstrap.yaml";
const BOOTSTRAP_VERSION: &str = "3";

/// How a single key of a string map under `/metadata` is written.
///
/// A scoped add on a map that does not exist fails under JSON Patch semantics, so the operation
/// is chosen from the pod's current metadata rather than left to the patch library.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MetadataOp {
    /// The map is absent: add it with the key as its only entry.
    AddWholeMap,
    /// The map exists but lacks the key.
    AddKey,
    /// The map already has the key.
    ReplaceKey,
}

/// Tracks a metadata map while operations against it are emitted, so that later keys see the
/// map created by earlier ones.
struct MapPatch<'p> {
    field: &'static str,
    current: Option<&'p BTreeMap<String, String>>,
    created: bool,
}

/// Builds the ordered JSON Patch that injects the proxy described by `identity` into `pod`.
///
/// Operations, in order: the bootstrap volume, the init container, the proxy container, the
/// metrics annotations (when enabled) and the proxy UUID label.
pub fn build_patch(
    pod: &Pod,
    config: &EffectiveConfig,
    identity: &ProxyIdentity,
) -> Result<Patch, Error> {
    let spec = pod.spec.clone().unwrap_or_default();
    let mut ops = Vec::with_capacity(6);

    let mut volumes = spec.volumes.unwrap_or_default();
    volumes.push(bootstrap_volume(identity));
    ops.push(add(&["spec", "volumes"], to_value(&volumes)?));

    let mut init_containers = spec.init_containers.unwrap_or_default();
    init_containers.push(init_container(config, identity));
    ops.push(add(&["spec", "initContainers"], to_value(&init_containers)?));

    let mut containers = spec.containers;
    containers.push(proxy_container(config, identity));
    ops.push(add(&["spec", "containers"], to_value(&containers)?));

    if config.prometheus_scraping {
        let mut annotations = MapPatch::new("annotations", pod.metadata.annotations.as_ref());
        ops.push(annotations.set(PROMETHEUS_SCRAPE_ANNOTATION, "true"));
        ops.push(annotations.set(PROMETHEUS_PORT_ANNOTATION, &PROXY_METRICS_PORT.to_string()));
        ops.push(annotations.set(PROMETHEUS_PATH_ANNOTATION, PROXY_METRICS_PATH));
    }

    let mut labels = MapPatch::new("labels", pod.metadata.labels.as_ref());
    ops.push(labels.set(PROXY_UUID_LABEL, &identity.uuid.to_string()));

    Ok(Patch(ops))
}

fn bootstrap_volume(identity: &ProxyIdentity) -> Volume {
    Volume {
        name: BOOTSTRAP_VOLUME_NAME.to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(identity.bootstrap_secret.clone()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn init_container(config: &EffectiveConfig, identity: &ProxyIdentity) -> Container {
    let mut env = vec![
        env_var("MESH_PROXY_UID", PROXY_UID.to_string()),
        env_var("MESH_ENVOY_INBOUND_PORT", PROXY_INBOUND_PORT.to_string()),
        env_var("MESH_ENVOY_OUTBOUND_PORT", PROXY_OUTBOUND_PORT.to_string()),
    ];
    if let Some(ports) = config.outbound_port_exclusions.as_deref() {
        if !ports.is_empty() {
            env.push(env_var(
                "MESH_OUTBOUND_PORT_EXCLUSION_LIST",
                format_portset(ports),
            ));
        }
    }
    if let Some(nets) = config.outbound_ip_range_exclusions.as_deref() {
        if !nets.is_empty() {
            env.push(env_var(
                "MESH_OUTBOUND_IP_RANGE_EXCLUSION_LIST",
                join(nets.iter().map(ToString::to_string)),
            ));
        }
    }

    // Without the privileged flag the redirect rules are installed by the node's CNI plugin and
    // the init container only validates them, so it needs no capabilities.
    let (mode, security_context) = if config.privileged_init {
        (
            "iptables",
            SecurityContext {
                capabilities: Some(Capabilities {
                    add: Some(vec!["NET_ADMIN".to_string()]),
                    ..Default::default()
                }),
                run_as_user: Some(0),
                ..Default::default()
            },
        )
    } else {
        (
            "cni",
            SecurityContext {
                allow_privilege_escalation: Some(false),
                capabilities: Some(Capabilities {
                    drop: Some(vec!["ALL".to_string()]),
                    ..Default::default()
                }),
                run_as_non_root: Some(true),
                run_as_user: Some(PROXY_UID),
                ..Default::default()
            },
        )
    };
    env.push(env_var("MESH_REDIRECT_MODE", mode.to_string()));

    tracing::trace!(proxy = %identity.uuid, %mode, "Building init container");
    Container {
        name: INIT_CONTAINER_NAME.to_string(),
        image: non_empty(&config.init_image),
        env: Some(env),
        security_context: Some(security_context),
        ..Default::default()
    }
}

fn proxy_container(config: &EffectiveConfig, identity: &ProxyIdentity) -> Container {
    let args = vec![
        "--log-level".to_string(),
        config.log_level.clone(),
        "--config-path".to_string(),
        format!("{BOOTSTRAP_MOUNT_PATH}/{BOOTSTRAP_FILE}"),
        "--service-node".to_string(),
        identity.uuid.to_string(),
        "--service-cluster".to_string(),
        identity.workload.service_cluster(),
        "--bootstrap-version".to_string(),
        BOOTSTRAP_VERSION.to_string(),
    ];

    Container {
        name: SIDECAR_CONTAINER_NAME.to_string(),
        image: non_empty(&config.proxy_image),
        image_pull_policy: Some("Always".to_string()),
        command: Some(vec!["envoy".to_string()]),
        args: Some(args),
        ports: Some(vec![
            container_port("proxy-admin", PROXY_ADMIN_PORT),
            container_port("proxy-inbound", PROXY_INBOUND_PORT),
            container_port("proxy-metrics", PROXY_METRICS_PORT),
        ]),
        resources: Some(config.resources.clone()),
        volume_mounts: Some(vec![VolumeMount {
            name: BOOTSTRAP_VOLUME_NAME.to_string(),
            mount_path: BOOTSTRAP_MOUNT_PATH.to_string(),
            read_only: Some(true),
            ..Default::default()
        }]),
        security_context: Some(SecurityContext {
            run_as_user: Some(PROXY_UID),
            ..Default::default()
        }),
        ..Default::default()
    }
}

// === impl MetadataOp ===

impl MetadataOp {
    pub fn choose(map: Option<&BTreeMap<String, String>>, key: &str) -> Self {
        match map {
            None => Self::AddWholeMap,
            Some(map) if map.contains_key(key) => Self::ReplaceKey,
            Some(_) => Self::AddKey,
        }
    }

    fn operation(self, field: &str, key: &str, value: &str) -> PatchOperation {
        match self {
            Self::AddWholeMap => add(
                &["metadata", field],
                serde_json::json!({ key: value }),
            ),
            Self::AddKey => add(&["metadata", field, key], Value::from(value)),
            Self::ReplaceKey => PatchOperation::Replace(ReplaceOperation {
                path: PointerBuf::from_tokens(["metadata", field, key]),
                value: Value::from(value),
            }),
        }
    }
}

// === impl MapPatch ===

impl<'p> MapPatch<'p> {
    fn new(field: &'static str, current: Option<&'p BTreeMap<String, String>>) -> Self {
        Self {
            field,
            current,
            created: false,
        }
    }

    fn set(&mut self, key: &str, value: &str) -> PatchOperation {
        let op = match MetadataOp::choose(self.current, key) {
            MetadataOp::AddWholeMap if self.created => MetadataOp::AddKey,
            op => op,
        };
        self.created = true;
        op.operation(self.field, key, value)
    }
}

fn add(tokens: &[&str], value: Value) -> PatchOperation {
    PatchOperation::Add(AddOperation {
        path: PointerBuf::from_tokens(tokens.iter().copied()),
        value,
    })
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<Value, Error> {
    serde_json::to_value(value).map_err(|e| Error::Patch(e.to_string()))
}

fn env_var(name: &str, value: String) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value),
        ..Default::default()
    }
}

fn container_port(name: &str, port: i32) -> ContainerPort {
    ContainerPort {
        name: Some(name.to_string()),
        container_port: port,
        ..Default::default()
    }
}

fn non_empty(s: &str) -> Option<String> {
    Some(s.to_string()).filter(|s| !s.is_empty())
}

fn join(items: impl Iterator<Item = String>) -> String {
    items.collect::<Vec<_>>().join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::WorkloadIdentity;
    use maplit::{btreemap, convert_args};
    use mesh_injector_k8s_api::{ObjectMeta, PodSpec};
    use std::num::NonZeroU16;
    use uuid::Uuid;

    fn identity() -> ProxyIdentity {
        let uuid = Uuid::from_u128(0x2a);
        ProxyIdentity {
            uuid,
            bootstrap_secret: crate::bootstrap_secret_name(&uuid),
            workload: WorkloadIdentity {
                namespace: "bookstore".to_string(),
                service_account: "bookstore".to_string(),
            },
        }
    }

    fn pod(
        annotations: Option<BTreeMap<String, String>>,
        labels: Option<BTreeMap<String, String>>,
    ) -> Pod {
        Pod {
            metadata: ObjectMeta {
                annotations,
                labels,
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "app".to_string(),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn ops(patch: &Patch) -> Vec<(String, String)> {
        patch
            .0
            .iter()
            .map(|op| match op {
                PatchOperation::Add(AddOperation { path, .. }) => {
                    ("add".to_string(), path.to_string())
                }
                PatchOperation::Replace(ReplaceOperation { path, .. }) => {
                    ("replace".to_string(), path.to_string())
                }
                op => panic!("unexpected operation: {op:?}"),
            })
            .collect()
    }

    fn value_at<'p>(patch: &'p Patch, path: &str) -> &'p Value {
        patch
            .0
            .iter()
            .find_map(|op| match op {
                PatchOperation::Add(AddOperation { path: p, value })
                | PatchOperation::Replace(ReplaceOperation { path: p, value })
                    if p.to_string() == path =>
                {
                    Some(value)
                }
                _ => None,
            })
            .unwrap_or_else(|| panic!("no operation at {path}"))
    }

    #[test]
    fn chooses_metadata_op_from_existing_map() {
        let map = convert_args!(btreemap!("a" => "1"));
        assert_eq!(MetadataOp::choose(None, "a"), MetadataOp::AddWholeMap);
        assert_eq!(MetadataOp::choose(Some(&map), "b"), MetadataOp::AddKey);
        assert_eq!(MetadataOp::choose(Some(&map), "a"), MetadataOp::ReplaceKey);
    }

    #[test]
    fn adds_whole_annotations_map_when_absent() {
        let patch =
            build_patch(&pod(None, None), &EffectiveConfig::default(), &identity()).unwrap();
        let ops = ops(&patch);
        assert_eq!(
            ops[3],
            ("add".to_string(), "/metadata/annotations".to_string())
        );
        assert_eq!(
            value_at(&patch, "/metadata/annotations"),
            &serde_json::json!({ "prometheus.io/scrape": "true" })
        );
        assert_eq!(
            ops[4],
            (
                "add".to_string(),
                "/metadata/annotations/prometheus.io~1port".to_string()
            )
        );
        assert_eq!(
            ops[5],
            (
                "add".to_string(),
                "/metadata/annotations/prometheus.io~1path".to_string()
            )
        );
        // No labels either, so the label map is added whole.
        assert_eq!(ops[6], ("add".to_string(), "/metadata/labels".to_string()));
        assert_eq!(
            value_at(&patch, "/metadata/labels"),
            &serde_json::json!({ "mesh.io/proxy-uuid": identity().uuid.to_string() })
        );
    }

    #[test]
    fn scoped_add_when_annotations_exist() {
        let annotations = convert_args!(btreemap!("team" => "books"));
        let patch = build_patch(
            &pod(Some(annotations), None),
            &EffectiveConfig::default(),
            &identity(),
        )
        .unwrap();
        assert_eq!(
            ops(&patch)[3],
            (
                "add".to_string(),
                "/metadata/annotations/prometheus.io~1scrape".to_string()
            )
        );
    }

    #[test]
    fn replaces_existing_keys() {
        let annotations = convert_args!(btreemap!("prometheus.io/scrape" => "false"));
        let labels = convert_args!(btreemap!(PROXY_UUID_LABEL => "stale"));
        let patch = build_patch(
            &pod(Some(annotations), Some(labels)),
            &EffectiveConfig::default(),
            &identity(),
        )
        .unwrap();
        let ops = ops(&patch);
        assert_eq!(
            ops[3],
            (
                "replace".to_string(),
                "/metadata/annotations/prometheus.io~1scrape".to_string()
            )
        );
        assert_eq!(
            ops[4].0, "add",
            "keys missing from an existing map are added"
        );
        assert_eq!(
            ops[6],
            (
                "replace".to_string(),
                "/metadata/labels/mesh.io~1proxy-uuid".to_string()
            )
        );
    }

    #[test]
    fn escapes_pointer_reserved_characters() {
        let op = MetadataOp::AddKey.operation("annotations", "a/b~c", "v");
        match op {
            PatchOperation::Add(AddOperation { path, .. }) => {
                assert_eq!(path.to_string(), "/metadata/annotations/a~1b~0c")
            }
            op => panic!("unexpected operation: {op:?}"),
        }
    }

    #[test]
    fn omits_metrics_annotations_when_scraping_disabled() {
        let config = EffectiveConfig {
            prometheus_scraping: false,
            ..Default::default()
        };
        let patch = build_patch(&pod(None, None), &config, &identity()).unwrap();
        let paths = ops(&patch).into_iter().map(|(_, p)| p).collect::<Vec<_>>();
        assert_eq!(
            paths,
            vec![
                "/spec/volumes",
                "/spec/initContainers",
                "/spec/containers",
                "/metadata/labels"
            ]
        );
    }

    #[test]
    fn keeps_existing_workload_entries() {
        let mut pod = pod(None, None);
        if let Some(spec) = pod.spec.as_mut() {
            spec.volumes = Some(vec![Volume {
                name: "data".to_string(),
                ..Default::default()
            }]);
        }
        let patch = build_patch(&pod, &EffectiveConfig::default(), &identity()).unwrap();

        let volumes = value_at(&patch, "/spec/volumes").as_array().unwrap();
        assert_eq!(volumes[0]["name"], "data");
        assert_eq!(volumes[1]["name"], BOOTSTRAP_VOLUME_NAME);

        let containers = value_at(&patch, "/spec/containers").as_array().unwrap();
        assert_eq!(containers[0]["name"], "app");
        assert_eq!(containers[1]["name"], SIDECAR_CONTAINER_NAME);
    }

    #[test]
    fn privileged_init_requests_net_admin() {
        let config = EffectiveConfig {
            privileged_init: true,
            ..Default::default()
        };
        let patch = build_patch(&pod(None, None), &config, &identity()).unwrap();
        let init = &value_at(&patch, "/spec/initContainers")[0];
        assert_eq!(
            init["securityContext"]["capabilities"]["add"],
            serde_json::json!(["NET_ADMIN"])
        );
    }

    #[test]
    fn wide_port_exclusions_stay_compact() {
        let config = EffectiveConfig {
            outbound_port_exclusions: Some(
                crate::ports::parse_portset("1-65535")
                    .unwrap()
                    .into_iter()
                    .collect(),
            ),
            ..Default::default()
        };
        let patch = build_patch(&pod(None, None), &config, &identity()).unwrap();
        let env = &value_at(&patch, "/spec/initContainers")[0]["env"];
        let excluded = env
            .as_array()
            .unwrap()
            .iter()
            .find(|e| e["name"] == "MESH_OUTBOUND_PORT_EXCLUSION_LIST")
            .expect("exclusion list must be set");
        assert_eq!(excluded["value"], "1-65535");
    }

    #[test]
    fn exclusion_lists_only_when_non_empty() {
        let config = EffectiveConfig {
            outbound_port_exclusions: Some(vec![
                NonZeroU16::new(6060).unwrap(),
                NonZeroU16::new(8080).unwrap(),
            ]),
            outbound_ip_range_exclusions: Some(vec![]),
            ..Default::default()
        };
        let patch = build_patch(&pod(None, None), &config, &identity()).unwrap();
        let env = value_at(&patch, "/spec/initContainers")[0]["env"]
            .as_array()
            .unwrap()
            .clone();
        assert!(env.contains(&serde_json::json!({
            "name": "MESH_OUTBOUND_PORT_EXCLUSION_LIST",
            "value": "6060,8080",
        })));
        assert!(!env
            .iter()
            .any(|e| e["name"] == "MESH_OUTBOUND_IP_RANGE_EXCLUSION_LIST"));
    }
}

use crate::{
    core::{bootstrap_secret_name, CertificateIssuer, ClusterInfo, Uuid, WorkloadIdentity},
    k8s::{meta::PROXY_UUID_LABEL, Api, Client, ObjectMeta, Secret},
};
use anyhow::{bail, Context, Result};
use kube::api::PostParams;
use serde_json::json;
use std::{collections::BTreeMap, str::FromStr};
use tracing::debug;

const BOOTSTRAP_KEY: &str = "bootstrap.yaml";
const XDS_CLUSTER: &str = "mesh-controller";

/// Issues proxy bootstraps as Secrets in the workload's namespace.
#[derive(Clone)]
pub struct SecretIssuer {
    client: Client,
    cluster: ClusterInfo,
    xds: XdsAddress,
}

/// The address proxies use to reach the control plane's discovery service.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct XdsAddress {
    pub host: String,
    pub port: u16,
}

// === impl SecretIssuer ===

impl SecretIssuer {
    pub fn new(client: Client, cluster: ClusterInfo, xds: XdsAddress) -> Self {
        Self {
            client,
            cluster,
            xds,
        }
    }
}

#[async_trait::async_trait]
impl CertificateIssuer for SecretIssuer {
    async fn issue_bootstrap(&self, id: Uuid, workload: &WorkloadIdentity) -> Result<String> {
        let secret = bootstrap_secret(id, workload, &self.cluster, &self.xds)?;
        let name = secret.metadata.name.clone().unwrap_or_default();

        let api = Api::<Secret>::namespaced(self.client.clone(), &workload.namespace);
        api.create(&PostParams::default(), &secret)
            .await
            .with_context(|| format!("failed to create secret {}/{name}", workload.namespace))?;
        debug!(ns = %workload.namespace, %name, "Created bootstrap secret");

        Ok(name)
    }
}

fn bootstrap_secret(
    id: Uuid,
    workload: &WorkloadIdentity,
    cluster: &ClusterInfo,
    xds: &XdsAddress,
) -> Result<Secret> {
    let bootstrap = render_bootstrap(id, workload, cluster, xds)?;
    Ok(Secret {
        metadata: ObjectMeta {
            name: Some(bootstrap_secret_name(&id)),
            namespace: Some(workload.namespace.clone()),
            labels: Some(BTreeMap::from([(
                PROXY_UUID_LABEL.to_string(),
                id.to_string(),
            )])),
            ..Default::default()
        },
        string_data: Some(BTreeMap::from([(BOOTSTRAP_KEY.to_string(), bootstrap)])),
        ..Default::default()
    })
}

/// Renders the Envoy bootstrap for proxy `id`.
///
/// The proxy identifies itself to the control plane by its UUID and fetches all of its listeners,
/// clusters and its workload certificate over ADS.
fn render_bootstrap(
    id: Uuid,
    workload: &WorkloadIdentity,
    cluster: &ClusterInfo,
    xds: &XdsAddress,
) -> Result<String> {
    let identity =
        cluster.service_account_identity(&workload.namespace, &workload.service_account);
    let ads = json!({ "ads": {}, "resource_api_version": "V3" });

    let bootstrap = json!({
        "admin": {
            "access_log_path": "/dev/stdout",
            "address": {
                "socket_address": {
                    "address": "0.0.0.0",
                    "port_value": crate::core::patch::PROXY_ADMIN_PORT,
                },
            },
        },
        "node": {
            "id": id.to_string(),
            "cluster": workload.service_cluster(),
            "metadata": {
                "mesh": cluster.mesh_name,
                "identity": identity,
            },
        },
        "dynamic_resources": {
            "ads_config": {
                "api_type": "GRPC",
                "transport_api_version": "V3",
                "grpc_services": [{ "envoy_grpc": { "cluster_name": XDS_CLUSTER } }],
                "set_node_on_first_message_only": true,
            },
            "cds_config": ads,
            "lds_config": ads,
        },
        "static_resources": {
            "clusters": [{
                "name": XDS_CLUSTER,
                "connect_timeout": "0.25s",
                "type": "LOGICAL_DNS",
                "typed_extension_protocol_options": {
                    "envoy.extensions.upstreams.http.v3.HttpProtocolOptions": {
                        "@type": "type.googleapis.com/envoy.extensions.upstreams.http.v3.HttpProtocolOptions",
                        "explicit_http_config": { "http2_protocol_options": {} },
                    },
                },
                "transport_socket": {
                    "name": "envoy.transport_sockets.tls",
                    "typed_config": {
                        "@type": "type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.UpstreamTlsContext",
                        "sni": xds.host,
                        "common_tls_context": {
                            "tls_certificate_sds_secret_configs": [{
                                "name": identity,
                                "sds_config": ads,
                            }],
                        },
                    },
                },
                "load_assignment": {
                    "cluster_name": XDS_CLUSTER,
                    "endpoints": [{
                        "lb_endpoints": [{
                            "endpoint": {
                                "address": {
                                    "socket_address": {
                                        "address": xds.host,
                                        "port_value": xds.port,
                                    },
                                },
                            },
                        }],
                    }],
                },
            }],
        },
    });

    serde_yaml::to_string(&bootstrap).context("failed to render bootstrap")
}

// === impl XdsAddress ===

impl FromStr for XdsAddress {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let Some((host, port)) = s.rsplit_once(':') else {
            bail!("missing port in {s:?}");
        };
        if host.is_empty() {
            bail!("missing host in {s:?}");
        }
        let port = port
            .parse::<u16>()
            .with_context(|| format!("invalid port in {s:?}"))?;
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

impl std::fmt::Display for XdsAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

use crate::{
    core::{ClusterInfo, Injector, NonInjectNamespaces, Provisioner},
    k8s::{self, MeshConfig},
    Admission, AdmissionMetrics, ApiNamespaces, MeshConfigIndex, NamespaceIndex, SecretIssuer,
    SharedMeshConfig, XdsAddress,
};
use anyhow::{bail, Result};
use clap::Parser;
use kube::runtime::watcher;
use prometheus_client::registry::Registry;
use std::sync::Arc;
use tokio::time::Duration;
use tracing::{info, info_span, Instrument};

#[derive(Debug, Parser)]
#[clap(name = "mesh-injector", about = "Injects the mesh proxy into pods")]
pub struct Args {
    #[clap(long, default_value = "mesh=info,warn", env = "MESH_INJECTOR_LOG")]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    server: kubert::ServerArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// The name namespaces use to enroll in the mesh.
    #[clap(long, default_value = "mesh")]
    mesh_name: String,

    #[clap(long, default_value = "mesh-system")]
    control_plane_namespace: String,

    #[clap(long, default_value = "cluster.local")]
    identity_domain: String,

    /// The name of the MeshConfig resource in the control plane namespace.
    #[clap(long, default_value = "mesh-config")]
    mesh_config_name: String,

    /// Namespaces that are never injected, in addition to those labelled `mesh.io/ignore=true`.
    #[clap(long, default_value = "kube-system", value_delimiter = ',')]
    non_inject_namespaces: Vec<String>,

    #[clap(long, default_value = "mesh-controller.mesh-system.svc.cluster.local:15128")]
    xds_address: XdsAddress,

    /// The deadline for handling a single admission request.
    ///
    /// Must stay below the webhook's `timeoutSeconds` (10s by default) so that the denial reaches
    /// the API server before it gives up on the call.
    #[clap(long, default_value = "8000")]
    admission_timeout_ms: u64,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            admin,
            client,
            log_level,
            log_format,
            server,
            mesh_name,
            control_plane_namespace,
            identity_domain,
            mesh_config_name,
            non_inject_namespaces,
            xds_address,
            admission_timeout_ms,
        } = self;

        let cluster = ClusterInfo {
            mesh_name,
            control_plane_ns: control_plane_namespace.clone(),
            identity_domain,
        };

        let mut prom = <Registry>::default();
        let admission_metrics =
            AdmissionMetrics::register(prom.sub_registry_with_prefix("admission"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .with_optional_server(Some(server))
            .build()
            .await?;

        // Spawn resource watches.

        let non_inject = NonInjectNamespaces::default();
        let namespace_index = NamespaceIndex::shared(
            non_inject_namespaces.into_iter().filter(|ns| !ns.is_empty()),
            non_inject.clone(),
        );
        let namespaces = runtime.watch_all::<k8s::Namespace>(watcher::Config::default());
        tokio::spawn(
            kubert::index::cluster(namespace_index, namespaces)
                .instrument(info_span!("namespaces")),
        );

        let mesh_config_index =
            MeshConfigIndex::shared(&control_plane_namespace, &mesh_config_name);
        let mesh_configs = runtime.watch_namespaced::<MeshConfig>(
            control_plane_namespace.clone(),
            watcher::Config::default().fields(&format!("metadata.name={mesh_config_name}")),
        );
        tokio::spawn(
            kubert::index::namespaced(mesh_config_index.clone(), mesh_configs)
                .instrument(info_span!("meshconfigs")),
        );

        let client = runtime.client();
        let issuer = SecretIssuer::new(client.clone(), cluster.clone(), xds_address);
        let injector = Arc::new(Injector::new(
            cluster,
            non_inject,
            ApiNamespaces::new(client),
            SharedMeshConfig::new(mesh_config_index),
            Provisioner::new(issuer),
            Duration::from_millis(admission_timeout_ms),
        ));

        info!(timeout_ms = admission_timeout_ms, "Serving sidecar injection");
        let runtime = runtime.spawn_server(move || {
            Admission::new(injector.clone(), admission_metrics.clone())
        });

        // Runs until the shutdown signal fires and the server drains.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}

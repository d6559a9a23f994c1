#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod check;

use self::check::PodRef;
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use mesh_injector_k8s_api::{Api, Client, MeshConfig, Pod, TrafficTarget};
use tokio::time;
use tracing::debug;

/// Inspect the traffic policies of the mesh
#[derive(Parser)]
#[clap(version, about)]
struct Args {
    #[clap(long, env = "MESH_POLICY_CHECK_LOG_LEVEL", default_value = "warn")]
    log_level: kubert::LogFilter,

    #[clap(long, env = "MESH_POLICY_CHECK_LOG_FORMAT", default_value = "plain")]
    log_format: kubert::LogFormat,

    /// Namespace where the mesh control plane is installed
    #[clap(long, default_value = "mesh-system")]
    control_plane_namespace: String,

    /// Name of the MeshConfig resource in the control plane namespace
    #[clap(long, default_value = "mesh-config")]
    mesh_config_name: String,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Check whether a source pod is allowed to send traffic to a destination pod
    ///
    /// Traffic is allowed when the mesh runs in permissive traffic policy mode, or when an SMI
    /// TrafficTarget grants the source pod's service account access to the destination pod's.
    /// Pods are given as <namespace>/<pod>, or <pod> for the default namespace.
    CheckPods {
        source: PodRef,
        destination: PodRef,
    },
}

const API_TIMEOUT: time::Duration = time::Duration::from_secs(10);

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let Args {
        log_level,
        log_format,
        control_plane_namespace,
        mesh_config_name,
        command,
    } = Args::parse();

    log_format
        .try_init(log_level)
        .context("must configure logging")?;

    let client = Client::try_default().await?;
    match command {
        Command::CheckPods {
            source,
            destination,
        } => {
            let src = get_meshed_pod(&client, &source).await?;
            let dst = get_meshed_pod(&client, &destination).await?;

            let configs = Api::<MeshConfig>::namespaced(client.clone(), &control_plane_namespace);
            let mesh = time::timeout(API_TIMEOUT, configs.get(&mesh_config_name))
                .await?
                .with_context(|| format!("failed to fetch MeshConfig {mesh_config_name}"))?;
            let permissive = mesh.spec.traffic.enable_permissive_traffic_policy_mode;

            let targets = if permissive {
                Vec::new()
            } else {
                let api = Api::<TrafficTarget>::namespaced(client, &destination.namespace);
                time::timeout(API_TIMEOUT, api.list(&Default::default()))
                    .await?
                    .context("failed to list SMI TrafficTarget policies")?
                    .items
            };
            debug!(permissive, targets = targets.len());

            let verdict = check::check(&src, &dst, permissive, targets);
            check::write_report(
                &mut std::io::stdout().lock(),
                &source,
                &destination,
                &control_plane_namespace,
                &verdict,
            )?;
        }
    }

    Ok(())
}

async fn get_meshed_pod(client: &Client, pod: &PodRef) -> Result<Pod> {
    let api = Api::<Pod>::namespaced(client.clone(), &pod.namespace);
    let Some(found) = time::timeout(API_TIMEOUT, api.get_opt(&pod.name)).await?? else {
        bail!("could not find pod {pod}");
    };
    if !check::is_meshed(&found) {
        bail!("pod {pod} is not a part of the mesh");
    }
    Ok(found)
}

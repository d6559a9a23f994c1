use crate::{patch::SIDECAR_CONTAINER_NAME, ClusterInfo, Error};
use mesh_injector_k8s_api::{
    meta::{Injection, MONITORED_BY_LABEL},
    Namespace, Pod, ResourceExt,
};
use std::collections::BTreeSet;

/// Decides whether `pod`, being created in `ns`, must have a proxy injected.
///
/// The non-inject set always wins, even over a pod that opts in. Otherwise the namespace must be
/// enrolled in the mesh (by label or by annotation) and the pod must not opt out.
pub fn should_inject(
    pod: &Pod,
    ns: &Namespace,
    cluster: &ClusterInfo,
    non_inject: &BTreeSet<String>,
) -> Result<bool, Error> {
    let ns_name = ns.name_any();
    if non_inject.contains(&ns_name) {
        tracing::debug!(ns = %ns_name, "Namespace is excluded from injection");
        return Ok(false);
    }

    let pod_injection = Injection::from_meta(&pod.metadata)?;
    if pod_injection == Some(Injection::Disabled) {
        tracing::debug!("Pod opted out of injection");
        return Ok(false);
    }

    if is_injected(pod) {
        tracing::debug!("Pod already has a proxy");
        return Ok(false);
    }

    let monitored = ns.labels().get(MONITORED_BY_LABEL) == Some(&cluster.mesh_name);
    let ns_injection = Injection::from_meta(&ns.metadata)?;
    match ns_injection {
        Some(Injection::Disabled) => Ok(false),
        Some(Injection::Enabled) => Ok(true),
        None => Ok(monitored),
    }
}

fn is_injected(pod: &Pod) -> bool {
    pod.spec
        .iter()
        .flat_map(|spec| spec.containers.iter())
        .any(|c| c.name == SIDECAR_CONTAINER_NAME)
}

use crate::{
    build_patch, should_inject, CertificateIssuer, ClusterInfo, EffectiveConfig, Error,
    NonInjectNamespaces, ProxyIdGenerator, Provisioner, RandomProxyIds, WorkloadIdentity,
};
use kube::{
    core::{
        admission::{AdmissionRequest, AdmissionResponse},
        DynamicObject,
    },
    Resource,
};
use mesh_injector_k8s_api::{MeshConfigSpec, Namespace, Pod};
use std::{sync::Arc, time::Duration};
use tokio::time;
use tracing::{debug, info, warn};

/// Looks up Namespace objects by name.
#[async_trait::async_trait]
pub trait NamespaceReader {
    async fn get_namespace(&self, name: &str) -> anyhow::Result<Option<Namespace>>;
}

/// Provides the current mesh-wide configuration.
pub trait MeshConfigSource {
    fn mesh_config(&self) -> anyhow::Result<Arc<MeshConfigSpec>>;
}

/// Handles Pod admission requests, injecting a proxy into eligible Pods.
#[derive(Clone, Debug)]
pub struct Injector<I, N, C, G = RandomProxyIds> {
    cluster: ClusterInfo,
    non_inject: NonInjectNamespaces,
    namespaces: N,
    mesh_config: C,
    provisioner: Provisioner<I, G>,
    timeout: Duration,
}

// === impl Injector ===

impl<I, N, C, G> Injector<I, N, C, G>
where
    I: CertificateIssuer,
    N: NamespaceReader,
    C: MeshConfigSource,
    G: ProxyIdGenerator,
{
    pub fn new(
        cluster: ClusterInfo,
        non_inject: NonInjectNamespaces,
        namespaces: N,
        mesh_config: C,
        provisioner: Provisioner<I, G>,
        timeout: Duration,
    ) -> Self {
        Self {
            cluster,
            non_inject,
            namespaces,
            mesh_config,
            provisioner,
            timeout,
        }
    }

    /// Admits a Pod creation request.
    ///
    /// Eligible Pods are allowed with a patch that adds the proxy; ineligible Pods are allowed
    /// unchanged. Every failure, including running past the admission deadline, denies the Pod.
    pub async fn admit(&self, req: AdmissionRequest<DynamicObject>) -> AdmissionResponse {
        let rsp = AdmissionResponse::from(&req);
        let uid = req.uid.clone();

        let error = match time::timeout(self.timeout, self.inject(req)).await {
            Ok(Ok(None)) => return rsp,
            Ok(Ok(Some(patch))) => match rsp.clone().with_patch(patch) {
                Ok(rsp) => return rsp,
                Err(error) => Error::Patch(error.to_string()),
            },
            Ok(Err(error)) => error,
            Err(_) => Error::Timeout(self.timeout),
        };

        info!(%uid, %error, "Denying pod");
        rsp.deny(error)
    }

    async fn inject(
        &self,
        req: AdmissionRequest<DynamicObject>,
    ) -> Result<Option<json_patch::Patch>, Error> {
        let dry_run = req.dry_run;
        let (ns, pod) = parse_pod(req)?;

        let non_inject = self.non_inject.snapshot();
        if non_inject.contains(&ns) {
            debug!(%ns, "Namespace is excluded from injection");
            return Ok(None);
        }

        let namespace = self
            .namespaces
            .get_namespace(&ns)
            .await
            .map_err(|source| Error::NamespaceLookup {
                ns: ns.clone(),
                source,
            })?
            .ok_or_else(|| Error::NamespaceNotFound(ns.clone()))?;

        if !should_inject(&pod, &namespace, &self.cluster, &non_inject)? {
            debug!(%ns, "Skipping injection");
            return Ok(None);
        }

        // Only eligible Pods depend on the mesh configuration.
        let mesh = self.mesh_config.mesh_config().map_err(Error::MeshConfig)?;

        // Overrides are validated before anything is issued so that a bad annotation never
        // leaves an orphaned bootstrap secret behind.
        let config = EffectiveConfig::merge(&pod.metadata, &mesh)?;

        let workload = WorkloadIdentity::from_pod(&ns, &pod);
        let identity = self.provisioner.provision(workload, &pod, dry_run).await?;

        let patch = build_patch(&pod, &config, &identity)?;
        info!(%ns, proxy = %identity.uuid, dry_run, "Injecting proxy");
        Ok(Some(patch))
    }
}

fn parse_pod(req: AdmissionRequest<DynamicObject>) -> Result<(String, Pod), Error> {
    if !is_kind::<Pod>(&req) {
        return Err(Error::Malformed(format!(
            "unsupported resource type: {}.{}.{}",
            req.kind.group, req.kind.version, req.kind.kind
        )));
    }

    let obj = req
        .object
        .ok_or_else(|| Error::Malformed("admission request missing 'object'".to_string()))?;
    let pod = obj
        .try_parse::<Pod>()
        .map_err(|error| Error::Malformed(format!("invalid pod: {error}")))?;

    // Pods created through a controller may not carry a namespace; the request always does.
    let ns = req
        .namespace
        .or_else(|| pod.metadata.namespace.clone())
        .filter(|ns| !ns.is_empty())
        .ok_or_else(|| Error::Malformed("admission request missing namespace".to_string()))?;

    if pod.spec.is_none() {
        warn!(%ns, "Pod has no spec");
        return Err(Error::Malformed("pod missing 'spec'".to_string()));
    }

    Ok((ns, pod))
}

fn is_kind<T>(req: &AdmissionRequest<DynamicObject>) -> bool
where
    T: Resource,
    T::DynamicType: Default,
{
    let dt = Default::default();
    req.kind.group.eq_ignore_ascii_case(&T::group(&dt))
        && req.kind.kind.eq_ignore_ascii_case(&T::kind(&dt))
}

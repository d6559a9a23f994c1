use crate::Error;
use mesh_injector_k8s_api::Pod;
use tracing::{debug, info};
use uuid::Uuid;

const BOOTSTRAP_SECRET_PREFIX: &str = "envoy-bootstrap-config";

/// Issues the bootstrap artifact that carries a proxy's mesh identity.
#[async_trait::async_trait]
pub trait CertificateIssuer {
    /// Issues a bootstrap artifact for the proxy `id`, returning the name of the secret that
    /// holds it.
    ///
    /// Called at most once per admission request. The returned future may be dropped when the
    /// request's deadline expires.
    async fn issue_bootstrap(&self, id: Uuid, workload: &WorkloadIdentity)
        -> anyhow::Result<String>;
}

/// Mints proxy identifiers.
pub trait ProxyIdGenerator {
    fn next_id(&self) -> Uuid;
}

/// Generates random (v4) identifiers.
#[derive(Copy, Clone, Debug, Default)]
pub struct RandomProxyIds;

/// The workload a proxy is injected into.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkloadIdentity {
    pub namespace: String,
    pub service_account: String,
}

/// The identity provisioned for a single injected proxy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProxyIdentity {
    pub uuid: Uuid,
    pub bootstrap_secret: String,
    pub workload: WorkloadIdentity,
}

#[derive(Clone, Debug)]
pub struct Provisioner<I, G = RandomProxyIds> {
    issuer: I,
    ids: G,
}

/// Names the secret that holds the bootstrap artifact for proxy `id`.
pub fn bootstrap_secret_name(id: &Uuid) -> String {
    format!("{BOOTSTRAP_SECRET_PREFIX}-{id}")
}

// === impl RandomProxyIds ===

impl ProxyIdGenerator for RandomProxyIds {
    fn next_id(&self) -> Uuid {
        Uuid::new_v4()
    }
}

// === impl WorkloadIdentity ===

impl WorkloadIdentity {
    pub fn from_pod(namespace: impl Into<String>, pod: &Pod) -> Self {
        let service_account = pod
            .spec
            .as_ref()
            .and_then(|spec| spec.service_account_name.clone())
            .filter(|sa| !sa.is_empty())
            .unwrap_or_else(|| "default".to_string());
        Self {
            namespace: namespace.into(),
            service_account,
        }
    }

    /// The cluster name the proxy reports to the control plane.
    pub fn service_cluster(&self) -> String {
        format!("{}.{}", self.service_account, self.namespace)
    }
}

// === impl Provisioner ===

impl<I> Provisioner<I> {
    pub fn new(issuer: I) -> Self {
        Self::with_ids(issuer, RandomProxyIds)
    }
}

impl<I, G> Provisioner<I, G> {
    pub fn with_ids(issuer: I, ids: G) -> Self {
        Self { issuer, ids }
    }
}

impl<I, G> Provisioner<I, G>
where
    I: CertificateIssuer,
    G: ProxyIdGenerator,
{
    /// Mints a new proxy identifier and issues its bootstrap artifact.
    ///
    /// When `dry_run` is set nothing is issued and the secret name is derived locally.
    pub async fn provision(
        &self,
        workload: WorkloadIdentity,
        pod: &Pod,
        dry_run: bool,
    ) -> Result<ProxyIdentity, Error> {
        let uuid = self.ids.next_id();
        let pod_name = pod.metadata.name.clone().unwrap_or_else(|| {
            pod.metadata
                .generate_name
                .clone()
                .unwrap_or_default()
        });

        let bootstrap_secret = if dry_run {
            debug!(%uuid, pod = %pod_name, "Dry run; skipping bootstrap issuance");
            bootstrap_secret_name(&uuid)
        } else {
            let secret = self
                .issuer
                .issue_bootstrap(uuid, &workload)
                .await
                .map_err(Error::Issuance)?;
            info!(
                %uuid,
                pod = %pod_name,
                ns = %workload.namespace,
                %secret,
                "Issued proxy bootstrap"
            );
            secret
        };

        Ok(ProxyIdentity {
            uuid,
            bootstrap_secret,
            workload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_injector_k8s_api::{ObjectMeta, PodSpec};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixed(Uuid);

    impl ProxyIdGenerator for Fixed {
        fn next_id(&self) -> Uuid {
            self.0
        }
    }

    #[derive(Default)]
    struct CountingIssuer {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait::async_trait]
    impl CertificateIssuer for CountingIssuer {
        async fn issue_bootstrap(
            &self,
            id: Uuid,
            _: &WorkloadIdentity,
        ) -> anyhow::Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("certificate authority unavailable");
            }
            Ok(bootstrap_secret_name(&id))
        }
    }

    fn workload() -> WorkloadIdentity {
        WorkloadIdentity {
            namespace: "bookstore".to_string(),
            service_account: "bookstore".to_string(),
        }
    }

    #[tokio::test]
    async fn issues_exactly_once() {
        let id = Uuid::from_u128(7);
        let provisioner = Provisioner::with_ids(CountingIssuer::default(), Fixed(id));

        let identity = provisioner
            .provision(workload(), &Pod::default(), false)
            .await
            .expect("must provision");

        assert_eq!(identity.uuid, id);
        assert_eq!(identity.bootstrap_secret, format!("envoy-bootstrap-config-{id}"));
        assert_eq!(provisioner.issuer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dry_run_skips_issuance() {
        let id = Uuid::from_u128(7);
        let provisioner = Provisioner::with_ids(CountingIssuer::default(), Fixed(id));

        let identity = provisioner
            .provision(workload(), &Pod::default(), true)
            .await
            .expect("must provision");

        assert_eq!(identity.bootstrap_secret, bootstrap_secret_name(&id));
        assert_eq!(provisioner.issuer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn surfaces_issuance_errors_without_retrying() {
        let issuer = CountingIssuer {
            fail: true,
            ..Default::default()
        };
        let provisioner = Provisioner::with_ids(issuer, Fixed(Uuid::from_u128(7)));

        let res = provisioner.provision(workload(), &Pod::default(), false).await;
        assert!(matches!(res, Err(Error::Issuance(_))));
        assert_eq!(provisioner.issuer.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn random_ids_are_not_reused() {
        let ids = RandomProxyIds;
        assert_ne!(ids.next_id(), ids.next_id());
    }

    #[test]
    fn workload_defaults_service_account() {
        let pod = Pod {
            metadata: ObjectMeta::default(),
            spec: Some(PodSpec::default()),
            ..Default::default()
        };
        assert_eq!(
            WorkloadIdentity::from_pod("ns", &pod),
            WorkloadIdentity {
                namespace: "ns".to_string(),
                service_account: "default".to_string(),
            }
        );
    }
}

use mesh_injector_k8s_api::{
    meta::PROXY_UUID_LABEL, IdentityBindingSubject, Pod, ResourceExt, TrafficTarget,
};
use std::{fmt, io, str::FromStr};
use thiserror::Error;

const DEFAULT_NAMESPACE: &str = "default";
const DEFAULT_SERVICE_ACCOUNT: &str = "default";

/// A pod named on the command line as `<namespace>/<pod>` or `<pod>`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PodRef {
    pub namespace: String,
    pub name: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("pod must be of the form <namespace>/<pod>, or <pod> for the default namespace, got {0:?}")]
pub struct InvalidPodRef(String);

/// Whether traffic from one pod to another is allowed, and why.
#[derive(Debug)]
pub enum Verdict {
    /// The mesh allows all traffic between meshed pods.
    Permissive,

    /// The listed policies allow the traffic.
    Allowed(Vec<TrafficTarget>),

    /// No policy allows the traffic.
    Denied,
}

/// Returns true if the injector has added a proxy to `pod`.
pub fn is_meshed(pod: &Pod) -> bool {
    pod.labels().contains_key(PROXY_UUID_LABEL)
}

/// Decides whether `src` may send traffic to `dst` given the traffic targets in the destination
/// pod's namespace.
pub fn check(
    src: &Pod,
    dst: &Pod,
    permissive: bool,
    targets: impl IntoIterator<Item = TrafficTarget>,
) -> Verdict {
    if permissive {
        return Verdict::Permissive;
    }

    let src_ns = src.namespace().unwrap_or_default();
    let dst_ns = dst.namespace().unwrap_or_default();
    let src_sa = service_account(src);
    let dst_sa = service_account(dst);

    let allowed = targets
        .into_iter()
        .filter(|target| {
            let target_ns = target.namespace().unwrap_or_default();
            let spec = &target.spec;
            subject_matches(&spec.destination, &target_ns, &dst_ns, dst_sa)
                && spec
                    .sources
                    .iter()
                    .any(|source| subject_matches(source, &target_ns, &src_ns, src_sa))
        })
        .collect::<Vec<_>>();

    if allowed.is_empty() {
        Verdict::Denied
    } else {
        Verdict::Allowed(allowed)
    }
}

/// Writes a human-readable report of `verdict`.
pub fn write_report(
    out: &mut impl io::Write,
    src: &PodRef,
    dst: &PodRef,
    control_plane_ns: &str,
    verdict: &Verdict,
) -> anyhow::Result<()> {
    match verdict {
        Verdict::Permissive => {
            writeln!(
                out,
                "[+] Permissive mode enabled for the mesh controlled from the {control_plane_ns:?} namespace\n"
            )?;
            writeln!(out, "[+] Pod '{src}' is allowed to communicate to pod '{dst}'")?;
        }
        Verdict::Allowed(targets) => {
            writeln!(
                out,
                "[+] SMI traffic policy mode enabled for the mesh controlled from the {control_plane_ns:?} namespace\n"
            )?;
            for target in targets {
                writeln!(
                    out,
                    "[+] Pod '{src}' is allowed to communicate to pod '{dst}' via the SMI TrafficTarget policy {:?}:",
                    target.name_any()
                )?;
                writeln!(out, "---\n{}---", serde_yaml::to_string(target)?)?;
            }
        }
        Verdict::Denied => {
            writeln!(
                out,
                "[+] SMI traffic policy mode enabled for the mesh controlled from the {control_plane_ns:?} namespace\n"
            )?;
            writeln!(
                out,
                "[+] Pod '{src}' is not allowed to communicate to pod '{dst}', missing SMI TrafficTarget policy"
            )?;
        }
    }
    Ok(())
}

fn service_account(pod: &Pod) -> &str {
    pod.spec
        .as_ref()
        .and_then(|spec| spec.service_account_name.as_deref())
        .filter(|sa| !sa.is_empty())
        .unwrap_or(DEFAULT_SERVICE_ACCOUNT)
}

/// Subjects without a namespace refer to the TrafficTarget's own namespace.
fn subject_matches(
    subject: &IdentityBindingSubject,
    target_ns: &str,
    ns: &str,
    service_account: &str,
) -> bool {
    subject.kind == IdentityBindingSubject::SERVICE_ACCOUNT
        && subject.name == service_account
        && subject.namespace.as_deref().unwrap_or(target_ns) == ns
}

// === impl PodRef ===

impl FromStr for PodRef {
    type Err = InvalidPodRef;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidPodRef(s.to_string());
        let (namespace, name) = match s.split('/').collect::<Vec<_>>()[..] {
            [name] => (DEFAULT_NAMESPACE, name),
            [namespace, name] if !namespace.is_empty() => (namespace, name),
            _ => return Err(invalid()),
        };
        if name.is_empty() {
            return Err(invalid());
        }
        Ok(Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        })
    }
}

impl fmt::Display for PodRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

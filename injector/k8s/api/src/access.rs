/// An SMI access policy allowing a set of sources to send traffic to a destination identity.
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
    group = "access.smi-spec.io",
    version = "v1alpha3",
    kind = "TrafficTarget",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct TrafficTargetSpec {
    pub destination: IdentityBindingSubject,

    #[serde(default)]
    pub sources: Vec<IdentityBindingSubject>,

    #[serde(default)]
    pub rules: Vec<TrafficTargetRule>,
}

#[derive(
    Clone, Debug, Default, PartialEq, serde::Deserialize, serde::Serialize, schemars::JsonSchema,
)]
#[serde(rename_all = "camelCase")]
pub struct IdentityBindingSubject {
    pub kind: String,
    pub name: String,
    pub namespace: Option<String>,
}

#[derive(
    Clone, Debug, Default, PartialEq, serde::Deserialize, serde::Serialize, schemars::JsonSchema,
)]
#[serde(rename_all = "camelCase")]
pub struct TrafficTargetRule {
    pub kind: String,
    pub name: String,
    #[serde(default)]
    pub matches: Vec<String>,
}

impl IdentityBindingSubject {
    pub const SERVICE_ACCOUNT: &'static str = "ServiceAccount";

    /// Returns true if this subject names the given service account.
    pub fn is_service_account(&self, ns: &str, name: &str) -> bool {
        self.kind == Self::SERVICE_ACCOUNT
            && self.name == name
            && self.namespace.as_deref() == Some(ns)
    }
}

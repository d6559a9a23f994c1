//! Well-known label and annotation keys.

use thiserror::Error;

/// Set on a namespace or pod to enable or disable sidecar injection.
pub const SIDECAR_INJECTION_ANNOTATION: &str = "mesh.io/sidecar-injection";

/// Set on a namespace to enroll it in the mesh with the given name.
pub const MONITORED_BY_LABEL: &str = "mesh.io/monitored-by";

/// Set to `true` on a namespace to exclude it from injection entirely.
pub const IGNORE_LABEL: &str = "mesh.io/ignore";

/// Carries the injected proxy's unique identifier.
pub const PROXY_UUID_LABEL: &str = "mesh.io/proxy-uuid";

pub const OUTBOUND_PORT_EXCLUSION_LIST_ANNOTATION: &str = "mesh.io/outbound-port-exclusion-list";
pub const OUTBOUND_IP_RANGE_EXCLUSION_LIST_ANNOTATION: &str =
    "mesh.io/outbound-ip-range-exclusion-list";

pub const PROXY_LOG_LEVEL_ANNOTATION: &str = "mesh.io/proxy-log-level";
pub const PROXY_CPU_REQUEST_ANNOTATION: &str = "mesh.io/proxy-cpu-request";
pub const PROXY_CPU_LIMIT_ANNOTATION: &str = "mesh.io/proxy-cpu-limit";
pub const PROXY_MEMORY_REQUEST_ANNOTATION: &str = "mesh.io/proxy-memory-request";
pub const PROXY_MEMORY_LIMIT_ANNOTATION: &str = "mesh.io/proxy-memory-limit";

pub const PROMETHEUS_SCRAPE_ANNOTATION: &str = "prometheus.io/scrape";
pub const PROMETHEUS_PORT_ANNOTATION: &str = "prometheus.io/port";
pub const PROMETHEUS_PATH_ANNOTATION: &str = "prometheus.io/path";

/// The parsed value of a [`SIDECAR_INJECTION_ANNOTATION`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Injection {
    Enabled,
    Disabled,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error(
    "invalid {annotation} value {0:?}; expected enabled or disabled",
    annotation = SIDECAR_INJECTION_ANNOTATION
)]
pub struct InvalidInjection(pub String);

// === impl Injection ===

impl Injection {
    /// Reads the injection annotation from `meta`, if it is set.
    pub fn from_meta(meta: &crate::ObjectMeta) -> Result<Option<Self>, InvalidInjection> {
        meta.annotations
            .as_ref()
            .and_then(|anns| anns.get(SIDECAR_INJECTION_ANNOTATION))
            .map(|v| v.parse())
            .transpose()
    }
}

impl std::str::FromStr for Injection {
    type Err = InvalidInjection;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "enabled" | "yes" | "true" => Ok(Self::Enabled),
            "disabled" | "no" | "false" => Ok(Self::Disabled),
            _ => Err(InvalidInjection(s.to_string())),
        }
    }
}

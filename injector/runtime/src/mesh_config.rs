use crate::{
    core::MeshConfigSource,
    k8s::{MeshConfig, MeshConfigSpec, ResourceExt},
};
use anyhow::{anyhow, Result};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{info, warn};

/// Holds the most recently observed `MeshConfig`.
#[derive(Debug)]
pub struct MeshConfigIndex {
    namespace: String,
    name: String,
    current: Option<Arc<MeshConfigSpec>>,
}

/// A handle to the mesh configuration that the webhook reads on every request.
#[derive(Clone, Debug)]
pub struct SharedMeshConfig(Arc<RwLock<MeshConfigIndex>>);

// === impl MeshConfigIndex ===

impl MeshConfigIndex {
    pub fn shared(namespace: impl ToString, name: impl ToString) -> Arc<RwLock<Self>> {
        Arc::new(RwLock::new(Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
            current: None,
        }))
    }

    fn is_tracked(&self, namespace: &str, name: &str) -> bool {
        self.namespace == namespace && self.name == name
    }
}

impl kubert::index::IndexNamespacedResource<MeshConfig> for MeshConfigIndex {
    fn apply(&mut self, config: MeshConfig) {
        let namespace = config.namespace().unwrap_or_default();
        let name = config.name_unchecked();
        if !self.is_tracked(&namespace, &name) {
            return;
        }

        info!(%namespace, %name, "Updated mesh configuration");
        self.current = Some(Arc::new(config.spec));
    }

    fn delete(&mut self, namespace: String, name: String) {
        if self.is_tracked(&namespace, &name) {
            warn!(%namespace, %name, "Mesh configuration deleted");
            self.current = None;
        }
    }
}

// === impl SharedMeshConfig ===

impl SharedMeshConfig {
    pub fn new(index: Arc<RwLock<MeshConfigIndex>>) -> Self {
        Self(index)
    }
}

impl MeshConfigSource for SharedMeshConfig {
    fn mesh_config(&self) -> Result<Arc<MeshConfigSpec>> {
        let index = self.0.read();
        index.current.clone().ok_or_else(|| {
            anyhow!(
                "MeshConfig {}/{} has not been observed",
                index.namespace,
                index.name
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::k8s::ObjectMeta;
    use kubert::index::IndexNamespacedResource;

    fn mk(ns: &str, name: &str, log_level: &str) -> MeshConfig {
        let mut spec = MeshConfigSpec::default();
        spec.sidecar.log_level = log_level.to_string();
        MeshConfig {
            metadata: ObjectMeta {
                namespace: Some(ns.to_string()),
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec,
        }
    }

    #[test]
    fn tracks_configured_resource() {
        let index = MeshConfigIndex::shared("mesh-system", "mesh-config");
        let config = SharedMeshConfig::new(index.clone());
        assert!(config.mesh_config().is_err(), "nothing observed yet");

        index.write().apply(mk("mesh-system", "mesh-config", "debug"));
        assert_eq!(config.mesh_config().unwrap().sidecar.log_level, "debug");

        // Other MeshConfigs are ignored.
        index.write().apply(mk("mesh-system", "other", "trace"));
        index.write().apply(mk("default", "mesh-config", "trace"));
        assert_eq!(config.mesh_config().unwrap().sidecar.log_level, "debug");

        index
            .write()
            .delete("mesh-system".to_string(), "other".to_string());
        assert!(config.mesh_config().is_ok());

        index
            .write()
            .delete("mesh-system".to_string(), "mesh-config".to_string());
        assert!(config.mesh_config().is_err());
    }
}

use parking_lot::RwLock;
use std::{collections::BTreeSet, sync::Arc};

/// The set of namespaces that are never injected.
///
/// Readers take an immutable snapshot; writers replace the snapshot wholesale, so a request never
/// observes a partially updated set.
#[derive(Clone, Debug, Default)]
pub struct NonInjectNamespaces(Arc<RwLock<Arc<BTreeSet<String>>>>);

// === impl NonInjectNamespaces ===

impl NonInjectNamespaces {
    pub fn new(namespaces: impl IntoIterator<Item = String>) -> Self {
        Self(Arc::new(RwLock::new(Arc::new(
            namespaces.into_iter().collect(),
        ))))
    }

    pub fn snapshot(&self) -> Arc<BTreeSet<String>> {
        self.0.read().clone()
    }

    pub fn replace(&self, namespaces: BTreeSet<String>) {
        *self.0.write() = Arc::new(namespaces);
    }

    pub fn contains(&self, ns: &str) -> bool {
        self.0.read().contains(ns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshots_are_stable_across_replacement() {
        let namespaces = NonInjectNamespaces::new(vec!["kube-system".to_string()]);
        let before = namespaces.snapshot();

        namespaces.replace(
            ["kube-system", "mesh-system"]
                .into_iter()
                .map(String::from)
                .collect(),
        );

        assert_eq!(before.len(), 1);
        assert!(!before.contains("mesh-system"));
        assert!(namespaces.contains("mesh-system"));
        assert_eq!(namespaces.snapshot().len(), 2);
    }

    #[test]
    fn clones_share_updates() {
        let namespaces = NonInjectNamespaces::default();
        let reader = namespaces.clone();
        namespaces.replace(Some("ignored".to_string()).into_iter().collect());
        assert!(reader.contains("ignored"));
    }
}

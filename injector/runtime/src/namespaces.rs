use crate::{
    core::{NamespaceReader, NonInjectNamespaces},
    k8s::{meta::IGNORE_LABEL, Api, Client, Namespace, ResourceExt},
};
use anyhow::Result;
use parking_lot::RwLock;
use std::{collections::BTreeSet, sync::Arc};
use tracing::info;

/// Reads Namespaces directly from the API server.
///
/// A Namespace may be created immediately before its first Pod, so lookups do not go through a
/// watch cache.
#[derive(Clone)]
pub struct ApiNamespaces(Api<Namespace>);

/// Maintains the non-inject set from Namespaces that are labelled to be ignored by the mesh.
#[derive(Debug)]
pub struct NamespaceIndex {
    configured: BTreeSet<String>,
    ignored: BTreeSet<String>,
    non_inject: NonInjectNamespaces,
}

// === impl ApiNamespaces ===

impl ApiNamespaces {
    pub fn new(client: Client) -> Self {
        Self(Api::all(client))
    }
}

#[async_trait::async_trait]
impl NamespaceReader for ApiNamespaces {
    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>> {
        Ok(self.0.get_opt(name).await?)
    }
}

// === impl NamespaceIndex ===

impl NamespaceIndex {
    /// Creates an index seeded with the statically `configured` namespaces, which are never
    /// removed from the non-inject set.
    pub fn shared(
        configured: impl IntoIterator<Item = String>,
        non_inject: NonInjectNamespaces,
    ) -> Arc<RwLock<Self>> {
        let index = Self {
            configured: configured.into_iter().collect(),
            ignored: BTreeSet::new(),
            non_inject,
        };
        index.publish();
        Arc::new(RwLock::new(index))
    }

    fn publish(&self) {
        self.non_inject
            .replace(self.configured.union(&self.ignored).cloned().collect());
    }
}

impl kubert::index::IndexClusterResource<Namespace> for NamespaceIndex {
    fn apply(&mut self, ns: Namespace) {
        let name = ns.name_unchecked();
        let ignored = ns
            .labels()
            .get(IGNORE_LABEL)
            .is_some_and(|v| v.eq_ignore_ascii_case("true"));

        let changed = if ignored {
            self.ignored.insert(name.clone())
        } else {
            self.ignored.remove(&name)
        };
        if changed {
            info!(ns = %name, ignored, "Updated non-inject namespaces");
            self.publish();
        }
    }

    fn delete(&mut self, name: String) {
        if self.ignored.remove(&name) {
            self.publish();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::k8s::ObjectMeta;
    use kubert::index::IndexClusterResource;
    use maplit::{btreemap, convert_args};

    fn mk_ns(name: &str, ignore: Option<&str>) -> Namespace {
        Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: ignore.map(|v| convert_args!(btreemap!(IGNORE_LABEL => v))),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn ignored_namespaces_join_configured_set() {
        let non_inject = NonInjectNamespaces::default();
        let index = NamespaceIndex::shared(vec!["kube-system".to_string()], non_inject.clone());
        assert!(non_inject.contains("kube-system"));

        index.write().apply(mk_ns("legacy", Some("true")));
        assert!(non_inject.contains("legacy"));

        index.write().apply(mk_ns("bookstore", Some("false")));
        assert!(!non_inject.contains("bookstore"));

        // Removing the label re-enables injection.
        index.write().apply(mk_ns("legacy", None));
        assert!(!non_inject.contains("legacy"));

        index.write().apply(mk_ns("legacy", Some("true")));
        index.write().delete("legacy".to_string());
        assert!(!non_inject.contains("legacy"));
    }

    #[test]
    fn configured_namespaces_are_never_removed() {
        let non_inject = NonInjectNamespaces::default();
        let index = NamespaceIndex::shared(vec!["kube-system".to_string()], non_inject.clone());

        index.write().apply(mk_ns("kube-system", None));
        index.write().delete("kube-system".to_string());
        assert!(non_inject.contains("kube-system"));
    }
}

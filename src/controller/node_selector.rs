//! Node selection for a Module

use k8s_openapi::api::core::v1::Node;

use super::store::ClusterStore;
use crate::crd::Module;
use crate::error::Result;

const NO_SCHEDULE: &str = "NoSchedule";

/// Nodes targeted by `module` that accept new pods.
///
/// `PreferNoSchedule` taints are soft and do not exclude a node.
pub async fn select_nodes(store: &dyn ClusterStore, module: &Module) -> Result<Vec<Node>> {
    let nodes = store.list_nodes(&module.spec.selector).await?;
    Ok(nodes.into_iter().filter(is_schedulable).collect())
}

pub fn is_schedulable(node: &Node) -> bool {
    !node
        .spec
        .as_ref()
        .and_then(|s| s.taints.as_ref())
        .is_some_and(|taints| taints.iter().any(|t| t.effect == NO_SCHEDULE))
}

/// Whether `node` carries every label of the module selector
pub fn selector_matches(module: &Module, node: &Node) -> bool {
    let labels = node.metadata.labels.as_ref();
    module
        .spec
        .selector
        .iter()
        .all(|(k, v)| labels.and_then(|l| l.get(k)) == Some(v))
}

pub fn kernel_version(node: &Node) -> Option<&str> {
    node.status
        .as_ref()?
        .node_info
        .as_ref()
        .map(|info| info.kernel_version.as_str())
        .filter(|kv| !kv.is_empty())
}

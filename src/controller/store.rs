//! Object-store seam
//!
//! The reconcilers read and write cluster state through [`ClusterStore`] so
//! they can be exercised against in-memory doubles. [`KubeStore`] is the
//! production implementation over `kube::Client`.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Pod, Secret, ServiceAccount};
use kube::{
    api::{Api, ListParams, ObjectMeta, PostParams},
    Client, ResourceExt,
};
use tracing::{debug, info};

use super::finalizers;
use crate::crd::{Module, NodeModuleSpec, NodeModulesConfig, NodeModulesConfigSpec};
use crate::error::Result;

/// A change to one module entry of a node's NodeModulesConfig spec
#[derive(Clone, Debug, PartialEq)]
pub enum NmcSpecChange {
    Set(NodeModuleSpec),
    Remove { name: String, namespace: String },
}

impl NmcSpecChange {
    /// Apply to `nmc`, returning whether anything changed
    pub fn apply(&self, nmc: &mut NodeModulesConfig) -> bool {
        match self {
            NmcSpecChange::Set(spec) => {
                let unchanged = nmc
                    .find_spec(&spec.item.name, &spec.item.namespace)
                    .is_some_and(|existing| existing == spec);
                if unchanged {
                    return false;
                }
                nmc.set_spec(spec.clone());
                true
            }
            NmcSpecChange::Remove { name, namespace } => nmc.remove_spec(name, namespace),
        }
    }
}

#[async_trait]
pub trait ClusterStore: Send + Sync {
    async fn get_module(&self, name: &str, namespace: &str) -> Result<Option<Module>>;

    /// Nodes carrying every label of `selector`
    async fn list_nodes(&self, selector: &BTreeMap<String, String>) -> Result<Vec<Node>>;

    async fn get_node(&self, name: &str) -> Result<Option<Node>>;

    async fn get_node_modules_config(&self, name: &str) -> Result<Option<NodeModulesConfig>>;

    async fn list_node_modules_configs(&self) -> Result<Vec<NodeModulesConfig>>;

    /// Replace the status, conditional on the object's resourceVersion.
    ///
    /// Returns the stored object so callers can chain further writes.
    async fn replace_node_modules_config_status(
        &self,
        nmc: &NodeModulesConfig,
    ) -> Result<NodeModulesConfig>;

    /// Read-modify-write of one spec entry of the node's NodeModulesConfig.
    ///
    /// The object is created when absent and the change adds an entry.
    async fn update_node_modules_config_spec(&self, node: &str, change: NmcSpecChange)
        -> Result<()>;

    async fn remove_pod_finalizer(&self, pod: &Pod, finalizer: &str) -> Result<()>;

    async fn get_service_account(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<ServiceAccount>>;

    async fn get_secret(&self, name: &str, namespace: &str) -> Result<Option<Secret>>;
}

/// `k=v,k2=v2` label selector string
pub fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ClusterStore for KubeStore {
    async fn get_module(&self, name: &str, namespace: &str) -> Result<Option<Module>> {
        let api: Api<Module> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn list_nodes(&self, selector: &BTreeMap<String, String>) -> Result<Vec<Node>> {
        let api: Api<Node> = Api::all(self.client.clone());
        let params = ListParams::default().labels(&label_selector(selector));
        Ok(api.list(&params).await?.items)
    }

    async fn get_node(&self, name: &str) -> Result<Option<Node>> {
        let api: Api<Node> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn get_node_modules_config(&self, name: &str) -> Result<Option<NodeModulesConfig>> {
        let api: Api<NodeModulesConfig> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn list_node_modules_configs(&self) -> Result<Vec<NodeModulesConfig>> {
        let api: Api<NodeModulesConfig> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn replace_node_modules_config_status(
        &self,
        nmc: &NodeModulesConfig,
    ) -> Result<NodeModulesConfig> {
        let api: Api<NodeModulesConfig> = Api::all(self.client.clone());
        let data = serde_json::to_vec(nmc)?;
        let updated = api
            .replace_status(&nmc.name_any(), &PostParams::default(), data)
            .await?;
        debug!("Updated status of NodeModulesConfig {}", nmc.name_any());
        Ok(updated)
    }

    async fn update_node_modules_config_spec(
        &self,
        node: &str,
        change: NmcSpecChange,
    ) -> Result<()> {
        let api: Api<NodeModulesConfig> = Api::all(self.client.clone());

        match api.get_opt(node).await? {
            Some(mut nmc) => {
                if !change.apply(&mut nmc) {
                    return Ok(());
                }
                // resourceVersion from the read makes this a conditional update
                api.replace(node, &PostParams::default(), &nmc).await?;
                debug!("Updated NodeModulesConfig {}", node);
            }
            None => {
                let mut nmc = NodeModulesConfig {
                    metadata: ObjectMeta {
                        name: Some(node.to_string()),
                        ..Default::default()
                    },
                    spec: NodeModulesConfigSpec::default(),
                    status: None,
                };
                if !change.apply(&mut nmc) {
                    return Ok(());
                }
                api.create(&PostParams::default(), &nmc).await?;
                info!("Created NodeModulesConfig {}", node);
            }
        }

        Ok(())
    }

    async fn remove_pod_finalizer(&self, pod: &Pod, finalizer: &str) -> Result<()> {
        let namespace = pod.namespace().unwrap_or_default();
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &namespace);
        finalizers::remove_finalizer(&api, pod, finalizer).await
    }

    async fn get_service_account(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<ServiceAccount>> {
        let api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn get_secret(&self, name: &str, namespace: &str) -> Result<Option<Secret>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }
}

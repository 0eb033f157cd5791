//! Module to NodeModulesConfig bridge
//!
//! Writes one spec entry per targeted node into that node's
//! NodeModulesConfig once the module image for the node's kernel is
//! available, and removes entries for nodes the module no longer targets.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use kube::ResourceExt;
use tracing::{debug, info, instrument, warn};

use super::jobs::pull_credentials;
use super::mapper::{KernelMapper, ModuleLoaderData};
use super::node_selector::{kernel_version, select_nodes};
use super::store::{ClusterStore, NmcSpecChange};
use crate::crd::{Module, ModuleConfig, ModuleItem, NodeModuleSpec};
use crate::error::{Error, Result};
use crate::registry::ImageRegistry;

pub struct ModuleNmcReconciler {
    store: Arc<dyn ClusterStore>,
    mapper: Arc<dyn KernelMapper>,
    registry: Arc<dyn ImageRegistry>,
}

/// The NodeModulesConfig entry for `mld` on a node running `node_kernel`
pub fn node_module_spec(mld: &ModuleLoaderData, node_kernel: &str) -> NodeModuleSpec {
    NodeModuleSpec {
        item: ModuleItem {
            name: mld.name.clone(),
            namespace: mld.namespace.clone(),
            image_repo_secret: mld.image_repo_secret.clone(),
            service_account_name: mld.service_account_name.clone().unwrap_or_default(),
        },
        config: ModuleConfig {
            kernel_version: node_kernel.to_string(),
            container_image: mld.container_image.clone(),
            image_pull_policy: mld.image_pull_policy.clone(),
            insecure_pull: mld.registry_tls.insecure || mld.registry_tls.insecure_skip_tls_verify,
            in_tree_module_to_remove: mld.in_tree_module_to_remove.clone(),
            modprobe: mld.modprobe.clone(),
        },
    }
}

impl ModuleNmcReconciler {
    pub fn new(
        store: Arc<dyn ClusterStore>,
        mapper: Arc<dyn KernelMapper>,
        registry: Arc<dyn ImageRegistry>,
    ) -> Self {
        Self {
            store,
            mapper,
            registry,
        }
    }

    #[instrument(skip(self, module), fields(name = %module.name_any(), namespace = module.namespace()))]
    pub async fn reconcile(&self, module: &Module) -> Result<()> {
        let name = module.name_any();
        let namespace = module.namespace().unwrap_or_default();

        let nodes = select_nodes(self.store.as_ref(), module).await?;
        let mut keep = BTreeSet::new();
        let mut available: BTreeMap<String, bool> = BTreeMap::new();
        let mut errors = Vec::new();

        for node in &nodes {
            let node_name = node.name_any();
            let Some(kernel) = kernel_version(node) else {
                continue;
            };

            let mld = match self.mapper.module_loader_data_for_kernel(module, kernel) {
                Ok(mld) => mld,
                Err(Error::NoKernelMapping { .. }) => {
                    debug!("No mapping for kernel {} on node {}", kernel, node_name);
                    continue;
                }
                Err(e) => {
                    errors.push(e);
                    continue;
                }
            };
            keep.insert(node_name.clone());

            let ready = match available.get(kernel) {
                Some(ready) => *ready,
                None => match self.image_available(&mld).await {
                    Ok(ready) => {
                        available.insert(kernel.to_string(), ready);
                        ready
                    }
                    Err(e) => {
                        errors.push(e);
                        continue;
                    }
                },
            };
            if !ready {
                debug!("Image {} not available yet for node {}", mld.container_image, node_name);
                continue;
            }

            let change = NmcSpecChange::Set(node_module_spec(&mld, kernel));
            if let Err(e) = self.store.update_node_modules_config_spec(&node_name, change).await {
                errors.push(e);
            }
        }

        for nmc in self.store.list_node_modules_configs().await? {
            let node_name = nmc.name_any();
            if keep.contains(&node_name) || nmc.find_spec(&name, &namespace).is_none() {
                continue;
            }
            info!("Node {} is no longer targeted, removing {}/{}", node_name, namespace, name);
            let change = NmcSpecChange::Remove {
                name: name.clone(),
                namespace: namespace.clone(),
            };
            if let Err(e) = self.store.update_node_modules_config_spec(&node_name, change).await {
                errors.push(e);
            }
        }

        Error::aggregate(errors)
    }

    /// Remove the module from every NodeModulesConfig
    #[instrument(skip(self))]
    pub async fn remove_module(&self, name: &str, namespace: &str) -> Result<()> {
        let mut errors = Vec::new();

        for nmc in self.store.list_node_modules_configs().await? {
            if nmc.find_spec(name, namespace).is_none() {
                continue;
            }
            let change = NmcSpecChange::Remove {
                name: name.to_string(),
                namespace: namespace.to_string(),
            };
            if let Err(e) = self
                .store
                .update_node_modules_config_spec(&nmc.name_any(), change)
                .await
            {
                warn!("Failed to remove {}/{} from {}: {}", namespace, name, nmc.name_any(), e);
                errors.push(e);
            }
        }

        Error::aggregate(errors)
    }

    /// Pre-built images are assumed present; built or signed ones are checked
    async fn image_available(&self, mld: &ModuleLoaderData) -> Result<bool> {
        if !mld.build_configured() && !mld.sign_configured() {
            return Ok(true);
        }
        let credentials = pull_credentials(self.store.as_ref(), mld).await?;
        self.registry
            .image_exists(&mld.container_image, &mld.registry_tls, credentials.as_ref())
            .await
    }
}

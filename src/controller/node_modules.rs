//! Per-node worker loop
//!
//! Drives a node's NodeModulesConfig toward its spec: finished worker pods
//! are folded into the status, then every spec entry that is not yet loaded
//! with its current config gets a loader or unloader pod, and status entries
//! no longer in the spec are unloaded.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::ResourceExt;
use tracing::{debug, info, instrument, warn};

use super::finalizers::has_finalizer;
use super::pods::{worker_config, PodManager, WorkerAction};
use super::store::ClusterStore;
use crate::constants::{MODULE_NAME_LABEL, WORKER_CONTAINER_NAME, WORKER_POD_FINALIZER};
use crate::crd::{ModuleItem, NodeModuleSpec, NodeModuleStatus, NodeModulesConfig};
use crate::error::{Error, Result};

const POD_SUCCEEDED: &str = "Succeeded";
const POD_FAILED: &str = "Failed";

pub struct NodeModuleReconciler {
    store: Arc<dyn ClusterStore>,
    pods: Arc<dyn PodManager>,
}

impl NodeModuleReconciler {
    pub fn new(store: Arc<dyn ClusterStore>, pods: Arc<dyn PodManager>) -> Self {
        Self { store, pods }
    }

    /// One pass for the node named `node`
    #[instrument(skip(self))]
    pub async fn reconcile(&self, node: &str) -> Result<()> {
        let Some(nmc) = self.store.get_node_modules_config(node).await? else {
            info!("NodeModulesConfig {} is gone, releasing worker pods", node);
            return self.remove_orphan_finalizers(node).await;
        };

        let nmc = self.sync_status(&nmc).await?;
        let mut errors = Vec::new();

        for spec in &nmc.spec.modules {
            let status = nmc.find_status(&spec.item.name, &spec.item.namespace);
            if let Err(e) = self.process_module_spec(&nmc, spec, status).await {
                warn!(
                    "Failed to process module {}/{} on {}: {}",
                    spec.item.namespace, spec.item.name, node, e
                );
                errors.push(e);
            }
        }

        let orphans: Vec<NodeModuleStatus> = nmc
            .status
            .iter()
            .flat_map(|s| s.modules.iter())
            .filter(|s| nmc.find_spec(&s.item.name, &s.item.namespace).is_none())
            .cloned()
            .collect();

        for status in &orphans {
            if let Err(e) = self.process_orphan_module_status(&nmc, status).await {
                errors.push(e);
            }
        }

        Error::aggregate(errors)
    }

    /// Fold finished worker pods into the status, then delete those pods.
    ///
    /// Returns the NodeModulesConfig as stored after the status write.
    pub async fn sync_status(&self, nmc: &NodeModulesConfig) -> Result<NodeModulesConfig> {
        let node = nmc.name_any();
        let pods = self.pods.list_worker_pods_on_node(&node).await?;
        if pods.is_empty() {
            return Ok(nmc.clone());
        }

        let mut updated = nmc.clone();
        let mut finished = Vec::new();
        let mut errors = Vec::new();

        for pod in pods {
            let phase = pod
                .status
                .as_ref()
                .and_then(|s| s.phase.clone())
                .unwrap_or_default();
            let Some(module) = pod.labels().get(MODULE_NAME_LABEL).cloned() else {
                warn!("Worker pod {} has no module label, skipping", pod.name_any());
                continue;
            };
            let namespace = pod.namespace().unwrap_or_default();
            debug!("Worker pod {}/{} is {}", namespace, pod.name_any(), phase);

            match phase.as_str() {
                POD_FAILED => {
                    warn!("Worker pod {}/{} failed", namespace, pod.name_any());
                    finished.push(pod);
                }
                POD_SUCCEEDED => {
                    if WorkerAction::from_pod(&pod) == Some(WorkerAction::Unload) {
                        updated.remove_status(&module, &namespace);
                        finished.push(pod);
                        continue;
                    }

                    let config = match worker_config(&pod) {
                        Ok(config) => config,
                        Err(e) => {
                            errors.push(e);
                            continue;
                        }
                    };
                    let item = status_item(nmc, &pod, &module, &namespace);
                    updated.set_status(NodeModuleStatus {
                        item,
                        config: Some(config),
                        last_transition_time: Some(finished_at(&pod).to_rfc3339()),
                    });
                    finished.push(pod);
                }
                _ => {}
            }
        }

        let stored = if updated.status != nmc.status {
            self.store.replace_node_modules_config_status(&updated).await?
        } else {
            updated
        };

        for pod in &finished {
            if let Err(e) = self.pods.delete_pod(pod).await {
                errors.push(e);
            }
        }

        Error::aggregate(errors)?;
        Ok(stored)
    }

    /// Decide what one spec entry needs given its status entry
    pub async fn process_module_spec(
        &self,
        nmc: &NodeModulesConfig,
        spec: &NodeModuleSpec,
        status: Option<&NodeModuleStatus>,
    ) -> Result<()> {
        let Some(status) = status else {
            info!("Module {}/{} not loaded yet, creating loader pod", spec.item.namespace, spec.item.name);
            return ignore_already_exists(self.pods.create_loader_pod(nmc, spec).await);
        };

        let Some(loaded) = &status.config else {
            info!(
                "Module {}/{} has no loaded config after a failed worker, creating loader pod",
                spec.item.namespace, spec.item.name
            );
            return ignore_already_exists(self.pods.create_loader_pod(nmc, spec).await);
        };

        if *loaded != spec.config {
            info!("Module {}/{} config changed, creating unloader pod", spec.item.namespace, spec.item.name);
            return ignore_already_exists(self.pods.create_unloader_pod(nmc, status).await);
        }

        let node = self
            .store
            .get_node(&nmc.name_any())
            .await?
            .ok_or_else(|| Error::not_found("Node", nmc.name_any()))?;

        if node_ready_since(&node, status.last_transition_time.as_deref()) {
            info!(
                "Node {} became ready after module {}/{} was loaded, reloading",
                nmc.name_any(),
                spec.item.namespace,
                spec.item.name
            );
            return ignore_already_exists(self.pods.create_loader_pod(nmc, spec).await);
        }

        Ok(())
    }

    /// Handle a status entry that has no spec entry anymore
    pub async fn process_orphan_module_status(
        &self,
        nmc: &NodeModulesConfig,
        status: &NodeModuleStatus,
    ) -> Result<()> {
        if status.config.is_some() {
            info!("Module {}/{} removed from spec, creating unloader pod", status.item.namespace, status.item.name);
            return ignore_already_exists(self.pods.create_unloader_pod(nmc, status).await);
        }

        // Nothing is loaded, the entry can simply go
        let Some(mut latest) = self.store.get_node_modules_config(&nmc.name_any()).await? else {
            return Ok(());
        };
        latest.remove_status(&status.item.name, &status.item.namespace);
        self.store.replace_node_modules_config_status(&latest).await?;
        debug!("Dropped status of module {}/{}", status.item.namespace, status.item.name);
        Ok(())
    }

    /// Release every worker pod on `node` from the worker finalizer
    pub async fn remove_orphan_finalizers(&self, node: &str) -> Result<()> {
        let pods = self.pods.list_worker_pods_on_node(node).await?;
        let mut errors = Vec::new();

        for pod in pods.iter().filter(|p| has_finalizer(*p, WORKER_POD_FINALIZER)) {
            if let Err(e) = self.store.remove_pod_finalizer(pod, WORKER_POD_FINALIZER).await {
                errors.push(e);
            }
        }

        Error::aggregate(errors)
    }
}

fn ignore_already_exists(result: Result<()>) -> Result<()> {
    match result {
        Err(e) if e.is_already_exists() => {
            debug!("Worker pod already exists");
            Ok(())
        }
        other => other,
    }
}

/// Identity for a status entry, preferring the spec entry's credentials
fn status_item(nmc: &NodeModulesConfig, pod: &Pod, module: &str, namespace: &str) -> ModuleItem {
    if let Some(spec) = nmc.find_spec(module, namespace) {
        return spec.item.clone();
    }
    ModuleItem {
        name: module.to_string(),
        namespace: namespace.to_string(),
        image_repo_secret: None,
        service_account_name: pod
            .spec
            .as_ref()
            .and_then(|s| s.service_account_name.clone())
            .unwrap_or_default(),
    }
}

/// When the worker container terminated, or now when unknown
fn finished_at(pod: &Pod) -> DateTime<Utc> {
    pod.status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .and_then(|cs| cs.iter().find(|c| c.name == WORKER_CONTAINER_NAME))
        .and_then(|c| {
            let current = c.state.as_ref().and_then(|s| s.terminated.as_ref());
            let last = c.last_state.as_ref().and_then(|s| s.terminated.as_ref());
            current.or(last)
        })
        .and_then(|t| t.finished_at.as_ref())
        .map(|t| t.0)
        .unwrap_or_else(Utc::now)
}

/// Whether the node's Ready condition turned true after `loaded_at`.
///
/// A reboot resets the condition, so this catches modules lost on reboot.
pub fn node_ready_since(node: &Node, loaded_at: Option<&str>) -> bool {
    let Some(loaded_at) = loaded_at.and_then(|t| DateTime::parse_from_rfc3339(t).ok()) else {
        return false;
    };

    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|c| c.iter().find(|c| c.type_ == "Ready" && c.status == "True"))
        .and_then(|c| c.last_transition_time.as_ref())
        .is_some_and(|t| t.0 > loaded_at.with_timezone(&Utc))
}

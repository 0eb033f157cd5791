//! Build and sign reconciliation for one Module
//!
//! For every distinct kernel among the module's schedulable nodes, make sure
//! the module image exists: build it if a build is configured, then sign it
//! if signing is configured. Finished jobs are garbage collected on every
//! pass.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;
use tracing::{debug, info, instrument, warn};

use super::jobs::{intermediate_image_name, BuildManager, JobStatus, SignManager};
use super::mapper::{KernelMapper, ModuleLoaderData};
use super::node_selector::{kernel_version, select_nodes};
use super::store::ClusterStore;
use crate::crd::Module;
use crate::error::{Error, Result};

pub struct BuildSignReconciler {
    store: Arc<dyn ClusterStore>,
    mapper: Arc<dyn KernelMapper>,
    build: Arc<dyn BuildManager>,
    sign: Arc<dyn SignManager>,
}

impl BuildSignReconciler {
    pub fn new(
        store: Arc<dyn ClusterStore>,
        mapper: Arc<dyn KernelMapper>,
        build: Arc<dyn BuildManager>,
        sign: Arc<dyn SignManager>,
    ) -> Self {
        Self {
            store,
            mapper,
            build,
            sign,
        }
    }

    /// One pass for the Module `namespace/name`
    #[instrument(skip(self))]
    pub async fn reconcile(&self, name: &str, namespace: &str) -> Result<()> {
        let Some(module) = self.store.get_module(name, namespace).await? else {
            info!("Module {}/{} deleted, nothing to do", namespace, name);
            return Ok(());
        };

        let nodes = select_nodes(self.store.as_ref(), &module).await?;
        let mappings = self.relevant_kernel_mappings(&module, &nodes);

        let mut errors = Vec::new();
        for (kernel, mld) in &mappings {
            if let Err(e) = self.process_mapping(mld).await {
                warn!("Failed to process kernel {} for {}/{}: {}", kernel, namespace, name, e);
                errors.push(e);
                break;
            }
        }

        // Runs even when a mapping failed
        if let Err(e) = self.garbage_collect(&module).await {
            match e {
                Error::Multiple(all) => errors.extend(all),
                e => errors.push(e),
            }
        }

        Error::aggregate(errors)
    }

    /// One loader data per distinct kernel version, first node wins
    pub fn relevant_kernel_mappings(
        &self,
        module: &Module,
        nodes: &[Node],
    ) -> BTreeMap<String, ModuleLoaderData> {
        let mut mappings = BTreeMap::new();

        for node in nodes {
            let Some(kernel) = kernel_version(node) else {
                debug!("Node {} reports no kernel version", node.name_any());
                continue;
            };
            // `5.14.0+` and `5.14.0` resolve to the same kernel
            if mappings.contains_key(kernel.trim_end_matches('+')) {
                continue;
            }

            match self.mapper.module_loader_data_for_kernel(module, kernel) {
                Ok(mld) => {
                    mappings.insert(mld.kernel_version.clone(), mld);
                }
                Err(Error::NoKernelMapping { .. }) => {
                    info!(
                        "No mapping of {}/{} for kernel {} on node {}",
                        module.namespace().unwrap_or_default(),
                        module.name_any(),
                        kernel,
                        node.name_any()
                    );
                }
                Err(e) => {
                    warn!("Cannot map kernel {} on node {}: {}", kernel, node.name_any(), e);
                }
            }
        }

        mappings
    }

    async fn process_mapping(&self, mld: &ModuleLoaderData) -> Result<()> {
        if !self.handle_build(mld).await? {
            debug!("Build for kernel {} not finished, signing later", mld.kernel_version);
            return Ok(());
        }

        if self.handle_sign(mld).await? {
            debug!("Image {} ready for kernel {}", mld.container_image, mld.kernel_version);
        }
        Ok(())
    }

    /// Returns true once nothing is left to build for this kernel
    pub async fn handle_build(&self, mld: &ModuleLoaderData) -> Result<bool> {
        if !self.build.should_sync(mld).await? {
            debug!("Build not needed for kernel {}", mld.kernel_version);
            return Ok(true);
        }

        let status = self.build.sync(mld, true, &mld.owner).await?;
        Ok(phase_complete("build", mld, status))
    }

    /// Returns true once nothing is left to sign for this kernel
    pub async fn handle_sign(&self, mld: &ModuleLoaderData) -> Result<bool> {
        if !self.sign.should_sync(mld).await? {
            debug!("Signing not needed for kernel {}", mld.kernel_version);
            return Ok(true);
        }

        let previous_image = if mld.build_configured() {
            intermediate_image_name(&mld.name, &mld.namespace, &mld.container_image)
        } else {
            String::new()
        };

        let status = self
            .sign
            .sync(mld, &previous_image, true, &mld.owner)
            .await?;
        Ok(phase_complete("sign", mld, status))
    }

    /// Collect finished build and sign jobs; both always run
    pub async fn garbage_collect(&self, module: &Module) -> Result<()> {
        let name = module.name_any();
        let namespace = module.namespace().unwrap_or_default();
        let mut errors = Vec::new();

        match self.build.garbage_collect(&name, &namespace, module).await {
            Ok(deleted) if !deleted.is_empty() => info!("Deleted build jobs {:?}", deleted),
            Ok(_) => {}
            Err(e) => errors.push(e),
        }
        match self.sign.garbage_collect(&name, &namespace, module).await {
            Ok(deleted) if !deleted.is_empty() => info!("Deleted sign jobs {:?}", deleted),
            Ok(_) => {}
            Err(e) => errors.push(e),
        }

        Error::aggregate(errors)
    }
}

fn phase_complete(phase: &str, mld: &ModuleLoaderData, status: JobStatus) -> bool {
    #[cfg(feature = "metrics")]
    if status == JobStatus::Created {
        super::metrics::inc_job_created(&mld.namespace, &mld.name, phase);
    }

    match status {
        JobStatus::Completed => {
            info!("{} job for kernel {} completed", phase, mld.kernel_version);
            true
        }
        JobStatus::Created => {
            info!("{} job for kernel {} created", phase, mld.kernel_version);
            false
        }
        JobStatus::InProgress => {
            debug!("{} job for kernel {} in progress", phase, mld.kernel_version);
            false
        }
        JobStatus::Failed => {
            warn!("{} job for kernel {} failed", phase, mld.kernel_version);
            false
        }
    }
}

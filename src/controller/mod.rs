//! Controllers for Module and NodeModulesConfig resources
//!
//! The reconcilers here are plain structs over trait seams
//! ([`ClusterStore`], [`BuildManager`], [`SignManager`], [`PodManager`],
//! [`KernelMapper`]); [`reconciler`] wires them into kube-runtime
//! controllers.

pub mod build;
pub mod build_sign;
#[cfg(test)]
mod fakes;
mod finalizers;
pub mod jobs;
pub mod mapper;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod module_nmc;
pub mod node_modules;
pub mod node_selector;
pub mod pods;
pub mod pull_secrets;
mod reconciler;
pub mod sign;
pub mod store;

pub use build_sign::BuildSignReconciler;
pub use finalizers::{MODULE_FINALIZER, NMC_FINALIZER, WORKER_POD_FINALIZER};
pub use jobs::{BuildManager, JobStatus, SignManager};
pub use mapper::{DefaultKernelMapper, KernelMapper, ModuleLoaderData};
pub use module_nmc::ModuleNmcReconciler;
pub use node_modules::NodeModuleReconciler;
pub use node_selector::select_nodes;
pub use pods::PodManager;
pub use pull_secrets::{DefaultPullSecretHelper, PullSecretHelper};
pub use reconciler::{
    run_build_sign_controller, run_module_nmc_controller, run_node_modules_controller,
    ControllerState,
};
pub use store::{ClusterStore, KubeStore};

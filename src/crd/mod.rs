//! Custom Resource Definitions for kernel module management
//!
//! `Module` is the user-facing declaration; `NodeModulesConfig` is the
//! per-node desired and observed state the worker loop operates on.
//! `ManagedClusterModule` carries a Module spec on a hub cluster.

mod managed_cluster_module;
mod module;
mod node_modules_config;
pub mod validation;


pub use managed_cluster_module::*;
pub use module::*;
pub use node_modules_config::*;
pub use validation::SpecValidationError;

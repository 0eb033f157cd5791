//! Validating admission webhook for Module and ManagedClusterModule resources
//!
//! Module and ManagedClusterModule create and update requests are checked
//! with the rules in [`crate::crd::validation`]; deletes are always admitted.

pub mod server;

pub use server::{
    review_managed_cluster_module, review_module, WebhookServer,
    MANAGED_CLUSTER_MODULE_VALIDATION_PATH, MODULE_VALIDATION_PATH,
};

//! KMM operator: Kubernetes operator for out-of-tree kernel modules
//!
//! This crate builds and signs kernel module images in-cluster, and loads
//! them onto every node whose kernel a `Module` maps to.

pub mod config;
pub mod constants;
pub mod controller;
pub mod crd;
pub mod error;
pub mod registry;
pub mod webhook;

pub use crate::error::{Error, Result};

/// Install ring as the process-wide rustls crypto provider.
///
/// kube and axum-server pull in different rustls backends, and with both
/// compiled in rustls refuses to pick one. Must run before the first client
/// or TLS config is built; later calls are no-ops.
pub fn install_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

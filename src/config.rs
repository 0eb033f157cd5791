//! Operator configuration
//!
//! Loaded from an optional YAML file; every field has a default so an empty
//! or partial file is valid. Command-line arguments override a few fields
//! after loading.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OperatorConfig {
    pub webhook: WebhookConfig,
    pub metrics: MetricsConfig,
    pub worker: WorkerConfig,
    pub job: JobConfig,
    pub controllers: ControllersConfig,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WebhookConfig {
    pub enabled: bool,
    pub bind_address: SocketAddr,
    /// Directory holding `tls.crt` and `tls.key`
    pub cert_dir: PathBuf,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: SocketAddr::from(([0, 0, 0, 0], 9443)),
            cert_dir: PathBuf::from("/tmp/k8s-webhook-server/serving-certs"),
        }
    }
}

impl WebhookConfig {
    pub fn cert_path(&self) -> PathBuf {
        self.cert_dir.join("tls.crt")
    }

    pub fn key_path(&self) -> PathBuf {
        self.cert_dir.join("tls.key")
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MetricsConfig {
    pub bind_address: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([0, 0, 0, 0], 8080)),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkerConfig {
    /// Image running the load/unload logic on nodes
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firmware_host_path: Option<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            image: "gcr.io/k8s-staging-kmm/kernel-module-management-worker:latest".to_string(),
            firmware_host_path: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JobConfig {
    pub builder_image: String,
    pub signer_image: String,
    /// Completed jobs kept per module and job type
    pub keep_completed: usize,
    /// Completed jobs younger than this are never collected
    pub gc_delay_seconds: u64,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            builder_image: "gcr.io/kaniko-project/executor:latest".to_string(),
            signer_image: "gcr.io/k8s-staging-kmm/kernel-module-management-signimage:latest"
                .to_string(),
            keep_completed: 0,
            gc_delay_seconds: 0,
        }
    }
}

impl JobConfig {
    pub fn gc_delay(&self) -> Duration {
        Duration::from_secs(self.gc_delay_seconds)
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ControllersConfig {
    pub build_sign_concurrency: u16,
    pub node_modules_concurrency: u16,
    pub module_nmc_concurrency: u16,
}

impl Default for ControllersConfig {
    fn default() -> Self {
        Self {
            build_sign_concurrency: 4,
            node_modules_concurrency: 8,
            module_nmc_concurrency: 4,
        }
    }
}

impl OperatorConfig {
    /// Load from `path`, or return the defaults when no path is given
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            info!("No configuration file given, using defaults");
            return Ok(Self::default());
        };

        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::ConfigError(format!("failed to read {}: {e}", path.display()))
        })?;

        let config = Self::from_yaml(&contents)?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn from_yaml(contents: &str) -> Result<Self> {
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(contents)?)
    }
}

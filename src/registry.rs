//! Container registry access
//!
//! Build and sign jobs are skipped when their output image already exists,
//! so the managers need a cheap manifest lookup against the target registry.

use std::collections::BTreeMap;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use k8s_openapi::api::core::v1::Secret;
use oci_client::client::{ClientConfig, ClientProtocol};
use oci_client::errors::OciDistributionError;
use oci_client::secrets::RegistryAuth;
use oci_client::{Client as OciClient, Reference};
use serde::Deserialize;
use tracing::{debug, instrument};

use crate::crd::RegistryTls;
use crate::error::{Error, Result};

const DOCKER_CONFIG_JSON_KEY: &str = ".dockerconfigjson";

#[async_trait]
pub trait ImageRegistry: Send + Sync {
    /// Whether `image` has a manifest in its registry
    async fn image_exists(
        &self,
        image: &str,
        tls: &RegistryTls,
        credentials: Option<&DockerConfig>,
    ) -> Result<bool>;
}

/// Registry credentials from a `kubernetes.io/dockerconfigjson` secret
#[derive(Clone, Debug, Default, Deserialize)]
pub struct DockerConfig {
    #[serde(default)]
    auths: BTreeMap<String, DockerAuthEntry>,
}

#[derive(Clone, Debug, Default, Deserialize)]
struct DockerAuthEntry {
    #[serde(default)]
    auth: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

impl DockerConfig {
    pub fn from_json(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }

    /// Returns `None` when the secret carries no docker config
    pub fn from_secret(secret: &Secret) -> Result<Option<Self>> {
        let Some(data) = secret
            .data
            .as_ref()
            .and_then(|d| d.get(DOCKER_CONFIG_JSON_KEY))
        else {
            return Ok(None);
        };
        Self::from_json(&data.0).map(Some)
    }

    /// Username and password for `registry`, if any entry matches it
    pub fn credentials_for(&self, registry: &str) -> Option<(String, String)> {
        let entry = self
            .auths
            .iter()
            .find(|(host, _)| normalize_registry(host) == registry)
            .map(|(_, entry)| entry)?;

        if let (Some(user), Some(pass)) = (&entry.username, &entry.password) {
            return Some((user.clone(), pass.clone()));
        }

        let decoded = STANDARD.decode(entry.auth.as_deref()?).ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (user, pass) = decoded.split_once(':')?;
        Some((user.to_string(), pass.to_string()))
    }

    fn registry_auth(&self, reference: &Reference) -> RegistryAuth {
        match self.credentials_for(reference.registry()) {
            Some((user, pass)) => RegistryAuth::Basic(user, pass),
            None => RegistryAuth::Anonymous,
        }
    }
}

/// Strip scheme and path so `https://quay.io/v1/` matches `quay.io`
fn normalize_registry(host: &str) -> &str {
    let host = host
        .strip_prefix("https://")
        .or_else(|| host.strip_prefix("http://"))
        .unwrap_or(host);
    host.split('/').next().unwrap_or(host)
}

/// [`ImageRegistry`] backed by the OCI distribution API
#[derive(Default)]
pub struct OciImageRegistry;

impl OciImageRegistry {
    pub fn new() -> Self {
        Self
    }

    fn client(tls: &RegistryTls) -> OciClient {
        let protocol = if tls.insecure {
            ClientProtocol::Http
        } else {
            ClientProtocol::Https
        };

        OciClient::new(ClientConfig {
            protocol,
            accept_invalid_certificates: tls.insecure_skip_tls_verify,
            ..Default::default()
        })
    }
}

#[async_trait]
impl ImageRegistry for OciImageRegistry {
    #[instrument(skip(self, credentials))]
    async fn image_exists(
        &self,
        image: &str,
        tls: &RegistryTls,
        credentials: Option<&DockerConfig>,
    ) -> Result<bool> {
        let reference: Reference = image.parse().map_err(|e| Error::RegistryError {
            image: image.to_string(),
            message: format!("invalid image reference: {e}"),
        })?;

        let auth = credentials
            .map(|c| c.registry_auth(&reference))
            .unwrap_or(RegistryAuth::Anonymous);

        match Self::client(tls)
            .fetch_manifest_digest(&reference, &auth)
            .await
        {
            Ok(digest) => {
                debug!("Image {} found with digest {}", image, digest);
                Ok(true)
            }
            Err(e) if is_missing_manifest(&e) => {
                debug!("Image {} not found in registry", image);
                Ok(false)
            }
            Err(e) => Err(Error::RegistryError {
                image: image.to_string(),
                message: e.to_string(),
            }),
        }
    }
}

fn is_missing_manifest(e: &OciDistributionError) -> bool {
    matches!(
        e,
        OciDistributionError::ImageManifestNotFoundError(_)
            | OciDistributionError::ServerError { code: 404, .. }
    )
}

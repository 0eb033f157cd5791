//! Image pull secrets for worker pods
//!
//! The worker pulls the module image itself, so every pull secret that could
//! apply to the module is mounted into the pod: the module's own
//! `imageRepoSecret` plus the `imagePullSecrets` of its service account.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{SecretVolumeSource, Volume, VolumeMount};

use super::store::ClusterStore;
use crate::crd::ModuleItem;
use crate::error::{Error, Result};

/// Directory under which each pull secret gets its own subdirectory
pub const PULL_SECRETS_MOUNT: &str = "/var/run/kmm/pull-secrets";

#[async_trait]
pub trait PullSecretHelper: Send + Sync {
    async fn volumes_and_volume_mounts(
        &self,
        item: &ModuleItem,
    ) -> Result<(Vec<Volume>, Vec<VolumeMount>)>;
}

pub struct DefaultPullSecretHelper {
    store: Arc<dyn ClusterStore>,
}

impl DefaultPullSecretHelper {
    pub fn new(store: Arc<dyn ClusterStore>) -> Self {
        Self { store }
    }

    async fn secret_names(&self, item: &ModuleItem) -> Result<BTreeSet<String>> {
        let mut names = BTreeSet::new();

        if let Some(secret) = &item.image_repo_secret {
            names.insert(secret.name.clone());
        }

        if !item.service_account_name.is_empty() {
            let sa = self
                .store
                .get_service_account(&item.service_account_name, &item.namespace)
                .await?
                .ok_or_else(|| {
                    Error::not_found(
                        "ServiceAccount",
                        format!("{}/{}", item.namespace, item.service_account_name),
                    )
                })?;

            names.extend(
                sa.image_pull_secrets
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(|r| r.name)
                    .filter(|n| !n.is_empty()),
            );
        }

        Ok(names)
    }
}

pub fn pull_secret_volume_name(secret: &str) -> String {
    format!("pull-secret-{secret}")
}

#[async_trait]
impl PullSecretHelper for DefaultPullSecretHelper {
    async fn volumes_and_volume_mounts(
        &self,
        item: &ModuleItem,
    ) -> Result<(Vec<Volume>, Vec<VolumeMount>)> {
        let names = self.secret_names(item).await?;

        let volumes = names
            .iter()
            .map(|name| Volume {
                name: pull_secret_volume_name(name),
                secret: Some(SecretVolumeSource {
                    secret_name: Some(name.clone()),
                    optional: Some(true),
                    ..Default::default()
                }),
                ..Default::default()
            })
            .collect();

        let mounts = names
            .iter()
            .map(|name| VolumeMount {
                name: pull_secret_volume_name(name),
                mount_path: format!("{PULL_SECRETS_MOUNT}/{name}"),
                read_only: Some(true),
                ..Default::default()
            })
            .collect();

        Ok((volumes, mounts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::fakes::FakeStore;
    use crate::crd::LocalRef;
    use k8s_openapi::api::core::v1::{LocalObjectReference, ServiceAccount};
    use kube::api::ObjectMeta;

    fn service_account(name: &str, secrets: &[&str]) -> ServiceAccount {
        ServiceAccount {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("ns".to_string()),
                ..Default::default()
            },
            image_pull_secrets: Some(
                secrets
                    .iter()
                    .map(|s| LocalObjectReference {
                        name: Some(s.to_string()),
                    })
                    .collect(),
            ),
            ..Default::default()
        }
    }

    fn item(secret: Option<&str>, sa: &str) -> ModuleItem {
        ModuleItem {
            name: "mod".to_string(),
            namespace: "ns".to_string(),
            image_repo_secret: secret.map(LocalRef::new),
            service_account_name: sa.to_string(),
        }
    }

    #[tokio::test]
    async fn no_secrets_no_volumes() {
        let helper = DefaultPullSecretHelper::new(Arc::new(FakeStore::default()));
        let (volumes, mounts) = helper
            .volumes_and_volume_mounts(&item(None, ""))
            .await
            .unwrap();
        assert!(volumes.is_empty());
        assert!(mounts.is_empty());
    }

    #[tokio::test]
    async fn merges_module_and_service_account_secrets() {
        let store = FakeStore::default();
        store.add_service_account(service_account("sa", &["registry-b", "registry-a"]));
        let helper = DefaultPullSecretHelper::new(Arc::new(store));

        let (volumes, mounts) = helper
            .volumes_and_volume_mounts(&item(Some("registry-a"), "sa"))
            .await
            .unwrap();

        let names: Vec<_> = volumes.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, vec!["pull-secret-registry-a", "pull-secret-registry-b"]);
        assert_eq!(
            volumes[0].secret.as_ref().unwrap().optional,
            Some(true)
        );
        assert_eq!(mounts[1].mount_path, "/var/run/kmm/pull-secrets/registry-b");
        assert_eq!(mounts[1].read_only, Some(true));
    }

    #[tokio::test]
    async fn missing_service_account_is_an_error() {
        let helper = DefaultPullSecretHelper::new(Arc::new(FakeStore::default()));
        let err = helper
            .volumes_and_volume_mounts(&item(None, "missing"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}

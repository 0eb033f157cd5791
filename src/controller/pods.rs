//! Worker pods
//!
//! A worker pod runs on exactly one node and loads or unloads exactly one
//! module. Its name is derived from the node and module so that at most one
//! worker exists per pair; the ModuleConfig it acts on travels as YAML in an
//! annotation and is projected into the container through the downward API.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    Container, DownwardAPIVolumeFile, DownwardAPIVolumeSource, HostPathVolumeSource,
    ObjectFieldSelector, Pod, PodSpec, SecurityContext, Volume, VolumeMount,
};
use kube::{
    api::{Api, DeleteParams, ListParams, ObjectMeta, PostParams},
    Client, Resource, ResourceExt,
};
use tracing::{debug, info};

use super::finalizers::{has_finalizer, remove_finalizer};
use super::pull_secrets::PullSecretHelper;
use crate::config::WorkerConfig;
use crate::constants::{
    MODULE_NAME_LABEL, WORKER_ACTION_LABEL, WORKER_ACTION_LOAD, WORKER_ACTION_UNLOAD,
    WORKER_CONFIG_ANNOTATION, WORKER_CONTAINER_NAME, WORKER_POD_FINALIZER,
};
use crate::crd::{ModuleConfig, ModuleItem, NodeModuleSpec, NodeModuleStatus, NodeModulesConfig};
use crate::error::{Error, Result};

const CONFIG_VOLUME: &str = "config";
const CONFIG_MOUNT: &str = "/etc/kmm-worker";
const CONFIG_FILE: &str = "config.yaml";
const MODULES_VOLUME: &str = "lib-modules";
const MODULES_PATH: &str = "/lib/modules";
const FIRMWARE_VOLUME: &str = "lib-firmware";
const FIRMWARE_MOUNT: &str = "/var/lib/firmware";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerAction {
    Load,
    Unload,
}

impl WorkerAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerAction::Load => WORKER_ACTION_LOAD,
            WorkerAction::Unload => WORKER_ACTION_UNLOAD,
        }
    }

    pub fn from_pod(pod: &Pod) -> Option<Self> {
        match pod.labels().get(WORKER_ACTION_LABEL)?.as_str() {
            WORKER_ACTION_LOAD => Some(WorkerAction::Load),
            WORKER_ACTION_UNLOAD => Some(WorkerAction::Unload),
            _ => None,
        }
    }
}

#[async_trait]
pub trait PodManager: Send + Sync {
    async fn create_loader_pod(&self, nmc: &NodeModulesConfig, spec: &NodeModuleSpec)
        -> Result<()>;

    async fn create_unloader_pod(
        &self,
        nmc: &NodeModulesConfig,
        status: &NodeModuleStatus,
    ) -> Result<()>;

    /// Remove the worker finalizer and delete the pod
    async fn delete_pod(&self, pod: &Pod) -> Result<()>;

    async fn list_worker_pods_on_node(&self, node: &str) -> Result<Vec<Pod>>;
}

pub fn worker_pod_name(node: &str, module: &str) -> String {
    format!("kmm-worker-{node}-{module}")
}

/// The ModuleConfig a worker pod carries in its annotation
pub fn worker_config(pod: &Pod) -> Result<ModuleConfig> {
    let raw = pod
        .annotations()
        .get(WORKER_CONFIG_ANNOTATION)
        .ok_or_else(|| {
            Error::ConfigError(format!(
                "pod {}/{} has no worker config annotation",
                pod.namespace().unwrap_or_default(),
                pod.name_any()
            ))
        })?;
    Ok(serde_yaml::from_str(raw)?)
}

fn host_path_volume(name: &str, path: &str) -> Volume {
    Volume {
        name: name.to_string(),
        host_path: Some(HostPathVolumeSource {
            path: path.to_string(),
            type_: Some("Directory".to_string()),
        }),
        ..Default::default()
    }
}

fn mount(name: &str, path: &str, read_only: bool) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        read_only: Some(read_only),
        ..Default::default()
    }
}

/// Build the worker pod for `action` on the node named by `nmc`.
///
/// `pull_secrets` are the volumes and mounts from the pull secret helper.
pub fn worker_pod(
    nmc: &NodeModulesConfig,
    item: &ModuleItem,
    config: &ModuleConfig,
    action: WorkerAction,
    worker: &WorkerConfig,
    pull_secrets: (Vec<Volume>, Vec<VolumeMount>),
) -> Result<Pod> {
    let node = nmc.name_any();
    let (secret_volumes, secret_mounts) = pull_secrets;

    let labels = BTreeMap::from([
        (MODULE_NAME_LABEL.to_string(), item.name.clone()),
        (WORKER_ACTION_LABEL.to_string(), action.as_str().to_string()),
    ]);
    let annotations = BTreeMap::from([(
        WORKER_CONFIG_ANNOTATION.to_string(),
        serde_yaml::to_string(config)?,
    )]);

    let mut volumes = vec![
        Volume {
            name: CONFIG_VOLUME.to_string(),
            downward_api: Some(DownwardAPIVolumeSource {
                items: Some(vec![DownwardAPIVolumeFile {
                    path: CONFIG_FILE.to_string(),
                    field_ref: Some(ObjectFieldSelector {
                        field_path: format!("metadata.annotations['{WORKER_CONFIG_ANNOTATION}']"),
                        ..Default::default()
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        },
        host_path_volume(MODULES_VOLUME, MODULES_PATH),
    ];
    let mut mounts = vec![
        mount(CONFIG_VOLUME, CONFIG_MOUNT, true),
        mount(MODULES_VOLUME, MODULES_PATH, true),
    ];

    if let Some(firmware) = &worker.firmware_host_path {
        if !config.modprobe.firmware_path.is_empty() {
            volumes.push(host_path_volume(FIRMWARE_VOLUME, firmware));
            mounts.push(mount(FIRMWARE_VOLUME, FIRMWARE_MOUNT, false));
        }
    }

    volumes.extend(secret_volumes);
    mounts.extend(secret_mounts);

    let service_account_name =
        Some(item.service_account_name.clone()).filter(|sa| !sa.is_empty());

    Ok(Pod {
        metadata: ObjectMeta {
            name: Some(worker_pod_name(&node, &item.name)),
            namespace: Some(item.namespace.clone()),
            labels: Some(labels),
            annotations: Some(annotations),
            finalizers: Some(vec![WORKER_POD_FINALIZER.to_string()]),
            owner_references: nmc.controller_owner_ref(&()).map(|o| vec![o]),
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_name: Some(node),
            restart_policy: Some("Never".to_string()),
            service_account_name,
            containers: vec![Container {
                name: WORKER_CONTAINER_NAME.to_string(),
                image: Some(worker.image.clone()),
                args: Some(vec![
                    "kmod".to_string(),
                    action.as_str().to_string(),
                    format!("{CONFIG_MOUNT}/{CONFIG_FILE}"),
                ]),
                security_context: Some(SecurityContext {
                    privileged: Some(true),
                    ..Default::default()
                }),
                volume_mounts: Some(mounts),
                ..Default::default()
            }],
            volumes: Some(volumes),
            ..Default::default()
        }),
        ..Default::default()
    })
}

pub struct KubePodManager {
    client: Client,
    pull_secrets: Arc<dyn PullSecretHelper>,
    worker: WorkerConfig,
}

impl KubePodManager {
    pub fn new(client: Client, pull_secrets: Arc<dyn PullSecretHelper>, worker: WorkerConfig) -> Self {
        Self {
            client,
            pull_secrets,
            worker,
        }
    }

    async fn create_worker_pod(
        &self,
        nmc: &NodeModulesConfig,
        item: &ModuleItem,
        config: &ModuleConfig,
        action: WorkerAction,
    ) -> Result<()> {
        let secrets = self.pull_secrets.volumes_and_volume_mounts(item).await?;
        let pod = worker_pod(nmc, item, config, action, &self.worker, secrets)?;

        let api: Api<Pod> = Api::namespaced(self.client.clone(), &item.namespace);
        api.create(&PostParams::default(), &pod).await?;
        #[cfg(feature = "metrics")]
        super::metrics::inc_worker_pod_created(action.as_str());
        info!(
            "Created {} pod {}/{}",
            action.as_str(),
            item.namespace,
            pod.name_any()
        );
        Ok(())
    }
}

#[async_trait]
impl PodManager for KubePodManager {
    async fn create_loader_pod(
        &self,
        nmc: &NodeModulesConfig,
        spec: &NodeModuleSpec,
    ) -> Result<()> {
        self.create_worker_pod(nmc, &spec.item, &spec.config, WorkerAction::Load)
            .await
    }

    async fn create_unloader_pod(
        &self,
        nmc: &NodeModulesConfig,
        status: &NodeModuleStatus,
    ) -> Result<()> {
        let config = status.config.as_ref().ok_or_else(|| {
            Error::ConfigError(format!(
                "module {}/{} has no loaded config to unload",
                status.item.namespace, status.item.name
            ))
        })?;
        self.create_worker_pod(nmc, &status.item, config, WorkerAction::Unload)
            .await
    }

    async fn delete_pod(&self, pod: &Pod) -> Result<()> {
        let namespace = pod.namespace().unwrap_or_default();
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &namespace);

        if has_finalizer(pod, WORKER_POD_FINALIZER) {
            remove_finalizer(&api, pod, WORKER_POD_FINALIZER).await?;
        }

        match api.delete(&pod.name_any(), &DeleteParams::default()).await {
            Ok(_) => debug!("Deleted worker pod {}/{}", namespace, pod.name_any()),
            Err(kube::Error::Api(e)) if e.code == 404 => {}
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    async fn list_worker_pods_on_node(&self, node: &str) -> Result<Vec<Pod>> {
        let api: Api<Pod> = Api::all(self.client.clone());
        let params = ListParams::default()
            .labels(WORKER_ACTION_LABEL)
            .fields(&format!("spec.nodeName={node}"));
        Ok(api.list(&params).await?.items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ModprobeSpec, NodeModulesConfigSpec};

    fn nmc() -> NodeModulesConfig {
        let mut nmc = NodeModulesConfig::new("node1", NodeModulesConfigSpec::default());
        nmc.metadata.uid = Some("uid-1".to_string());
        nmc
    }

    fn item() -> ModuleItem {
        ModuleItem {
            name: "mod".to_string(),
            namespace: "ns".to_string(),
            service_account_name: "mod-sa".to_string(),
            ..Default::default()
        }
    }

    fn config() -> ModuleConfig {
        ModuleConfig {
            kernel_version: "5.14.0".to_string(),
            container_image: "quay.io/org/mod:5.14.0".to_string(),
            modprobe: ModprobeSpec {
                module_name: "kmm_ci_a".to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn loader_pod_is_pinned_and_labelled() {
        let pod = worker_pod(
            &nmc(),
            &item(),
            &config(),
            WorkerAction::Load,
            &WorkerConfig::default(),
            (vec![], vec![]),
        )
        .unwrap();

        assert_eq!(pod.name_any(), "kmm-worker-node1-mod");
        assert_eq!(pod.namespace().as_deref(), Some("ns"));
        assert_eq!(WorkerAction::from_pod(&pod), Some(WorkerAction::Load));
        assert_eq!(pod.labels()[MODULE_NAME_LABEL], "mod");
        assert!(has_finalizer(&pod, WORKER_POD_FINALIZER));

        let owner = &pod.metadata.owner_references.as_ref().unwrap()[0];
        assert_eq!(owner.kind, "NodeModulesConfig");
        assert_eq!(owner.name, "node1");

        let spec = pod.spec.as_ref().unwrap();
        assert_eq!(spec.node_name.as_deref(), Some("node1"));
        assert_eq!(spec.restart_policy.as_deref(), Some("Never"));
        assert_eq!(spec.service_account_name.as_deref(), Some("mod-sa"));
        assert_eq!(
            spec.containers[0].args.as_ref().unwrap()[1],
            WORKER_ACTION_LOAD
        );
    }

    #[test]
    fn config_annotation_round_trips() {
        let pod = worker_pod(
            &nmc(),
            &item(),
            &config(),
            WorkerAction::Unload,
            &WorkerConfig::default(),
            (vec![], vec![]),
        )
        .unwrap();

        assert_eq!(worker_config(&pod).unwrap(), config());
        assert_eq!(WorkerAction::from_pod(&pod), Some(WorkerAction::Unload));
    }

    #[test]
    fn missing_annotation_is_an_error() {
        assert!(worker_config(&Pod::default()).is_err());
    }

    #[test]
    fn firmware_mounted_only_when_requested() {
        let worker = WorkerConfig {
            firmware_host_path: Some("/var/lib/firmware".to_string()),
            ..Default::default()
        };

        let pod = worker_pod(&nmc(), &item(), &config(), WorkerAction::Load, &worker, (vec![], vec![]))
            .unwrap();
        let volumes = pod.spec.unwrap().volumes.unwrap();
        assert!(volumes.iter().all(|v| v.name != FIRMWARE_VOLUME));

        let mut with_firmware = config();
        with_firmware.modprobe.firmware_path = "/firmware".to_string();
        let pod = worker_pod(&nmc(), &item(), &with_firmware, WorkerAction::Load, &worker, (vec![], vec![]))
            .unwrap();
        let volumes = pod.spec.unwrap().volumes.unwrap();
        assert!(volumes.iter().any(|v| v.name == FIRMWARE_VOLUME));
    }

    #[test]
    fn pull_secret_volumes_are_appended() {
        let secrets = (
            vec![Volume {
                name: "pull-secret-a".to_string(),
                ..Default::default()
            }],
            vec![mount("pull-secret-a", "/var/run/kmm/pull-secrets/a", true)],
        );
        let pod = worker_pod(&nmc(), &item(), &config(), WorkerAction::Load, &WorkerConfig::default(), secrets)
            .unwrap();

        let spec = pod.spec.unwrap();
        assert_eq!(spec.volumes.unwrap().last().unwrap().name, "pull-secret-a");
        let mounts = spec.containers[0].volume_mounts.clone().unwrap();
        assert_eq!(mounts.last().unwrap().mount_path, "/var/run/kmm/pull-secrets/a");
    }
}

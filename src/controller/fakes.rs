//! In-memory doubles for reconciler tests

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    Node, NodeCondition, NodeStatus, NodeSystemInfo, Pod, PodStatus, Secret, ServiceAccount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::ObjectMeta;
use kube::core::ErrorResponse;
use kube::ResourceExt;

use super::jobs::{BuildManager, JobStatus, SignManager};
use super::mapper::{DefaultKernelMapper, KernelMapper, ModuleLoaderData};
use super::pods::{worker_pod_name, PodManager, WorkerAction};
use super::store::{ClusterStore, NmcSpecChange};
use crate::constants::{
    MODULE_NAME_LABEL, WORKER_ACTION_LABEL, WORKER_CONFIG_ANNOTATION, WORKER_POD_FINALIZER,
};
use crate::crd::{Module, ModuleConfig, NodeModuleSpec, NodeModuleStatus, NodeModulesConfig};
use crate::crd::RegistryTls;
use crate::error::{Error, Result};
use crate::registry::{DockerConfig, ImageRegistry};

pub fn api_error(code: u16, reason: &str) -> Error {
    Error::KubeError(kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: format!("injected {reason}"),
        reason: reason.to_string(),
        code,
    }))
}

pub fn injected() -> Error {
    api_error(500, "InternalError")
}

/// A node with the given kernel, Ready since the epoch
pub fn node(name: &str, kernel_version: &str) -> Node {
    Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        status: Some(NodeStatus {
            node_info: Some(NodeSystemInfo {
                kernel_version: kernel_version.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn ready_since(mut node: Node, time: chrono::DateTime<chrono::Utc>) -> Node {
    node.status.get_or_insert_with(Default::default).conditions = Some(vec![NodeCondition {
        type_: "Ready".to_string(),
        status: "True".to_string(),
        last_transition_time: Some(Time(time)),
        ..Default::default()
    }]);
    node
}

/// A worker pod on `node` in `phase`
pub fn worker_pod(
    node: &str,
    module: &str,
    namespace: &str,
    action: WorkerAction,
    phase: &str,
    config: &ModuleConfig,
) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(worker_pod_name(node, module)),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([
                (MODULE_NAME_LABEL.to_string(), module.to_string()),
                (WORKER_ACTION_LABEL.to_string(), action.as_str().to_string()),
            ])),
            annotations: Some(BTreeMap::from([(
                WORKER_CONFIG_ANNOTATION.to_string(),
                serde_yaml::to_string(config).unwrap(),
            )])),
            finalizers: Some(vec![WORKER_POD_FINALIZER.to_string()]),
            ..Default::default()
        },
        spec: Some(k8s_openapi::api::core::v1::PodSpec {
            node_name: Some(node.to_string()),
            ..Default::default()
        }),
        status: Some(PodStatus {
            phase: Some(phase.to_string()),
            ..Default::default()
        }),
    }
}

/// Client for code paths that hold one but never reach the API server
pub fn offline_client() -> kube::Client {
    crate::install_crypto_provider();
    let config = kube::Config::new("http://127.0.0.1:1".parse().unwrap());
    kube::Client::try_from(config).unwrap()
}

/// Registry double holding a fixed set of images and recording lookups
#[derive(Default)]
pub struct FakeRegistry {
    present: Mutex<BTreeSet<String>>,
    queried: Mutex<Vec<String>>,
}

impl FakeRegistry {
    pub fn with_images(images: &[&str]) -> Self {
        let registry = Self::default();
        registry
            .present
            .lock()
            .unwrap()
            .extend(images.iter().map(|i| i.to_string()));
        registry
    }

    pub fn add_image(&self, image: &str) {
        self.present.lock().unwrap().insert(image.to_string());
    }

    pub fn queried(&self) -> Vec<String> {
        self.queried.lock().unwrap().clone()
    }
}

#[async_trait]
impl ImageRegistry for FakeRegistry {
    async fn image_exists(
        &self,
        image: &str,
        _tls: &RegistryTls,
        _credentials: Option<&DockerConfig>,
    ) -> Result<bool> {
        self.queried.lock().unwrap().push(image.to_string());
        Ok(self.present.lock().unwrap().contains(image))
    }
}

#[derive(Default)]
pub struct FakeStore {
    modules: Mutex<Vec<Module>>,
    nodes: Mutex<Vec<Node>>,
    nmcs: Mutex<BTreeMap<String, NodeModulesConfig>>,
    service_accounts: Mutex<Vec<ServiceAccount>>,
    secrets: Mutex<Vec<Secret>>,
    status_writes: Mutex<Vec<NodeModulesConfig>>,
    spec_changes: Mutex<Vec<(String, NmcSpecChange)>>,
    removed_pod_finalizers: Mutex<Vec<String>>,
    fail_get_module: AtomicBool,
    fail_list_nodes: AtomicBool,
    fail_status_write: AtomicBool,
}

impl FakeStore {
    pub fn add_module(&self, module: Module) {
        self.modules.lock().unwrap().push(module);
    }

    pub fn add_node(&self, node: Node) {
        self.nodes.lock().unwrap().push(node);
    }

    pub fn add_nmc(&self, nmc: NodeModulesConfig) {
        self.nmcs.lock().unwrap().insert(nmc.name_any(), nmc);
    }

    pub fn nmc(&self, name: &str) -> Option<NodeModulesConfig> {
        self.nmcs.lock().unwrap().get(name).cloned()
    }

    pub fn add_service_account(&self, sa: ServiceAccount) {
        self.service_accounts.lock().unwrap().push(sa);
    }

    pub fn add_secret(&self, secret: Secret) {
        self.secrets.lock().unwrap().push(secret);
    }

    pub fn fail_get_module(&self) {
        self.fail_get_module.store(true, Ordering::SeqCst);
    }

    pub fn fail_list_nodes(&self) {
        self.fail_list_nodes.store(true, Ordering::SeqCst);
    }

    pub fn fail_status_write(&self) {
        self.fail_status_write.store(true, Ordering::SeqCst);
    }

    pub fn status_writes(&self) -> usize {
        self.status_writes.lock().unwrap().len()
    }

    pub fn spec_changes(&self) -> Vec<(String, NmcSpecChange)> {
        self.spec_changes.lock().unwrap().clone()
    }

    pub fn removed_pod_finalizers(&self) -> Vec<String> {
        self.removed_pod_finalizers.lock().unwrap().clone()
    }
}

#[async_trait]
impl ClusterStore for FakeStore {
    async fn get_module(&self, name: &str, namespace: &str) -> Result<Option<Module>> {
        if self.fail_get_module.load(Ordering::SeqCst) {
            return Err(injected());
        }
        Ok(self
            .modules
            .lock()
            .unwrap()
            .iter()
            .find(|m| m.name_any() == name && m.namespace().as_deref() == Some(namespace))
            .cloned())
    }

    async fn list_nodes(&self, selector: &BTreeMap<String, String>) -> Result<Vec<Node>> {
        if self.fail_list_nodes.load(Ordering::SeqCst) {
            return Err(injected());
        }
        Ok(self
            .nodes
            .lock()
            .unwrap()
            .iter()
            .filter(|n| selector.iter().all(|(k, v)| n.labels().get(k) == Some(v)))
            .cloned()
            .collect())
    }

    async fn get_node(&self, name: &str) -> Result<Option<Node>> {
        Ok(self
            .nodes
            .lock()
            .unwrap()
            .iter()
            .find(|n| n.name_any() == name)
            .cloned())
    }

    async fn get_node_modules_config(&self, name: &str) -> Result<Option<NodeModulesConfig>> {
        Ok(self.nmc(name))
    }

    async fn list_node_modules_configs(&self) -> Result<Vec<NodeModulesConfig>> {
        Ok(self.nmcs.lock().unwrap().values().cloned().collect())
    }

    async fn replace_node_modules_config_status(
        &self,
        nmc: &NodeModulesConfig,
    ) -> Result<NodeModulesConfig> {
        if self.fail_status_write.load(Ordering::SeqCst) {
            return Err(api_error(409, "Conflict"));
        }
        self.status_writes.lock().unwrap().push(nmc.clone());

        let mut nmcs = self.nmcs.lock().unwrap();
        let stored = nmcs
            .get_mut(&nmc.name_any())
            .ok_or_else(|| Error::not_found("NodeModulesConfig", nmc.name_any()))?;
        stored.status = nmc.status.clone();
        Ok(stored.clone())
    }

    async fn update_node_modules_config_spec(
        &self,
        node: &str,
        change: NmcSpecChange,
    ) -> Result<()> {
        self.spec_changes
            .lock()
            .unwrap()
            .push((node.to_string(), change.clone()));

        let mut nmcs = self.nmcs.lock().unwrap();
        match nmcs.get_mut(node) {
            Some(nmc) => {
                change.apply(nmc);
            }
            None => {
                let mut nmc = NodeModulesConfig::new(node, Default::default());
                if change.apply(&mut nmc) {
                    nmcs.insert(node.to_string(), nmc);
                }
            }
        }
        Ok(())
    }

    async fn remove_pod_finalizer(&self, pod: &Pod, _finalizer: &str) -> Result<()> {
        self.removed_pod_finalizers.lock().unwrap().push(pod.name_any());
        Ok(())
    }

    async fn get_service_account(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<ServiceAccount>> {
        Ok(self
            .service_accounts
            .lock()
            .unwrap()
            .iter()
            .find(|s| s.name_any() == name && s.namespace().as_deref() == Some(namespace))
            .cloned())
    }

    async fn get_secret(&self, name: &str, namespace: &str) -> Result<Option<Secret>> {
        Ok(self
            .secrets
            .lock()
            .unwrap()
            .iter()
            .find(|s| s.name_any() == name && s.namespace().as_deref() == Some(namespace))
            .cloned())
    }
}

/// Calls observed by [`FakeJobManager`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobCall {
    ShouldSync(String),
    Sync { kernel: String, previous_image: String },
    GarbageCollect(String),
}

/// Build or sign manager double.
///
/// A kernel whose sync reported `Completed` no longer needs syncing, the way
/// a pushed image satisfies the registry check.
pub struct FakeJobManager {
    required: bool,
    status: JobStatus,
    fail_should_sync: bool,
    fail_sync: bool,
    fail_gc: bool,
    calls: Mutex<Vec<JobCall>>,
    jobs: Mutex<BTreeSet<String>>,
    done: Mutex<BTreeSet<String>>,
}

impl FakeJobManager {
    pub fn new(status: JobStatus) -> Self {
        Self {
            required: true,
            status,
            fail_should_sync: false,
            fail_sync: false,
            fail_gc: false,
            calls: Mutex::default(),
            jobs: Mutex::default(),
            done: Mutex::default(),
        }
    }

    pub fn not_required() -> Self {
        Self {
            required: false,
            ..Self::new(JobStatus::Completed)
        }
    }

    pub fn failing_should_sync(mut self) -> Self {
        self.fail_should_sync = true;
        self
    }

    pub fn failing_sync(mut self) -> Self {
        self.fail_sync = true;
        self
    }

    pub fn failing_gc(mut self) -> Self {
        self.fail_gc = true;
        self
    }

    pub fn calls(&self) -> Vec<JobCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn sync_calls(&self) -> Vec<JobCall> {
        self.calls()
            .into_iter()
            .filter(|c| matches!(c, JobCall::Sync { .. }))
            .collect()
    }

    pub fn gc_calls(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, JobCall::GarbageCollect(_)))
            .count()
    }

    /// Jobs created so far, one per kernel
    pub fn jobs_created(&self) -> usize {
        self.jobs.lock().unwrap().len()
    }

    fn record(&self, call: JobCall) {
        self.calls.lock().unwrap().push(call);
    }

    fn should_sync_inner(&self, mld: &ModuleLoaderData) -> Result<bool> {
        self.record(JobCall::ShouldSync(mld.kernel_version.clone()));
        if self.fail_should_sync {
            return Err(injected());
        }
        Ok(self.required && !self.done.lock().unwrap().contains(&mld.kernel_version))
    }

    fn sync_inner(&self, mld: &ModuleLoaderData, previous_image: &str) -> Result<JobStatus> {
        self.record(JobCall::Sync {
            kernel: mld.kernel_version.clone(),
            previous_image: previous_image.to_string(),
        });
        if self.fail_sync {
            return Err(injected());
        }
        self.jobs.lock().unwrap().insert(mld.kernel_version.clone());
        if self.status == JobStatus::Completed {
            self.done.lock().unwrap().insert(mld.kernel_version.clone());
        }
        Ok(self.status)
    }

    fn gc_inner(&self, name: &str) -> Result<Vec<String>> {
        self.record(JobCall::GarbageCollect(name.to_string()));
        if self.fail_gc {
            return Err(injected());
        }
        Ok(vec![])
    }
}

#[async_trait]
impl BuildManager for FakeJobManager {
    async fn should_sync(&self, mld: &ModuleLoaderData) -> Result<bool> {
        self.should_sync_inner(mld)
    }

    async fn sync(&self, mld: &ModuleLoaderData, _push: bool, _owner: &Module) -> Result<JobStatus> {
        self.sync_inner(mld, "")
    }

    async fn garbage_collect(&self, name: &str, _ns: &str, _owner: &Module) -> Result<Vec<String>> {
        self.gc_inner(name)
    }
}

#[async_trait]
impl SignManager for FakeJobManager {
    async fn should_sync(&self, mld: &ModuleLoaderData) -> Result<bool> {
        self.should_sync_inner(mld)
    }

    async fn sync(
        &self,
        mld: &ModuleLoaderData,
        previous_image: &str,
        _push: bool,
        _owner: &Module,
    ) -> Result<JobStatus> {
        self.sync_inner(mld, previous_image)
    }

    async fn garbage_collect(&self, name: &str, _ns: &str, _owner: &Module) -> Result<Vec<String>> {
        self.gc_inner(name)
    }
}

/// Delegates to [`DefaultKernelMapper`], recording each kernel asked for
#[derive(Default)]
pub struct RecordingMapper {
    inner: DefaultKernelMapper,
    kernels: Mutex<Vec<String>>,
}

impl RecordingMapper {
    pub fn kernels(&self) -> Vec<String> {
        self.kernels.lock().unwrap().clone()
    }
}

impl KernelMapper for RecordingMapper {
    fn module_loader_data_for_kernel(
        &self,
        module: &Module,
        kernel_version: &str,
    ) -> Result<ModuleLoaderData> {
        self.kernels.lock().unwrap().push(kernel_version.to_string());
        self.inner.module_loader_data_for_kernel(module, kernel_version)
    }
}

/// Worker pods created, keyed as `node/module`
#[derive(Default)]
pub struct FakePodManager {
    pods: Mutex<Vec<Pod>>,
    loaders: Mutex<Vec<String>>,
    unloaders: Mutex<Vec<String>>,
    deleted: Mutex<Vec<String>>,
    already_exists: AtomicBool,
}

impl FakePodManager {
    pub fn add_pod(&self, pod: Pod) {
        self.pods.lock().unwrap().push(pod);
    }

    pub fn creates_conflict(&self) {
        self.already_exists.store(true, Ordering::SeqCst);
    }

    pub fn loaders(&self) -> Vec<String> {
        self.loaders.lock().unwrap().clone()
    }

    pub fn unloaders(&self) -> Vec<String> {
        self.unloaders.lock().unwrap().clone()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }

    fn create(&self, list: &Mutex<Vec<String>>, node: &str, module: &str) -> Result<()> {
        if self.already_exists.load(Ordering::SeqCst) {
            return Err(api_error(409, "AlreadyExists"));
        }
        list.lock().unwrap().push(format!("{node}/{module}"));
        Ok(())
    }
}

#[async_trait]
impl PodManager for FakePodManager {
    async fn create_loader_pod(
        &self,
        nmc: &NodeModulesConfig,
        spec: &NodeModuleSpec,
    ) -> Result<()> {
        self.create(&self.loaders, &nmc.name_any(), &spec.item.name)
    }

    async fn create_unloader_pod(
        &self,
        nmc: &NodeModulesConfig,
        status: &NodeModuleStatus,
    ) -> Result<()> {
        self.create(&self.unloaders, &nmc.name_any(), &status.item.name)
    }

    async fn delete_pod(&self, pod: &Pod) -> Result<()> {
        self.deleted.lock().unwrap().push(pod.name_any());
        self.pods
            .lock()
            .unwrap()
            .retain(|p| p.name_any() != pod.name_any());
        Ok(())
    }

    async fn list_worker_pods_on_node(&self, node: &str) -> Result<Vec<Pod>> {
        Ok(self
            .pods
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.spec.as_ref().and_then(|s| s.node_name.as_deref()) == Some(node))
            .cloned()
            .collect())
    }
}

//! Well-known label, annotation and finalizer names

/// Label carrying the owning Module's name on jobs and worker pods
pub const MODULE_NAME_LABEL: &str = "kmm.node.kubernetes.io/module.name";
/// Label carrying the kernel version a build or sign job targets
pub const TARGET_KERNEL_LABEL: &str = "kmm.node.kubernetes.io/target-kernel";
/// Label distinguishing build jobs from sign jobs
pub const JOB_TYPE_LABEL: &str = "kmm.node.kubernetes.io/job-type";
/// Annotation holding the hash of a job's pod template
pub const JOB_HASH_ANNOTATION: &str = "kmm.node.kubernetes.io/last-hash";

/// Label set on worker pods: `load` or `unload`
pub const WORKER_ACTION_LABEL: &str = "kmm.node.kubernetes.io/worker-action";
pub const WORKER_ACTION_LOAD: &str = "load";
pub const WORKER_ACTION_UNLOAD: &str = "unload";
/// Annotation holding the worker's ModuleConfig as YAML
pub const WORKER_CONFIG_ANNOTATION: &str = "kmm.node.kubernetes.io/worker-config";
pub const WORKER_CONTAINER_NAME: &str = "worker";

/// Finalizer placed on worker pods so their outcome is observed before removal
pub const WORKER_POD_FINALIZER: &str = "kmm.node.kubernetes.io/nodemodulesconfig-reconciler";
/// Finalizer placed on NodeModulesConfig objects
pub const NMC_FINALIZER: &str = "kmm.node.kubernetes.io/worker-cleanup";
/// Finalizer placed on Module objects
pub const MODULE_FINALIZER: &str = "kmm.node.kubernetes.io/module-finalizer";

pub const WORKER_POD_VERSION_LABEL_PREFIX: &str = "beta.kmm.node.kubernetes.io/version-worker-pod";
pub const DEVICE_PLUGIN_VERSION_LABEL_PREFIX: &str =
    "beta.kmm.node.kubernetes.io/version-device-plugin";
pub const MODULE_VERSION_LABEL_PREFIX: &str = "kmm.node.kubernetes.io/version-module";

/// Kubernetes label values and name segments are capped at this length
pub const MAX_LABEL_LENGTH: usize = 63;

pub const DOCKERFILE_CONFIG_MAP_KEY: &str = "dockerfile";
pub const PUBLIC_SIGN_DATA_KEY: &str = "cert";
pub const PRIVATE_SIGN_DATA_KEY: &str = "key";

pub const FIELD_MANAGER: &str = "kmm-operator";

pub fn module_version_label_name(namespace: &str, name: &str) -> String {
    format!("{MODULE_VERSION_LABEL_PREFIX}.{namespace}.{name}")
}

pub fn worker_pod_version_label_name(namespace: &str, name: &str) -> String {
    format!("{WORKER_POD_VERSION_LABEL_PREFIX}.{namespace}.{name}")
}

pub fn device_plugin_version_label_name(namespace: &str, name: &str) -> String {
    format!("{DEVICE_PLUGIN_VERSION_LABEL_PREFIX}.{namespace}.{name}")
}

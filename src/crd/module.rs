//! Module Custom Resource Definition
//!
//! A Module declares an out-of-tree kernel module: which nodes it targets,
//! which image carries it for each kernel version, and optionally how that
//! image is built and signed in-cluster.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "kmm.sigs.x-k8s.io",
    version = "v1beta1",
    kind = "Module",
    namespaced,
    shortname = "mod",
    derive = "PartialEq",
    derive = "Default",
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ModuleSpec {
    pub module_loader: ModuleLoaderSpec,

    /// Secret used to pull and push module images
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_repo_secret: Option<LocalRef>,

    /// Node labels the module targets
    #[serde(default)]
    pub selector: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ModuleLoaderSpec {
    pub container: ModuleLoaderContainerSpec,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ModuleLoaderContainerSpec {
    pub modprobe: ModprobeSpec,

    /// Default image for kernel mappings that do not set their own
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub container_image: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,

    /// Module version; drives the version labels on nodes
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<Build>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sign: Option<Sign>,

    #[serde(default, rename = "registryTLS")]
    pub registry_tls: RegistryTls,

    #[serde(default)]
    pub kernel_mappings: Vec<KernelMapping>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub in_tree_module_to_remove: String,
}

/// One kernel-version rule of a Module
///
/// Exactly one of `regexp` and `literal` must be set.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KernelMapping {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub regexp: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub literal: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub container_image: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<Build>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sign: Option<Sign>,

    #[serde(default, rename = "registryTLS", skip_serializing_if = "Option::is_none")]
    pub registry_tls: Option<RegistryTls>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_tree_module_to_remove: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ModprobeSpec {
    /// Name of the kernel module to load
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub module_name: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<String>,

    #[serde(default = "default_dir_name")]
    pub dir_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<ModprobeArgs>,

    /// Replaces the generated modprobe invocation entirely
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_args: Option<ModprobeArgs>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub firmware_path: String,

    /// Dependent modules in load order; the first entry is `module_name`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub modules_loading_order: Vec<String>,
}

fn default_dir_name() -> String {
    "/opt".to_string()
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ModprobeArgs {
    #[serde(default)]
    pub load: Vec<String>,
    #[serde(default)]
    pub unload: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Build {
    #[serde(default)]
    pub build_args: Vec<BuildArg>,

    /// ConfigMap holding the Dockerfile under the `dockerfile` key
    pub dockerfile_config_map: LocalRef,

    #[serde(default, rename = "baseImageRegistryTLS")]
    pub base_image_registry_tls: RegistryTls,

    #[serde(default)]
    pub secrets: Vec<LocalRef>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct BuildArg {
    pub name: String,
    pub value: String,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Sign {
    /// Image to sign when the module is not built in-cluster
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub unsigned_image: String,

    #[serde(default, rename = "unsignedImageRegistryTLS")]
    pub unsigned_image_registry_tls: RegistryTls,

    pub key_secret: LocalRef,
    pub cert_secret: LocalRef,

    #[serde(default)]
    pub files_to_sign: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RegistryTls {
    /// Plain HTTP
    #[serde(default)]
    pub insecure: bool,
    #[serde(default, rename = "insecureSkipTLSVerify")]
    pub insecure_skip_tls_verify: bool,
}

/// Reference to an object in the same namespace
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
pub struct LocalRef {
    pub name: String,
}

impl LocalRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

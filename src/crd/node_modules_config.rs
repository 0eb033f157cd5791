//! NodeModulesConfig Custom Resource Definition
//!
//! One NodeModulesConfig exists per node and is named after it. Its spec lists
//! the modules that should be loaded on the node; its status records what the
//! worker pods last reported.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::module::{LocalRef, ModprobeSpec};

#[derive(CustomResource, Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "kmm.sigs.x-k8s.io",
    version = "v1beta1",
    kind = "NodeModulesConfig",
    status = "NodeModulesConfigStatus",
    shortname = "nmc",
    derive = "PartialEq",
    derive = "Default",
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct NodeModulesConfigSpec {
    #[serde(default)]
    pub modules: Vec<NodeModuleSpec>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeModulesConfigStatus {
    #[serde(default)]
    pub modules: Vec<NodeModuleStatus>,
}

/// Identity of a module on a node plus the credentials needed to pull it
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ModuleItem {
    pub name: String,
    pub namespace: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_repo_secret: Option<LocalRef>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub service_account_name: String,
}

impl ModuleItem {
    pub fn is(&self, name: &str, namespace: &str) -> bool {
        self.name == name && self.namespace == namespace
    }
}

/// Everything a worker pod needs to load or unload one module
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ModuleConfig {
    pub kernel_version: String,
    pub container_image: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,

    #[serde(default)]
    pub insecure_pull: bool,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub in_tree_module_to_remove: String,

    pub modprobe: ModprobeSpec,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeModuleSpec {
    #[serde(flatten)]
    pub item: ModuleItem,
    pub config: ModuleConfig,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeModuleStatus {
    #[serde(flatten)]
    pub item: ModuleItem,

    /// Config last applied successfully; absent while nothing is loaded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<ModuleConfig>,

    /// RFC 3339 time of the last load
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

impl NodeModulesConfig {
    pub fn find_spec(&self, name: &str, namespace: &str) -> Option<&NodeModuleSpec> {
        self.spec.modules.iter().find(|m| m.item.is(name, namespace))
    }

    pub fn find_status(&self, name: &str, namespace: &str) -> Option<&NodeModuleStatus> {
        self.status
            .as_ref()?
            .modules
            .iter()
            .find(|m| m.item.is(name, namespace))
    }

    /// Insert or replace the spec entry for `module`
    pub fn set_spec(&mut self, module: NodeModuleSpec) {
        let existing = self
            .spec
            .modules
            .iter_mut()
            .find(|m| m.item.is(&module.item.name, &module.item.namespace));

        match existing {
            Some(entry) => *entry = module,
            None => self.spec.modules.push(module),
        }
    }

    /// Returns true when an entry was removed
    pub fn remove_spec(&mut self, name: &str, namespace: &str) -> bool {
        let before = self.spec.modules.len();
        self.spec.modules.retain(|m| !m.item.is(name, namespace));
        before != self.spec.modules.len()
    }

    pub fn set_status(&mut self, module: NodeModuleStatus) {
        let status = self.status.get_or_insert_with(Default::default);
        let existing = status
            .modules
            .iter_mut()
            .find(|m| m.item.is(&module.item.name, &module.item.namespace));

        match existing {
            Some(entry) => *entry = module,
            None => status.modules.push(module),
        }
    }

    pub fn remove_status(&mut self, name: &str, namespace: &str) {
        if let Some(status) = self.status.as_mut() {
            status.modules.retain(|m| !m.item.is(name, namespace));
        }
    }
}

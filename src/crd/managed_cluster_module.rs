//! ManagedClusterModule Custom Resource Definition
//!
//! Hub-side wrapper distributing a Module spec to managed clusters. Only its
//! admission rules live in this operator; they are the Module rules applied
//! to the embedded spec.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::module::{Module, ModuleSpec};

#[derive(CustomResource, Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "hub.kmm.sigs.x-k8s.io",
    version = "v1beta1",
    kind = "ManagedClusterModule",
    shortname = "mcm",
    derive = "PartialEq",
    derive = "Default",
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ManagedClusterModuleSpec {
    pub module_spec: ModuleSpec,

    /// Namespace the Module is created in on each managed cluster
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub spoke_namespace: String,

    /// Labels of the managed clusters that receive the Module
    #[serde(default)]
    pub selector: BTreeMap<String, String>,
}

impl ManagedClusterModule {
    /// The embedded spec as an unnamed Module
    pub fn module(&self) -> Module {
        Module::new("", self.spec.module_spec.clone())
    }
}

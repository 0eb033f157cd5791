//! Admission-time validation of Module objects
//!
//! These checks run before a Module participates in reconciliation, so the
//! controllers can assume compiled regexps and well-formed modprobe settings.

use std::collections::HashSet;

use kube::ResourceExt;
use regex::Regex;
use thiserror::Error;

use super::module::{KernelMapping, ModprobeSpec, Module};
use crate::constants::{
    device_plugin_version_label_name, module_version_label_name, worker_pod_version_label_name,
    MAX_LABEL_LENGTH,
};

/// Structured validation error for Module specs
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct SpecValidationError {
    /// JSON path of the offending field
    pub field: String,
    pub message: String,
}

impl SpecValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }

    fn wrap(self, context: &str) -> Self {
        Self {
            field: self.field,
            message: format!("{context}: {}", self.message),
        }
    }
}

/// Length of a label name after its `prefix/` part
fn label_name_length(label: &str) -> usize {
    match label.split_once('/') {
        Some((_, after)) => after.len(),
        None => label.len(),
    }
}

/// Longest name + namespace a Module may have.
///
/// Derived from the version label templates so the generated label names
/// always fit the Kubernetes label length limit.
pub fn max_combined_length() -> usize {
    let longest = [
        module_version_label_name("", ""),
        worker_pod_version_label_name("", ""),
        device_plugin_version_label_name("", ""),
    ]
    .iter()
    .map(|l| label_name_length(l))
    .max()
    .unwrap_or(0);

    MAX_LABEL_LENGTH.saturating_sub(longest)
}

pub fn validate_create(module: &Module) -> Result<(), SpecValidationError> {
    validate(module)
}

/// Validate an update; `old` is absent when the previous object is unknown.
pub fn validate_update(module: &Module, old: Option<&Module>) -> Result<(), SpecValidationError> {
    if let Some(old) = old {
        let old_version = &old.spec.module_loader.container.version;
        let new_version = &module.spec.module_loader.container.version;

        if old_version.is_empty() != new_version.is_empty() {
            return Err(SpecValidationError::new(
                "spec.moduleLoader.container.version",
                "cannot update to/from empty version",
            ));
        }
    }

    validate(module)
}

/// Deletes are never rejected
pub fn validate_delete(_module: &Module) -> Result<(), SpecValidationError> {
    Ok(())
}

pub fn validate(module: &Module) -> Result<(), SpecValidationError> {
    let name = module.name_any();
    let namespace = module.namespace().unwrap_or_default();
    let combined = name.len() + namespace.len();
    let max = max_combined_length();

    if combined > max {
        return Err(SpecValidationError::new(
            "metadata.name",
            format!(
                "module name and namespace have a combined length of {combined} characters, \
                 which exceeds the maximum of {max}"
            ),
        ));
    }

    let container = &module.spec.module_loader.container;

    validate_kernel_mappings(&container.kernel_mappings, &container.container_image)
        .map_err(|e| e.wrap("failed to validate kernel mappings"))?;

    validate_modprobe(&container.modprobe)
}

pub fn validate_kernel_mappings(
    mappings: &[KernelMapping],
    default_image: &str,
) -> Result<(), SpecValidationError> {
    for (idx, km) in mappings.iter().enumerate() {
        let field = format!("spec.moduleLoader.container.kernelMappings[{idx}]");

        match (km.regexp.is_empty(), km.literal.is_empty()) {
            (false, false) => {
                return Err(SpecValidationError::new(
                    field,
                    format!("regexp and literal are mutually exclusive properties at kernelMappings[{idx}]"),
                ))
            }
            (true, true) => {
                return Err(SpecValidationError::new(
                    field,
                    format!("regexp or literal must be set at kernelMappings[{idx}]"),
                ))
            }
            _ => {}
        }

        if !km.regexp.is_empty() {
            if let Err(e) = Regex::new(&km.regexp) {
                return Err(SpecValidationError::new(
                    format!("{field}.regexp"),
                    format!("invalid regexp at index {idx}: {e}"),
                ));
            }
        }

        if km.container_image.is_empty() && default_image.is_empty() {
            return Err(SpecValidationError::new(
                format!("{field}.containerImage"),
                format!("missing {field}.containerImage"),
            ));
        }
    }

    Ok(())
}

pub fn validate_modprobe(modprobe: &ModprobeSpec) -> Result<(), SpecValidationError> {
    let raw_args_set = modprobe
        .raw_args
        .as_ref()
        .is_some_and(|a| !a.load.is_empty() || !a.unload.is_empty());

    if modprobe.module_name.is_empty() {
        let complete = modprobe
            .raw_args
            .as_ref()
            .is_some_and(|a| !a.load.is_empty() && !a.unload.is_empty());

        if !complete {
            return Err(SpecValidationError::new(
                "spec.moduleLoader.container.modprobe.rawArgs",
                "load and unload rawArgs must be set when moduleName is unset",
            ));
        }
    } else if raw_args_set {
        return Err(SpecValidationError::new(
            "spec.moduleLoader.container.modprobe.rawArgs",
            "rawArgs cannot be set when moduleName is set",
        ));
    }

    let order = &modprobe.modules_loading_order;
    if order.is_empty() {
        return Ok(());
    }

    const FIELD: &str = "spec.moduleLoader.container.modprobe.modulesLoadingOrder";

    if order.len() < 2 {
        return Err(SpecValidationError::new(
            FIELD,
            "if modulesLoadingOrder is set, it must contain at least two elements",
        ));
    }

    if order[0] != modprobe.module_name {
        return Err(SpecValidationError::new(
            FIELD,
            format!(
                "if modulesLoadingOrder is set, its first element must be moduleName ({})",
                modprobe.module_name
            ),
        ));
    }

    let mut seen = HashSet::with_capacity(order.len());
    for name in order {
        if !seen.insert(name.as_str()) {
            return Err(SpecValidationError::new(
                FIELD,
                format!("duplicate value {name} in modulesLoadingOrder"),
            ));
        }
    }

    Ok(())
}

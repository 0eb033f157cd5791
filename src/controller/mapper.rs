//! Kernel mapping resolution
//!
//! Turns a Module plus a node's kernel version into the concrete per-kernel
//! configuration the build, sign and load steps work from.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, PoisonError};

use kube::ResourceExt;
use regex::Regex;

use crate::crd::{Build, KernelMapping, LocalRef, ModprobeSpec, Module, RegistryTls, Sign};
use crate::error::{Error, Result};

/// Resolved configuration for one (module, kernel version) pair.
///
/// Derived on every pass and never persisted.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ModuleLoaderData {
    pub name: String,
    pub namespace: String,
    pub container_image: String,
    pub image_pull_policy: Option<String>,
    pub kernel_version: String,
    pub build: Option<Build>,
    pub sign: Option<Sign>,
    pub modprobe: ModprobeSpec,
    pub registry_tls: RegistryTls,
    pub image_repo_secret: Option<LocalRef>,
    pub service_account_name: Option<String>,
    pub selector: BTreeMap<String, String>,
    pub in_tree_module_to_remove: String,
    pub owner: Module,
}

impl ModuleLoaderData {
    /// Whether the module image is produced in-cluster by a build job
    pub fn build_configured(&self) -> bool {
        self.build.is_some()
    }

    pub fn sign_configured(&self) -> bool {
        self.sign.is_some()
    }
}

pub trait KernelMapper: Send + Sync {
    /// Resolve `module` for `kernel_version`.
    ///
    /// Returns [`Error::NoKernelMapping`] when no rule matches.
    fn module_loader_data_for_kernel(
        &self,
        module: &Module,
        kernel_version: &str,
    ) -> Result<ModuleLoaderData>;
}

/// Patterns kept before the regex cache is reset
const MAX_CACHED_REGEXES: usize = 1024;

/// Resolver shared by the controllers.
///
/// Compiled kernel mapping regexps are cached by pattern, so a pass over
/// many nodes compiles each rule once.
#[derive(Debug, Default)]
pub struct DefaultKernelMapper {
    regexes: Mutex<HashMap<String, Regex>>,
}

impl DefaultKernelMapper {
    pub fn new() -> Self {
        Self::default()
    }

    fn regex(&self, pattern: &str) -> Result<Regex> {
        let mut cache = self.regexes.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(re) = cache.get(pattern) {
            return Ok(re.clone());
        }

        let re = Regex::new(pattern).map_err(|e| {
            Error::ConfigError(format!("invalid kernel mapping regexp {pattern:?}: {e}"))
        })?;
        if cache.len() >= MAX_CACHED_REGEXES {
            cache.clear();
        }
        cache.insert(pattern.to_string(), re.clone());
        Ok(re)
    }

    #[cfg(test)]
    fn cached_regexes(&self) -> usize {
        self.regexes.lock().unwrap().len()
    }

    /// First rule matching `kernel_version`, in declaration order
    pub fn find_kernel_mapping<'a>(
        &self,
        mappings: &'a [KernelMapping],
        kernel_version: &str,
    ) -> Result<Option<&'a KernelMapping>> {
        for mapping in mappings {
            if !mapping.literal.is_empty() {
                if mapping.literal == kernel_version {
                    return Ok(Some(mapping));
                }
                continue;
            }

            if mapping.regexp.is_empty() {
                continue;
            }

            if self.regex(&mapping.regexp)?.is_match(kernel_version) {
                return Ok(Some(mapping));
            }
        }

        Ok(None)
    }
}

impl KernelMapper for DefaultKernelMapper {
    fn module_loader_data_for_kernel(
        &self,
        module: &Module,
        kernel_version: &str,
    ) -> Result<ModuleLoaderData> {
        let kernel_version = kernel_version.trim_end_matches('+');
        let mappings = &module.spec.module_loader.container.kernel_mappings;

        let mapping = self
            .find_kernel_mapping(mappings, kernel_version)?
            .ok_or_else(|| Error::NoKernelMapping {
                kernel_version: kernel_version.to_string(),
            })?;

        let mut mld = merge(module, mapping, kernel_version);
        replace_templates(&mut mld);
        Ok(mld)
    }
}

fn merge(module: &Module, mapping: &KernelMapping, kernel_version: &str) -> ModuleLoaderData {
    let container = &module.spec.module_loader.container;

    let container_image = if mapping.container_image.is_empty() {
        container.container_image.clone()
    } else {
        mapping.container_image.clone()
    };

    ModuleLoaderData {
        name: module.name_any(),
        namespace: module.namespace().unwrap_or_default(),
        container_image,
        image_pull_policy: container.image_pull_policy.clone(),
        kernel_version: kernel_version.to_string(),
        build: mapping.build.clone().or_else(|| container.build.clone()),
        sign: mapping.sign.clone().or_else(|| container.sign.clone()),
        modprobe: container.modprobe.clone(),
        registry_tls: mapping
            .registry_tls
            .clone()
            .unwrap_or_else(|| container.registry_tls.clone()),
        image_repo_secret: module.spec.image_repo_secret.clone(),
        service_account_name: module.spec.module_loader.service_account_name.clone(),
        selector: module.spec.selector.clone(),
        in_tree_module_to_remove: mapping
            .in_tree_module_to_remove
            .clone()
            .unwrap_or_else(|| container.in_tree_module_to_remove.clone()),
        owner: module.clone(),
    }
}

/// Leading `x.y.z` numeric triple of a kernel version
fn kernel_xyz(kernel_version: &str) -> Option<(&str, &str, &str)> {
    let mut parts = kernel_version.splitn(3, '.');
    let x = parts.next()?;
    let y = parts.next()?;
    let rest = parts.next()?;
    let z = &rest[..rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len())];

    let numeric = |p: &str| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit());
    (numeric(x) && numeric(y) && numeric(z)).then_some((x, y, z))
}

/// Values for `${VAR}` substitution in image references
fn template_variables(mld: &ModuleLoaderData) -> HashMap<&'static str, String> {
    let mut vars = HashMap::new();
    vars.insert("KERNEL_FULL_VERSION", mld.kernel_version.clone());
    vars.insert("KERNEL_VERSION", mld.kernel_version.clone());
    vars.insert("MOD_NAME", mld.name.clone());
    vars.insert("MOD_NAMESPACE", mld.namespace.clone());

    if let Some((x, y, z)) = kernel_xyz(&mld.kernel_version) {
        vars.insert("KERNEL_XYZ", format!("{x}.{y}.{z}"));
        vars.insert("KERNEL_XY", format!("{x}.{y}"));
        vars.insert("KERNEL_X", x.to_string());
    }

    vars
}

fn replace_templates(mld: &mut ModuleLoaderData) {
    let vars = template_variables(mld);

    mld.container_image = expand(&mld.container_image, &vars);
    if let Some(sign) = mld.sign.as_mut() {
        sign.unsigned_image = expand(&sign.unsigned_image, &vars);
    }
}

/// Expand `$VAR` and `${VAR}`; unknown variables are left untouched.
pub fn expand(input: &str, vars: &HashMap<&'static str, String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];

        let (name, consumed) = if let Some(braced) = after.strip_prefix('{') {
            match braced.find('}') {
                Some(end) => (&braced[..end], end + 2),
                None => ("", 0),
            }
        } else {
            let end = after
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .unwrap_or(after.len());
            (&after[..end], end)
        };

        match vars.get(name) {
            Some(value) if !name.is_empty() => {
                out.push_str(value);
                rest = &after[consumed..];
            }
            _ => {
                out.push('$');
                rest = after;
            }
        }
    }

    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ModuleLoaderContainerSpec, ModuleLoaderSpec, ModuleSpec};
    use kube::api::ObjectMeta;

    fn module(mappings: Vec<KernelMapping>) -> Module {
        Module {
            metadata: ObjectMeta {
                name: Some("kmm-ci".to_string()),
                namespace: Some("ns".to_string()),
                ..Default::default()
            },
            spec: ModuleSpec {
                module_loader: ModuleLoaderSpec {
                    container: ModuleLoaderContainerSpec {
                        modprobe: ModprobeSpec {
                            module_name: "kmm_ci_a".to_string(),
                            ..Default::default()
                        },
                        container_image: "registry/default:${KERNEL_FULL_VERSION}".to_string(),
                        kernel_mappings: mappings,
                        ..Default::default()
                    },
                    service_account_name: Some("sa".to_string()),
                },
                ..Default::default()
            },
        }
    }

    fn regexp(re: &str, image: &str) -> KernelMapping {
        KernelMapping {
            regexp: re.to_string(),
            container_image: image.to_string(),
            ..Default::default()
        }
    }

    fn literal(lit: &str, image: &str) -> KernelMapping {
        KernelMapping {
            literal: lit.to_string(),
            container_image: image.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn empty_mappings_yield_no_mapping() {
        let err = DefaultKernelMapper::new()
            .module_loader_data_for_kernel(&module(vec![]), "5.14.0")
            .unwrap_err();
        assert!(matches!(err, Error::NoKernelMapping { .. }));
    }

    #[test]
    fn first_matching_rule_wins() {
        let m = module(vec![
            literal("5.14.0-1", "literal-image"),
            regexp("^5\\.14", "first-regexp"),
            regexp(".*", "catch-all"),
        ]);
        let mapper = DefaultKernelMapper::new();

        let mld = mapper.module_loader_data_for_kernel(&m, "5.14.0-1").unwrap();
        assert_eq!(mld.container_image, "literal-image");

        let mld = mapper.module_loader_data_for_kernel(&m, "5.14.0-2").unwrap();
        assert_eq!(mld.container_image, "first-regexp");

        let mld = mapper.module_loader_data_for_kernel(&m, "6.1.0").unwrap();
        assert_eq!(mld.container_image, "catch-all");
    }

    #[test]
    fn regexp_is_an_unanchored_search() {
        let m = module(vec![regexp("el9", "img")]);
        assert!(DefaultKernelMapper::new()
            .module_loader_data_for_kernel(&m, "5.14.0-284.el9.x86_64")
            .is_ok());
    }

    #[test]
    fn regexps_are_compiled_once_per_pattern() {
        let m = module(vec![regexp("^6\\.", "six"), regexp("^5\\.", "five")]);
        let mapper = DefaultKernelMapper::new();

        for kernel in ["5.14.0-1", "5.14.0-2", "6.1.0", "5.15.0"] {
            mapper.module_loader_data_for_kernel(&m, kernel).unwrap();
        }
        assert_eq!(mapper.cached_regexes(), 2);
    }

    #[test]
    fn invalid_regexp_is_reported_every_time() {
        let m = module(vec![regexp("*-invalid-regexp", "img")]);
        let mapper = DefaultKernelMapper::new();

        for _ in 0..2 {
            let err = mapper.module_loader_data_for_kernel(&m, "5.14.0").unwrap_err();
            assert!(matches!(err, Error::ConfigError(_)));
        }
        assert_eq!(mapper.cached_regexes(), 0);
    }

    #[test]
    fn literal_requires_exact_match() {
        let m = module(vec![literal("5.14.0", "img")]);
        assert!(DefaultKernelMapper::new()
            .module_loader_data_for_kernel(&m, "5.14.0-1")
            .is_err());
    }

    #[test]
    fn trailing_plus_is_trimmed() {
        let m = module(vec![literal("6.6.0-rpi", "img")]);
        let mld = DefaultKernelMapper::new()
            .module_loader_data_for_kernel(&m, "6.6.0-rpi+")
            .unwrap();
        assert_eq!(mld.kernel_version, "6.6.0-rpi");
    }

    #[test]
    fn mapping_overrides_container_defaults() {
        let mut m = module(vec![KernelMapping {
            regexp: ".*".to_string(),
            build: Some(Build {
                dockerfile_config_map: LocalRef::new("mapping-dockerfile"),
                ..Default::default()
            }),
            registry_tls: Some(RegistryTls {
                insecure: true,
                insecure_skip_tls_verify: false,
            }),
            ..Default::default()
        }]);
        m.spec.module_loader.container.build = Some(Build {
            dockerfile_config_map: LocalRef::new("container-dockerfile"),
            ..Default::default()
        });
        m.spec.module_loader.container.sign = Some(Sign {
            unsigned_image: "unsigned:${KERNEL_XY}".to_string(),
            ..Default::default()
        });
        m.spec.module_loader.container.in_tree_module_to_remove = "old".to_string();

        let mld = DefaultKernelMapper::new()
            .module_loader_data_for_kernel(&m, "5.14.7-300")
            .unwrap();

        assert_eq!(
            mld.build.unwrap().dockerfile_config_map.name,
            "mapping-dockerfile"
        );
        assert!(mld.registry_tls.insecure);
        assert_eq!(mld.sign.unwrap().unsigned_image, "unsigned:5.14");
        assert_eq!(mld.container_image, "registry/default:5.14.7-300");
        assert_eq!(mld.in_tree_module_to_remove, "old");
        assert_eq!(mld.service_account_name.as_deref(), Some("sa"));
        assert_eq!(mld.owner.name_any(), "kmm-ci");
    }

    #[test]
    fn kernel_xyz_needs_three_numeric_parts() {
        assert_eq!(kernel_xyz("5.14.0-284.el9"), Some(("5", "14", "0")));
        assert_eq!(kernel_xyz("6.1.55+rpt"), Some(("6", "1", "55")));
        assert_eq!(kernel_xyz("5.14"), None);
        assert_eq!(kernel_xyz("valid-regexp"), None);
    }

    #[test]
    fn expands_known_variables_only() {
        let mut vars = HashMap::new();
        vars.insert("KERNEL_X", "5".to_string());
        vars.insert("MOD_NAME", "kmm-ci".to_string());

        assert_eq!(expand("img:${KERNEL_X}-$MOD_NAME", &vars), "img:5-kmm-ci");
        assert_eq!(expand("img:${UNKNOWN}", &vars), "img:${UNKNOWN}");
        assert_eq!(expand("cost$", &vars), "cost$");
        assert_eq!(expand("${KERNEL_X", &vars), "${KERNEL_X");
    }
}

//! Kernel mapping resolution
//!
//! A Module lists container defaults and a set of kernel mappings. For every
//! kernel version found on the targeted nodes, the reconciler asks a
//! [`KernelMapper`] for a [`ResolvedKernelConfig`]: the container defaults
//! merged with the first matching mapping, with kernel variables substituted
//! into the image names. The resolved config is the only input the build,
//! sign and DaemonSet stages need.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};
use regex::Regex;

use crate::crd::{
    Build, KernelMapping, LocalObjectReference, ModprobeSpec, Module, Sign, TlsOptions,
};
use crate::error::{Error, Result};

/// Identity of the Module that owns every Job and DaemonSet created for it
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OwnerRef {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub uid: String,
}

impl OwnerRef {
    pub fn from_module(module: &Module) -> Self {
        Self {
            api_version: Module::api_version(&()).to_string(),
            kind: Module::kind(&()).to_string(),
            name: module.name_any(),
            uid: module.metadata.uid.clone().unwrap_or_default(),
        }
    }

    /// Controller owner reference for garbage collection by the API server
    pub fn to_owner_reference(&self) -> OwnerReference {
        OwnerReference {
            api_version: self.api_version.clone(),
            kind: self.kind.clone(),
            name: self.name.clone(),
            uid: self.uid.clone(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }

    /// Whether `refs` contains a controller reference pointing at this owner
    pub fn is_controller_of(&self, refs: Option<&Vec<OwnerReference>>) -> bool {
        refs.map(|refs| {
            refs.iter()
                .any(|r| r.controller == Some(true) && r.uid == self.uid)
        })
        .unwrap_or(false)
    }
}

/// Everything needed to build, sign and load a module for one kernel version
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResolvedKernelConfig {
    pub name: String,
    pub namespace: String,
    pub kernel_version: String,
    /// Final image the module loader DaemonSet runs
    pub container_image: String,
    pub build: Option<Build>,
    pub sign: Option<Sign>,
    pub image_repo_secret: Option<LocalObjectReference>,
    pub registry_tls: TlsOptions,
    pub selector: BTreeMap<String, String>,
    pub modprobe: ModprobeSpec,
    pub image_pull_policy: String,
    pub service_account_name: Option<String>,
    pub owner: OwnerRef,
}

/// Resolves the configuration of a Module for a given kernel version
pub trait KernelMapper: Send + Sync {
    fn resolve(&self, module: &Module, kernel_version: &str) -> Result<ResolvedKernelConfig>;
}

/// Kernel mapper matching `literal` and `regexp` entries in declaration order
#[derive(Clone, Debug, Default)]
pub struct DefaultKernelMapper;

impl KernelMapper for DefaultKernelMapper {
    fn resolve(&self, module: &Module, kernel_version: &str) -> Result<ResolvedKernelConfig> {
        let container = &module.spec.module_loader.container;
        let mapping = find_mapping(&container.kernel_mappings, kernel_version)?;

        let image_template = mapping
            .container_image
            .as_ref()
            .or(container.container_image.as_ref())
            .ok_or_else(|| Error::KernelMappingError {
                kernel_version: kernel_version.to_string(),
                message: "no container image defined in the mapping or the container".to_string(),
            })?;

        let mut sign = merge_sign(container.sign.as_ref(), mapping.sign.as_ref());
        if let Some(unsigned) = sign.as_mut().and_then(|s| s.unsigned_image.as_mut()) {
            *unsigned = substitute_kernel_variables(unsigned, kernel_version)?;
        }

        Ok(ResolvedKernelConfig {
            name: module.name_any(),
            namespace: module.namespace().unwrap_or_else(|| "default".to_string()),
            kernel_version: kernel_version.to_string(),
            container_image: substitute_kernel_variables(image_template, kernel_version)?,
            build: merge_build(container.build.as_ref(), mapping.build.as_ref()),
            sign,
            image_repo_secret: module.spec.image_repo_secret.clone(),
            registry_tls: mapping
                .registry_tls
                .clone()
                .unwrap_or_else(|| container.registry_tls.clone()),
            selector: module.spec.selector.clone(),
            modprobe: container.modprobe.clone(),
            image_pull_policy: container.image_pull_policy.clone(),
            service_account_name: module.spec.module_loader.service_account_name.clone(),
            owner: OwnerRef::from_module(module),
        })
    }
}

/// First mapping whose literal equals, or whose regexp matches, the kernel version
fn find_mapping<'a>(mappings: &'a [KernelMapping], kernel_version: &str) -> Result<&'a KernelMapping> {
    for mapping in mappings {
        if mapping.literal.as_deref() == Some(kernel_version) {
            return Ok(mapping);
        }
        if let Some(pattern) = &mapping.regexp {
            let re = Regex::new(pattern).map_err(|e| Error::KernelMappingError {
                kernel_version: kernel_version.to_string(),
                message: format!("invalid regexp {:?}: {}", pattern, e),
            })?;
            if re.is_match(kernel_version) {
                return Ok(mapping);
            }
        }
    }

    Err(Error::KernelMappingError {
        kernel_version: kernel_version.to_string(),
        message: "no suitable mapping found".to_string(),
    })
}

/// Merge the container build defaults with a mapping override.
///
/// The mapping Dockerfile wins. Build args present in both are taken from the
/// mapping; mapping-only args are appended sorted by name. Secrets are
/// concatenated.
fn merge_build(defaults: Option<&Build>, mapping: Option<&Build>) -> Option<Build> {
    let (defaults, mapping) = match (defaults, mapping) {
        (None, None) => return None,
        (Some(b), None) | (None, Some(b)) => return Some(b.clone()),
        (Some(d), Some(m)) => (d, m),
    };

    let overrides: BTreeMap<&str, &str> = mapping
        .build_args
        .iter()
        .map(|a| (a.name.as_str(), a.value.as_str()))
        .collect();
    let mut used = BTreeSet::new();

    let mut build_args: Vec<_> = defaults
        .build_args
        .iter()
        .map(|arg| match overrides.get(arg.name.as_str()) {
            Some(value) => {
                used.insert(arg.name.as_str());
                crate::crd::BuildArg::new(arg.name.clone(), *value)
            }
            None => arg.clone(),
        })
        .collect();

    // BTreeMap iteration keeps the appended args sorted
    for (name, value) in &overrides {
        if !used.contains(name) {
            build_args.push(crate::crd::BuildArg::new(*name, *value));
        }
    }

    let mut secrets = defaults.secrets.clone();
    secrets.extend(mapping.secrets.iter().cloned());

    Some(Build {
        build_args,
        dockerfile_config_map: mapping.dockerfile_config_map.clone(),
        base_image_registry_tls: mapping.base_image_registry_tls.clone(),
        secrets,
    })
}

/// Merge the container sign defaults with a mapping override, field by field
fn merge_sign(defaults: Option<&Sign>, mapping: Option<&Sign>) -> Option<Sign> {
    let (defaults, mapping) = match (defaults, mapping) {
        (None, None) => return None,
        (Some(s), None) | (None, Some(s)) => return Some(s.clone()),
        (Some(d), Some(m)) => (d, m),
    };

    let mut merged = defaults.clone();
    if mapping.unsigned_image.is_some() {
        merged.unsigned_image = mapping.unsigned_image.clone();
        merged.unsigned_image_registry_tls = mapping.unsigned_image_registry_tls.clone();
    }
    if mapping.key_secret.is_some() {
        merged.key_secret = mapping.key_secret.clone();
    }
    if mapping.cert_secret.is_some() {
        merged.cert_secret = mapping.cert_secret.clone();
    }
    if !mapping.files_to_sign.is_empty() {
        merged.files_to_sign = mapping.files_to_sign.clone();
    }
    Some(merged)
}

/// Replace the `${KERNEL_*}` variables in an image reference
pub fn substitute_kernel_variables(template: &str, kernel_version: &str) -> Result<String> {
    let mut out = template
        .replace("${KERNEL_FULL_VERSION}", kernel_version)
        .replace("${KERNEL_VERSION}", kernel_version);

    if !out.contains("${KERNEL_X") {
        return Ok(out);
    }

    let (x, y, z) = split_kernel_version(kernel_version).ok_or_else(|| Error::KernelMappingError {
        kernel_version: kernel_version.to_string(),
        message: "kernel version is not of the form X.Y.Z".to_string(),
    })?;

    out = out
        .replace("${KERNEL_XYZ}", &format!("{}.{}.{}", x, y, z))
        .replace("${KERNEL_XY}", &format!("{}.{}", x, y))
        .replace("${KERNEL_X}", x);
    Ok(out)
}

fn split_kernel_version(kernel_version: &str) -> Option<(&str, &str, &str)> {
    let re = Regex::new(r"^(\d+)\.(\d+)\.(\d+)").ok()?;
    let caps = re.captures(kernel_version)?;
    Some((
        caps.get(1)?.as_str(),
        caps.get(2)?.as_str(),
        caps.get(3)?.as_str(),
    ))
}

/// Append `tag` to an image reference, extending the existing tag if there is one
pub fn append_to_tag(image: &str, tag: &str) -> String {
    let last_segment = image.rsplit('/').next().unwrap_or(image);
    let separator = if last_segment.contains(':') { '_' } else { ':' };
    format!("{}{}{}", image, separator, tag)
}

/// Name of the unsigned image a build pushes when signing follows
pub fn intermediate_image_name(name: &str, namespace: &str, target_image: &str) -> String {
    append_to_tag(
        target_image,
        &format!("{}_{}_kmm_unsigned", namespace, name),
    )
}

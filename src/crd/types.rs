//! Shared types for the Module Custom Resource Definition
//!
//! These types describe how a kernel module is built, signed and loaded,
//! both at the container level (defaults) and per kernel mapping (overrides).

use k8s_openapi::api::core::v1::{EnvVar, VolumeMount};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Registry TLS options used when pushing or pulling images
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct TlsOptions {
    /// Talk to the registry over plain HTTP
    #[serde(default)]
    pub insecure: bool,
    /// Use HTTPS but do not verify the registry certificate
    #[serde(default, rename = "insecureSkipTLSVerify")]
    pub insecure_skip_tls_verify: bool,
}

/// Reference to a Secret or ConfigMap in the Module namespace
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub struct LocalObjectReference {
    pub name: String,
}

impl LocalObjectReference {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl From<&LocalObjectReference> for k8s_openapi::api::core::v1::LocalObjectReference {
    fn from(r: &LocalObjectReference) -> Self {
        Self {
            name: Some(r.name.clone()),
        }
    }
}

/// A single `--build-arg` passed to the image builder
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub struct BuildArg {
    pub name: String,
    pub value: String,
}

impl BuildArg {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// In-cluster build instructions
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Build {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub build_args: Vec<BuildArg>,

    /// ConfigMap holding the Dockerfile under the `dockerfile` key
    pub dockerfile_config_map: LocalObjectReference,

    /// TLS options for pulling the base image
    #[serde(default)]
    pub base_image_registry_tls: TlsOptions,

    /// Secrets mounted into the build under /run/secrets/<name>
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secrets: Vec<LocalObjectReference>,
}

/// Kernel module signing instructions
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Sign {
    /// Image containing the unsigned modules, when no in-cluster build runs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unsigned_image: Option<String>,

    #[serde(default, rename = "unsignedImageRegistryTLS")]
    pub unsigned_image_registry_tls: TlsOptions,

    /// Secret holding the private signing key under the `key` key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_secret: Option<LocalObjectReference>,

    /// Secret holding the public certificate under the `cert` key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_secret: Option<LocalObjectReference>,

    /// Paths of the `.ko` files to sign inside the image
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files_to_sign: Vec<String>,
}

/// Load and unload arguments for modprobe
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct ModprobeArgs {
    #[serde(default)]
    pub load: Vec<String>,
    #[serde(default)]
    pub unload: Vec<String>,
}

/// How modprobe is invoked inside the module loader container
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModprobeSpec {
    /// Name of the kernel module to load
    pub module_name: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<String>,

    /// Root directory of the modules tree inside the image
    #[serde(default = "default_dir_name")]
    pub dir_name: String,

    /// Extra arguments prepended to the generated modprobe command
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<ModprobeArgs>,

    /// Replace the generated modprobe command entirely
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_args: Option<ModprobeArgs>,

    /// Host path where firmware files are copied before loading
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firmware_path: Option<String>,
}

fn default_dir_name() -> String {
    "/opt".to_string()
}

/// Per kernel version override of the container defaults
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KernelMapping {
    /// Exact kernel version to match
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub literal: Option<String>,

    /// Regular expression the kernel version must match
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regexp: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_image: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<Build>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sign: Option<Sign>,

    #[serde(default, skip_serializing_if = "Option::is_none", rename = "registryTLS")]
    pub registry_tls: Option<TlsOptions>,
}

/// Module loader container defaults and kernel mappings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModuleLoaderContainerSpec {
    /// Default image, may contain `${KERNEL_FULL_VERSION}` style variables
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_image: Option<String>,

    #[serde(default = "default_pull_policy")]
    pub image_pull_policy: String,

    pub modprobe: ModprobeSpec,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<Build>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sign: Option<Sign>,

    #[serde(default, rename = "registryTLS")]
    pub registry_tls: TlsOptions,

    #[serde(default)]
    pub kernel_mappings: Vec<KernelMapping>,
}

fn default_pull_policy() -> String {
    "IfNotPresent".to_string()
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModuleLoaderSpec {
    pub container: ModuleLoaderContainerSpec,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,
}

/// Container running the device plugin next to the loaded module
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DevicePluginContainerSpec {
    pub image: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[schemars(with = "Vec<serde_json::Value>")]
    pub env: Vec<EnvVar>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[schemars(with = "Vec<serde_json::Value>")]
    pub volume_mounts: Vec<VolumeMount>,

    #[serde(default = "default_pull_policy")]
    pub image_pull_policy: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DevicePluginSpec {
    pub container: DevicePluginContainerSpec,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,
}

/// Counters for one family of DaemonSets owned by a Module
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DaemonSetStatus {
    /// Schedulable nodes matching the Module selector
    #[serde(default)]
    pub nodes_matching_selector_number: i32,
    /// Nodes whose kernel version resolved to a mapping
    #[serde(default)]
    pub desired_number: i32,
    /// Pods reported available by the DaemonSets
    #[serde(default)]
    pub available_number: i32,
}

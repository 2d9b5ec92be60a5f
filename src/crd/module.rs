//! Module Custom Resource Definition
//!
//! A Module declares which kernel module should be loaded on which nodes,
//! and how to obtain an image for every kernel version found among them.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{DaemonSetStatus, DevicePluginSpec, LocalObjectReference, ModuleLoaderSpec};

#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "kmm.sigs.x-k8s.io",
    version = "v1beta1",
    kind = "Module",
    namespaced,
    status = "ModuleStatus",
    shortname = "mod",
    printcolumn = r#"{"name":"Desired","type":"integer","jsonPath":".status.moduleLoader.desiredNumber"}"#,
    printcolumn = r#"{"name":"Available","type":"integer","jsonPath":".status.moduleLoader.availableNumber"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ModuleSpec {
    pub module_loader: ModuleLoaderSpec,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_plugin: Option<DevicePluginSpec>,

    /// Pull (and push) secret for the module images
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_repo_secret: Option<LocalObjectReference>,

    /// Node labels the module targets
    pub selector: BTreeMap<String, String>,
}

impl ModuleSpec {
    /// Whether any build section is declared, at container level or in a mapping
    pub fn is_build_capable(&self) -> bool {
        let container = &self.module_loader.container;
        container.build.is_some() || container.kernel_mappings.iter().any(|m| m.build.is_some())
    }

    /// Whether any sign section is declared, at container level or in a mapping
    pub fn is_sign_capable(&self) -> bool {
        let container = &self.module_loader.container;
        container.sign.is_some() || container.kernel_mappings.iter().any(|m| m.sign.is_some())
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModuleStatus {
    #[serde(default)]
    pub module_loader: DaemonSetStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_plugin: Option<DaemonSetStatus>,
}

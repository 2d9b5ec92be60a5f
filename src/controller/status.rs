//! Module status aggregation
//!
//! The status is recomputed from scratch every pass from the nodes and
//! DaemonSets gathered by the reconciler, then written as a merge patch
//! against the status the pass started from.

use std::sync::Arc;

use k8s_openapi::api::apps::v1::DaemonSet;
use kube::ResourceExt;
use serde_json::json;
use tracing::{debug, info};

use super::daemonset::{is_device_plugin_kernel_version, DaemonSetIndex};
use super::patch::merge_patch_diff;
use super::store::ModuleStatusStore;
use crate::crd::{DaemonSetStatus, Module, ModuleStatus};
use crate::error::Result;

fn available(ds: &DaemonSet) -> i32 {
    ds.status
        .as_ref()
        .and_then(|s| s.number_available)
        .unwrap_or(0)
}

/// Status derived from this pass's observations
pub fn compute_status(
    module: &Module,
    targeted_nodes: usize,
    nodes_with_mapping: usize,
    index: &DaemonSetIndex,
) -> ModuleStatus {
    let mut loader_available = 0;
    let mut device_plugin_available = 0;
    for (kernel_version, ds) in index {
        if is_device_plugin_kernel_version(kernel_version) {
            device_plugin_available += available(ds);
        } else {
            loader_available += available(ds);
        }
    }

    let targeted = targeted_nodes as i32;
    ModuleStatus {
        module_loader: DaemonSetStatus {
            nodes_matching_selector_number: targeted,
            desired_number: nodes_with_mapping as i32,
            available_number: loader_available,
        },
        device_plugin: module.spec.device_plugin.as_ref().map(|_| DaemonSetStatus {
            nodes_matching_selector_number: targeted,
            desired_number: nodes_with_mapping as i32,
            available_number: device_plugin_available,
        }),
    }
}

#[derive(Clone)]
pub struct ModuleStatusUpdater {
    store: Arc<dyn ModuleStatusStore>,
}

impl ModuleStatusUpdater {
    pub fn new(store: Arc<dyn ModuleStatusStore>) -> Self {
        Self { store }
    }

    /// Write the recomputed status, skipping the write when nothing changed
    pub async fn update_status(
        &self,
        module: &Module,
        targeted_nodes: usize,
        nodes_with_mapping: usize,
        index: &DaemonSetIndex,
    ) -> Result<()> {
        let namespace = module.namespace().unwrap_or_else(|| "default".to_string());
        let name = module.name_any();

        let new_status = compute_status(module, targeted_nodes, nodes_with_mapping, index);
        let old = match &module.status {
            Some(status) => serde_json::to_value(status)?,
            None => json!({}),
        };
        let new = serde_json::to_value(&new_status)?;

        let diff = match merge_patch_diff(&old, &new) {
            Some(diff) => diff,
            None => {
                debug!("Status of module {}/{} unchanged", namespace, name);
                return Ok(());
            }
        };

        info!(
            "Updating status of module {}/{}: desired={} available={}",
            namespace,
            name,
            new_status.module_loader.desired_number,
            new_status.module_loader.available_number
        );
        self.store
            .patch_module_status(&namespace, &name, &json!({ "status": diff }))
            .await
    }
}

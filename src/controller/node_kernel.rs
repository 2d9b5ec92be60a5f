//! Node kernel labeller
//!
//! Copies the kernel version reported by each node into a label, so the
//! per kernel module loader DaemonSets can select nodes by exact version.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher::Config;
use kube::{Client, ResourceExt};
use serde_json::json;
use tracing::{debug, error, info, instrument, warn};

use super::KERNEL_VERSION_LABEL;
use crate::error::{Error, Result};

/// Kernel version of a node with the trailing `+` of custom builds removed
pub fn node_kernel_version(node: &Node) -> Option<String> {
    let version = node
        .status
        .as_ref()?
        .node_info
        .as_ref()?
        .kernel_version
        .trim()
        .trim_end_matches('+');
    (!version.is_empty()).then(|| version.to_string())
}

/// Whether the kernel label already matches the reported kernel version
pub fn has_current_kernel_label(node: &Node) -> bool {
    match node_kernel_version(node) {
        Some(version) => node.labels().get(KERNEL_VERSION_LABEL) == Some(&version),
        None => true,
    }
}

struct LabellerState {
    client: Client,
}

#[instrument(skip(node, ctx), fields(node = %node.name_any()))]
async fn reconcile(node: Arc<Node>, ctx: Arc<LabellerState>) -> Result<Action> {
    if has_current_kernel_label(&node) {
        return Ok(Action::await_change());
    }
    let version = match node_kernel_version(&node) {
        Some(v) => v,
        None => return Ok(Action::await_change()),
    };

    info!("Labelling node {} with kernel {}", node.name_any(), version);
    let api: Api<Node> = Api::all(ctx.client.clone());
    let patch = json!({ "metadata": { "labels": { KERNEL_VERSION_LABEL: version } } });
    api.patch(&node.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(Action::await_change())
}

fn error_policy(node: Arc<Node>, error: &Error, _ctx: Arc<LabellerState>) -> Action {
    warn!("Failed to label node {}: {:?}", node.name_any(), error);
    Action::requeue(Duration::from_secs(15))
}

/// Run the node kernel labeller until shutdown
pub async fn run_node_kernel_controller(client: Client) -> Result<()> {
    let nodes: Api<Node> = Api::all(client.clone());
    let state = Arc::new(LabellerState { client });

    info!("Starting node kernel labeller");
    Controller::new(nodes, Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, state)
        .for_each(|res| async move {
            match res {
                Ok(obj) => debug!("Labelled: {:?}", obj),
                Err(e) => error!("Node labelling error: {:?}", e),
            }
        })
        .await;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::fake::test_node;

    #[test]
    fn test_kernel_version_is_trimmed() {
        let node = test_node("n1", "5.14.0-70.el9.x86_64+", &[], false);
        assert_eq!(node_kernel_version(&node).as_deref(), Some("5.14.0-70.el9.x86_64"));
    }

    #[test]
    fn test_missing_kernel_version() {
        let node = Node::default();
        assert_eq!(node_kernel_version(&node), None);
        assert!(has_current_kernel_label(&node));
    }

    #[test]
    fn test_label_staleness() {
        let stale = test_node("n1", "6.1.0", &[(KERNEL_VERSION_LABEL, "5.14.0")], false);
        assert!(!has_current_kernel_label(&stale));

        let current = test_node("n1", "6.1.0+", &[(KERNEL_VERSION_LABEL, "6.1.0")], false);
        assert!(has_current_kernel_label(&current));
    }
}

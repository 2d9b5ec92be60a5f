//! Controller module for Module reconciliation
//!
//! This module contains the controller loops, the per kernel version
//! build/sign/deploy pipeline and the stores it runs against.

pub mod build;
pub mod daemonset;
pub mod job;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod node_kernel;
mod patch;
mod reconciler;
pub mod sign;
pub mod status;
pub mod store;

#[cfg(test)]
mod fake;

pub const MODULE_NAME_LABEL: &str = "kmm.node.kubernetes.io/module.name";
pub const TARGET_KERNEL_LABEL: &str = "kmm.node.kubernetes.io/target-kernel";
pub const KERNEL_VERSION_LABEL: &str = "kmm.node.kubernetes.io/kernel-version.full";

pub use build::{BuildJobManager, BuildManager};
pub use daemonset::DaemonSetManager;
pub use job::{JobManager, JobStatus, Stage};
pub use node_kernel::run_node_kernel_controller;
pub use reconciler::{find_modules_for_node, run_controller, ControllerState, ModuleReconciler};
pub use sign::{SignJobManager, SignManager};
pub use status::ModuleStatusUpdater;
pub use store::KubeStore;

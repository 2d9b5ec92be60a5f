//! Main reconciler for the Module CRD
//!
//! Each pass lists the schedulable nodes a Module targets, resolves one
//! configuration per kernel version found among them, and drives every
//! kernel version through build, sign and module loader deployment.
//! Stale Jobs and DaemonSets are garbage collected and the status is
//! recomputed at the end of the pass.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, ListParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config;
use kube::{Client, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use super::build::{BuildJobMaker, BuildJobManager, BuildManager};
use super::daemonset::{is_device_plugin_kernel_version, DaemonSetIndex, DaemonSetManager};
use super::job::{JobManager, JobStatus, Stage};
use super::node_kernel::{has_current_kernel_label, node_kernel_version};
use super::sign::{SignJobMaker, SignJobManager, SignManager};
use super::status::ModuleStatusUpdater;
use super::store::{ClusterReader, KubeStore};
use crate::config::OperatorConfig;
use crate::crd::Module;
use crate::error::{Error, Result};
use crate::module::{intermediate_image_name, DefaultKernelMapper, KernelMapper, OwnerRef, ResolvedKernelConfig};
use crate::registry::HttpRegistry;

#[cfg(feature = "metrics")]
use super::metrics;

/// Shared state for the Module controller
pub struct ControllerState {
    pub client: Client,
    pub config: OperatorConfig,
    /// Whether this replica holds the leader Lease
    pub is_leader: Arc<AtomicBool>,
    pub reconciler: ModuleReconciler,
}

/// Drives one Module towards its desired state
pub struct ModuleReconciler {
    cluster: Arc<dyn ClusterReader>,
    mapper: Arc<dyn KernelMapper>,
    build: Arc<dyn BuildManager>,
    sign: Arc<dyn SignManager>,
    daemonsets: DaemonSetManager,
    status: ModuleStatusUpdater,
}

fn is_node_schedulable(node: &Node) -> bool {
    let taints = node.spec.as_ref().and_then(|s| s.taints.as_ref());
    !taints.is_some_and(|taints| taints.iter().any(|t| t.effect == "NoSchedule"))
}

impl ModuleReconciler {
    pub fn new(
        cluster: Arc<dyn ClusterReader>,
        mapper: Arc<dyn KernelMapper>,
        build: Arc<dyn BuildManager>,
        sign: Arc<dyn SignManager>,
        daemonsets: DaemonSetManager,
        status: ModuleStatusUpdater,
    ) -> Self {
        Self {
            cluster,
            mapper,
            build,
            sign,
            daemonsets,
            status,
        }
    }

    /// Wire the reconciler to the API server and the container registries
    pub fn from_client(client: Client, config: &OperatorConfig) -> Result<Self> {
        let store = Arc::new(KubeStore::new(client));
        let registry = Arc::new(HttpRegistry::new()?);

        let build = BuildJobManager::new(
            JobManager::new(store.clone()),
            BuildJobMaker::new(config.builder_image.clone(), store.clone()),
            registry.clone(),
            store.clone(),
        );
        let sign = SignJobManager::new(
            JobManager::new(store.clone()),
            SignJobMaker::new(config.signer_image.clone(), store.clone()),
            registry,
            store.clone(),
        );

        Ok(Self::new(
            store.clone(),
            Arc::new(DefaultKernelMapper),
            Arc::new(build),
            Arc::new(sign),
            DaemonSetManager::new(store.clone()),
            ModuleStatusUpdater::new(store),
        ))
    }

    /// Run one reconcile pass for the Module `namespace/name`
    #[instrument(skip(self))]
    pub async fn reconcile(&self, namespace: &str, name: &str) -> Result<()> {
        let module = match self.cluster.get_module(namespace, name).await? {
            Some(module) => module,
            None => {
                info!("Module {}/{} not found, it was probably deleted", namespace, name);
                return Ok(());
            }
        };

        #[cfg(feature = "metrics")]
        match self.cluster.list_modules().await {
            Ok(modules) => metrics::set_module_inventory(&modules),
            Err(e) => warn!("Failed to refresh module metrics: {}", e),
        }

        let targeted: Vec<Node> = self
            .cluster
            .list_nodes(&module.spec.selector)
            .await?
            .into_iter()
            .filter(is_node_schedulable)
            .collect();

        let mut configs: BTreeMap<String, ResolvedKernelConfig> = BTreeMap::new();
        let mut unmapped: BTreeSet<String> = BTreeSet::new();
        let mut nodes_with_mapping = 0;
        for node in &targeted {
            let kernel_version = match node_kernel_version(node) {
                Some(v) => v,
                None => {
                    warn!("Node {} reports no kernel version", node.name_any());
                    continue;
                }
            };
            if unmapped.contains(&kernel_version) {
                continue;
            }
            if !configs.contains_key(&kernel_version) {
                match self.mapper.resolve(&module, &kernel_version) {
                    Ok(cfg) => {
                        configs.insert(kernel_version.clone(), cfg);
                    }
                    Err(e) => {
                        warn!("Skipping nodes with kernel {}: {}", kernel_version, e);
                        unmapped.insert(kernel_version);
                        continue;
                    }
                }
            }
            nodes_with_mapping += 1;
        }

        let mut index = self
            .daemonsets
            .module_daemonsets_by_kernel_version(name, namespace)
            .await?;

        let mut failures = Vec::new();
        for (kernel_version, cfg) in &configs {
            if let Err(e) = self.reconcile_kernel(cfg, &index).await {
                error!("Failed to reconcile kernel {} of module {}/{}: {}", kernel_version, namespace, name, e);
                failures.push(format!("{}: {}", kernel_version, e));
            }
        }
        if !failures.is_empty() {
            return Err(Error::KernelVersions(failures.join("; ")));
        }

        self.daemonsets.reconcile_device_plugin(&module, &index).await?;

        let valid_kernels: BTreeSet<String> = configs.keys().cloned().collect();
        self.garbage_collect(&module, &index, &valid_kernels).await?;
        index.retain(|k, _| is_device_plugin_kernel_version(k) || valid_kernels.contains(k));

        self.status
            .update_status(&module, targeted.len(), nodes_with_mapping, &index)
            .await
    }

    async fn reconcile_kernel(
        &self,
        cfg: &ResolvedKernelConfig,
        index: &DaemonSetIndex,
    ) -> Result<()> {
        if !self.handle_build(cfg).await? {
            return Ok(());
        }
        if !self.handle_signing(cfg).await? {
            return Ok(());
        }
        self.daemonsets.reconcile_driver_container(cfg, index).await
    }

    /// Returns true once the build stage is done or not needed
    pub async fn handle_build(&self, cfg: &ResolvedKernelConfig) -> Result<bool> {
        if !self.build.should_sync(cfg).await? {
            debug!("Build not needed for kernel {}", cfg.kernel_version);
            return Ok(true);
        }
        let status = self.build.sync(cfg, true).await?;
        Ok(stage_completed(cfg, Stage::Build, status))
    }

    /// Returns true once the sign stage is done or not needed
    pub async fn handle_signing(&self, cfg: &ResolvedKernelConfig) -> Result<bool> {
        if !self.sign.should_sync(cfg).await? {
            debug!("Signing not needed for kernel {}", cfg.kernel_version);
            return Ok(true);
        }
        let previous_image = match cfg.build {
            Some(_) => intermediate_image_name(&cfg.name, &cfg.namespace, &cfg.container_image),
            None => String::new(),
        };
        let status = self.sign.sync(cfg, &previous_image, true).await?;
        Ok(stage_completed(cfg, Stage::Sign, status))
    }

    async fn garbage_collect(
        &self,
        module: &Module,
        index: &DaemonSetIndex,
        valid_kernels: &BTreeSet<String>,
    ) -> Result<()> {
        let namespace = module.namespace().unwrap_or_else(|| "default".to_string());
        let name = module.name_any();
        let owner = OwnerRef::from_module(module);
        let mut failures = Vec::new();

        match self.daemonsets.garbage_collect(&namespace, index, valid_kernels).await {
            Ok(deleted) => record_collected("daemonset", &deleted),
            Err(e) => failures.push(format!("daemonsets: {}", e)),
        }
        match self.build.garbage_collect(&name, &namespace, &owner).await {
            Ok(deleted) => record_collected("build", &deleted),
            Err(e) => failures.push(format!("build jobs: {}", e)),
        }
        match self.sign.garbage_collect(&name, &namespace, &owner).await {
            Ok(deleted) => record_collected("sign", &deleted),
            Err(e) => failures.push(format!("sign jobs: {}", e)),
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::GarbageCollection(failures.join("; ")))
        }
    }
}

fn record_collected(kind: &str, deleted: &[String]) {
    if deleted.is_empty() {
        return;
    }
    info!("Garbage collected {} {}: {:?}", deleted.len(), kind, deleted);
    #[cfg(feature = "metrics")]
    metrics::inc_garbage_collected(kind, deleted.len());
}

fn stage_completed(cfg: &ResolvedKernelConfig, stage: Stage, status: JobStatus) -> bool {
    #[cfg(feature = "metrics")]
    metrics::inc_stage_result(stage.as_str(), &format!("{:?}", status).to_lowercase());

    match status {
        JobStatus::Completed => {
            info!("{} completed for kernel {}", stage, cfg.kernel_version);
            true
        }
        JobStatus::Created | JobStatus::InProgress => {
            info!("{} in progress for kernel {}", stage, cfg.kernel_version);
            false
        }
        JobStatus::Failed => {
            warn!(
                "{} failed for kernel {} of module {}/{}, delete the failed job to retry",
                stage, cfg.kernel_version, cfg.namespace, cfg.name
            );
            false
        }
    }
}

/// What a node event means for the Modules selecting it
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeChange {
    /// Kernel label matches the reported kernel version
    Labelled,
    /// The labeller has not caught up yet; its patch will produce another event
    AwaitingKernelLabel,
    /// Node carries a NoSchedule taint
    Unschedulable,
}

impl NodeChange {
    pub fn from_node(node: &Node) -> Self {
        if !is_node_schedulable(node) {
            NodeChange::Unschedulable
        } else if has_current_kernel_label(node) {
            NodeChange::Labelled
        } else {
            NodeChange::AwaitingKernelLabel
        }
    }
}

/// Modules to requeue after a change on `node`
pub fn find_modules_for_node(node: &Node, modules: &[Arc<Module>]) -> Vec<ObjectRef<Module>> {
    match NodeChange::from_node(node) {
        NodeChange::AwaitingKernelLabel => return Vec::new(),
        NodeChange::Labelled | NodeChange::Unschedulable => {}
    }

    let labels = node.labels();
    modules
        .iter()
        .filter(|m| m.spec.selector.iter().all(|(k, v)| labels.get(k) == Some(v)))
        .map(|m| {
            let mut obj = ObjectRef::new(&m.name_any());
            if let Some(ns) = m.namespace() {
                obj = obj.within(&ns);
            }
            obj
        })
        .collect()
}

/// Main entry point to start the Module controller
pub async fn run_controller(state: Arc<ControllerState>) -> Result<()> {
    let client = state.client.clone();
    let modules: Api<Module> = Api::all(client.clone());

    info!("Starting Module controller");

    // Verify CRD exists
    match modules.list(&ListParams::default().limit(1)).await {
        Ok(_) => info!("Module CRD is available"),
        Err(e) => {
            error!("Module CRD not found. Please install the CRD first: {:?}", e);
            return Err(Error::ConfigError("Module CRD not installed".to_string()));
        }
    }

    let controller = Controller::new(modules, Config::default());
    let store = controller.store();

    controller
        .owns::<DaemonSet>(Api::all(client.clone()), Config::default())
        .owns::<Job>(Api::all(client.clone()), Config::default())
        .watches(Api::<Node>::all(client.clone()), Config::default(), move |node| {
            find_modules_for_node(&node, &store.state())
        })
        .shutdown_on_signal()
        .run(reconcile, error_policy, state)
        .for_each(|res| async move {
            match res {
                Ok(obj) => info!("Reconciled: {:?}", obj),
                Err(e) => error!("Reconcile error: {:?}", e),
            }
        })
        .await;

    Ok(())
}

#[instrument(skip(obj, ctx), fields(name = %obj.name_any(), namespace = obj.namespace()))]
async fn reconcile(obj: Arc<Module>, ctx: Arc<ControllerState>) -> Result<Action> {
    if !ctx.is_leader.load(Ordering::Relaxed) {
        debug!("Not the leader, skipping reconcile");
        return Ok(Action::requeue(ctx.config.retry_interval));
    }

    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());
    let started = Instant::now();
    let result = ctx.reconciler.reconcile(&namespace, &obj.name_any()).await;

    #[cfg(feature = "metrics")]
    metrics::observe_reconcile_duration_seconds("module", started.elapsed().as_secs_f64());
    #[cfg(not(feature = "metrics"))]
    debug!("Reconcile took {:?}", started.elapsed());

    result.map(|_| Action::requeue(ctx.config.resync_interval))
}

fn error_policy(module: Arc<Module>, error: &Error, ctx: Arc<ControllerState>) -> Action {
    error!("Reconciliation error for {}: {:?}", module.name_any(), error);

    #[cfg(feature = "metrics")]
    metrics::inc_reconcile_error("module", error.kind());

    // Use shorter retry for retriable errors
    let retry_duration: Duration = if error.is_retriable() {
        ctx.config.retry_interval
    } else {
        ctx.config.error_backoff
    };

    Action::requeue(retry_duration)
}

//! Module loader and device plugin DaemonSets
//!
//! Every kernel version whose build and sign stages are done gets one module
//! loader DaemonSet, pinned to the nodes running that kernel. The optional
//! device plugin DaemonSet carries no kernel version label and is indexed
//! under the empty kernel version.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetSpec};
use k8s_openapi::api::core::v1::{
    Capabilities, Container, ExecAction, HostPathVolumeSource, Lifecycle, LifecycleHandler,
    PodSpec, PodTemplateSpec, SecurityContext, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::ObjectMeta;
use kube::ResourceExt;
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};

use super::job::hash_value;
use super::patch::is_subset;
use super::store::DaemonSetStore;
use super::{KERNEL_VERSION_LABEL, MODULE_NAME_LABEL};
use crate::crd::{ModprobeSpec, Module};
use crate::error::Result;
use crate::module::{OwnerRef, ResolvedKernelConfig};

/// Index key of the device plugin DaemonSet
pub const DEVICE_PLUGIN_KERNEL_VERSION: &str = "";

/// Hash of the desired labels and spec last applied to a DaemonSet
pub const DAEMONSET_HASH_ANNOTATION: &str = "kmm.node.kubernetes.io/daemonset-hash";

const ROLE_LABEL: &str = "kmm.node.kubernetes.io/role";
const FIRMWARE_HOST_PATH: &str = "/var/lib/firmware";

/// DaemonSets of one Module keyed by kernel version
pub type DaemonSetIndex = BTreeMap<String, DaemonSet>;

pub fn is_device_plugin_kernel_version(kernel_version: &str) -> bool {
    kernel_version == DEVICE_PLUGIN_KERNEL_VERSION
}

pub fn device_plugin_name(module_name: &str) -> String {
    format!("{}-device-plugin", module_name)
}

/// Stable name of the module loader DaemonSet for a kernel version
pub fn module_loader_name(module_name: &str, kernel_version: &str) -> String {
    let digest = hex::encode(Sha256::digest(kernel_version.as_bytes()));
    format!("{}-{}", module_name, &digest[..10])
}

fn module_loader_pod_labels(module_name: &str, kernel_version: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (MODULE_NAME_LABEL.to_string(), module_name.to_string()),
        (KERNEL_VERSION_LABEL.to_string(), kernel_version.to_string()),
        (ROLE_LABEL.to_string(), "module-loader".to_string()),
    ])
}

fn device_plugin_pod_labels(module_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (MODULE_NAME_LABEL.to_string(), module_name.to_string()),
        (ROLE_LABEL.to_string(), "device-plugin".to_string()),
    ])
}

fn exec(command: Vec<String>) -> LifecycleHandler {
    LifecycleHandler {
        exec: Some(ExecAction {
            command: Some(command),
        }),
        ..Default::default()
    }
}

/// modprobe invocations loading and unloading the module
pub fn modprobe_commands(modprobe: &ModprobeSpec) -> (Vec<String>, Vec<String>) {
    if let Some(raw) = &modprobe.raw_args {
        let with = |args: &[String]| {
            std::iter::once("modprobe".to_string())
                .chain(args.iter().cloned())
                .collect::<Vec<_>>()
        };
        return (with(&raw.load), with(&raw.unload));
    }

    let (load_args, unload_args) = match &modprobe.args {
        Some(args) => (args.load.clone(), args.unload.clone()),
        None => (vec!["-v".to_string()], vec!["-rv".to_string()]),
    };
    let target = [
        "-d".to_string(),
        modprobe.dir_name.clone(),
        modprobe.module_name.clone(),
    ];

    let mut load = vec!["modprobe".to_string()];
    load.extend(load_args);
    load.extend(target.iter().cloned());
    load.extend(modprobe.parameters.iter().cloned());

    let mut unload = vec!["modprobe".to_string()];
    unload.extend(unload_args);
    unload.extend(target.iter().cloned());

    (load, unload)
}

/// Desired module loader DaemonSet for a kernel version.
///
/// `existing_name` is set when patching a live object; new objects are named
/// after the module and kernel version.
pub fn module_loader_daemonset(cfg: &ResolvedKernelConfig, existing_name: Option<&str>) -> DaemonSet {
    let pod_labels = module_loader_pod_labels(&cfg.name, &cfg.kernel_version);

    let mut node_selector = cfg.selector.clone();
    node_selector.insert(KERNEL_VERSION_LABEL.to_string(), cfg.kernel_version.clone());

    let (load, unload) = modprobe_commands(&cfg.modprobe);

    let mut volumes = vec![Volume {
        name: "node-lib-modules".to_string(),
        host_path: Some(HostPathVolumeSource {
            path: "/lib/modules".to_string(),
            type_: Some("Directory".to_string()),
        }),
        ..Default::default()
    }];
    let mut mounts = vec![VolumeMount {
        name: "node-lib-modules".to_string(),
        mount_path: "/lib/modules".to_string(),
        read_only: Some(true),
        ..Default::default()
    }];

    let post_start = match &cfg.modprobe.firmware_path {
        Some(firmware_path) => {
            volumes.push(Volume {
                name: "node-var-lib-firmware".to_string(),
                host_path: Some(HostPathVolumeSource {
                    path: FIRMWARE_HOST_PATH.to_string(),
                    type_: Some("DirectoryOrCreate".to_string()),
                }),
                ..Default::default()
            });
            mounts.push(VolumeMount {
                name: "node-var-lib-firmware".to_string(),
                mount_path: FIRMWARE_HOST_PATH.to_string(),
                ..Default::default()
            });
            vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                format!(
                    "cp -r {}/* {} && {}",
                    firmware_path.trim_end_matches('/'),
                    FIRMWARE_HOST_PATH,
                    load.join(" ")
                ),
            ]
        }
        None => load,
    };

    DaemonSet {
        metadata: ObjectMeta {
            name: Some(
                existing_name
                    .map(str::to_string)
                    .unwrap_or_else(|| module_loader_name(&cfg.name, &cfg.kernel_version)),
            ),
            namespace: Some(cfg.namespace.clone()),
            labels: Some(BTreeMap::from([
                (MODULE_NAME_LABEL.to_string(), cfg.name.clone()),
                (KERNEL_VERSION_LABEL.to_string(), cfg.kernel_version.clone()),
            ])),
            owner_references: Some(vec![cfg.owner.to_owner_reference()]),
            ..Default::default()
        },
        spec: Some(DaemonSetSpec {
            selector: LabelSelector {
                match_labels: Some(pod_labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(pod_labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: "module-loader".to_string(),
                        image: Some(cfg.container_image.clone()),
                        image_pull_policy: Some(cfg.image_pull_policy.clone()),
                        command: Some(vec!["sleep".to_string(), "infinity".to_string()]),
                        lifecycle: Some(Lifecycle {
                            post_start: Some(exec(post_start)),
                            pre_stop: Some(exec(unload)),
                        }),
                        security_context: Some(SecurityContext {
                            run_as_user: Some(0),
                            capabilities: Some(Capabilities {
                                add: Some(vec!["SYS_MODULE".to_string()]),
                                ..Default::default()
                            }),
                            ..Default::default()
                        }),
                        volume_mounts: Some(mounts),
                        ..Default::default()
                    }],
                    image_pull_secrets: cfg.image_repo_secret.as_ref().map(|s| vec![s.into()]),
                    node_selector: Some(node_selector),
                    priority_class_name: Some("system-node-critical".to_string()),
                    service_account_name: cfg.service_account_name.clone(),
                    volumes: Some(volumes),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    }
}

/// Desired device plugin DaemonSet of a Module
pub fn device_plugin_daemonset(module: &Module) -> Option<DaemonSet> {
    let device_plugin = module.spec.device_plugin.as_ref()?;
    let container = &device_plugin.container;
    let name = module.name_any();
    let pod_labels = device_plugin_pod_labels(&name);

    let mut mounts = container.volume_mounts.clone();
    mounts.push(VolumeMount {
        name: "kubelet-device-plugins".to_string(),
        mount_path: "/var/lib/kubelet/device-plugins".to_string(),
        ..Default::default()
    });

    Some(DaemonSet {
        metadata: ObjectMeta {
            name: Some(device_plugin_name(&name)),
            namespace: module.namespace(),
            labels: Some(BTreeMap::from([(MODULE_NAME_LABEL.to_string(), name.clone())])),
            owner_references: Some(vec![OwnerRef::from_module(module).to_owner_reference()]),
            ..Default::default()
        },
        spec: Some(DaemonSetSpec {
            selector: LabelSelector {
                match_labels: Some(pod_labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(pod_labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: "device-plugin".to_string(),
                        image: Some(container.image.clone()),
                        image_pull_policy: Some(container.image_pull_policy.clone()),
                        args: (!container.args.is_empty()).then(|| container.args.clone()),
                        env: (!container.env.is_empty()).then(|| container.env.clone()),
                        security_context: Some(SecurityContext {
                            privileged: Some(true),
                            ..Default::default()
                        }),
                        volume_mounts: Some(mounts),
                        ..Default::default()
                    }],
                    image_pull_secrets: module
                        .spec
                        .image_repo_secret
                        .as_ref()
                        .map(|s| vec![s.into()]),
                    node_selector: Some(module.spec.selector.clone()),
                    priority_class_name: Some("system-node-critical".to_string()),
                    service_account_name: device_plugin.service_account_name.clone(),
                    volumes: Some(vec![Volume {
                        name: "kubelet-device-plugins".to_string(),
                        host_path: Some(HostPathVolumeSource {
                            path: "/var/lib/kubelet/device-plugins".to_string(),
                            type_: Some("Directory".to_string()),
                        }),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    })
}

/// Stamp the hash of the desired labels and spec into the annotations.
///
/// A field dropped from the desired spec changes the hash, so the live object
/// is rewritten even though the remaining fields still match.
fn with_template_hash(mut ds: DaemonSet) -> Result<DaemonSet> {
    let hash = hash_value(&(&ds.metadata.labels, &ds.spec))?;
    ds.metadata
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(DAEMONSET_HASH_ANNOTATION.to_string(), hash);
    Ok(ds)
}

/// Whether `live` already has every field of `desired`, hash included
fn up_to_date(desired: &DaemonSet, live: &DaemonSet) -> Result<bool> {
    let desired = serde_json::to_value(desired)?;
    let live = serde_json::to_value(live)?;
    Ok(is_subset(&desired, &live))
}

/// Reconciles the DaemonSets of a Module
#[derive(Clone)]
pub struct DaemonSetManager {
    store: Arc<dyn DaemonSetStore>,
}

impl DaemonSetManager {
    pub fn new(store: Arc<dyn DaemonSetStore>) -> Self {
        Self { store }
    }

    /// Index the DaemonSets of a Module by their kernel version label
    pub async fn module_daemonsets_by_kernel_version(
        &self,
        module_name: &str,
        namespace: &str,
    ) -> Result<DaemonSetIndex> {
        let labels = BTreeMap::from([(MODULE_NAME_LABEL.to_string(), module_name.to_string())]);
        let mut index = DaemonSetIndex::new();

        for ds in self.store.list_daemonsets(namespace, &labels).await? {
            let kernel_version = ds
                .labels()
                .get(KERNEL_VERSION_LABEL)
                .cloned()
                .unwrap_or_else(|| DEVICE_PLUGIN_KERNEL_VERSION.to_string());
            if let Some(previous) = index.get(&kernel_version) {
                warn!(
                    "DaemonSets {} and {} both target kernel {:?}, keeping the first",
                    previous.name_any(),
                    ds.name_any(),
                    kernel_version
                );
                continue;
            }
            index.insert(kernel_version, ds);
        }

        Ok(index)
    }

    async fn create_or_patch(
        &self,
        namespace: &str,
        desired: DaemonSet,
        existing: Option<&DaemonSet>,
    ) -> Result<()> {
        let desired = with_template_hash(desired)?;
        let name = match existing {
            Some(live) => {
                let name = live.name_any();
                if up_to_date(&desired, live)? {
                    debug!("DaemonSet {}/{} is up to date", namespace, name);
                    return Ok(());
                }
                info!("Patching DaemonSet {}/{}", namespace, name);
                name
            }
            None => {
                let name = desired.name_any();
                info!("Creating DaemonSet {}/{}", namespace, name);
                name
            }
        };

        self.store.apply_daemonset(namespace, &name, &desired).await
    }

    #[instrument(skip(self, cfg, index), fields(module = %cfg.name, kernel = %cfg.kernel_version))]
    pub async fn reconcile_driver_container(
        &self,
        cfg: &ResolvedKernelConfig,
        index: &DaemonSetIndex,
    ) -> Result<()> {
        let existing = index.get(&cfg.kernel_version);
        let desired = module_loader_daemonset(cfg, existing.map(|d| d.name_any()).as_deref());
        self.create_or_patch(&cfg.namespace, desired, existing).await
    }

    pub async fn reconcile_device_plugin(&self, module: &Module, index: &DaemonSetIndex) -> Result<()> {
        let desired = match device_plugin_daemonset(module) {
            Some(ds) => ds,
            None => return Ok(()),
        };
        let namespace = module.namespace().unwrap_or_else(|| "default".to_string());
        let existing = index.get(DEVICE_PLUGIN_KERNEL_VERSION);
        self.create_or_patch(&namespace, desired, existing).await
    }

    /// Delete module loader DaemonSets whose kernel version is no longer targeted
    pub async fn garbage_collect(
        &self,
        namespace: &str,
        index: &DaemonSetIndex,
        valid_kernels: &BTreeSet<String>,
    ) -> Result<Vec<String>> {
        let mut deleted = Vec::new();

        for (kernel_version, ds) in index {
            if is_device_plugin_kernel_version(kernel_version) || valid_kernels.contains(kernel_version) {
                continue;
            }
            let name = ds.name_any();
            self.store.delete_daemonset(namespace, &name).await?;
            deleted.push(name);
        }

        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::fake::FakeCluster;
    use crate::crd::{DevicePluginContainerSpec, DevicePluginSpec, LocalObjectReference, ModprobeArgs, ModuleSpec};

    fn test_config(kernel: &str) -> ResolvedKernelConfig {
        ResolvedKernelConfig {
            name: "simple-kmod".to_string(),
            namespace: "ns".to_string(),
            kernel_version: kernel.to_string(),
            container_image: format!("quay.io/org/kmod:{}", kernel),
            image_pull_policy: "IfNotPresent".to_string(),
            selector: BTreeMap::from([("kmm".to_string(), "yes".to_string())]),
            modprobe: ModprobeSpec {
                module_name: "simple_kmod".to_string(),
                dir_name: "/opt".to_string(),
                parameters: vec!["debug=1".to_string()],
                ..Default::default()
            },
            image_repo_secret: Some(LocalObjectReference::new("pull")),
            owner: OwnerRef {
                uid: "uid-1".to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_modprobe_commands() {
        let mut spec = test_config("5.14.0").modprobe;
        let (load, unload) = modprobe_commands(&spec);
        assert_eq!(load, vec!["modprobe", "-v", "-d", "/opt", "simple_kmod", "debug=1"]);
        assert_eq!(unload, vec!["modprobe", "-rv", "-d", "/opt", "simple_kmod"]);

        spec.raw_args = Some(ModprobeArgs {
            load: vec!["-a".to_string(), "foo".to_string()],
            unload: vec!["-r".to_string(), "foo".to_string()],
        });
        let (load, unload) = modprobe_commands(&spec);
        assert_eq!(load, vec!["modprobe", "-a", "foo"]);
        assert_eq!(unload, vec!["modprobe", "-r", "foo"]);
    }

    #[test]
    fn test_module_loader_node_selector_pins_kernel() {
        let ds = module_loader_daemonset(&test_config("5.14.0"), None);
        assert_eq!(ds.metadata.name, Some(module_loader_name("simple-kmod", "5.14.0")));
        assert_ne!(
            module_loader_name("simple-kmod", "5.14.0"),
            module_loader_name("simple-kmod", "6.0.0")
        );

        let pod = ds.spec.unwrap().template.spec.unwrap();
        let selector = pod.node_selector.unwrap();
        assert_eq!(selector.get("kmm").map(String::as_str), Some("yes"));
        assert_eq!(selector.get(KERNEL_VERSION_LABEL).map(String::as_str), Some("5.14.0"));
        assert_eq!(pod.image_pull_secrets.unwrap()[0].name.as_deref(), Some("pull"));
    }

    #[tokio::test]
    async fn test_create_then_no_write_when_unchanged() {
        let fake = Arc::new(FakeCluster::default());
        let dm = DaemonSetManager::new(fake.clone());
        let cfg = test_config("5.14.0");

        dm.reconcile_driver_container(&cfg, &DaemonSetIndex::new())
            .await
            .unwrap();
        assert_eq!(fake.daemonsets().len(), 1);

        let index = dm
            .module_daemonsets_by_kernel_version("simple-kmod", "ns")
            .await
            .unwrap();
        assert!(index.contains_key("5.14.0"));

        let writes = fake.write_count();
        dm.reconcile_driver_container(&cfg, &index).await.unwrap();
        assert_eq!(fake.write_count(), writes);

        let mut changed = cfg.clone();
        changed.container_image = "quay.io/org/kmod:rebuilt".to_string();
        dm.reconcile_driver_container(&changed, &index).await.unwrap();
        assert_eq!(fake.write_count(), writes + 1);
        assert_eq!(fake.daemonsets().len(), 1);
    }

    #[tokio::test]
    async fn test_removed_fields_are_rewritten() {
        let fake = Arc::new(FakeCluster::default());
        let dm = DaemonSetManager::new(fake.clone());
        let mut cfg = test_config("5.14.0");
        cfg.service_account_name = Some("sa".to_string());

        dm.reconcile_driver_container(&cfg, &DaemonSetIndex::new())
            .await
            .unwrap();
        let index = dm
            .module_daemonsets_by_kernel_version("simple-kmod", "ns")
            .await
            .unwrap();
        let writes = fake.write_count();

        cfg.image_repo_secret = None;
        cfg.service_account_name = None;
        dm.reconcile_driver_container(&cfg, &index).await.unwrap();
        assert_eq!(fake.write_count(), writes + 1);

        let daemonsets = fake.daemonsets();
        assert_eq!(daemonsets.len(), 1);
        let pod = daemonsets[0].spec.clone().unwrap().template.spec.unwrap();
        assert!(pod.image_pull_secrets.is_none());
        assert!(pod.service_account_name.is_none());

        let index = dm
            .module_daemonsets_by_kernel_version("simple-kmod", "ns")
            .await
            .unwrap();
        dm.reconcile_driver_container(&cfg, &index).await.unwrap();
        assert_eq!(fake.write_count(), writes + 1);
    }

    #[tokio::test]
    async fn test_garbage_collect_stale_kernels_only() {
        let fake = Arc::new(FakeCluster::default());
        let dm = DaemonSetManager::new(fake.clone());

        for kernel in ["5.14.0", "6.0.0"] {
            fake.insert_daemonset(module_loader_daemonset(&test_config(kernel), None));
        }
        let mut module = Module::new(
            "simple-kmod",
            ModuleSpec {
                module_loader: Default::default(),
                device_plugin: Some(DevicePluginSpec {
                    container: DevicePluginContainerSpec {
                        image: "dp".to_string(),
                        ..Default::default()
                    },
                    service_account_name: None,
                }),
                image_repo_secret: None,
                selector: BTreeMap::new(),
            },
        );
        module.metadata.namespace = Some("ns".to_string());
        dm.reconcile_device_plugin(&module, &DaemonSetIndex::new())
            .await
            .unwrap();

        let index = dm
            .module_daemonsets_by_kernel_version("simple-kmod", "ns")
            .await
            .unwrap();
        assert_eq!(index.len(), 3);
        assert!(index.contains_key(DEVICE_PLUGIN_KERNEL_VERSION));

        let valid = BTreeSet::from(["6.0.0".to_string()]);
        let deleted = dm.garbage_collect("ns", &index, &valid).await.unwrap();
        assert_eq!(deleted.len(), 1);
        assert_eq!(deleted[0], index["5.14.0"].name_any());
        assert_eq!(fake.daemonsets().len(), 2);
    }
}

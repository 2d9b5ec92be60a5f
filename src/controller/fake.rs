//! In-memory cluster used by the controller tests

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetStatus};
use k8s_openapi::api::batch::v1::{Job, JobStatus};
use k8s_openapi::api::core::v1::{Node, NodeStatus, NodeSystemInfo, Taint};
use kube::api::ObjectMeta;
use kube::ResourceExt;

use super::store::{ClusterReader, DaemonSetStore, JobStore, MaterialReader, ModuleStatusStore};
use crate::crd::{Module, TlsOptions};
use crate::error::{Error, Result};
use crate::registry::{Registry, RegistryAuth};

fn matches_labels(meta: &ObjectMeta, selector: &BTreeMap<String, String>) -> bool {
    let labels = meta.labels.clone().unwrap_or_default();
    selector.iter().all(|(k, v)| labels.get(k) == Some(v))
}

pub fn job_with_status(status: JobStatus) -> Job {
    Job {
        metadata: ObjectMeta {
            name: Some("job".to_string()),
            ..Default::default()
        },
        status: Some(status),
        ..Default::default()
    }
}

pub fn test_node(name: &str, kernel: &str, labels: &[(&str, &str)], no_schedule: bool) -> Node {
    Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(
                labels
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            ..Default::default()
        },
        spec: Some(k8s_openapi::api::core::v1::NodeSpec {
            taints: no_schedule.then(|| {
                vec![Taint {
                    effect: "NoSchedule".to_string(),
                    key: "node.kubernetes.io/unschedulable".to_string(),
                    ..Default::default()
                }]
            }),
            ..Default::default()
        }),
        status: Some(NodeStatus {
            node_info: Some(NodeSystemInfo {
                kernel_version: kernel.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
    }
}

/// Object store, material source and registry in one, counting every write
#[derive(Default)]
pub struct FakeCluster {
    modules: Mutex<Vec<Module>>,
    nodes: Mutex<Vec<Node>>,
    jobs: Mutex<Vec<Job>>,
    daemonsets: Mutex<Vec<DaemonSet>>,
    secrets: Mutex<BTreeMap<(String, String), Vec<u8>>>,
    config_maps: Mutex<BTreeMap<(String, String), String>>,
    images: Mutex<BTreeSet<String>>,
    status_patches: Mutex<Vec<serde_json::Value>>,
    deleted_jobs: Mutex<Vec<String>>,
    deleted_daemonsets: Mutex<Vec<String>>,
    writes: AtomicUsize,
    names: AtomicUsize,
    pub fail_daemonset_deletes: AtomicBool,
    pub fail_list_nodes: AtomicBool,
}

impl FakeCluster {
    fn next_name(&self, meta: &ObjectMeta) -> String {
        meta.name.clone().unwrap_or_else(|| {
            let n = self.names.fetch_add(1, Ordering::SeqCst);
            format!("{}{}", meta.generate_name.clone().unwrap_or_default(), n)
        })
    }

    fn write(&self) {
        self.writes.fetch_add(1, Ordering::SeqCst);
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn add_module(&self, module: Module) {
        self.modules.lock().unwrap().push(module);
    }

    pub fn add_node(&self, node: Node) {
        self.nodes.lock().unwrap().push(node);
    }

    pub fn add_secret(&self, name: &str, key: &str, data: &[u8]) {
        self.secrets
            .lock()
            .unwrap()
            .insert((name.to_string(), key.to_string()), data.to_vec());
    }

    pub fn add_config_map(&self, name: &str, key: &str, data: &str) {
        self.config_maps
            .lock()
            .unwrap()
            .insert((name.to_string(), key.to_string()), data.to_string());
    }

    pub fn add_image(&self, image: &str) {
        self.images.lock().unwrap().insert(image.to_string());
    }

    pub fn jobs(&self) -> Vec<Job> {
        self.jobs.lock().unwrap().clone()
    }

    pub fn daemonsets(&self) -> Vec<DaemonSet> {
        self.daemonsets.lock().unwrap().clone()
    }

    pub fn deleted_jobs(&self) -> Vec<String> {
        self.deleted_jobs.lock().unwrap().clone()
    }

    pub fn deleted_daemonsets(&self) -> Vec<String> {
        self.deleted_daemonsets.lock().unwrap().clone()
    }

    pub fn status_patches(&self) -> Vec<serde_json::Value> {
        self.status_patches.lock().unwrap().clone()
    }

    /// Insert a Job without counting a write. Returns its name.
    pub fn insert_job(&self, mut job: Job) -> String {
        let name = self.next_name(&job.metadata);
        job.metadata.name = Some(name.clone());
        self.jobs.lock().unwrap().push(job);
        name
    }

    /// Insert a DaemonSet without counting a write. Returns its name.
    pub fn insert_daemonset(&self, mut ds: DaemonSet) -> String {
        let name = self.next_name(&ds.metadata);
        ds.metadata.name = Some(name.clone());
        self.daemonsets.lock().unwrap().push(ds);
        name
    }

    pub fn set_job_status(&self, name: &str, active: i32, succeeded: i32, failed: i32) {
        let mut jobs = self.jobs.lock().unwrap();
        for job in jobs.iter_mut().filter(|j| j.name_any() == name) {
            job.status = Some(JobStatus {
                active: Some(active),
                succeeded: Some(succeeded),
                failed: Some(failed),
                ..Default::default()
            });
        }
    }

    pub fn set_daemonset_available(&self, name: &str, available: i32) {
        let mut daemonsets = self.daemonsets.lock().unwrap();
        for ds in daemonsets.iter_mut().filter(|d| d.name_any() == name) {
            ds.status = Some(DaemonSetStatus {
                number_available: Some(available),
                ..Default::default()
            });
        }
    }
}

#[async_trait]
impl ClusterReader for FakeCluster {
    async fn get_module(&self, namespace: &str, name: &str) -> Result<Option<Module>> {
        Ok(self
            .modules
            .lock()
            .unwrap()
            .iter()
            .find(|m| m.name_any() == name && m.namespace().as_deref() == Some(namespace))
            .cloned())
    }

    async fn list_modules(&self) -> Result<Vec<Module>> {
        Ok(self.modules.lock().unwrap().clone())
    }

    async fn list_nodes(&self, selector: &BTreeMap<String, String>) -> Result<Vec<Node>> {
        if self.fail_list_nodes.load(Ordering::SeqCst) {
            return Err(Error::ConfigError("injected list failure".to_string()));
        }
        Ok(self
            .nodes
            .lock()
            .unwrap()
            .iter()
            .filter(|n| matches_labels(&n.metadata, selector))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl JobStore for FakeCluster {
    async fn list_jobs(&self, namespace: &str, labels: &BTreeMap<String, String>) -> Result<Vec<Job>> {
        Ok(self
            .jobs
            .lock()
            .unwrap()
            .iter()
            .filter(|j| j.namespace().as_deref() == Some(namespace))
            .filter(|j| matches_labels(&j.metadata, labels))
            .cloned()
            .collect())
    }

    async fn create_job(&self, _namespace: &str, job: &Job) -> Result<()> {
        self.write();
        self.insert_job(job.clone());
        Ok(())
    }

    async fn delete_job(&self, _namespace: &str, name: &str) -> Result<()> {
        self.write();
        self.jobs.lock().unwrap().retain(|j| j.name_any() != name);
        self.deleted_jobs.lock().unwrap().push(name.to_string());
        Ok(())
    }
}

#[async_trait]
impl DaemonSetStore for FakeCluster {
    async fn list_daemonsets(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<DaemonSet>> {
        Ok(self
            .daemonsets
            .lock()
            .unwrap()
            .iter()
            .filter(|d| d.namespace().as_deref() == Some(namespace))
            .filter(|d| matches_labels(&d.metadata, labels))
            .cloned()
            .collect())
    }

    async fn apply_daemonset(&self, _namespace: &str, name: &str, ds: &DaemonSet) -> Result<()> {
        self.write();
        let mut daemonsets = self.daemonsets.lock().unwrap();
        match daemonsets.iter_mut().find(|d| d.name_any() == name) {
            Some(existing) => {
                existing.metadata.labels = ds.metadata.labels.clone();
                existing.metadata.annotations = ds.metadata.annotations.clone();
                existing.metadata.owner_references = ds.metadata.owner_references.clone();
                existing.spec = ds.spec.clone();
            }
            None => {
                let mut ds = ds.clone();
                ds.metadata.name = Some(name.to_string());
                daemonsets.push(ds);
            }
        }
        Ok(())
    }

    async fn delete_daemonset(&self, _namespace: &str, name: &str) -> Result<()> {
        if self.fail_daemonset_deletes.load(Ordering::SeqCst) {
            return Err(Error::ConfigError("injected delete failure".to_string()));
        }
        self.write();
        self.daemonsets.lock().unwrap().retain(|d| d.name_any() != name);
        self.deleted_daemonsets.lock().unwrap().push(name.to_string());
        Ok(())
    }
}

#[async_trait]
impl ModuleStatusStore for FakeCluster {
    async fn patch_module_status(
        &self,
        _namespace: &str,
        _name: &str,
        patch: &serde_json::Value,
    ) -> Result<()> {
        self.write();
        self.status_patches.lock().unwrap().push(patch.clone());
        Ok(())
    }
}

#[async_trait]
impl MaterialReader for FakeCluster {
    async fn secret_data(&self, _namespace: &str, name: &str, key: &str) -> Result<Vec<u8>> {
        self.secrets
            .lock()
            .unwrap()
            .get(&(name.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| Error::ConfigError(format!("secret {} has no key {}", name, key)))
    }

    async fn config_map_data(&self, _namespace: &str, name: &str, key: &str) -> Result<String> {
        self.config_maps
            .lock()
            .unwrap()
            .get(&(name.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| Error::ConfigError(format!("configmap {} has no key {}", name, key)))
    }
}

#[async_trait]
impl Registry for FakeCluster {
    async fn image_exists(
        &self,
        image: &str,
        _tls: &TlsOptions,
        _auth: Option<&RegistryAuth>,
    ) -> Result<bool> {
        Ok(self.images.lock().unwrap().contains(image))
    }
}

//! Object store access used by the reconciler
//!
//! The reconciliation pipeline only talks to the cluster through the traits
//! below, so it can be driven by in-memory fakes in tests. [`KubeStore`] is
//! the `kube::Client` backed implementation used by the operator.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, Node, Secret};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams, PropagationPolicy};
use kube::Client;
use tracing::{debug, instrument};

use crate::crd::Module;
use crate::error::{Error, Result};
use crate::module::ResolvedKernelConfig;
use crate::registry::RegistryAuth;

/// Field manager used for every server-side apply
pub const FIELD_MANAGER: &str = "kmm-operator";

/// Read access to Modules and Nodes
#[async_trait]
pub trait ClusterReader: Send + Sync {
    /// `Ok(None)` when the Module no longer exists
    async fn get_module(&self, namespace: &str, name: &str) -> Result<Option<Module>>;

    /// Every Module in the cluster, for the inventory metrics
    async fn list_modules(&self) -> Result<Vec<Module>>;

    async fn list_nodes(&self, selector: &BTreeMap<String, String>) -> Result<Vec<Node>>;
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn list_jobs(&self, namespace: &str, labels: &BTreeMap<String, String>) -> Result<Vec<Job>>;

    async fn create_job(&self, namespace: &str, job: &Job) -> Result<()>;

    /// Delete with background propagation so the pods go with the Job
    async fn delete_job(&self, namespace: &str, name: &str) -> Result<()>;
}

#[async_trait]
pub trait DaemonSetStore: Send + Sync {
    async fn list_daemonsets(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<DaemonSet>>;

    /// Server-side apply, creating the DaemonSet when it does not exist yet
    async fn apply_daemonset(&self, namespace: &str, name: &str, ds: &DaemonSet) -> Result<()>;

    async fn delete_daemonset(&self, namespace: &str, name: &str) -> Result<()>;
}

#[async_trait]
pub trait ModuleStatusStore: Send + Sync {
    /// Apply a JSON merge patch to the status subresource
    async fn patch_module_status(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<()>;
}

/// Secret and ConfigMap contents that end up in job templates and hashes
#[async_trait]
pub trait MaterialReader: Send + Sync {
    async fn secret_data(&self, namespace: &str, name: &str, key: &str) -> Result<Vec<u8>>;

    async fn config_map_data(&self, namespace: &str, name: &str, key: &str) -> Result<String>;
}

/// Secret key holding the pull secret docker config
pub const DOCKER_CONFIG_KEY: &str = ".dockerconfigjson";

/// Registry credentials from the Module pull secret, if one is set
pub async fn registry_auth(
    materials: &dyn MaterialReader,
    cfg: &ResolvedKernelConfig,
) -> Result<Option<RegistryAuth>> {
    let secret = match &cfg.image_repo_secret {
        Some(secret) => secret,
        None => return Ok(None),
    };
    let data = materials
        .secret_data(&cfg.namespace, &secret.name, DOCKER_CONFIG_KEY)
        .await?;
    Ok(Some(RegistryAuth::from_docker_config(&data)?))
}

/// Render a label map as an equality-based selector string
pub fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// Cluster store backed by the API server
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ClusterReader for KubeStore {
    async fn get_module(&self, namespace: &str, name: &str) -> Result<Option<Module>> {
        let api: Api<Module> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn list_modules(&self) -> Result<Vec<Module>> {
        let api: Api<Module> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    #[instrument(skip(self))]
    async fn list_nodes(&self, selector: &BTreeMap<String, String>) -> Result<Vec<Node>> {
        let api: Api<Node> = Api::all(self.client.clone());
        let lp = ListParams::default().labels(&label_selector(selector));
        let nodes = api.list(&lp).await?;
        debug!("Listed {} nodes", nodes.items.len());
        Ok(nodes.items)
    }
}

#[async_trait]
impl JobStore for KubeStore {
    async fn list_jobs(&self, namespace: &str, labels: &BTreeMap<String, String>) -> Result<Vec<Job>> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        let lp = ListParams::default().labels(&label_selector(labels));
        Ok(api.list(&lp).await?.items)
    }

    async fn create_job(&self, namespace: &str, job: &Job) -> Result<()> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), job).await?;
        Ok(())
    }

    async fn delete_job(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        let dp = DeleteParams {
            propagation_policy: Some(PropagationPolicy::Background),
            ..Default::default()
        };
        match api.delete(name, &dp).await.map_err(Error::from) {
            Err(e) if e.is_not_found() => Ok(()),
            res => res.map(|_| ()),
        }
    }
}

#[async_trait]
impl DaemonSetStore for KubeStore {
    async fn list_daemonsets(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<DaemonSet>> {
        let api: Api<DaemonSet> = Api::namespaced(self.client.clone(), namespace);
        let lp = ListParams::default().labels(&label_selector(labels));
        Ok(api.list(&lp).await?.items)
    }

    async fn apply_daemonset(&self, namespace: &str, name: &str, ds: &DaemonSet) -> Result<()> {
        let api: Api<DaemonSet> = Api::namespaced(self.client.clone(), namespace);
        api.patch(name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(ds))
            .await?;
        Ok(())
    }

    async fn delete_daemonset(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<DaemonSet> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await.map_err(Error::from) {
            Err(e) if e.is_not_found() => Ok(()),
            res => res.map(|_| ()),
        }
    }
}

#[async_trait]
impl ModuleStatusStore for KubeStore {
    async fn patch_module_status(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<()> {
        let api: Api<Module> = Api::namespaced(self.client.clone(), namespace);
        api.patch_status(name, &PatchParams::default(), &Patch::Merge(patch))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl MaterialReader for KubeStore {
    async fn secret_data(&self, namespace: &str, name: &str, key: &str) -> Result<Vec<u8>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = api.get(name).await?;
        secret
            .data
            .and_then(|mut d| d.remove(key))
            .map(|b| b.0)
            .ok_or_else(|| {
                Error::ConfigError(format!("secret {}/{} has no key {}", namespace, name, key))
            })
    }

    async fn config_map_data(&self, namespace: &str, name: &str, key: &str) -> Result<String> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        let cm = api.get(name).await?;
        cm.data.and_then(|mut d| d.remove(key)).ok_or_else(|| {
            Error::ConfigError(format!("configmap {}/{} has no key {}", namespace, name, key))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_selector_rendering() {
        let labels = BTreeMap::from([
            ("kmm.node.kubernetes.io/module.name".to_string(), "m".to_string()),
            ("node-role.kubernetes.io/worker".to_string(), String::new()),
        ]);
        assert_eq!(
            label_selector(&labels),
            "kmm.node.kubernetes.io/module.name=m,node-role.kubernetes.io/worker="
        );
        assert_eq!(label_selector(&BTreeMap::new()), "");
    }
}

//! Job lifecycle management shared by the build and sign stages
//!
//! Each (module, kernel version, stage) owns at most one Job. The desired Job
//! carries a content hash in an annotation; a live Job with a different hash
//! is deleted and recreated on a later pass, a live Job with the same hash
//! reports its progress through [`JobStatus`].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use k8s_openapi::api::batch::v1::Job;
use kube::ResourceExt;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};

use super::store::JobStore;
use super::{MODULE_NAME_LABEL, TARGET_KERNEL_LABEL};
use crate::error::{Error, Result};
use crate::module::OwnerRef;

pub const JOB_TYPE_LABEL: &str = "kmm.node.kubernetes.io/job-type";
pub const JOB_HASH_ANNOTATION: &str = "kmm.node.kubernetes.io/last-hash";

/// Pipeline stage a Job implements
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Stage {
    Build,
    Sign,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Build => "build",
            Stage::Sign => "sign",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobStatus {
    Created,
    InProgress,
    Completed,
    Failed,
}

/// Labels identifying the Job of one stage for one kernel version
pub fn job_labels(module_name: &str, kernel_version: &str, stage: Stage) -> BTreeMap<String, String> {
    let mut labels = module_stage_labels(module_name, stage);
    labels.insert(TARGET_KERNEL_LABEL.to_string(), kernel_version.to_string());
    labels
}

/// Labels matching every Job of one stage for a Module, across kernel versions
pub fn module_stage_labels(module_name: &str, stage: Stage) -> BTreeMap<String, String> {
    BTreeMap::from([
        (MODULE_NAME_LABEL.to_string(), module_name.to_string()),
        (JOB_TYPE_LABEL.to_string(), stage.as_str().to_string()),
    ])
}

/// SHA-256 hex digest of the JSON form of `value`
pub fn hash_value<T: Serialize>(value: &T) -> Result<String> {
    let bytes = serde_json::to_vec(value)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

fn job_hash(job: &Job) -> Option<&str> {
    job.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(JOB_HASH_ANNOTATION))
        .map(String::as_str)
}

/// Map the Job counters onto a [`JobStatus`]
pub fn job_status(job: &Job) -> Result<JobStatus> {
    let status = job.status.clone().unwrap_or_default();
    let active = status.active.unwrap_or(0);
    let succeeded = status.succeeded.unwrap_or(0);
    let failed = status.failed.unwrap_or(0);

    if failed > 0 && active == 0 && succeeded == 0 {
        Ok(JobStatus::Failed)
    } else if active > 0 {
        Ok(JobStatus::InProgress)
    } else if succeeded > 0 {
        Ok(JobStatus::Completed)
    } else {
        Err(Error::UnknownJobStatus(job.name_any()))
    }
}

fn is_succeeded(job: &Job) -> bool {
    job.status
        .as_ref()
        .and_then(|s| s.succeeded)
        .map(|n| n >= 1)
        .unwrap_or(false)
}

/// Idempotent create-or-replace of stage Jobs
#[derive(Clone)]
pub struct JobManager {
    store: Arc<dyn JobStore>,
}

impl JobManager {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    async fn owned_jobs(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
        owner: &OwnerRef,
    ) -> Result<Vec<Job>> {
        let jobs = self.store.list_jobs(namespace, labels).await?;
        Ok(jobs
            .into_iter()
            .filter(|j| owner.is_controller_of(j.metadata.owner_references.as_ref()))
            .collect())
    }

    /// The single owned Job of a stage, if any
    pub async fn get_job(
        &self,
        namespace: &str,
        module_name: &str,
        kernel_version: &str,
        stage: Stage,
        owner: &OwnerRef,
    ) -> Result<Option<Job>> {
        let labels = job_labels(module_name, kernel_version, stage);
        let mut jobs = self.owned_jobs(namespace, &labels, owner).await?;

        match jobs.len() {
            0 => Ok(None),
            1 => Ok(jobs.pop()),
            n => Err(Error::InvariantViolation(format!(
                "expected at most one {} job for module {}/{} and kernel {}, found {}",
                stage, namespace, module_name, kernel_version, n
            ))),
        }
    }

    /// Reconcile the live Job of a stage against `desired`.
    ///
    /// Performs at most one write: a create when no Job exists, a delete when
    /// the live Job has a different hash, nothing otherwise.
    #[instrument(skip(self, desired, owner), fields(stage = %stage))]
    pub async fn sync(
        &self,
        namespace: &str,
        module_name: &str,
        kernel_version: &str,
        stage: Stage,
        desired: &Job,
        owner: &OwnerRef,
    ) -> Result<JobStatus> {
        let desired_hash = job_hash(desired)
            .ok_or_else(|| Error::MissingHashAnnotation(format!("desired {} job", stage)))?;

        let existing = self
            .get_job(namespace, module_name, kernel_version, stage, owner)
            .await?;

        let job = match existing {
            None => {
                info!(
                    "Creating {} job for module {}/{} kernel {}",
                    stage, namespace, module_name, kernel_version
                );
                self.store.create_job(namespace, desired).await?;
                return Ok(JobStatus::Created);
            }
            Some(job) => job,
        };

        if job_hash(&job) != Some(desired_hash) {
            info!(
                "{} job {} is out of date, deleting it",
                stage,
                job.name_any()
            );
            self.store.delete_job(namespace, &job.name_any()).await?;
            return Ok(JobStatus::InProgress);
        }

        let status = job_status(&job)?;
        debug!("{} job {} status: {:?}", stage, job.name_any(), status);
        if status == JobStatus::Failed {
            warn!(
                "{} job {} failed; delete it to retry",
                stage,
                job.name_any()
            );
        }
        Ok(status)
    }

    /// Delete every owned, succeeded Job of a stage. Returns the deleted names.
    #[instrument(skip(self, owner), fields(stage = %stage))]
    pub async fn garbage_collect(
        &self,
        namespace: &str,
        module_name: &str,
        stage: Stage,
        owner: &OwnerRef,
    ) -> Result<Vec<String>> {
        let labels = module_stage_labels(module_name, stage);
        let mut deleted = Vec::new();

        for job in self.owned_jobs(namespace, &labels, owner).await? {
            if !is_succeeded(&job) {
                continue;
            }
            let name = job.name_any();
            self.store.delete_job(namespace, &name).await?;
            deleted.push(name);
        }

        Ok(deleted)
    }
}

//! In-cluster build stage
//!
//! Builds the module image for one kernel version with a kaniko Job. When
//! the image is signed afterwards, the build pushes the intermediate
//! (unsigned) image and the sign stage produces the final one.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Container, KeyToPath, PodSpec, PodTemplateSpec, SecretVolumeSource,
    Volume, VolumeMount,
};
use kube::api::ObjectMeta;
use tracing::{debug, instrument};

use super::job::{hash_value, job_labels, JobManager, JobStatus, Stage, JOB_HASH_ANNOTATION};
use super::store::{registry_auth, MaterialReader, DOCKER_CONFIG_KEY};
use crate::crd::Build;
use crate::error::{Error, Result};
use crate::module::{intermediate_image_name, OwnerRef, ResolvedKernelConfig};
use crate::registry::Registry;

/// ConfigMap key holding the Dockerfile
pub const DOCKERFILE_KEY: &str = "dockerfile";

const WORKSPACE_DIR: &str = "/workspace";
const KANIKO_DOCKER_DIR: &str = "/kaniko/.docker";

#[async_trait]
pub trait BuildManager: Send + Sync {
    /// Whether a build is declared and its image is not available yet
    async fn should_sync(&self, cfg: &ResolvedKernelConfig) -> Result<bool>;

    async fn sync(&self, cfg: &ResolvedKernelConfig, push_image: bool) -> Result<JobStatus>;

    /// Delete succeeded build Jobs of a Module, returning their names
    async fn garbage_collect(
        &self,
        module_name: &str,
        namespace: &str,
        owner: &OwnerRef,
    ) -> Result<Vec<String>>;
}

/// Renders build Job templates
#[derive(Clone)]
pub struct BuildJobMaker {
    builder_image: String,
    materials: Arc<dyn MaterialReader>,
}

impl BuildJobMaker {
    pub fn new(builder_image: impl Into<String>, materials: Arc<dyn MaterialReader>) -> Self {
        Self {
            builder_image: builder_image.into(),
            materials,
        }
    }

    /// Image the build pushes for this config
    pub fn destination(cfg: &ResolvedKernelConfig) -> String {
        if cfg.sign.is_some() {
            intermediate_image_name(&cfg.name, &cfg.namespace, &cfg.container_image)
        } else {
            cfg.container_image.clone()
        }
    }

    pub async fn make_job_template(
        &self,
        cfg: &ResolvedKernelConfig,
        build: &Build,
        push_image: bool,
    ) -> Result<Job> {
        let template = self.pod_template(cfg, build, push_image);

        let dockerfile = self
            .materials
            .config_map_data(&cfg.namespace, &build.dockerfile_config_map.name, DOCKERFILE_KEY)
            .await?;
        let hash = hash_value(&(&template, &dockerfile))?;

        Ok(Job {
            metadata: ObjectMeta {
                generate_name: Some(format!("{}-build-", cfg.name)),
                namespace: Some(cfg.namespace.clone()),
                labels: Some(job_labels(&cfg.name, &cfg.kernel_version, Stage::Build)),
                annotations: Some(BTreeMap::from([(JOB_HASH_ANNOTATION.to_string(), hash)])),
                owner_references: Some(vec![cfg.owner.to_owner_reference()]),
                ..Default::default()
            },
            spec: Some(JobSpec {
                completions: Some(1),
                backoff_limit: Some(0),
                template,
                ..Default::default()
            }),
            status: None,
        })
    }

    fn pod_template(&self, cfg: &ResolvedKernelConfig, build: &Build, push_image: bool) -> PodTemplateSpec {
        let mut args = vec![
            format!("--dockerfile={}/Dockerfile", WORKSPACE_DIR),
            format!("--context=dir://{}", WORKSPACE_DIR),
        ];

        if push_image {
            args.push(format!("--destination={}", Self::destination(cfg)));
            if cfg.registry_tls.insecure {
                args.push("--insecure".to_string());
            }
            if cfg.registry_tls.insecure_skip_tls_verify {
                args.push("--skip-tls-verify".to_string());
            }
        } else {
            args.push("--no-push".to_string());
        }

        if build.base_image_registry_tls.insecure {
            args.push("--insecure-pull".to_string());
        }
        if build.base_image_registry_tls.insecure_skip_tls_verify {
            args.push("--skip-tls-verify-pull".to_string());
        }

        let mut build_args = vec![
            ("KERNEL_VERSION".to_string(), cfg.kernel_version.clone()),
            ("KERNEL_FULL_VERSION".to_string(), cfg.kernel_version.clone()),
            ("MOD_NAME".to_string(), cfg.name.clone()),
            ("MOD_NAMESPACE".to_string(), cfg.namespace.clone()),
        ];
        build_args.extend(build.build_args.iter().map(|a| (a.name.clone(), a.value.clone())));
        args.extend(
            build_args
                .into_iter()
                .map(|(name, value)| format!("--build-arg={}={}", name, value)),
        );

        let mut volumes = vec![Volume {
            name: "dockerfile".to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: Some(build.dockerfile_config_map.name.clone()),
                items: Some(vec![KeyToPath {
                    key: DOCKERFILE_KEY.to_string(),
                    path: "Dockerfile".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }];
        let mut mounts = vec![VolumeMount {
            name: "dockerfile".to_string(),
            mount_path: WORKSPACE_DIR.to_string(),
            read_only: Some(true),
            ..Default::default()
        }];

        if let Some(secret) = &cfg.image_repo_secret {
            volumes.push(secret_volume(
                "pull-secret",
                &secret.name,
                Some((DOCKER_CONFIG_KEY, "config.json")),
            ));
            mounts.push(read_only_mount("pull-secret", KANIKO_DOCKER_DIR));
        }

        for secret in &build.secrets {
            let volume_name = format!("secret-{}", secret.name);
            volumes.push(secret_volume(&volume_name, &secret.name, None));
            mounts.push(read_only_mount(&volume_name, &format!("/run/secrets/{}", secret.name)));
        }

        PodTemplateSpec {
            metadata: None,
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "kaniko".to_string(),
                    image: Some(self.builder_image.clone()),
                    args: Some(args),
                    volume_mounts: Some(mounts),
                    ..Default::default()
                }],
                restart_policy: Some("Never".to_string()),
                volumes: Some(volumes),
                node_selector: Some(cfg.selector.clone()),
                ..Default::default()
            }),
        }
    }
}

/// Secret volume, optionally projecting a single key to a path
pub(crate) fn secret_volume(volume_name: &str, secret_name: &str, item: Option<(&str, &str)>) -> Volume {
    Volume {
        name: volume_name.to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(secret_name.to_string()),
            items: item.map(|(key, path)| {
                vec![KeyToPath {
                    key: key.to_string(),
                    path: path.to_string(),
                    ..Default::default()
                }]
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub(crate) fn read_only_mount(volume_name: &str, path: &str) -> VolumeMount {
    VolumeMount {
        name: volume_name.to_string(),
        mount_path: path.to_string(),
        read_only: Some(true),
        ..Default::default()
    }
}

/// Build stage backed by kaniko Jobs
pub struct BuildJobManager {
    jobs: JobManager,
    maker: BuildJobMaker,
    registry: Arc<dyn Registry>,
    materials: Arc<dyn MaterialReader>,
}

impl BuildJobManager {
    pub fn new(
        jobs: JobManager,
        maker: BuildJobMaker,
        registry: Arc<dyn Registry>,
        materials: Arc<dyn MaterialReader>,
    ) -> Self {
        Self {
            jobs,
            maker,
            registry,
            materials,
        }
    }
}

#[async_trait]
impl BuildManager for BuildJobManager {
    async fn should_sync(&self, cfg: &ResolvedKernelConfig) -> Result<bool> {
        if cfg.build.is_none() {
            return Ok(false);
        }
        let auth = registry_auth(self.materials.as_ref(), cfg).await?;
        let exists = self
            .registry
            .image_exists(&cfg.container_image, &cfg.registry_tls, auth.as_ref())
            .await?;
        debug!("Image {} exists: {}", cfg.container_image, exists);
        Ok(!exists)
    }

    #[instrument(skip(self, cfg), fields(module = %cfg.name, kernel = %cfg.kernel_version))]
    async fn sync(&self, cfg: &ResolvedKernelConfig, push_image: bool) -> Result<JobStatus> {
        let build = cfg.build.as_ref().ok_or_else(|| {
            Error::ConfigError(format!(
                "module {}/{} has no build for kernel {}",
                cfg.namespace, cfg.name, cfg.kernel_version
            ))
        })?;

        let desired = self.maker.make_job_template(cfg, build, push_image).await?;
        self.jobs
            .sync(
                &cfg.namespace,
                &cfg.name,
                &cfg.kernel_version,
                Stage::Build,
                &desired,
                &cfg.owner,
            )
            .await
    }

    async fn garbage_collect(
        &self,
        module_name: &str,
        namespace: &str,
        owner: &OwnerRef,
    ) -> Result<Vec<String>> {
        self.jobs
            .garbage_collect(namespace, module_name, Stage::Build, owner)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::fake::FakeCluster;
    use crate::crd::{BuildArg, LocalObjectReference, Sign};

    fn test_config() -> ResolvedKernelConfig {
        ResolvedKernelConfig {
            name: "simple-kmod".to_string(),
            namespace: "ns".to_string(),
            kernel_version: "5.14.0".to_string(),
            container_image: "quay.io/org/kmod:5.14.0".to_string(),
            build: Some(Build {
                build_args: vec![BuildArg::new("EXTRA", "1")],
                dockerfile_config_map: LocalObjectReference::new("dockerfile-cm"),
                base_image_registry_tls: Default::default(),
                secrets: vec![LocalObjectReference::new("build-secret")],
            }),
            image_repo_secret: Some(LocalObjectReference::new("pull")),
            selector: BTreeMap::from([("kmm".to_string(), "yes".to_string())]),
            owner: OwnerRef {
                uid: "uid-1".to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn fake_with_material() -> Arc<FakeCluster> {
        let fake = Arc::new(FakeCluster::default());
        fake.add_config_map("dockerfile-cm", DOCKERFILE_KEY, "FROM scratch");
        fake.add_secret("pull", DOCKER_CONFIG_KEY, br#"{"auths":{}}"#);
        fake
    }

    fn manager(fake: &Arc<FakeCluster>) -> BuildJobManager {
        BuildJobManager::new(
            JobManager::new(fake.clone()),
            BuildJobMaker::new("gcr.io/kaniko-project/executor:latest", fake.clone()),
            fake.clone(),
            fake.clone(),
        )
    }

    fn container_args(job: &Job) -> Vec<String> {
        job.spec.as_ref().unwrap().template.spec.as_ref().unwrap().containers[0]
            .args
            .clone()
            .unwrap()
    }

    #[tokio::test]
    async fn test_template_targets_final_image_without_sign() {
        let fake = fake_with_material();
        let maker = BuildJobMaker::new("kaniko", fake.clone());
        let cfg = test_config();

        let job = maker
            .make_job_template(&cfg, cfg.build.as_ref().unwrap(), true)
            .await
            .unwrap();
        let args = container_args(&job);

        assert!(args.contains(&"--destination=quay.io/org/kmod:5.14.0".to_string()));
        assert!(args.contains(&"--build-arg=KERNEL_FULL_VERSION=5.14.0".to_string()));
        assert!(args.contains(&"--build-arg=MOD_NAMESPACE=ns".to_string()));
        assert!(args.contains(&"--build-arg=EXTRA=1".to_string()));
        assert_eq!(job.metadata.generate_name.as_deref(), Some("simple-kmod-build-"));

        let spec = job.spec.as_ref().unwrap();
        assert_eq!(spec.backoff_limit, Some(0));
        assert_eq!(spec.completions, Some(1));
        let pod = spec.template.spec.as_ref().unwrap();
        assert_eq!(pod.restart_policy.as_deref(), Some("Never"));
        assert_eq!(pod.node_selector, Some(cfg.selector.clone()));
        assert_eq!(pod.volumes.as_ref().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_template_targets_intermediate_image_with_sign() {
        let fake = fake_with_material();
        let maker = BuildJobMaker::new("kaniko", fake.clone());
        let mut cfg = test_config();
        cfg.sign = Some(Sign::default());

        let job = maker
            .make_job_template(&cfg, cfg.build.as_ref().unwrap(), true)
            .await
            .unwrap();
        assert!(container_args(&job)
            .contains(&"--destination=quay.io/org/kmod:5.14.0_ns_simple-kmod_kmm_unsigned".to_string()));
    }

    #[tokio::test]
    async fn test_hash_changes_with_dockerfile() {
        let fake = fake_with_material();
        let maker = BuildJobMaker::new("kaniko", fake.clone());
        let cfg = test_config();
        let build = cfg.build.as_ref().unwrap();

        let first = maker.make_job_template(&cfg, build, true).await.unwrap();
        let same = maker.make_job_template(&cfg, build, true).await.unwrap();
        fake.add_config_map("dockerfile-cm", DOCKERFILE_KEY, "FROM busybox");
        let changed = maker.make_job_template(&cfg, build, true).await.unwrap();

        let hash = |j: &Job| j.metadata.annotations.as_ref().unwrap()[JOB_HASH_ANNOTATION].clone();
        assert_eq!(hash(&first), hash(&same));
        assert_ne!(hash(&first), hash(&changed));
    }

    #[tokio::test]
    async fn test_should_sync_depends_on_registry() {
        let fake = fake_with_material();
        let bm = manager(&fake);
        let mut cfg = test_config();

        assert!(bm.should_sync(&cfg).await.unwrap());
        fake.add_image("quay.io/org/kmod:5.14.0");
        assert!(!bm.should_sync(&cfg).await.unwrap());

        cfg.build = None;
        assert!(!bm.should_sync(&cfg).await.unwrap());
    }

    #[tokio::test]
    async fn test_sync_creates_one_labelled_job() {
        let fake = fake_with_material();
        let bm = manager(&fake);
        let cfg = test_config();

        assert_eq!(bm.sync(&cfg, true).await.unwrap(), JobStatus::Created);
        let writes = fake.write_count();
        let jobs = fake.jobs();
        assert_eq!(jobs.len(), 1);
        let name = kube::ResourceExt::name_any(&jobs[0]);
        fake.set_job_status(&name, 0, 1, 0);

        assert_eq!(bm.sync(&cfg, true).await.unwrap(), JobStatus::Completed);
        assert_eq!(fake.write_count(), writes);

        let deleted = bm.garbage_collect("simple-kmod", "ns", &cfg.owner).await.unwrap();
        assert_eq!(deleted, vec![name]);
    }
}

//! Kernel module signing stage
//!
//! Signs the `.ko` files of an image with the Module key pair and pushes
//! the result as the final image.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{Container, KeyToPath, PodSpec, PodTemplateSpec};
use kube::api::ObjectMeta;
use serde::Serialize;
use tracing::{debug, instrument};

use super::build::{read_only_mount, secret_volume};
use super::job::{hash_value, job_labels, JobManager, JobStatus, Stage, JOB_HASH_ANNOTATION};
use super::store::{registry_auth, MaterialReader};
use crate::crd::Sign;
use crate::error::{Error, Result};
use crate::module::{OwnerRef, ResolvedKernelConfig};
use crate::registry::Registry;

/// Secret key holding the private signing key
pub const PRIVATE_KEY_DATA_KEY: &str = "key";
/// Secret key holding the public certificate
pub const PUBLIC_KEY_DATA_KEY: &str = "cert";

const DOCKER_CONFIG_DIR: &str = "/docker_config";

#[async_trait]
pub trait SignManager: Send + Sync {
    /// Whether signing is declared and the signed image is not available yet
    async fn should_sync(&self, cfg: &ResolvedKernelConfig) -> Result<bool>;

    /// `previous_image` is the unsigned image produced by the build stage,
    /// or empty when the sign section names its own unsigned image.
    async fn sync(
        &self,
        cfg: &ResolvedKernelConfig,
        previous_image: &str,
        push_image: bool,
    ) -> Result<JobStatus>;

    async fn garbage_collect(
        &self,
        module_name: &str,
        namespace: &str,
        owner: &OwnerRef,
    ) -> Result<Vec<String>>;
}

#[derive(Serialize)]
struct HashData<'a> {
    private_key: &'a [u8],
    public_key: &'a [u8],
    pod_template: &'a PodTemplateSpec,
}

/// Renders sign Job templates
#[derive(Clone)]
pub struct SignJobMaker {
    signer_image: String,
    materials: Arc<dyn MaterialReader>,
}

impl SignJobMaker {
    pub fn new(signer_image: impl Into<String>, materials: Arc<dyn MaterialReader>) -> Self {
        Self {
            signer_image: signer_image.into(),
            materials,
        }
    }

    pub async fn make_job_template(
        &self,
        cfg: &ResolvedKernelConfig,
        sign: &Sign,
        image_to_sign: &str,
        push_image: bool,
    ) -> Result<Job> {
        let key_secret = sign.key_secret.as_ref().ok_or_else(|| {
            Error::ConfigError(format!("module {}/{}: sign.keySecret is required", cfg.namespace, cfg.name))
        })?;
        let cert_secret = sign.cert_secret.as_ref().ok_or_else(|| {
            Error::ConfigError(format!("module {}/{}: sign.certSecret is required", cfg.namespace, cfg.name))
        })?;

        let template = self.pod_template(cfg, sign, &key_secret.name, &cert_secret.name, image_to_sign, push_image)?;

        let private_key = self
            .materials
            .secret_data(&cfg.namespace, &key_secret.name, PRIVATE_KEY_DATA_KEY)
            .await?;
        let public_key = self
            .materials
            .secret_data(&cfg.namespace, &cert_secret.name, PUBLIC_KEY_DATA_KEY)
            .await?;
        let hash = hash_value(&HashData {
            private_key: &private_key,
            public_key: &public_key,
            pod_template: &template,
        })?;

        Ok(Job {
            metadata: ObjectMeta {
                generate_name: Some(format!("{}-sign-", cfg.name)),
                namespace: Some(cfg.namespace.clone()),
                labels: Some(job_labels(&cfg.name, &cfg.kernel_version, Stage::Sign)),
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

    fn pod_template(
        &self,
        cfg: &ResolvedKernelConfig,
        sign: &Sign,
        key_secret: &str,
        cert_secret: &str,
        image_to_sign: &str,
        push_image: bool,
    ) -> Result<PodTemplateSpec> {
        let mut args: Vec<String> = Vec::new();

        if push_image {
            args.extend(["-signedimage".to_string(), cfg.container_image.clone()]);
            if cfg.registry_tls.insecure {
                args.push("--insecure".to_string());
            }
            if cfg.registry_tls.insecure_skip_tls_verify {
                args.push("--skip-tls-verify".to_string());
            }
        } else {
            args.push("-no-push".to_string());
        }

        let unsigned = if !image_to_sign.is_empty() {
            image_to_sign.to_string()
        } else {
            sign.unsigned_image
                .clone()
                .filter(|i| !i.is_empty())
                .ok_or_else(|| Error::ConfigError("no image to sign given".to_string()))?
        };
        args.extend(["-unsignedimage".to_string(), unsigned]);
        args.extend(["-key".to_string(), "/signingkey/key.priv".to_string()]);
        args.extend(["-cert".to_string(), "/signingcert/public.der".to_string()]);

        if !sign.files_to_sign.is_empty() {
            args.extend(["-filestosign".to_string(), sign.files_to_sign.join(":")]);
        }
        if sign.unsigned_image_registry_tls.insecure {
            args.push("--insecure-pull".to_string());
        }
        if sign.unsigned_image_registry_tls.insecure_skip_tls_verify {
            args.push("--skip-tls-verify-pull".to_string());
        }
        args.extend(["-secretdir".to_string(), format!("{}/", DOCKER_CONFIG_DIR)]);

        let key_volume = format!("secret-{}", key_secret);
        let cert_volume = format!("secret-{}", cert_secret);
        let mut volumes = if key_secret == cert_secret {
            let mut volume = secret_volume(&key_volume, key_secret, Some((PRIVATE_KEY_DATA_KEY, "key.priv")));
            if let Some(items) = volume.secret.as_mut().and_then(|s| s.items.as_mut()) {
                items.push(KeyToPath {
                    key: PUBLIC_KEY_DATA_KEY.to_string(),
                    path: "public.der".to_string(),
                    ..Default::default()
                });
            }
            vec![volume]
        } else {
            vec![
                secret_volume(&key_volume, key_secret, Some((PRIVATE_KEY_DATA_KEY, "key.priv"))),
                secret_volume(&cert_volume, cert_secret, Some((PUBLIC_KEY_DATA_KEY, "public.der"))),
            ]
        };
        let mut mounts = vec![
            read_only_mount(&cert_volume, "/signingcert"),
            read_only_mount(&key_volume, "/signingkey"),
        ];

        if let Some(secret) = &cfg.image_repo_secret {
            let volume_name = format!("docker-config-{}", secret.name);
            volumes.push(secret_volume(&volume_name, &secret.name, None));
            mounts.push(read_only_mount(
                &volume_name,
                &format!("{}/{}", DOCKER_CONFIG_DIR, secret.name),
            ));
        }

        Ok(PodTemplateSpec {
            metadata: None,
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "signimage".to_string(),
                    image: Some(self.signer_image.clone()),
                    args: Some(args),
                    volume_mounts: Some(mounts),
                    ..Default::default()
                }],
                restart_policy: Some("Never".to_string()),
                volumes: Some(volumes),
                node_selector: Some(cfg.selector.clone()),
                ..Default::default()
            }),
        })
    }
}

/// Sign stage backed by signer Jobs
pub struct SignJobManager {
    jobs: JobManager,
    maker: SignJobMaker,
    registry: Arc<dyn Registry>,
    materials: Arc<dyn MaterialReader>,
}

impl SignJobManager {
    pub fn new(
        jobs: JobManager,
        maker: SignJobMaker,
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
impl SignManager for SignJobManager {
    async fn should_sync(&self, cfg: &ResolvedKernelConfig) -> Result<bool> {
        if cfg.sign.is_none() {
            return Ok(false);
        }
        let auth = registry_auth(self.materials.as_ref(), cfg).await?;
        let exists = self
            .registry
            .image_exists(&cfg.container_image, &cfg.registry_tls, auth.as_ref())
            .await?;
        debug!("Signed image {} exists: {}", cfg.container_image, exists);
        Ok(!exists)
    }

    #[instrument(skip(self, cfg), fields(module = %cfg.name, kernel = %cfg.kernel_version))]
    async fn sync(
        &self,
        cfg: &ResolvedKernelConfig,
        previous_image: &str,
        push_image: bool,
    ) -> Result<JobStatus> {
        let sign = cfg.sign.as_ref().ok_or_else(|| {
            Error::ConfigError(format!(
                "module {}/{} has no sign section for kernel {}",
                cfg.namespace, cfg.name, cfg.kernel_version
            ))
        })?;

        let desired = self
            .maker
            .make_job_template(cfg, sign, previous_image, push_image)
            .await?;
        self.jobs
            .sync(
                &cfg.namespace,
                &cfg.name,
                &cfg.kernel_version,
                Stage::Sign,
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
            .garbage_collect(namespace, module_name, Stage::Sign, owner)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::fake::FakeCluster;
    use crate::crd::{LocalObjectReference, TlsOptions};

    fn test_config() -> ResolvedKernelConfig {
        ResolvedKernelConfig {
            name: "simple-kmod".to_string(),
            namespace: "ns".to_string(),
            kernel_version: "5.14.0".to_string(),
            container_image: "quay.io/org/kmod:5.14.0".to_string(),
            sign: Some(Sign {
                unsigned_image: Some("quay.io/org/unsigned:5.14.0".to_string()),
                unsigned_image_registry_tls: TlsOptions {
                    insecure: true,
                    insecure_skip_tls_verify: false,
                },
                key_secret: Some(LocalObjectReference::new("signing-key")),
                cert_secret: Some(LocalObjectReference::new("signing-cert")),
                files_to_sign: vec!["/opt/a.ko".to_string(), "/opt/b.ko".to_string()],
            }),
            image_repo_secret: Some(LocalObjectReference::new("pull")),
            owner: OwnerRef {
                uid: "uid-1".to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn fake_with_keys() -> Arc<FakeCluster> {
        let fake = Arc::new(FakeCluster::default());
        fake.add_secret("signing-key", PRIVATE_KEY_DATA_KEY, b"private");
        fake.add_secret("signing-cert", PUBLIC_KEY_DATA_KEY, b"public");
        fake
    }

    fn args_of(job: &Job) -> Vec<String> {
        job.spec.as_ref().unwrap().template.spec.as_ref().unwrap().containers[0]
            .args
            .clone()
            .unwrap()
    }

    #[tokio::test]
    async fn test_sign_args_with_previous_image() {
        let fake = fake_with_keys();
        let maker = SignJobMaker::new("signer", fake.clone());
        let cfg = test_config();

        let job = maker
            .make_job_template(&cfg, cfg.sign.as_ref().unwrap(), "quay.io/org/kmod:built", true)
            .await
            .unwrap();

        assert_eq!(
            args_of(&job),
            vec![
                "-signedimage",
                "quay.io/org/kmod:5.14.0",
                "-unsignedimage",
                "quay.io/org/kmod:built",
                "-key",
                "/signingkey/key.priv",
                "-cert",
                "/signingcert/public.der",
                "-filestosign",
                "/opt/a.ko:/opt/b.ko",
                "--insecure-pull",
                "-secretdir",
                "/docker_config/",
            ]
        );
        assert_eq!(job.metadata.generate_name.as_deref(), Some("simple-kmod-sign-"));
        let pod = job.spec.as_ref().unwrap().template.spec.as_ref().unwrap();
        assert_eq!(pod.containers[0].name, "signimage");
        assert_eq!(pod.volumes.as_ref().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_sign_falls_back_to_unsigned_image() {
        let fake = fake_with_keys();
        let maker = SignJobMaker::new("signer", fake.clone());
        let cfg = test_config();

        let job = maker
            .make_job_template(&cfg, cfg.sign.as_ref().unwrap(), "", false)
            .await
            .unwrap();
        let args = args_of(&job);
        assert_eq!(args[0], "-no-push");
        assert_eq!(args[2], "quay.io/org/unsigned:5.14.0");
    }

    #[tokio::test]
    async fn test_no_image_to_sign_is_an_error() {
        let fake = fake_with_keys();
        let maker = SignJobMaker::new("signer", fake.clone());
        let mut cfg = test_config();
        cfg.sign.as_mut().unwrap().unsigned_image = None;

        let err = maker
            .make_job_template(&cfg, cfg.sign.as_ref().unwrap(), "", true)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConfigError(_)));
    }

    #[tokio::test]
    async fn test_hash_covers_key_material() {
        let fake = fake_with_keys();
        let maker = SignJobMaker::new("signer", fake.clone());
        let cfg = test_config();
        let sign = cfg.sign.as_ref().unwrap();

        let before = maker.make_job_template(&cfg, sign, "", true).await.unwrap();
        fake.add_secret("signing-key", PRIVATE_KEY_DATA_KEY, b"rotated");
        let after = maker.make_job_template(&cfg, sign, "", true).await.unwrap();

        assert_ne!(
            before.metadata.annotations.unwrap()[JOB_HASH_ANNOTATION],
            after.metadata.annotations.unwrap()[JOB_HASH_ANNOTATION]
        );
    }

    #[tokio::test]
    async fn test_sync_and_should_sync() {
        let fake = fake_with_keys();
        fake.add_secret("pull", crate::controller::store::DOCKER_CONFIG_KEY, br#"{"auths":{}}"#);
        let sm = SignJobManager::new(
            JobManager::new(fake.clone()),
            SignJobMaker::new("signer", fake.clone()),
            fake.clone(),
            fake.clone(),
        );
        let cfg = test_config();

        assert!(sm.should_sync(&cfg).await.unwrap());
        assert_eq!(sm.sync(&cfg, "", true).await.unwrap(), JobStatus::Created);
        assert_eq!(fake.jobs().len(), 1);

        fake.add_image("quay.io/org/kmod:5.14.0");
        assert!(!sm.should_sync(&cfg).await.unwrap());
    }
}

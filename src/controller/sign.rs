//! In-cluster module signing
//!
//! The sign job pulls the unsigned image, signs the listed kernel object
//! files with the Module's key pair and pushes the result as the final image.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, KeyToPath, PodSpec, PodTemplateSpec, SecretVolumeSource, Volume, VolumeMount,
};
use kube::api::ObjectMeta;
use tracing::{debug, instrument};

use super::jobs::{job_labels, JobKind, JobRunner, JobStatus, SignManager};
use super::mapper::ModuleLoaderData;
use crate::constants::{PRIVATE_SIGN_DATA_KEY, PUBLIC_SIGN_DATA_KEY};
use crate::crd::{LocalRef, Module, Sign};
use crate::error::{Error, Result};

const KEY_MOUNT: &str = "/signingkey";
const CERT_MOUNT: &str = "/signingcert";
const DOCKER_CONFIG_MOUNT: &str = "/docker_config";

pub struct JobSignManager {
    runner: Arc<JobRunner>,
}

impl JobSignManager {
    pub fn new(runner: Arc<JobRunner>) -> Self {
        Self { runner }
    }
}

/// Image the sign job reads from
pub fn unsigned_image<'a>(sign: &'a Sign, previous_image: &'a str) -> &'a str {
    if previous_image.is_empty() {
        &sign.unsigned_image
    } else {
        previous_image
    }
}

pub fn signer_args(
    mld: &ModuleLoaderData,
    sign: &Sign,
    previous_image: &str,
    push_image: bool,
) -> Vec<String> {
    let mut args = vec![
        "-signedimage".to_string(),
        mld.container_image.clone(),
        "-unsignedimage".to_string(),
        unsigned_image(sign, previous_image).to_string(),
        "-key".to_string(),
        format!("{KEY_MOUNT}/key.pem"),
        "-cert".to_string(),
        format!("{CERT_MOUNT}/public.der"),
    ];

    if !sign.files_to_sign.is_empty() {
        args.push("-filestosign".to_string());
        args.push(sign.files_to_sign.join(":"));
    }

    if mld.image_repo_secret.is_some() {
        args.push("-pullsecret".to_string());
        args.push(format!("{DOCKER_CONFIG_MOUNT}/config.json"));
    }

    // Built images come from our own registry, pre-existing ones may not
    let pull_tls = if previous_image.is_empty() {
        &sign.unsigned_image_registry_tls
    } else {
        &mld.registry_tls
    };
    if pull_tls.insecure || mld.registry_tls.insecure {
        args.push("-insecure".to_string());
    }
    if pull_tls.insecure_skip_tls_verify || mld.registry_tls.insecure_skip_tls_verify {
        args.push("-skipverify".to_string());
    }

    if !push_image {
        args.push("-no-push".to_string());
    }

    args
}

fn secret_volume(volume: &str, secret: &LocalRef, key: &str, path: &str) -> Volume {
    Volume {
        name: volume.to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(secret.name.clone()),
            items: Some(vec![KeyToPath {
                key: key.to_string(),
                path: path.to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn read_only_mount(volume: &str, path: &str) -> VolumeMount {
    VolumeMount {
        name: volume.to_string(),
        mount_path: path.to_string(),
        read_only: Some(true),
        ..Default::default()
    }
}

pub fn sign_job(
    mld: &ModuleLoaderData,
    sign: &Sign,
    previous_image: &str,
    signer_image: &str,
    push_image: bool,
) -> Job {
    let mut volumes = vec![
        secret_volume("signing-key", &sign.key_secret, PRIVATE_SIGN_DATA_KEY, "key.pem"),
        secret_volume("signing-cert", &sign.cert_secret, PUBLIC_SIGN_DATA_KEY, "public.der"),
    ];
    let mut mounts = vec![
        read_only_mount("signing-key", KEY_MOUNT),
        read_only_mount("signing-cert", CERT_MOUNT),
    ];

    if let Some(secret) = &mld.image_repo_secret {
        volumes.push(secret_volume(
            "docker-config",
            secret,
            ".dockerconfigjson",
            "config.json",
        ));
        mounts.push(read_only_mount("docker-config", DOCKER_CONFIG_MOUNT));
    }

    let labels = job_labels(mld, JobKind::Sign);

    Job {
        metadata: ObjectMeta {
            generate_name: Some(format!("{}-sign-", mld.name)),
            namespace: Some(mld.namespace.clone()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(0),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    restart_policy: Some("Never".to_string()),
                    containers: vec![Container {
                        name: "signimage".to_string(),
                        image: Some(signer_image.to_string()),
                        args: Some(signer_args(mld, sign, previous_image, push_image)),
                        volume_mounts: Some(mounts),
                        ..Default::default()
                    }],
                    volumes: Some(volumes),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[async_trait]
impl SignManager for JobSignManager {
    #[instrument(skip(self, mld), fields(module = %mld.name, kernel = %mld.kernel_version))]
    async fn should_sync(&self, mld: &ModuleLoaderData) -> Result<bool> {
        if !mld.sign_configured() {
            return Ok(false);
        }

        let exists = self
            .runner
            .image_exists(mld, &mld.container_image, &mld.registry_tls)
            .await?;
        debug!("Signed image {} exists: {}", mld.container_image, exists);
        Ok(!exists)
    }

    #[instrument(skip(self, mld, owner), fields(module = %mld.name, kernel = %mld.kernel_version))]
    async fn sync(
        &self,
        mld: &ModuleLoaderData,
        previous_image: &str,
        push_image: bool,
        owner: &Module,
    ) -> Result<JobStatus> {
        let sign = mld.sign.as_ref().ok_or_else(|| {
            Error::ConfigError(format!("module {}/{} has no sign section", mld.namespace, mld.name))
        })?;

        if unsigned_image(sign, previous_image).is_empty() {
            return Err(Error::ConfigError(format!(
                "module {}/{} has no image to sign",
                mld.namespace, mld.name
            )));
        }

        let job = sign_job(
            mld,
            sign,
            previous_image,
            &self.runner.config().signer_image,
            push_image,
        );
        self.runner.sync_job(mld, job, owner).await
    }

    async fn garbage_collect(&self, name: &str, namespace: &str, _owner: &Module) -> Result<Vec<String>> {
        self.runner.garbage_collect(name, namespace, JobKind::Sign).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::RegistryTls;

    fn signed_mld() -> (ModuleLoaderData, Sign) {
        let sign = Sign {
            unsigned_image: "quay.io/org/mod:unsigned".to_string(),
            key_secret: LocalRef::new("signing-key"),
            cert_secret: LocalRef::new("signing-cert"),
            files_to_sign: vec![
                "/opt/lib/modules/5.14.0/kmm_ci_a.ko".to_string(),
                "/opt/lib/modules/5.14.0/kmm_ci_b.ko".to_string(),
            ],
            ..Default::default()
        };
        let mld = ModuleLoaderData {
            name: "mod".to_string(),
            namespace: "ns".to_string(),
            container_image: "quay.io/org/mod:signed".to_string(),
            kernel_version: "5.14.0".to_string(),
            sign: Some(sign.clone()),
            ..Default::default()
        };
        (mld, sign)
    }

    #[test]
    fn signs_previous_image_when_built() {
        let (mld, sign) = signed_mld();

        assert_eq!(unsigned_image(&sign, ""), "quay.io/org/mod:unsigned");
        assert_eq!(unsigned_image(&sign, "built:tag"), "built:tag");

        let args = signer_args(&mld, &sign, "built:tag", true);
        let pos = args.iter().position(|a| a == "-unsignedimage").unwrap();
        assert_eq!(args[pos + 1], "built:tag");
    }

    #[test]
    fn args_carry_files_and_push_flag() {
        let (mld, sign) = signed_mld();
        let args = signer_args(&mld, &sign, "", false);

        assert!(args.contains(
            &"/opt/lib/modules/5.14.0/kmm_ci_a.ko:/opt/lib/modules/5.14.0/kmm_ci_b.ko".to_string()
        ));
        assert!(args.contains(&"-no-push".to_string()));
        assert!(!args.contains(&"-pullsecret".to_string()));
    }

    #[test]
    fn unsigned_registry_tls_applies_to_external_images() {
        let (mld, mut sign) = signed_mld();
        sign.unsigned_image_registry_tls = RegistryTls {
            insecure: true,
            insecure_skip_tls_verify: false,
        };

        assert!(signer_args(&mld, &sign, "", true).contains(&"-insecure".to_string()));
        assert!(!signer_args(&mld, &sign, "built:tag", true).contains(&"-insecure".to_string()));
    }

    #[test]
    fn job_mounts_key_pair() {
        let (mld, sign) = signed_mld();
        let job = sign_job(&mld, &sign, "", "signer:latest", true);

        let pod = job.spec.unwrap().template.spec.unwrap();
        let volumes = pod.volumes.unwrap();
        assert_eq!(volumes.len(), 2);
        assert_eq!(
            volumes[0].secret.as_ref().unwrap().secret_name.as_deref(),
            Some("signing-key")
        );
        assert_eq!(
            volumes[1].secret.as_ref().unwrap().items.as_ref().unwrap()[0].key,
            PUBLIC_SIGN_DATA_KEY
        );
    }
}

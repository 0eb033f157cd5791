//! In-cluster module image builds
//!
//! Builds run as kaniko Jobs fed by the Dockerfile from the Module's
//! ConfigMap. When the module is also signed, the build pushes to an
//! intermediate tag and the sign job produces the final image.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Container, KeyToPath, PodSpec, PodTemplateSpec, SecretVolumeSource,
    Volume, VolumeMount,
};
use kube::api::ObjectMeta;
use tracing::{debug, instrument};

use super::jobs::{
    intermediate_image_name, job_labels, BuildManager, JobKind, JobRunner, JobStatus,
};
use super::mapper::ModuleLoaderData;
use crate::constants::DOCKERFILE_CONFIG_MAP_KEY;
use crate::crd::{Build, Module};
use crate::error::{Error, Result};

const DOCKERFILE_MOUNT: &str = "/workspace";
const DOCKER_CONFIG_MOUNT: &str = "/kaniko/.docker";
const BUILD_SECRETS_MOUNT: &str = "/run/secrets";

pub struct JobBuildManager {
    runner: Arc<JobRunner>,
}

impl JobBuildManager {
    pub fn new(runner: Arc<JobRunner>) -> Self {
        Self { runner }
    }
}

/// Image the build job pushes for `mld`
pub fn build_destination(mld: &ModuleLoaderData) -> String {
    if mld.sign_configured() {
        intermediate_image_name(&mld.name, &mld.namespace, &mld.container_image)
    } else {
        mld.container_image.clone()
    }
}

/// kaniko arguments for `build`
pub fn kaniko_args(mld: &ModuleLoaderData, build: &Build, push_image: bool) -> Vec<String> {
    let mut args = vec![
        format!("--dockerfile={DOCKERFILE_MOUNT}/Dockerfile"),
        format!("--context=dir://{DOCKERFILE_MOUNT}"),
    ];

    if push_image {
        args.push(format!("--destination={}", build_destination(mld)));
    } else {
        args.push("--no-push".to_string());
    }

    let default_args = [
        ("KERNEL_VERSION", mld.kernel_version.as_str()),
        ("KERNEL_FULL_VERSION", mld.kernel_version.as_str()),
        ("MOD_NAME", mld.name.as_str()),
        ("MOD_NAMESPACE", mld.namespace.as_str()),
    ];
    for (name, value) in default_args {
        if !build.build_args.iter().any(|a| a.name == name) {
            args.push(format!("--build-arg={name}={value}"));
        }
    }
    for arg in &build.build_args {
        args.push(format!("--build-arg={}={}", arg.name, arg.value));
    }

    if mld.registry_tls.insecure {
        args.push("--insecure".to_string());
    }
    if mld.registry_tls.insecure_skip_tls_verify {
        args.push("--skip-tls-verify".to_string());
    }
    if build.base_image_registry_tls.insecure {
        args.push("--insecure-pull".to_string());
    }
    if build.base_image_registry_tls.insecure_skip_tls_verify {
        args.push("--skip-tls-verify-pull".to_string());
    }

    args
}

pub fn build_job(mld: &ModuleLoaderData, build: &Build, builder_image: &str, push_image: bool) -> Job {
    let mut volumes = vec![Volume {
        name: "dockerfile".to_string(),
        config_map: Some(ConfigMapVolumeSource {
            name: Some(build.dockerfile_config_map.name.clone()),
            items: Some(vec![KeyToPath {
                key: DOCKERFILE_CONFIG_MAP_KEY.to_string(),
                path: "Dockerfile".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }];
    let mut mounts = vec![VolumeMount {
        name: "dockerfile".to_string(),
        mount_path: DOCKERFILE_MOUNT.to_string(),
        read_only: Some(true),
        ..Default::default()
    }];

    if let Some(secret) = &mld.image_repo_secret {
        volumes.push(Volume {
            name: "docker-config".to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(secret.name.clone()),
                items: Some(vec![KeyToPath {
                    key: ".dockerconfigjson".to_string(),
                    path: "config.json".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        });
        mounts.push(VolumeMount {
            name: "docker-config".to_string(),
            mount_path: DOCKER_CONFIG_MOUNT.to_string(),
            read_only: Some(true),
            ..Default::default()
        });
    }

    for secret in &build.secrets {
        let volume_name = format!("secret-{}", secret.name);
        volumes.push(Volume {
            name: volume_name.clone(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(secret.name.clone()),
                ..Default::default()
            }),
            ..Default::default()
        });
        mounts.push(VolumeMount {
            name: volume_name,
            mount_path: format!("{BUILD_SECRETS_MOUNT}/{}", secret.name),
            read_only: Some(true),
            ..Default::default()
        });
    }

    let labels = job_labels(mld, JobKind::Build);

    Job {
        metadata: ObjectMeta {
            generate_name: Some(format!("{}-build-", mld.name)),
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
                        name: "kaniko".to_string(),
                        image: Some(builder_image.to_string()),
                        args: Some(kaniko_args(mld, build, push_image)),
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
impl BuildManager for JobBuildManager {
    #[instrument(skip(self, mld), fields(module = %mld.name, kernel = %mld.kernel_version))]
    async fn should_sync(&self, mld: &ModuleLoaderData) -> Result<bool> {
        if !mld.build_configured() {
            return Ok(false);
        }

        // A signed module is built into an intermediate tag
        let destination = build_destination(mld);
        let exists = self
            .runner
            .image_exists(mld, &destination, &mld.registry_tls)
            .await?;
        debug!("Image {} exists: {}", destination, exists);
        Ok(!exists)
    }

    #[instrument(skip(self, mld, owner), fields(module = %mld.name, kernel = %mld.kernel_version))]
    async fn sync(&self, mld: &ModuleLoaderData, push_image: bool, owner: &Module) -> Result<JobStatus> {
        let build = mld.build.as_ref().ok_or_else(|| {
            Error::ConfigError(format!("module {}/{} has no build section", mld.namespace, mld.name))
        })?;

        let job = build_job(mld, build, &self.runner.config().builder_image, push_image);
        self.runner.sync_job(mld, job, owner).await
    }

    async fn garbage_collect(&self, name: &str, namespace: &str, _owner: &Module) -> Result<Vec<String>> {
        self.runner.garbage_collect(name, namespace, JobKind::Build).await
    }
}

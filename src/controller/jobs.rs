//! Build and sign pipelines backed by batch Jobs
//!
//! [`BuildManager`] and [`SignManager`] are the seams the build/sign
//! reconciler drives. [`JobRunner`] holds the Job plumbing both managers
//! share: lookup by labels, hash-based replacement, status mapping and
//! retention-based garbage collection.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::PodTemplateSpec;
use kube::{
    api::{Api, DeleteParams, ListParams, PostParams},
    Client, Resource, ResourceExt,
};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::mapper::ModuleLoaderData;
use super::store::{label_selector, ClusterStore};
use crate::config::JobConfig;
use crate::constants::{JOB_HASH_ANNOTATION, JOB_TYPE_LABEL, MODULE_NAME_LABEL, TARGET_KERNEL_LABEL};
use crate::crd::{Module, RegistryTls};
use crate::error::Result;
use crate::registry::{DockerConfig, ImageRegistry};

/// Observed state of one build or sign job
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobStatus {
    Created,
    InProgress,
    Completed,
    Failed,
}

#[async_trait]
pub trait BuildManager: Send + Sync {
    /// Whether a build is needed for this kernel
    async fn should_sync(&self, mld: &ModuleLoaderData) -> Result<bool>;

    async fn sync(
        &self,
        mld: &ModuleLoaderData,
        push_image: bool,
        owner: &Module,
    ) -> Result<JobStatus>;

    /// Prune finished build jobs; returns the deleted job names
    async fn garbage_collect(
        &self,
        name: &str,
        namespace: &str,
        owner: &Module,
    ) -> Result<Vec<String>>;
}

#[async_trait]
pub trait SignManager: Send + Sync {
    async fn should_sync(&self, mld: &ModuleLoaderData) -> Result<bool>;

    /// `previous_image` is the freshly built unsigned image, or empty when
    /// the module signs a pre-existing image.
    async fn sync(
        &self,
        mld: &ModuleLoaderData,
        previous_image: &str,
        push_image: bool,
        owner: &Module,
    ) -> Result<JobStatus>;

    async fn garbage_collect(
        &self,
        name: &str,
        namespace: &str,
        owner: &Module,
    ) -> Result<Vec<String>>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobKind {
    Build,
    Sign,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Build => "build",
            JobKind::Sign => "sign",
        }
    }
}

/// Tag for the unsigned image a build pushes before it is signed.
///
/// Joined with `_` when `image` already carries a tag. A digest cannot be
/// pushed to, so it is dropped and the tag goes on the repository.
pub fn intermediate_image_name(name: &str, namespace: &str, image: &str) -> String {
    let tag = format!("{namespace}_{name}_kmm_unsigned");
    let image = image.split_once('@').map_or(image, |(repository, _)| repository);
    let last_segment = image.rsplit('/').next().unwrap_or(image);

    if last_segment.contains(':') {
        format!("{image}_{tag}")
    } else {
        format!("{image}:{tag}")
    }
}

pub fn job_labels(mld: &ModuleLoaderData, kind: JobKind) -> BTreeMap<String, String> {
    let mut labels = module_job_labels(&mld.name, kind);
    labels.insert(TARGET_KERNEL_LABEL.to_string(), mld.kernel_version.clone());
    labels
}

fn module_job_labels(name: &str, kind: JobKind) -> BTreeMap<String, String> {
    BTreeMap::from([
        (MODULE_NAME_LABEL.to_string(), name.to_string()),
        (JOB_TYPE_LABEL.to_string(), kind.as_str().to_string()),
    ])
}

pub fn template_hash(template: &PodTemplateSpec) -> Result<String> {
    let bytes = serde_json::to_vec(template)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

pub fn job_status(job: &Job) -> JobStatus {
    let status = job.status.as_ref();
    if status.and_then(|s| s.succeeded).unwrap_or(0) > 0 {
        JobStatus::Completed
    } else if status.and_then(|s| s.failed).unwrap_or(0) > 0 {
        JobStatus::Failed
    } else {
        JobStatus::InProgress
    }
}

fn completion_time(job: &Job) -> Option<DateTime<Utc>> {
    job.status.as_ref()?.completion_time.as_ref().map(|t| t.0)
}

/// Names of completed jobs to delete.
///
/// The `keep` most recently completed jobs are retained, as is any job
/// completed less than `delay` before `now`.
pub fn select_jobs_for_gc(
    jobs: &[Job],
    keep: usize,
    delay: Duration,
    now: DateTime<Utc>,
) -> Vec<String> {
    let mut completed: Vec<(&Job, DateTime<Utc>)> = jobs
        .iter()
        .filter(|j| job_status(j) == JobStatus::Completed)
        .filter_map(|j| completion_time(j).map(|t| (j, t)))
        .collect();
    completed.sort_by(|a, b| b.1.cmp(&a.1));

    let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());

    completed
        .into_iter()
        .skip(keep)
        .filter(|(_, done)| now - *done >= delay)
        .map(|(j, _)| j.name_any())
        .collect()
}

/// Registry credentials from the module's image pull secret, if any.
///
/// A missing secret falls back to anonymous access.
pub async fn pull_credentials(
    store: &dyn ClusterStore,
    mld: &ModuleLoaderData,
) -> Result<Option<DockerConfig>> {
    let Some(secret_ref) = &mld.image_repo_secret else {
        return Ok(None);
    };

    match store.get_secret(&secret_ref.name, &mld.namespace).await? {
        Some(secret) => DockerConfig::from_secret(&secret),
        None => {
            warn!(
                "Pull secret {}/{} not found, using anonymous registry access",
                mld.namespace, secret_ref.name
            );
            Ok(None)
        }
    }
}

/// Job plumbing shared by the build and sign managers
pub struct JobRunner {
    client: Client,
    store: Arc<dyn ClusterStore>,
    registry: Arc<dyn ImageRegistry>,
    config: JobConfig,
}

impl JobRunner {
    pub fn new(
        client: Client,
        store: Arc<dyn ClusterStore>,
        registry: Arc<dyn ImageRegistry>,
        config: JobConfig,
    ) -> Self {
        Self {
            client,
            store,
            registry,
            config,
        }
    }

    pub fn config(&self) -> &JobConfig {
        &self.config
    }

    /// Whether `image` exists, using the module's pull secret when set
    pub async fn image_exists(
        &self,
        mld: &ModuleLoaderData,
        image: &str,
        tls: &RegistryTls,
    ) -> Result<bool> {
        let credentials = pull_credentials(self.store.as_ref(), mld).await?;
        self.registry
            .image_exists(image, tls, credentials.as_ref())
            .await
    }

    /// Converge on a single job matching `desired`'s labels
    pub async fn sync_job(&self, mld: &ModuleLoaderData, mut desired: Job, owner: &Module) -> Result<JobStatus> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), &mld.namespace);
        let labels = desired.metadata.labels.clone().unwrap_or_default();

        let template = desired
            .spec
            .as_ref()
            .map(|s| s.template.clone())
            .unwrap_or_default();
        let hash = template_hash(&template)?;

        desired
            .metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(JOB_HASH_ANNOTATION.to_string(), hash.clone());
        desired.metadata.owner_references = owner.controller_owner_ref(&()).map(|o| vec![o]);

        let existing = api
            .list(&ListParams::default().labels(&label_selector(&labels)))
            .await?
            .items;

        let Some(job) = existing.into_iter().next() else {
            let created = api.create(&PostParams::default(), &desired).await?;
            info!(
                "Created job {}/{} for kernel {}",
                mld.namespace,
                created.name_any(),
                mld.kernel_version
            );
            return Ok(JobStatus::Created);
        };

        let current_hash = job.annotations().get(JOB_HASH_ANNOTATION).cloned();
        if current_hash.as_deref() != Some(hash.as_str()) {
            info!(
                "Job {}/{} is out of date, replacing it",
                mld.namespace,
                job.name_any()
            );
            match api.delete(&job.name_any(), &DeleteParams::background()).await {
                Ok(_) => {}
                Err(kube::Error::Api(e)) if e.code == 404 => {}
                Err(e) => return Err(e.into()),
            }
            api.create(&PostParams::default(), &desired).await?;
            return Ok(JobStatus::Created);
        }

        let status = job_status(&job);
        debug!("Job {}/{} status: {:?}", mld.namespace, job.name_any(), status);
        Ok(status)
    }

    pub async fn garbage_collect(&self, name: &str, namespace: &str, kind: JobKind) -> Result<Vec<String>> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        let params = ListParams::default().labels(&label_selector(&module_job_labels(name, kind)));
        let jobs = api.list(&params).await?.items;

        let doomed = select_jobs_for_gc(
            &jobs,
            self.config.keep_completed,
            self.config.gc_delay(),
            Utc::now(),
        );

        for job_name in &doomed {
            match api.delete(job_name, &DeleteParams::background()).await {
                Ok(_) => info!("Garbage collected {} job {}/{}", kind.as_str(), namespace, job_name),
                Err(kube::Error::Api(e)) if e.code == 404 => {}
                Err(e) => return Err(e.into()),
            }
        }

        Ok(doomed)
    }
}

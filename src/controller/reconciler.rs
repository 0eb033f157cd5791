//! Controller wiring
//!
//! Three independent controllers share one [`ControllerState`]:
//! - build/sign, keyed by Module, owning build and sign Jobs
//! - module-nmc, keyed by Module, writing NodeModulesConfig spec entries
//! - node-modules, keyed by NodeModulesConfig, owning worker Pods

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::{
    api::Api,
    client::Client,
    runtime::{
        controller::{Action, Config as ControllerConfig, Controller},
        finalizer::{finalizer, Event as FinalizerEvent},
        reflector::ObjectRef,
        watcher::Config,
    },
    Resource, ResourceExt,
};
use rand::Rng;
use tracing::{error, info, instrument, warn};

use super::build::JobBuildManager;
use super::build_sign::BuildSignReconciler;
use super::finalizers::{MODULE_FINALIZER, NMC_FINALIZER};
use super::jobs::JobRunner;
use super::mapper::{DefaultKernelMapper, KernelMapper};
use super::module_nmc::ModuleNmcReconciler;
use super::node_modules::NodeModuleReconciler;
use super::node_selector::selector_matches;
use super::pods::KubePodManager;
use super::pull_secrets::DefaultPullSecretHelper;
use super::sign::JobSignManager;
use super::store::{ClusterStore, KubeStore};
use crate::config::OperatorConfig;
use crate::constants::{JOB_TYPE_LABEL, WORKER_ACTION_LABEL};
use crate::crd::{Module, NodeModulesConfig};
use crate::error::{Error, Result};
use crate::registry::{ImageRegistry, OciImageRegistry};

const BUILD_SIGN_CONTROLLER: &str = "build-sign";
const MODULE_NMC_CONTROLLER: &str = "module-nmc";
const NODE_MODULES_CONTROLLER: &str = "node-modules";

/// Periodic resync so registry-side changes are noticed
const RESYNC_INTERVAL: Duration = Duration::from_secs(300);

/// Shared state for the controllers
pub struct ControllerState {
    pub client: Client,
    pub config: OperatorConfig,
    pub build_sign: BuildSignReconciler,
    pub module_nmc: ModuleNmcReconciler,
    pub node_modules: NodeModuleReconciler,
}

impl ControllerState {
    pub fn new(client: Client, config: OperatorConfig) -> Self {
        let store: Arc<dyn ClusterStore> = Arc::new(KubeStore::new(client.clone()));
        let registry: Arc<dyn ImageRegistry> = Arc::new(OciImageRegistry::new());
        let mapper: Arc<dyn KernelMapper> = Arc::new(DefaultKernelMapper::new());

        let runner = Arc::new(JobRunner::new(
            client.clone(),
            store.clone(),
            registry.clone(),
            config.job.clone(),
        ));
        let build_sign = BuildSignReconciler::new(
            store.clone(),
            mapper.clone(),
            Arc::new(JobBuildManager::new(runner.clone())),
            Arc::new(JobSignManager::new(runner)),
        );

        let module_nmc = ModuleNmcReconciler::new(store.clone(), mapper, registry);

        let pods = KubePodManager::new(
            client.clone(),
            Arc::new(DefaultPullSecretHelper::new(store.clone())),
            config.worker.clone(),
        );
        let node_modules = NodeModuleReconciler::new(store, Arc::new(pods));

        Self {
            client,
            config,
            build_sign,
            module_nmc,
            node_modules,
        }
    }
}

async fn ensure_crd<K>(api: &Api<K>, kind: &str) -> Result<()>
where
    K: Resource + Clone + serde::de::DeserializeOwned + std::fmt::Debug,
{
    match api.list(&Default::default()).await {
        Ok(_) => {
            info!("{} CRD is available", kind);
            Ok(())
        }
        Err(e) => {
            error!("{} CRD not found. Please install the CRD first: {:?}", kind, e);
            Err(Error::ConfigError(format!("{kind} CRD not installed")))
        }
    }
}

/// Builds and signs module images for the kernels found in the cluster
pub async fn run_build_sign_controller(state: Arc<ControllerState>) -> Result<()> {
    let client = state.client.clone();
    let modules: Api<Module> = Api::all(client.clone());
    ensure_crd(&modules, "Module").await?;

    info!("Starting build/sign controller");

    let controller = Controller::new(modules, Config::default());
    let cache = controller.store();
    let concurrency = state.config.controllers.build_sign_concurrency;

    controller
        .owns::<Job>(Api::all(client.clone()), Config::default().labels(JOB_TYPE_LABEL))
        // A node with a new kernel may need a new build
        .watches(Api::<Node>::all(client), Config::default(), move |node| {
            cache
                .state()
                .into_iter()
                .filter(|m| selector_matches(m, &node))
                .map(|m| ObjectRef::from_obj(&*m))
                .collect::<Vec<_>>()
        })
        .with_config(ControllerConfig::default().concurrency(concurrency))
        .shutdown_on_signal()
        .run(reconcile_build_sign, error_policy, state)
        .for_each(|res| async move {
            match res {
                Ok(obj) => info!("Reconciled: {:?}", obj),
                Err(e) => error!("Reconcile error: {:?}", e),
            }
        })
        .await;

    Ok(())
}

/// Publishes per-node module entries into NodeModulesConfig objects
pub async fn run_module_nmc_controller(state: Arc<ControllerState>) -> Result<()> {
    let client = state.client.clone();
    let modules: Api<Module> = Api::all(client.clone());
    ensure_crd(&modules, "Module").await?;

    info!("Starting module-nmc controller");

    let controller = Controller::new(modules, Config::default());
    let cache = controller.store();
    let concurrency = state.config.controllers.module_nmc_concurrency;

    controller
        .watches(Api::<Node>::all(client), Config::default(), move |node| {
            cache
                .state()
                .into_iter()
                .filter(|m| selector_matches(m, &node))
                .map(|m| ObjectRef::from_obj(&*m))
                .collect::<Vec<_>>()
        })
        .with_config(ControllerConfig::default().concurrency(concurrency))
        .shutdown_on_signal()
        .run(reconcile_module_nmc, error_policy, state)
        .for_each(|res| async move {
            match res {
                Ok(obj) => info!("Reconciled: {:?}", obj),
                Err(e) => error!("Reconcile error: {:?}", e),
            }
        })
        .await;

    Ok(())
}

/// Runs worker pods to converge each node on its NodeModulesConfig
pub async fn run_node_modules_controller(state: Arc<ControllerState>) -> Result<()> {
    let client = state.client.clone();
    let nmcs: Api<NodeModulesConfig> = Api::all(client.clone());
    ensure_crd(&nmcs, "NodeModulesConfig").await?;

    info!("Starting node-modules controller");

    let concurrency = state.config.controllers.node_modules_concurrency;

    Controller::new(nmcs, Config::default())
        .owns::<Pod>(
            Api::all(client.clone()),
            Config::default().labels(WORKER_ACTION_LABEL),
        )
        // Readiness changes after a reboot trigger a reload
        .watches(Api::<Node>::all(client), Config::default(), |node| {
            Some(ObjectRef::<NodeModulesConfig>::new(&node.name_any()))
        })
        .with_config(ControllerConfig::default().concurrency(concurrency))
        .shutdown_on_signal()
        .run(reconcile_node_modules, error_policy, state)
        .for_each(|res| async move {
            match res {
                Ok(obj) => info!("Reconciled: {:?}", obj),
                Err(e) => error!("Reconcile error: {:?}", e),
            }
        })
        .await;

    Ok(())
}

#[instrument(skip(ctx), fields(name = %module.name_any(), namespace = module.namespace()))]
async fn reconcile_build_sign(module: Arc<Module>, ctx: Arc<ControllerState>) -> Result<Action> {
    let started = Instant::now();
    let namespace = module.namespace().unwrap_or_default();

    let result = ctx
        .build_sign
        .reconcile(&module.name_any(), &namespace)
        .await
        .map(|_| Action::requeue(RESYNC_INTERVAL));

    record(BUILD_SIGN_CONTROLLER, started, &result);
    result
}

#[instrument(skip(ctx), fields(name = %module.name_any(), namespace = module.namespace()))]
async fn reconcile_module_nmc(module: Arc<Module>, ctx: Arc<ControllerState>) -> Result<Action> {
    let started = Instant::now();
    let namespace = module.namespace().unwrap_or_default();
    let api: Api<Module> = Api::namespaced(ctx.client.clone(), &namespace);

    let result = finalizer(&api, MODULE_FINALIZER, module, |event| async {
        match event {
            FinalizerEvent::Apply(module) => {
                ctx.module_nmc.reconcile(&module).await?;
                Ok(Action::requeue(RESYNC_INTERVAL))
            }
            FinalizerEvent::Cleanup(module) => {
                info!("Module {}/{} deleted, unloading it everywhere", namespace, module.name_any());
                ctx.module_nmc
                    .remove_module(&module.name_any(), &namespace)
                    .await?;
                Ok(Action::await_change())
            }
        }
    })
    .await
    .map_err(Error::from);

    record(MODULE_NMC_CONTROLLER, started, &result);
    result
}

#[instrument(skip(ctx), fields(name = %nmc.name_any()))]
async fn reconcile_node_modules(
    nmc: Arc<NodeModulesConfig>,
    ctx: Arc<ControllerState>,
) -> Result<Action> {
    let started = Instant::now();
    let api: Api<NodeModulesConfig> = Api::all(ctx.client.clone());

    let result = finalizer(&api, NMC_FINALIZER, nmc, |event| async {
        match event {
            FinalizerEvent::Apply(nmc) => {
                ctx.node_modules.reconcile(&nmc.name_any()).await?;
                Ok(Action::await_change())
            }
            FinalizerEvent::Cleanup(nmc) => {
                ctx.node_modules
                    .remove_orphan_finalizers(&nmc.name_any())
                    .await?;
                Ok(Action::await_change())
            }
        }
    })
    .await
    .map_err(Error::from);

    record(NODE_MODULES_CONTROLLER, started, &result);
    result
}

#[cfg(feature = "metrics")]
fn record(controller: &str, started: Instant, result: &Result<Action>) {
    super::metrics::observe_reconcile_duration_seconds(controller, started.elapsed().as_secs_f64());
    if let Err(e) = result {
        super::metrics::inc_reconcile_error(controller, e.kind());
    }
}

#[cfg(not(feature = "metrics"))]
fn record(controller: &str, started: Instant, result: &Result<Action>) {
    if result.is_err() {
        warn!("{} pass failed after {:?}", controller, started.elapsed());
    }
}

/// Requeue delay for a failed pass, with jitter so that failures caused by
/// the same outage do not retry in lockstep
pub fn retry_delay(error: &Error) -> Duration {
    let base = if error.is_retriable() {
        Duration::from_secs(15)
    } else {
        Duration::from_secs(60)
    };
    let jitter = rand::thread_rng().gen_range(0..=base.as_millis() as u64 / 5);
    base + Duration::from_millis(jitter)
}

fn error_policy<K: ResourceExt>(obj: Arc<K>, error: &Error, _ctx: Arc<ControllerState>) -> Action {
    if error.is_conflict() {
        warn!("Conflict while reconciling {}, retrying", obj.name_any());
    } else {
        error!("Reconciliation error for {}: {:?}", obj.name_any(), error);
    }
    Action::requeue(retry_delay(error))
}

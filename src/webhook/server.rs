//! Admission Webhook Server
//!
//! Serves the Module and ManagedClusterModule validation endpoints over TLS,
//! plus `/healthz` for probes. Without a certificate the server falls back to plain HTTP, which
//! is only useful for local testing.

use std::net::SocketAddr;
use std::path::PathBuf;

use axum::{
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use axum_server::tls_rustls::RustlsConfig;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
use tracing::{debug, error, info, instrument};

use crate::crd::validation::{validate_create, validate_delete, validate_update};
use crate::crd::{ManagedClusterModule, Module, SpecValidationError};
use crate::error::{Error, Result};

/// Paths the ValidatingWebhookConfigurations point at
pub const MODULE_VALIDATION_PATH: &str = "/validate-kmm-sigs-x-k8s-io-v1beta1-module";
pub const MANAGED_CLUSTER_MODULE_VALIDATION_PATH: &str =
    "/validate-hub-kmm-sigs-x-k8s-io-v1beta1-managedclustermodule";

pub struct WebhookServer {
    addr: SocketAddr,
    /// Certificate and key PEM files
    tls: Option<(PathBuf, PathBuf)>,
}

impl WebhookServer {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr, tls: None }
    }

    pub fn with_tls(mut self, cert: PathBuf, key: PathBuf) -> Self {
        self.tls = Some((cert, key));
        self
    }

    pub fn router() -> Router {
        Router::new()
            .route("/healthz", get(health_handler))
            .route(MODULE_VALIDATION_PATH, post(validate_module_handler))
            .route(
                MANAGED_CLUSTER_MODULE_VALIDATION_PATH,
                post(validate_managed_cluster_module_handler),
            )
            .layer(tower_http::trace::TraceLayer::new_for_http())
    }

    /// Start the webhook server
    pub async fn start(self) -> Result<()> {
        let app = Self::router();

        match self.tls {
            Some((cert, key)) => {
                let config = RustlsConfig::from_pem_file(&cert, &key).await.map_err(|e| {
                    Error::ConfigError(format!(
                        "failed to load webhook certificate from {}: {e}",
                        cert.display()
                    ))
                })?;

                info!("Starting webhook server on {} (TLS)", self.addr);
                axum_server::bind_rustls(self.addr, config)
                    .serve(app.into_make_service())
                    .await
                    .map_err(|e| Error::ConfigError(format!("webhook server error: {e}")))?;
            }
            None => {
                info!("Starting webhook server on {} (plain HTTP)", self.addr);
                let listener = tokio::net::TcpListener::bind(self.addr).await.map_err(|e| {
                    Error::ConfigError(format!("failed to bind to {}: {e}", self.addr))
                })?;
                axum::serve(listener, app)
                    .await
                    .map_err(|e| Error::ConfigError(format!("webhook server error: {e}")))?;
            }
        }

        Ok(())
    }
}

async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

#[instrument(skip(review))]
async fn validate_module_handler(Json(review): Json<AdmissionReview<Module>>) -> impl IntoResponse {
    let req: AdmissionRequest<Module> = match review.try_into() {
        Ok(req) => req,
        Err(e) => {
            error!("Failed to parse admission request: {}", e);
            return (
                StatusCode::BAD_REQUEST,
                Json(AdmissionResponse::invalid(format!("Invalid admission request: {e}")).into_review()),
            );
        }
    };

    (StatusCode::OK, Json(review_module(&req).into_review()))
}

#[instrument(skip(review))]
async fn validate_managed_cluster_module_handler(
    Json(review): Json<AdmissionReview<ManagedClusterModule>>,
) -> impl IntoResponse {
    let req: AdmissionRequest<ManagedClusterModule> = match review.try_into() {
        Ok(req) => req,
        Err(e) => {
            error!("Failed to parse admission request: {}", e);
            return (
                StatusCode::BAD_REQUEST,
                Json(AdmissionResponse::invalid(format!("Invalid admission request: {e}")).into_review()),
            );
        }
    };

    (StatusCode::OK, Json(review_managed_cluster_module(&req).into_review()))
}

/// Admission decision for one Module request
pub fn review_module(req: &AdmissionRequest<Module>) -> AdmissionResponse {
    let result = match (&req.operation, req.object.as_ref()) {
        (Operation::Delete, _) => match req.old_object.as_ref() {
            Some(old) => validate_delete(old),
            None => Ok(()),
        },
        (Operation::Create, Some(module)) => validate_create(module),
        (Operation::Update, Some(module)) => validate_update(module, req.old_object.as_ref()),
        (Operation::Create | Operation::Update, None) => {
            return AdmissionResponse::from(req).deny("request carries no Module object");
        }
        (Operation::Connect, _) => Ok(()),
    };

    respond(req, "Module", result)
}

/// Admission decision for one ManagedClusterModule request.
///
/// The embedded Module spec is held to the Module rules.
pub fn review_managed_cluster_module(req: &AdmissionRequest<ManagedClusterModule>) -> AdmissionResponse {
    let result = match (&req.operation, req.object.as_ref()) {
        (Operation::Delete, _) => match req.old_object.as_ref() {
            Some(old) => validate_delete(&old.module()),
            None => Ok(()),
        },
        (Operation::Create, Some(mcm)) => validate_create(&mcm.module()),
        (Operation::Update, Some(mcm)) => {
            let old = req.old_object.as_ref().map(ManagedClusterModule::module);
            validate_update(&mcm.module(), old.as_ref())
        }
        (Operation::Create | Operation::Update, None) => {
            return AdmissionResponse::from(req)
                .deny("request carries no ManagedClusterModule object");
        }
        (Operation::Connect, _) => Ok(()),
    };

    respond(req, "ManagedClusterModule", result)
}

fn respond<K>(
    req: &AdmissionRequest<K>,
    kind: &str,
    result: std::result::Result<(), SpecValidationError>,
) -> AdmissionResponse
where
    K: kube::Resource,
{
    let namespace = req.namespace.as_deref().unwrap_or_default();
    match result {
        Ok(()) => {
            debug!("Admitted {:?} of {} {}/{}", req.operation, kind, namespace, req.name);
            AdmissionResponse::from(req)
        }
        Err(e) => {
            info!("Denied {:?} of {} {}/{}: {}", req.operation, kind, namespace, req.name, e);
            AdmissionResponse::from(req).deny(e.to_string())
        }
    }
}

//! Error types for the KMM operator

use thiserror::Error;

use crate::crd::SpecValidationError;

#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// An object the reconciler depends on is gone
    #[error("{kind} {name} not found")]
    NotFound { kind: &'static str, name: String },

    /// No kernel mapping of the module matches the node's kernel
    #[error("failed to find mapping for kernel {kernel_version}")]
    NoKernelMapping { kernel_version: String },

    /// Module, kernel mapping or modprobe configuration is malformed
    #[error("{0}")]
    ValidationError(#[from] SpecValidationError),

    /// Operator configuration could not be loaded
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// Container registry could not be queried
    #[error("Registry error for {image}: {message}")]
    RegistryError { image: String, message: String },

    /// Finalizer bookkeeping failed
    #[error("Finalizer error: {0}")]
    FinalizerError(#[source] Box<kube::runtime::finalizer::Error<Error>>),

    /// Several independent steps of one pass failed
    #[error("{}", join_errors(.0))]
    Multiple(Vec<Error>),
}

fn join_errors(errors: &[Error]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<kube::runtime::finalizer::Error<Error>> for Error {
    fn from(e: kube::runtime::finalizer::Error<Error>) -> Self {
        Error::FinalizerError(Box::new(e))
    }
}

impl Error {
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Error::NotFound {
            kind,
            name: name.into(),
        }
    }

    /// Collapse the errors of one pass into a single result.
    ///
    /// No error is dropped: two or more become [`Error::Multiple`].
    pub fn aggregate(mut errors: Vec<Error>) -> Result<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Error::Multiple(errors)),
        }
    }

    fn api_code(&self) -> Option<u16> {
        match self {
            Error::KubeError(kube::Error::Api(resp)) => Some(resp.code),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. }) || self.api_code() == Some(404)
    }

    /// Optimistic-concurrency conflict on an update
    pub fn is_conflict(&self) -> bool {
        self.api_code() == Some(409) && !self.is_already_exists()
    }

    pub fn is_already_exists(&self) -> bool {
        match self {
            Error::KubeError(kube::Error::Api(resp)) => {
                resp.code == 409 && resp.reason == "AlreadyExists"
            }
            _ => false,
        }
    }

    /// Whether a short requeue is likely to succeed
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::KubeError(_) | Error::RegistryError { .. } => true,
            Error::NotFound { .. } => true,
            Error::Multiple(errors) => errors.iter().any(Error::is_retriable),
            Error::FinalizerError(_) => true,
            _ => false,
        }
    }

    /// Short category used for metrics labels
    pub fn kind(&self) -> &'static str {
        match self {
            Error::KubeError(_) => "kube",
            Error::NotFound { .. } => "not_found",
            Error::NoKernelMapping { .. } => "no_mapping",
            Error::ValidationError(_) => "validation",
            Error::ConfigError(_) => "config",
            Error::SerializationError(_) | Error::YamlError(_) => "serialization",
            Error::RegistryError { .. } => "registry",
            Error::FinalizerError(_) => "finalizer",
            Error::Multiple(_) => "multiple",
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

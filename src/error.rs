//! Error types for the KMM operator

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// Operator or resource configuration is unusable
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// No kernel mapping could be resolved for a kernel version
    #[error("Kernel mapping error for kernel {kernel_version}: {message}")]
    KernelMappingError {
        kernel_version: String,
        message: String,
    },

    /// More than one owned job exists for the same (module, kernel, stage)
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// A job reported a combination of counters that maps to no known status
    #[error("Unknown status for job {0}")]
    UnknownJobStatus(String),

    /// An existing job has no hash annotation to compare against
    #[error("Job {0} has no hash annotation")]
    MissingHashAnnotation(String),

    /// Container registry could not be queried
    #[error("Registry error: {0}")]
    RegistryError(String),

    /// HTTP transport error while talking to a registry
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// One or more kernel version pipelines failed during this pass
    #[error("Failed to reconcile kernel versions: {0}")]
    KernelVersions(String),

    /// One or more garbage collection passes failed
    #[error("Garbage collection failed: {0}")]
    GarbageCollection(String),
}

impl Error {
    /// Whether the reconcile should be retried on the short interval.
    ///
    /// Configuration and invariant problems will not go away until someone
    /// edits the Module or removes the duplicate job, so they back off longer.
    pub fn is_retriable(&self) -> bool {
        !matches!(
            self,
            Error::ConfigError(_)
                | Error::KernelMappingError { .. }
                | Error::InvariantViolation(_)
                | Error::MissingHashAnnotation(_)
        )
    }

    /// Short category used as a metrics label
    pub fn kind(&self) -> &'static str {
        match self {
            Error::KubeError(_) => "kube",
            Error::ConfigError(_) => "config",
            Error::KernelMappingError { .. } => "kernel_mapping",
            Error::InvariantViolation(_) => "invariant",
            Error::UnknownJobStatus(_) | Error::MissingHashAnnotation(_) => "job",
            Error::RegistryError(_) | Error::HttpError(_) => "registry",
            Error::SerializationError(_) => "serialization",
            Error::KernelVersions(_) => "kernel_versions",
            Error::GarbageCollection(_) => "garbage_collection",
        }
    }

    /// Whether this wraps a Kubernetes 404
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::KubeError(kube::Error::Api(e)) if e.code == 404)
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

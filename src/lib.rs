use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("SerializationError: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("YamlError: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Kube Error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Finalizer Error: {0}")]
    // NB: awkward type because finalizer::Error embeds the reconciler error (which is this)
    // so boxing this error to break cycles
    FinalizerError(#[from] Box<kube::runtime::finalizer::Error<Error>>),

    #[error("The credentials Secret {namespace}/{name} does not exist")]
    AssetSecretNotFound { name: String, namespace: String },

    #[error("No ClusterDeployment is specified")]
    NoClusterDeployment,

    #[error("The ClusterDeployment {namespace}/{name} does not exist")]
    ClusterDeploymentNotFound { name: String, namespace: String },

    #[error("Failed to expand agent manifests: {0}")]
    TemplateError(String),

    #[error("{}", join_errors(.0))]
    Aggregate(Vec<Error>),

    #[error("PKI Error: {0}")]
    PkiError(String),

    #[error("Invalid cert secret reference {0:?}, expected <namespace>/<name> or <name>")]
    InvalidCertSecret(String),
}

fn join_errors(errors: &[Error]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn metric_label(&self) -> &'static str {
        match self {
            Error::SerializationError(_) => "SerializationError",
            Error::YamlError(_) => "YamlError",
            Error::KubeError(_) => "KubeError",
            Error::FinalizerError(_) => "FinalizerError",
            Error::AssetSecretNotFound { .. } => "AssetSecretNotFound",
            Error::NoClusterDeployment => "NoClusterDeployment",
            Error::ClusterDeploymentNotFound { .. } => "ClusterDeploymentNotFound",
            Error::TemplateError(_) => "TemplateError",
            Error::Aggregate(_) => "Aggregate",
            Error::PkiError(_) => "PkiError",
            Error::InvalidCertSecret(_) => "InvalidCertSecret",
        }
    }

    /// Status code of the underlying api server response, looking through finalizer wrapping
    fn api_code(&self) -> Option<u16> {
        match self {
            Error::KubeError(kube::Error::Api(resp)) => Some(resp.code),
            Error::FinalizerError(err) => match err.as_ref() {
                kube::runtime::finalizer::Error::ApplyFailed(e)
                | kube::runtime::finalizer::Error::CleanupFailed(e) => e.api_code(),
                kube::runtime::finalizer::Error::AddFinalizer(kube::Error::Api(resp))
                | kube::runtime::finalizer::Error::RemoveFinalizer(kube::Error::Api(resp)) => {
                    Some(resp.code)
                }
                _ => None,
            },
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.api_code() == Some(404)
    }

    pub fn is_conflict(&self) -> bool {
        self.api_code() == Some(409)
    }

    pub fn is_forbidden(&self) -> bool {
        self.api_code() == Some(403)
    }

    /// Errors worth a fast retry: write conflicts, timeouts and transport failures.
    /// Everything else is requeued at the slow rate.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::KubeError(kube::Error::Api(resp)) => {
                matches!(resp.code, 409 | 429) || resp.code >= 500
            }
            Error::KubeError(_) => true,
            Error::FinalizerError(_) => self.is_conflict() || self.api_code().is_none(),
            Error::Aggregate(errors) => errors.iter().all(Error::is_transient),
            _ => false,
        }
    }
}

pub mod controllers;
pub use controllers::{run, Settings, State};

/// Log and trace integrations
pub mod telemetry;

/// Metrics
mod metrics;
pub use metrics::Metrics;

/// Requeue policy and conflict retries
pub mod backoff;

/// Finalizer add/remove with optimistic concurrency
pub mod finalizers;

/// Cluster-set to subject index
pub mod cache;

/// Derived role names, rule templates and binding helpers
pub mod rbac;

/// Certificate generation and validation
pub mod pki;

/// Agent manifest templates
pub mod manifests;

/// Admission decisions
pub mod webhook;

/// External and owned CRDs
pub mod resources;

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_error(code: u16) -> Error {
        Error::KubeError(kube::Error::Api(ErrorResponse {
            status: "Failure".into(),
            message: "boom".into(),
            reason: "Test".into(),
            code,
        }))
    }

    #[test]
    fn classifies_api_errors() {
        assert!(api_error(404).is_not_found());
        assert!(api_error(409).is_conflict());
        assert!(api_error(403).is_forbidden());
        assert!(api_error(409).is_transient());
        assert!(api_error(503).is_transient());
        assert!(!api_error(403).is_transient());
        assert!(!api_error(422).is_transient());
    }

    #[test]
    fn missing_referenced_objects_are_not_retried_fast() {
        let err = Error::ClusterDeploymentNotFound {
            name: "mycluster".into(),
            namespace: "mycluster".into(),
        };
        assert!(!err.is_transient());
        assert!(!Error::NoClusterDeployment.is_transient());
    }

    #[test]
    fn classification_looks_through_finalizer_errors() {
        let err = Error::FinalizerError(Box::new(
            kube::runtime::finalizer::Error::ApplyFailed(api_error(403)),
        ));
        assert!(err.is_forbidden());
        assert!(!err.is_transient());
    }

    #[test]
    fn aggregate_joins_lines() {
        let err = Error::Aggregate(vec![Error::NoClusterDeployment, Error::PkiError("bad".into())]);
        assert_eq!(
            err.to_string(),
            "No ClusterDeployment is specified\nPKI Error: bad"
        );
        assert!(!err.is_transient());
    }
}

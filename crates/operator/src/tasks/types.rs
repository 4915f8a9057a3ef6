use crate::tasks::config::OperatorConfig;
use kube::Client;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Label every operator-managed object carries
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY_VALUE: &str = "honsefarm-operator";
pub const NAME_LABEL: &str = "app.kubernetes.io/name";
pub const COMPONENT_LABEL: &str = "honsefarm-component";
pub const SHARD_LABEL: &str = "honsefarm-shard";
pub const PVC_LABEL: &str = "honsefarm-pvc";

/// Annotation on the build job recording the build identifier it was created for
pub const BUILD_ID_ANNOTATION: &str = "clusters.honse.farm/build-id";

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// A required field is missing or invalid for an enabled component
    #[error("Invalid cluster configuration: {0}")]
    ConfigError(String),

    #[error("Secret material generation failed: {0}")]
    CryptoError(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Reconcile pass cancelled")]
    Cancelled,

    #[error("Object is missing a name or uid")]
    MissingObjectKey,
}

impl Error {
    /// Errors worth another attempt without a spec change
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::KubeError(_) | Self::CryptoError(_) | Self::SerializationError(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::KubeError(kube::Error::Api(ae)) if ae.code == 404)
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::KubeError(kube::Error::Api(ae)) if ae.code == 409)
    }
}

/// Shared, immutable state handed to every reconcile pass
#[derive(Clone)]
pub struct Context {
    pub client: Client,
    pub config: Arc<OperatorConfig>,
    /// Cancelled on shutdown; observed at every control-plane call
    pub cancel: CancellationToken,
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_error(code: u16) -> Error {
        Error::KubeError(kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "boom".to_string(),
            reason: "Test".to_string(),
            code,
        }))
    }

    #[test]
    fn classifies_api_errors() {
        assert!(api_error(404).is_not_found());
        assert!(api_error(409).is_conflict());
        assert!(!api_error(500).is_not_found());
        assert!(api_error(500).is_retryable());
    }

    #[test]
    fn config_errors_wait_for_spec_change() {
        assert!(!Error::ConfigError("spec.images.server must be set".into()).is_retryable());
        assert!(!Error::Cancelled.is_retryable());
        assert!(Error::CryptoError("rng".into()).is_retryable());
    }
}

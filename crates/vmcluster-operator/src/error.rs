use thiserror::Error;

use crate::resources::BuildError;

#[derive(Error, Debug)]
pub enum OperatorError {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid cluster spec: {0}")]
    Validation(String),

    #[error("Cannot build workload: {0}")]
    Build(#[from] BuildError),

    #[error("Object rejected by the store: {0}")]
    Invalid(String),

    #[error("Object ownership conflict: {0}")]
    Ownership(String),

    #[error("Version conflict: {0}")]
    Conflict(String),

    #[error("Store unavailable: {0}")]
    Store(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, OperatorError>;

impl OperatorError {
    /// Whether the reconciliation should be retried with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            OperatorError::Kube(_)
                | OperatorError::Conflict(_)
                | OperatorError::Store(_)
                | OperatorError::Serialization(_)
        )
    }

    /// Whether the user has to edit the spec before another pass can succeed.
    pub fn is_user_correctable(&self) -> bool {
        matches!(
            self,
            OperatorError::Validation(_)
                | OperatorError::Build(_)
                | OperatorError::Invalid(_)
                | OperatorError::Ownership(_)
        )
    }

    /// Translate an API error into the store-level taxonomy.
    pub fn from_kube(err: kube::Error) -> Self {
        match &err {
            kube::Error::Api(resp) if resp.code == 404 => OperatorError::NotFound(resp.message.clone()),
            kube::Error::Api(resp) if resp.code == 409 => OperatorError::Conflict(resp.message.clone()),
            kube::Error::Api(resp) if resp.code == 422 => OperatorError::Invalid(resp.message.clone()),
            _ => OperatorError::Kube(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".into(),
            message: format!("status {code}"),
            reason: String::new(),
            code,
        })
    }

    #[test]
    fn test_kube_status_codes_are_classified() {
        assert!(matches!(OperatorError::from_kube(api_error(404)), OperatorError::NotFound(_)));
        assert!(matches!(OperatorError::from_kube(api_error(409)), OperatorError::Conflict(_)));
        assert!(matches!(OperatorError::from_kube(api_error(422)), OperatorError::Invalid(_)));
        assert!(matches!(OperatorError::from_kube(api_error(503)), OperatorError::Kube(_)));
    }

    #[test]
    fn test_conflict_is_transient_not_user_correctable() {
        let err = OperatorError::Conflict("stale".into());
        assert!(err.is_transient());
        assert!(!err.is_user_correctable());
    }

    #[test]
    fn test_validation_and_build_are_user_correctable() {
        assert!(OperatorError::Validation("bad size".into()).is_user_correctable());
        assert!(OperatorError::Build(BuildError::MissingImage("vmstorage".into())).is_user_correctable());
        assert!(OperatorError::Invalid("422".into()).is_user_correctable());
        assert!(OperatorError::Ownership("taken".into()).is_user_correctable());
        assert!(!OperatorError::NotFound("gone".into()).is_transient());
    }
}

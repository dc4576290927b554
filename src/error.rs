// src/error.rs
use thiserror::Error;

use crate::signing::protocol::Status;

pub type Result<T> = std::result::Result<T, PkiError>;

/// Errors raised while issuing, validating or distributing PKI material.
///
/// The variants follow the operator-facing taxonomy: configuration problems,
/// validation failures (with the normalized values that disagreed), signer
/// rejections, transport faults and internal crypto/encoding faults.
#[derive(Debug, Error)]
pub enum PkiError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("{field} mismatch: got {actual:?} want {expected:?}")]
    FieldMismatch {
        field: &'static str,
        expected: Vec<String>,
        actual: Vec<String>,
    },

    #[error("certificate public key does not match the locally generated private key")]
    KeyMismatch,

    /// The signer answered and refused the request on policy grounds.
    #[error("rejected by signer: {0}")]
    Rejected(Status),

    /// The signer could not be reached or the call was not authorized.
    #[error("transport error: {0}")]
    Transport(Status),

    #[error("internal error: {0}")]
    Internal(String),

    /// An optimistic update lost a race with another writer.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("issuing {identity:?} from {authority:?}: {source}")]
    Issuance {
        authority: String,
        identity: String,
        #[source]
        source: Box<PkiError>,
    },

    #[error("crypto error: {0}")]
    Crypto(#[from] openssl::error::ErrorStack),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl PkiError {
    /// Wraps an error with the identity and authority it was raised for.
    pub fn for_identity(self, authority: &str, identity: &str) -> Self {
        PkiError::Issuance {
            authority: authority.to_string(),
            identity: identity.to_string(),
            source: Box::new(self),
        }
    }

    /// True for errors that mean "the request was refused by policy" rather
    /// than "the signer could not be reached".
    pub fn is_policy_rejection(&self) -> bool {
        match self {
            PkiError::Rejected(_) => true,
            PkiError::Issuance { source, .. } => source.is_policy_rejection(),
            _ => false,
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, PkiError::Conflict(_))
    }

    pub fn is_transport(&self) -> bool {
        match self {
            PkiError::Transport(_) => true,
            PkiError::Issuance { source, .. } => source.is_transport(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signing::protocol::Code;

    #[test]
    fn issuance_context_preserves_classification() {
        let err = PkiError::Rejected(Status::new(Code::InvalidArgument, "SANs are not allowed"))
            .for_identity("etcd-ca", "kube-etcd-healthcheck-client");
        assert!(err.is_policy_rejection());
        assert!(!err.is_transport());
        let text = err.to_string();
        assert!(text.contains("kube-etcd-healthcheck-client"));
        assert!(text.contains("etcd-ca"));
    }

    #[test]
    fn mismatch_names_field_and_values() {
        let err = PkiError::FieldMismatch {
            field: "organization",
            expected: vec!["system:masters".into()],
            actual: vec!["wrong-org".into()],
        };
        assert_eq!(
            err.to_string(),
            r#"organization mismatch: got ["wrong-org"] want ["system:masters"]"#
        );
    }
}

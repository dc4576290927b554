// src/signing/protocol.rs
//! Wire contract between requesters and the signing service.
//!
//! Both calls take one opaque string and return one opaque string, so any
//! unary string-in/string-out transport can carry them. The sign payload is
//! the JSON object `{"caName": ..., "csrPEM": ...}`.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::PkiError;

pub const SERVICE_NAME: &str = "pki.v1.Signer";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    GetAuthorityCertificate,
    Sign,
}

impl Method {
    pub const ALL: [Method; 2] = [Method::GetAuthorityCertificate, Method::Sign];

    /// Fully qualified path, `/<service>/<method>`.
    pub fn path(self) -> &'static str {
        match self {
            Method::GetAuthorityCertificate => "/pki.v1.Signer/GetAuthorityCertificate",
            Method::Sign => "/pki.v1.Signer/Sign",
        }
    }

    pub fn from_path(path: &str) -> Option<Method> {
        Method::ALL.into_iter().find(|m| m.path() == path)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignRequest {
    #[serde(rename = "caName")]
    pub ca_name: String,
    #[serde(rename = "csrPEM")]
    pub csr_pem: String,
}

impl SignRequest {
    pub fn new(ca_name: impl Into<String>, csr_pem: impl Into<String>) -> Self {
        Self {
            ca_name: ca_name.into(),
            csr_pem: csr_pem.into(),
        }
    }

    pub fn encode(&self) -> Result<String, Status> {
        serde_json::to_string(self)
            .map_err(|e| Status::new(Code::Internal, format!("marshal sign request: {}", e)))
    }

    /// Strict decode. Nothing is produced from a payload that fails to parse.
    pub fn decode(payload: &str) -> Result<Self, Status> {
        serde_json::from_str(payload).map_err(|e| {
            Status::new(
                Code::InvalidArgument,
                format!("invalid sign payload: unmarshal sign request: {}", e),
            )
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Code {
    NotFound,
    InvalidArgument,
    Internal,
    Unauthenticated,
    PermissionDenied,
    DeadlineExceeded,
    Unavailable,
}

impl Code {
    pub fn http_status(self) -> u16 {
        match self {
            Code::InvalidArgument => 400,
            Code::Unauthenticated => 401,
            Code::PermissionDenied => 403,
            Code::NotFound => 404,
            Code::Internal => 500,
            Code::Unavailable => 503,
            Code::DeadlineExceeded => 504,
        }
    }

    pub fn from_http_status(status: u16) -> Code {
        match status {
            400 => Code::InvalidArgument,
            401 => Code::Unauthenticated,
            403 => Code::PermissionDenied,
            404 => Code::NotFound,
            408 | 504 => Code::DeadlineExceeded,
            502 | 503 => Code::Unavailable,
            _ => Code::Internal,
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Code::NotFound => "NotFound",
            Code::InvalidArgument => "InvalidArgument",
            Code::Internal => "Internal",
            Code::Unauthenticated => "Unauthenticated",
            Code::PermissionDenied => "PermissionDenied",
            Code::DeadlineExceeded => "DeadlineExceeded",
            Code::Unavailable => "Unavailable",
        };
        f.write_str(name)
    }
}

/// Error status carried back to the caller of a protocol method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub code: Code,
    pub message: String,
}

impl Status {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(Code::NotFound, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(Code::InvalidArgument, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Code::Internal, message)
    }

    /// Classifies the status for the requester: policy refusals become
    /// `Rejected`, signer faults `Internal`, everything about reaching or
    /// being admitted by the signer `Transport`.
    pub fn into_error(self) -> PkiError {
        match self.code {
            Code::NotFound | Code::InvalidArgument => PkiError::Rejected(self),
            Code::Internal => PkiError::Internal(format!("signer fault: {}", self)),
            Code::Unauthenticated
            | Code::PermissionDenied
            | Code::DeadlineExceeded
            | Code::Unavailable => PkiError::Transport(self),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for Status {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_request_round_trips() {
        let req = SignRequest::new(
            "kubernetes-ca",
            "-----BEGIN CERTIFICATE REQUEST-----\nabc\n-----END CERTIFICATE REQUEST-----",
        );
        let payload = req.encode().unwrap();
        assert!(payload.contains(r#""caName":"kubernetes-ca""#));
        assert!(payload.contains(r#""csrPEM""#));
        assert_eq!(SignRequest::decode(&payload).unwrap(), req);
    }

    #[test]
    fn malformed_payload_is_invalid_argument() {
        let err = SignRequest::decode("{not-json").unwrap_err();
        assert_eq!(err.code, Code::InvalidArgument);
        assert!(SignRequest::decode(r#"{"caName": 5}"#).is_err());
    }

    #[test]
    fn method_paths_resolve() {
        for method in Method::ALL {
            assert_eq!(Method::from_path(method.path()), Some(method));
        }
        assert_eq!(Method::from_path("/pki.v1.Signer/Revoke"), None);
        assert!(Method::Sign.path().starts_with(&format!("/{}/", SERVICE_NAME)));
    }

    #[test]
    fn codes_survive_http_mapping() {
        for code in [
            Code::NotFound,
            Code::InvalidArgument,
            Code::Internal,
            Code::Unauthenticated,
            Code::PermissionDenied,
            Code::DeadlineExceeded,
            Code::Unavailable,
        ] {
            assert_eq!(Code::from_http_status(code.http_status()), code);
        }
    }

    #[test]
    fn classification_separates_policy_from_transport() {
        assert!(Status::invalid_argument("bad csr").into_error().is_policy_rejection());
        let denied = Status::new(Code::PermissionDenied, "client not allowed").into_error();
        assert!(denied.is_transport());
        assert!(!denied.is_policy_rejection());
        assert!(matches!(
            Status::internal("sign failed").into_error(),
            PkiError::Internal(_)
        ));
    }
}

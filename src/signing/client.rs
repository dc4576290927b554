// src/signing/client.rs
use async_trait::async_trait;
use openssl::x509::X509;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::auth::PeerIdentity;
use super::protocol::{Code, Method, SignRequest, Status};
use super::service::SigningService;
use crate::cert::inspect::inspect_certificate;
use crate::cert::openssl::{
    build_csr, generate_private_key, parse_certificate_pem, private_key_to_pem, LEAF_KEY_BITS,
};
use crate::cert::types::{IdentitySpec, KeyPair};
use crate::cert::verification::validate_signed_leaf;
use crate::error::{PkiError, Result};

pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(30);

/// Unary string-in/string-out call to the signing service.
#[async_trait]
pub trait SignerTransport: Send + Sync {
    async fn invoke(&self, method: Method, payload: String) -> std::result::Result<String, Status>;
}

/// Calls a `SigningService` in the same process, presenting a fixed peer
/// identity as a real channel would.
#[derive(Clone)]
pub struct InProcessTransport {
    service: Arc<SigningService>,
    peer: Option<PeerIdentity>,
}

impl InProcessTransport {
    pub fn new(service: Arc<SigningService>, peer: Option<PeerIdentity>) -> Self {
        Self { service, peer }
    }
}

#[async_trait]
impl SignerTransport for InProcessTransport {
    async fn invoke(&self, method: Method, payload: String) -> std::result::Result<String, Status> {
        self.service.handle(method, self.peer.as_ref(), &payload)
    }
}

/// An authority certificate fetched from the signer, kept verbatim.
#[derive(Debug, Clone)]
pub struct RemoteAuthority {
    pub name: String,
    pub cert_pem: Vec<u8>,
    pub certificate: X509,
}

impl RemoteAuthority {
    pub fn export(&self) -> KeyPair {
        KeyPair::cert_only(self.cert_pem.clone())
    }
}

/// Requester side of remote custody. Leaf keys are generated here and never
/// sent; only CSRs travel.
pub struct RemoteSigningClient {
    transport: Box<dyn SignerTransport>,
    deadline: Duration,
}

impl RemoteSigningClient {
    pub fn new(transport: impl SignerTransport + 'static, deadline: Duration) -> Self {
        Self {
            transport: Box::new(transport),
            deadline,
        }
    }

    async fn call(&self, method: Method, payload: String) -> Result<String> {
        match tokio::time::timeout(self.deadline, self.transport.invoke(method, payload)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(status)) => Err(status.into_error()),
            Err(_) => Err(PkiError::Transport(Status::new(
                Code::DeadlineExceeded,
                format!("{} exceeded deadline of {:?}", method, self.deadline),
            ))),
        }
    }

    pub async fn fetch_authority_certificate(&self, name: &str) -> Result<RemoteAuthority> {
        let pem = self
            .call(Method::GetAuthorityCertificate, name.to_string())
            .await?;
        let certificate = parse_certificate_pem(pem.as_bytes())?;
        if !inspect_certificate(&certificate.to_der()?)?.is_ca {
            return Err(PkiError::Validation(format!(
                "signer returned a non-CA certificate for authority {:?}",
                name
            )));
        }
        debug!(authority = name, "fetched authority certificate");
        Ok(RemoteAuthority {
            name: name.to_string(),
            cert_pem: pem.into_bytes(),
            certificate,
        })
    }

    /// Generates a key and CSR for `spec`, has the signer sign it, and
    /// accepts the result only after independent validation.
    pub async fn request_leaf(
        &self,
        authority: &RemoteAuthority,
        spec: &IdentitySpec,
    ) -> Result<KeyPair> {
        let key = generate_private_key(LEAF_KEY_BITS)?;
        let csr = build_csr(spec, &key)?;
        let csr_pem = String::from_utf8(csr.to_pem()?)
            .map_err(|e| PkiError::Internal(format!("encode csr: {}", e)))?;
        let payload = SignRequest::new(&authority.name, csr_pem)
            .encode()
            .map_err(Status::into_error)?;

        let cert_pem = self.call(Method::Sign, payload).await?.into_bytes();
        validate_signed_leaf(&cert_pem, &authority.certificate, spec, &key)?;

        info!(
            authority = %authority.name,
            identity = %spec.common_name,
            "remote leaf issued and validated"
        );
        Ok(KeyPair::new(cert_pem, private_key_to_pem(&key)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cert::ca::AuthorityMaterial;
    use crate::cert::catalog::KUBERNETES_CA;
    use crate::signing::auth::ClientAllowList;
    use crate::signing::profile::SigningProfiles;

    struct StalledTransport;

    #[async_trait]
    impl SignerTransport for StalledTransport {
        async fn invoke(&self, _: Method, _: String) -> std::result::Result<String, Status> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Err(Status::internal("unreachable"))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_expiry_is_a_transport_error() {
        let client = RemoteSigningClient::new(StalledTransport, Duration::from_secs(5));
        let err = client
            .fetch_authority_certificate(KUBERNETES_CA)
            .await
            .unwrap_err();
        match err {
            PkiError::Transport(status) => assert_eq!(status.code, Code::DeadlineExceeded),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn in_process_round_trip() {
        let service = Arc::new(SigningService::new(
            [AuthorityMaterial::generate(KUBERNETES_CA).unwrap()],
            SigningProfiles::kubeadm(),
            ClientAllowList::default(),
        ));
        let client = RemoteSigningClient::new(
            InProcessTransport::new(service, None),
            DEFAULT_DEADLINE,
        );
        let authority = client
            .fetch_authority_certificate(KUBERNETES_CA)
            .await
            .unwrap();
        let spec = IdentitySpec::new("system:kube-scheduler")
            .organization("system:kube-scheduler")
            .usages(&[crate::cert::types::ExtKeyUsage::ClientAuth]);
        let pair = client.request_leaf(&authority, &spec).await.unwrap();
        assert!(pair.is_complete());
    }
}

// src/signing/https.rs
//! HTTPS carriage for the signing protocol, mutually authenticated with
//! TLS 1.3 on both ends.
//!
//! Each protocol method is a POST route named after its method path; the
//! request body is the string argument and a 200 body is the string result.
//! Failures come back as a JSON `Status` under the mapped HTTP status code.

use async_trait::async_trait;
use axum::extract::{Extension, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use hyper_util::rt::TokioIo;
use hyper_util::service::TowerToHyperService;
use openssl::pkey::PKey;
use openssl::x509::X509;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use std::future::Future;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use super::auth::PeerIdentity;
use super::client::SignerTransport;
use super::protocol::{Code, Method, Status};
use super::service::SigningService;
use crate::cert::inspect::peer_common_name;
use crate::error::{PkiError, Result};

/// PEM material for the service's side of the channel.
#[derive(Debug, Clone)]
pub struct ServerTlsMaterial {
    pub cert_chain_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
    /// Roots that client certificates must chain to.
    pub client_ca_pem: Vec<u8>,
}

/// PEM material for the requester's side of the channel.
#[derive(Debug, Clone)]
pub struct ClientTlsMaterial {
    /// Pinned root for the signer's server certificate.
    pub ca_pem: Vec<u8>,
    pub cert_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
}

fn certificate_chain(pem: &[u8], what: &str) -> Result<Vec<CertificateDer<'static>>> {
    let chain = X509::stack_from_pem(pem)
        .map_err(|e| PkiError::Config(format!("parse {}: {}", what, e)))?;
    if chain.is_empty() {
        return Err(PkiError::Config(format!("{} contains no certificates", what)));
    }
    chain
        .iter()
        .map(|cert| -> Result<CertificateDer<'static>> {
            Ok(CertificateDer::from(cert.to_der()?))
        })
        .collect()
}

fn private_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>> {
    let key = PKey::private_key_from_pem(pem)
        .map_err(|e| PkiError::Config(format!("parse TLS private key: {}", e)))?;
    Ok(PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
        key.private_key_to_pkcs8()?,
    )))
}

/// rustls server config: TLS 1.3 only, client certificate required and
/// verified against `client_ca_pem`.
pub fn server_tls_config(material: &ServerTlsMaterial) -> Result<ServerConfig> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let mut roots = RootCertStore::empty();
    for root in certificate_chain(&material.client_ca_pem, "client CA bundle")? {
        roots
            .add(root)
            .map_err(|e| PkiError::Config(format!("add client CA: {}", e)))?;
    }
    let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider.clone())
        .build()
        .map_err(|e| PkiError::Config(format!("build client verifier: {}", e)))?;

    ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| PkiError::Config(format!("select TLS versions: {}", e)))?
        .with_client_cert_verifier(verifier)
        .with_single_cert(
            certificate_chain(&material.cert_chain_pem, "server certificate")?,
            private_key(&material.key_pem)?,
        )
        .map_err(|e| PkiError::Config(format!("build server TLS config: {}", e)))
}

/// Peer identity of one accepted connection, attached to every request on it.
#[derive(Debug, Clone, Default)]
pub struct ConnectionPeer(pub Option<PeerIdentity>);

pub fn router(service: Arc<SigningService>) -> Router {
    Router::new()
        .route(
            Method::GetAuthorityCertificate.path(),
            post(get_authority_certificate),
        )
        .route(Method::Sign.path(), post(sign))
        .with_state(service)
}

async fn get_authority_certificate(
    State(service): State<Arc<SigningService>>,
    Extension(peer): Extension<ConnectionPeer>,
    body: String,
) -> Response {
    dispatch(service, Method::GetAuthorityCertificate, peer, body).await
}

async fn sign(
    State(service): State<Arc<SigningService>>,
    Extension(peer): Extension<ConnectionPeer>,
    body: String,
) -> Response {
    dispatch(service, Method::Sign, peer, body).await
}

async fn dispatch(
    service: Arc<SigningService>,
    method: Method,
    peer: ConnectionPeer,
    payload: String,
) -> Response {
    // RSA signing is CPU-bound; keep it off the reactor threads.
    let result =
        tokio::task::spawn_blocking(move || service.handle(method, peer.0.as_ref(), &payload))
            .await
            .unwrap_or_else(|e| Err(Status::internal(format!("signing task failed: {}", e))));

    match result {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/x-pem-file")],
            body,
        )
            .into_response(),
        Err(status) => {
            let code = StatusCode::from_u16(status.code.http_status())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (code, Json(status)).into_response()
        }
    }
}

/// TCP listener plus TLS acceptor serving the protocol router.
pub struct SignerServer {
    listener: TcpListener,
    acceptor: TlsAcceptor,
    router: Router,
}

impl SignerServer {
    pub async fn bind(
        addr: &str,
        service: Arc<SigningService>,
        material: &ServerTlsMaterial,
    ) -> Result<Self> {
        let tls = server_tls_config(material)?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| PkiError::Config(format!("listen on {}: {}", addr, e)))?;
        Ok(Self {
            listener,
            acceptor: TlsAcceptor::from(Arc::new(tls)),
            router: router(service),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn serve(self) -> Result<()> {
        self.serve_until(std::future::pending()).await
    }

    /// Accepts connections until `shutdown` resolves. Connections already
    /// accepted run to completion on their own tasks.
    pub async fn serve_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let addr = self.local_addr()?;
        info!(%addr, "signing service listening (mTLS, TLS 1.3)");
        tokio::pin!(shutdown);

        loop {
            let (stream, peer_addr) = tokio::select! {
                _ = &mut shutdown => {
                    info!(%addr, "signing service shutting down");
                    return Ok(());
                }
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!(error = %e, "TCP accept error");
                        continue;
                    }
                },
            };

            let acceptor = self.acceptor.clone();
            let router = self.router.clone();
            tokio::spawn(async move {
                serve_connection(acceptor, router, stream, peer_addr).await;
            });
        }
    }
}

async fn serve_connection(
    acceptor: TlsAcceptor,
    router: Router,
    stream: TcpStream,
    peer_addr: SocketAddr,
) {
    let tls_stream = match acceptor.accept(stream).await {
        Ok(tls_stream) => tls_stream,
        Err(e) => {
            warn!(%peer_addr, error = %e, "TLS handshake failed");
            return;
        }
    };

    let peer = {
        let (_, conn) = tls_stream.get_ref();
        conn.peer_certificates()
            .and_then(|certs| certs.first())
            .and_then(|leaf| match peer_common_name(leaf.as_ref()) {
                Ok(cn) => Some(PeerIdentity::new(cn)),
                Err(e) => {
                    warn!(%peer_addr, error = %e, "unreadable client certificate");
                    None
                }
            })
    };
    debug!(%peer_addr, peer = ?peer, "mTLS connection established");

    let service = TowerToHyperService::new(router.layer(Extension(ConnectionPeer(peer))));
    if let Err(e) = hyper::server::conn::http1::Builder::new()
        .serve_connection(TokioIo::new(tls_stream), service)
        .await
    {
        debug!(%peer_addr, error = %e, "connection closed with error");
    }
}

/// reqwest-based transport for `RemoteSigningClient`.
pub struct HttpsTransport {
    client: reqwest::Client,
    base: url::Url,
}

impl HttpsTransport {
    /// `endpoint` is `host:port`. With `server_name` set, TLS verifies the
    /// signer's certificate against that name while still dialing `endpoint`.
    pub fn new(
        endpoint: &str,
        material: &ClientTlsMaterial,
        server_name: Option<&str>,
    ) -> Result<Self> {
        let endpoint = endpoint.trim();
        if endpoint.is_empty() {
            return Err(PkiError::Config("signer endpoint cannot be empty".to_string()));
        }
        if material.ca_pem.is_empty() || material.cert_pem.is_empty() || material.key_pem.is_empty()
        {
            return Err(PkiError::Config(
                "signer TLS inputs are required: ca-cert, client-cert, client-key".to_string(),
            ));
        }

        let root = reqwest::Certificate::from_pem(&material.ca_pem)
            .map_err(|e| PkiError::Config(format!("parse signer CA certificate: {}", e)))?;
        let mut identity_pem = material.cert_pem.clone();
        if !identity_pem.ends_with(b"\n") {
            identity_pem.push(b'\n');
        }
        identity_pem.extend_from_slice(&material.key_pem);
        let identity = reqwest::Identity::from_pem(&identity_pem)
            .map_err(|e| PkiError::Config(format!("load client key pair: {}", e)))?;

        let mut builder = reqwest::Client::builder()
            .use_rustls_tls()
            .tls_built_in_root_certs(false)
            .add_root_certificate(root)
            .identity(identity)
            .min_tls_version(reqwest::tls::Version::TLS_1_3)
            .https_only(true);

        let authority = match server_name.map(str::trim).filter(|s| !s.is_empty()) {
            Some(name) => {
                let addr = endpoint
                    .to_socket_addrs()
                    .map_err(|e| PkiError::Config(format!("resolve {}: {}", endpoint, e)))?
                    .next()
                    .ok_or_else(|| {
                        PkiError::Config(format!("{} resolved to no addresses", endpoint))
                    })?;
                builder = builder.resolve(name, addr);
                format!("{}:{}", name, addr.port())
            }
            None => endpoint.to_string(),
        };

        let base = url::Url::parse(&format!("https://{}", authority)).map_err(|e| {
            PkiError::Config(format!("invalid signer endpoint {:?}: {}", endpoint, e))
        })?;
        let client = builder
            .build()
            .map_err(|e| PkiError::Config(format!("build signer client: {}", e)))?;
        Ok(Self { client, base })
    }
}

#[async_trait]
impl SignerTransport for HttpsTransport {
    async fn invoke(&self, method: Method, payload: String) -> std::result::Result<String, Status> {
        let url = self
            .base
            .join(method.path())
            .map_err(|e| Status::internal(format!("build {} url: {}", method, e)))?;

        let response = self
            .client
            .post(url)
            .header(header::CONTENT_TYPE.as_str(), "text/plain; charset=utf-8")
            .body(payload)
            .send()
            .await
            .map_err(|e| {
                let code = if e.is_timeout() {
                    Code::DeadlineExceeded
                } else {
                    Code::Unavailable
                };
                Status::new(code, format!("{} failed: {}", method, e))
            })?;

        let http_status = response.status();
        let body = response.text().await.map_err(|e| {
            Status::new(Code::Unavailable, format!("read {} response: {}", method, e))
        })?;
        if http_status.is_success() {
            return Ok(body);
        }
        Err(serde_json::from_str::<Status>(&body).unwrap_or_else(|_| {
            Status::new(
                Code::from_http_status(http_status.as_u16()),
                format!("{} returned {}: {}", method, http_status, body.trim()),
            )
        }))
    }
}

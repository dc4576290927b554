use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

use kube_external_ca::cert::{
    issue_leaf, AuthorityMaterial, ExtKeyUsage, IdentitySpec, KeyPair, AUTHORITY_NAMES,
    FRONT_PROXY_CA,
};
use kube_external_ca::signing::{
    ClientAllowList, ClientTlsMaterial, Code, HttpsTransport, RemoteSigningClient,
    ServerTlsMaterial, SignerServer, SigningProfiles, SigningService,
};
use kube_external_ca::PkiError;

struct Pki {
    ca: AuthorityMaterial,
    server: KeyPair,
}

impl Pki {
    fn new() -> Self {
        let ca = AuthorityMaterial::generate("tls-ca").unwrap();
        let server = issue_leaf(
            &ca,
            &IdentitySpec::new("kube-ca-signer")
                .sans(["127.0.0.1", "localhost"])
                .usages(&[ExtKeyUsage::ServerAuth]),
        )
        .unwrap();
        Self { ca, server }
    }

    fn client(&self, common_name: &str) -> ClientTlsMaterial {
        let pair = issue_leaf(
            &self.ca,
            &IdentitySpec::new(common_name).usages(&[ExtKeyUsage::ClientAuth]),
        )
        .unwrap();
        ClientTlsMaterial {
            ca_pem: self.ca.cert_pem().unwrap(),
            cert_pem: pair.cert_pem.clone(),
            key_pem: pair.key_bytes().to_vec(),
        }
    }
}

async fn start(pki: &Pki, allowed: &[&str]) -> (String, oneshot::Sender<()>) {
    let service = Arc::new(SigningService::new(
        AUTHORITY_NAMES
            .iter()
            .map(|name| AuthorityMaterial::generate(name).unwrap()),
        SigningProfiles::kubeadm(),
        ClientAllowList::new(allowed.iter().copied()),
    ));
    let material = ServerTlsMaterial {
        cert_chain_pem: pki.server.cert_pem.clone(),
        key_pem: pki.server.key_bytes().to_vec(),
        client_ca_pem: pki.ca.cert_pem().unwrap(),
    };
    let server = SignerServer::bind("127.0.0.1:0", service, &material)
        .await
        .unwrap();
    let addr = server.local_addr().unwrap().to_string();
    let (stop, stopped) = oneshot::channel::<()>();
    tokio::spawn(server.serve_until(async {
        let _ = stopped.await;
    }));
    (addr, stop)
}

fn remote(addr: &str, material: &ClientTlsMaterial, server_name: Option<&str>) -> RemoteSigningClient {
    RemoteSigningClient::new(
        HttpsTransport::new(addr, material, server_name).unwrap(),
        Duration::from_secs(10),
    )
}

#[tokio::test]
async fn signs_over_mutual_tls() {
    let pki = Pki::new();
    let (addr, stop) = start(&pki, &["bootstrapper"]).await;

    let client = remote(&addr, &pki.client("bootstrapper"), None);
    let authority = client.fetch_authority_certificate(FRONT_PROXY_CA).await.unwrap();
    let spec = IdentitySpec::new("front-proxy-client").usages(&[ExtKeyUsage::ClientAuth]);
    let pair = client.request_leaf(&authority, &spec).await.unwrap();
    assert!(pair.is_complete());

    let _ = stop.send(());
}

#[tokio::test]
async fn server_name_override_verifies_against_that_name() {
    let pki = Pki::new();
    let (addr, stop) = start(&pki, &[]).await;

    let client = remote(&addr, &pki.client("anyone"), Some("localhost"));
    client.fetch_authority_certificate(FRONT_PROXY_CA).await.unwrap();

    let _ = stop.send(());
}

#[tokio::test]
async fn client_outside_allow_list_is_denied() {
    let pki = Pki::new();
    let (addr, stop) = start(&pki, &["bootstrapper"]).await;

    let err = remote(&addr, &pki.client("intruder"), None)
        .fetch_authority_certificate(FRONT_PROXY_CA)
        .await
        .unwrap_err();
    match err {
        PkiError::Transport(status) => assert_eq!(status.code, Code::PermissionDenied),
        other => panic!("unexpected error: {other}"),
    }

    let _ = stop.send(());
}

#[tokio::test]
async fn unknown_authority_maps_back_to_not_found() {
    let pki = Pki::new();
    let (addr, stop) = start(&pki, &[]).await;

    let err = remote(&addr, &pki.client("bootstrapper"), None)
        .fetch_authority_certificate("missing-ca")
        .await
        .unwrap_err();
    match err {
        PkiError::Rejected(status) => assert_eq!(status.code, Code::NotFound),
        other => panic!("unexpected error: {other}"),
    }

    let _ = stop.send(());
}

#[tokio::test]
async fn client_from_another_ca_cannot_connect() {
    let pki = Pki::new();
    let (addr, stop) = start(&pki, &[]).await;

    let stranger = Pki::new();
    let mut material = stranger.client("bootstrapper");
    material.ca_pem = pki.ca.cert_pem().unwrap();

    let err = remote(&addr, &material, None)
        .fetch_authority_certificate(FRONT_PROXY_CA)
        .await
        .unwrap_err();
    assert!(err.is_transport(), "{err}");

    let _ = stop.send(());
}

#[test]
fn transport_requires_all_tls_inputs() {
    let pki = Pki::new();
    let mut material = pki.client("bootstrapper");
    material.key_pem.clear();
    assert!(matches!(
        HttpsTransport::new("127.0.0.1:9443", &material, None),
        Err(PkiError::Config(_))
    ));
    assert!(matches!(
        HttpsTransport::new("  ", &pki.client("bootstrapper"), None),
        Err(PkiError::Config(_))
    ));
}

// src/bootstrap/builder.rs
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, info};

use crate::cert::catalog::{IdentityCatalog, LeafIdentity, AUTHORITY_NAMES, KUBERNETES_CA};
use crate::cert::issuer::LocalSigner;
use crate::cert::openssl::{parse_certificate_pem, parse_private_key_pem};
use crate::cert::service_account::reuse_or_generate;
use crate::cert::types::{IdentitySpec, KeyPair};
use crate::cert::verification::validate_signed_leaf;
use crate::error::{PkiError, Result};
use crate::kubeconfig::{build_kubeconfig, kubelet_user, LOCAL_APISERVER};
use crate::signing::client::{RemoteAuthority, RemoteSigningClient};

/// How leaves get signed for a run.
pub enum Issuer {
    Local(LocalSigner),
    Remote(RemoteSigningClient),
}

impl Issuer {
    pub fn mode(&self) -> &'static str {
        match self {
            Issuer::Local(_) => "local",
            Issuer::Remote(_) => "remote",
        }
    }
}

/// Principals that receive a kubeconfig.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Principal {
    Admin,
    SuperAdmin,
    Kubelet,
    ControllerManager,
    Scheduler,
}

impl Principal {
    pub const ALL: [Principal; 5] = [
        Principal::Admin,
        Principal::SuperAdmin,
        Principal::Kubelet,
        Principal::ControllerManager,
        Principal::Scheduler,
    ];

    pub fn file_name(self) -> &'static str {
        match self {
            Principal::Admin => "admin.conf",
            Principal::SuperAdmin => "super-admin.conf",
            Principal::Kubelet => "kubelet.conf",
            Principal::ControllerManager => "controller-manager.conf",
            Principal::Scheduler => "scheduler.conf",
        }
    }

    /// Leaf whose certificate and key the kubeconfig embeds.
    pub fn credentials(self) -> LeafIdentity {
        match self {
            Principal::Admin | Principal::Kubelet => LeafIdentity::Admin,
            Principal::SuperAdmin => LeafIdentity::SuperAdmin,
            Principal::ControllerManager => LeafIdentity::ControllerManager,
            Principal::Scheduler => LeafIdentity::Scheduler,
        }
    }

    /// Control-plane components talk to their local apiserver.
    fn uses_local_apiserver(self) -> bool {
        matches!(self, Principal::ControllerManager | Principal::Scheduler)
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.file_name().trim_end_matches(".conf"))
    }
}

/// A rendered kubeconfig and what went into it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfigRecord {
    pub principal: Principal,
    pub server: String,
    pub user: String,
    pub kubeconfig: Vec<u8>,
}

/// Complete output of one issuance run.
#[derive(Debug, Clone)]
pub struct Artifacts {
    /// Authority certificates, never keys.
    pub authorities: BTreeMap<String, KeyPair>,
    pub leaves: BTreeMap<LeafIdentity, KeyPair>,
    pub service_account: KeyPair,
    pub service_account_reused: bool,
    pub client_configs: BTreeMap<Principal, ClientConfigRecord>,
}

impl Artifacts {
    pub fn authority(&self, name: &str) -> Result<&KeyPair> {
        self.authorities
            .get(name)
            .ok_or_else(|| PkiError::Internal(format!("missing authority certificate {:?}", name)))
    }

    pub fn leaf(&self, identity: LeafIdentity) -> Result<&KeyPair> {
        self.leaves
            .get(&identity)
            .ok_or_else(|| PkiError::Internal(format!("missing leaf {:?}", identity.common_name())))
    }

    pub fn client_config(&self, principal: Principal) -> Result<&ClientConfigRecord> {
        self.client_configs
            .get(&principal)
            .ok_or_else(|| PkiError::Internal(format!("missing kubeconfig for {}", principal)))
    }
}

/// Authority certificates resolved for a run, plus the way to reach the key.
enum Signer<'a> {
    Local(&'a LocalSigner),
    Remote(&'a RemoteSigningClient, BTreeMap<String, RemoteAuthority>),
}

impl Signer<'_> {
    fn authority_certificate(&self, name: &str) -> Result<KeyPair> {
        match self {
            Signer::Local(local) => local.authority(name)?.export(),
            Signer::Remote(_, authorities) => authorities
                .get(name)
                .map(RemoteAuthority::export)
                .ok_or_else(|| PkiError::Config(format!("no parent authority named {:?}", name))),
        }
    }

    async fn issue(&self, authority: &str, spec: &IdentitySpec) -> Result<KeyPair> {
        match self {
            Signer::Local(local) => {
                let pair = local.issue_leaf(authority, spec)?;
                // Local leaves go through the same checks as remote ones.
                let key = parse_private_key_pem(pair.key_bytes())?;
                validate_signed_leaf(
                    &pair.cert_pem,
                    local.authority(authority)?.certificate(),
                    spec,
                    &key,
                )?;
                Ok(pair)
            }
            Signer::Remote(client, authorities) => {
                let parent = authorities.get(authority).ok_or_else(|| {
                    PkiError::Config(format!("no parent authority named {:?}", authority))
                })?;
                client.request_leaf(parent, spec).await
            }
        }
    }
}

/// Drives the identity catalog through one issuer and assembles Artifacts.
pub struct ArtifactBuilder {
    catalog: IdentityCatalog,
    issuer: Issuer,
    server: String,
    kubelet_node_name: Option<String>,
    previous_service_account: Option<KeyPair>,
}

impl ArtifactBuilder {
    /// `server` is the endpoint written into the admin, super-admin and
    /// kubelet kubeconfigs.
    pub fn new(catalog: IdentityCatalog, issuer: Issuer, server: impl Into<String>) -> Self {
        Self {
            catalog,
            issuer,
            server: server.into(),
            kubelet_node_name: None,
            previous_service_account: None,
        }
    }

    pub fn kubelet_node_name(mut self, name: Option<String>) -> Self {
        self.kubelet_node_name = name;
        self
    }

    /// Service-account pair from an earlier run, reused if it still matches.
    pub fn previous_service_account(mut self, pair: Option<KeyPair>) -> Self {
        self.previous_service_account = pair;
        self
    }

    pub fn issuer(&self) -> &Issuer {
        &self.issuer
    }

    /// Issues every catalog identity in order. Any failure aborts the run and
    /// nothing is returned.
    pub async fn build(&self) -> Result<Artifacts> {
        if self.server.trim().is_empty() {
            return Err(PkiError::Config(
                "cluster endpoint is empty; pass --server explicitly".to_string(),
            ));
        }

        let signer = match &self.issuer {
            Issuer::Local(local) => Signer::Local(local),
            Issuer::Remote(client) => {
                let mut fetched = BTreeMap::new();
                for name in AUTHORITY_NAMES {
                    let authority = client.fetch_authority_certificate(name).await?;
                    fetched.insert(name.to_string(), authority);
                }
                Signer::Remote(client, fetched)
            }
        };

        let mut authorities = BTreeMap::new();
        for name in AUTHORITY_NAMES {
            authorities.insert(name.to_string(), signer.authority_certificate(name)?);
        }

        let mut leaves = BTreeMap::new();
        for entry in self.catalog.entries() {
            let pair = signer
                .issue(entry.authority, &entry.spec)
                .await
                .map_err(|e| e.for_identity(entry.authority, &entry.spec.common_name))?;
            if !pair.is_complete() {
                return Err(PkiError::Validation(format!(
                    "issued key pair for {:?} is incomplete",
                    entry.spec.common_name
                ))
                .for_identity(entry.authority, &entry.spec.common_name));
            }
            info!(
                mode = self.issuer.mode(),
                authority = entry.authority,
                identity = %entry.identity,
                "leaf issued"
            );
            leaves.insert(entry.identity, pair);
        }

        let (service_account, service_account_reused) =
            reuse_or_generate(self.previous_service_account.as_ref())?;

        let mut artifacts = Artifacts {
            authorities,
            leaves,
            service_account,
            service_account_reused,
            client_configs: BTreeMap::new(),
        };
        artifacts.client_configs = self.client_configs(&artifacts)?;

        info!(
            mode = self.issuer.mode(),
            leaves = artifacts.leaves.len(),
            kubeconfigs = artifacts.client_configs.len(),
            "artifacts complete"
        );
        Ok(artifacts)
    }

    fn client_configs(
        &self,
        artifacts: &Artifacts,
    ) -> Result<BTreeMap<Principal, ClientConfigRecord>> {
        let ca_pem = &artifacts.authority(KUBERNETES_CA)?.cert_pem;
        let mut records = BTreeMap::new();
        for principal in Principal::ALL {
            let credentials = principal.credentials();
            let pair = artifacts.leaf(credentials)?;
            let user = match principal {
                Principal::Kubelet => kubelet_user(self.kubelet_node_name.as_deref()),
                _ => credentials.common_name().to_string(),
            };
            let server = if principal.uses_local_apiserver() {
                LOCAL_APISERVER.to_string()
            } else {
                self.server.trim().to_string()
            };
            let kubeconfig =
                build_kubeconfig(&server, ca_pem, &user, &pair.cert_pem, pair.key_bytes())?;
            debug!(%principal, %server, %user, "kubeconfig rendered");
            records.insert(
                principal,
                ClientConfigRecord {
                    principal,
                    server,
                    user,
                    kubeconfig,
                },
            );
        }
        Ok(records)
    }
}

/// Leaf certificate parsed back, for callers that need to inspect output.
pub fn leaf_certificate(pair: &KeyPair) -> Result<openssl::x509::X509> {
    parse_certificate_pem(&pair.cert_pem)
}

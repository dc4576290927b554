// src/cert/catalog.rs
//! The fixed set of identities a kubeadm control plane needs, as seen by the
//! requester. The signing service keeps its own table in
//! `signing::profile`; the two must agree on usages for every identity.

use std::fmt;

use super::types::{ExtKeyUsage, IdentitySpec};

pub const KUBERNETES_CA: &str = "kubernetes-ca";
pub const FRONT_PROXY_CA: &str = "kubernetes-front-proxy-ca";
pub const ETCD_CA: &str = "etcd-ca";

/// Every authority, in issuance order.
pub const AUTHORITY_NAMES: [&str; 3] = [KUBERNETES_CA, FRONT_PROXY_CA, ETCD_CA];

pub const SYSTEM_MASTERS: &str = "system:masters";

const SERVER: &[ExtKeyUsage] = &[ExtKeyUsage::ServerAuth];
const CLIENT: &[ExtKeyUsage] = &[ExtKeyUsage::ClientAuth];
const SERVER_CLIENT: &[ExtKeyUsage] = &[ExtKeyUsage::ServerAuth, ExtKeyUsage::ClientAuth];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LeafIdentity {
    ApiServer,
    ApiServerKubeletClient,
    FrontProxyClient,
    ApiServerEtcdClient,
    EtcdServer,
    EtcdPeer,
    EtcdHealthcheckClient,
    Admin,
    SuperAdmin,
    ControllerManager,
    Scheduler,
}

impl LeafIdentity {
    pub const ALL: [LeafIdentity; 11] = [
        LeafIdentity::ApiServer,
        LeafIdentity::ApiServerKubeletClient,
        LeafIdentity::FrontProxyClient,
        LeafIdentity::ApiServerEtcdClient,
        LeafIdentity::EtcdServer,
        LeafIdentity::EtcdPeer,
        LeafIdentity::EtcdHealthcheckClient,
        LeafIdentity::Admin,
        LeafIdentity::SuperAdmin,
        LeafIdentity::ControllerManager,
        LeafIdentity::Scheduler,
    ];

    pub fn authority(self) -> &'static str {
        match self {
            LeafIdentity::FrontProxyClient => FRONT_PROXY_CA,
            LeafIdentity::ApiServerEtcdClient
            | LeafIdentity::EtcdServer
            | LeafIdentity::EtcdPeer
            | LeafIdentity::EtcdHealthcheckClient => ETCD_CA,
            _ => KUBERNETES_CA,
        }
    }

    pub fn common_name(self) -> &'static str {
        match self {
            LeafIdentity::ApiServer => "kube-apiserver",
            LeafIdentity::ApiServerKubeletClient => "kube-apiserver-kubelet-client",
            LeafIdentity::FrontProxyClient => "front-proxy-client",
            LeafIdentity::ApiServerEtcdClient => "kube-apiserver-etcd-client",
            LeafIdentity::EtcdServer => "kube-etcd",
            LeafIdentity::EtcdPeer => "kube-etcd-peer",
            LeafIdentity::EtcdHealthcheckClient => "kube-etcd-healthcheck-client",
            LeafIdentity::Admin => "kubernetes-admin",
            LeafIdentity::SuperAdmin => "kubernetes-super-admin",
            LeafIdentity::ControllerManager => "system:kube-controller-manager",
            LeafIdentity::Scheduler => "system:kube-scheduler",
        }
    }

    /// Base name for local `.crt`/`.key` output.
    pub fn output_name(self) -> &'static str {
        match self {
            LeafIdentity::ApiServer => "apiserver",
            LeafIdentity::ApiServerKubeletClient => "apiserver-kubelet-client",
            LeafIdentity::FrontProxyClient => "front-proxy-client",
            LeafIdentity::ApiServerEtcdClient => "apiserver-etcd-client",
            LeafIdentity::EtcdServer => "etcd-server",
            LeafIdentity::EtcdPeer => "etcd-peer",
            LeafIdentity::EtcdHealthcheckClient => "etcd-healthcheck-client",
            LeafIdentity::Admin => "admin",
            LeafIdentity::SuperAdmin => "super-admin",
            LeafIdentity::ControllerManager => "controller-manager",
            LeafIdentity::Scheduler => "scheduler",
        }
    }

    fn organizations(self) -> &'static [&'static str] {
        match self {
            LeafIdentity::ApiServerKubeletClient
            | LeafIdentity::ApiServerEtcdClient
            | LeafIdentity::Admin
            | LeafIdentity::SuperAdmin => &[SYSTEM_MASTERS],
            LeafIdentity::ControllerManager => &["system:kube-controller-manager"],
            LeafIdentity::Scheduler => &["system:kube-scheduler"],
            _ => &[],
        }
    }

    fn usages(self) -> &'static [ExtKeyUsage] {
        match self {
            LeafIdentity::ApiServer => SERVER,
            LeafIdentity::EtcdServer | LeafIdentity::EtcdPeer => SERVER_CLIENT,
            _ => CLIENT,
        }
    }
}

impl fmt::Display for LeafIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.common_name())
    }
}

pub fn default_apiserver_sans() -> Vec<String> {
    [
        "kubernetes",
        "kubernetes.default",
        "kubernetes.default.svc",
        "kubernetes.default.svc.cluster.local",
        "localhost",
        "127.0.0.1",
        "::1",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

pub fn default_etcd_sans() -> Vec<String> {
    ["localhost", "127.0.0.1", "::1"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

#[derive(Debug, Clone)]
pub struct CatalogEntry {
    pub identity: LeafIdentity,
    pub authority: &'static str,
    pub spec: IdentitySpec,
}

/// Requester-side catalog with the operator's extra SANs folded in.
#[derive(Debug, Clone)]
pub struct IdentityCatalog {
    entries: Vec<CatalogEntry>,
}

impl IdentityCatalog {
    pub fn kubeadm(extra_apiserver_sans: &[String], extra_etcd_sans: &[String]) -> Self {
        let mut apiserver_sans = default_apiserver_sans();
        apiserver_sans.extend_from_slice(extra_apiserver_sans);
        let mut etcd_sans = default_etcd_sans();
        etcd_sans.extend_from_slice(extra_etcd_sans);

        let entries = LeafIdentity::ALL
            .iter()
            .map(|&identity| {
                let mut spec = IdentitySpec::new(identity.common_name()).usages(identity.usages());
                for org in identity.organizations() {
                    spec = spec.organization(*org);
                }
                spec = match identity {
                    LeafIdentity::ApiServer => spec.sans(apiserver_sans.iter().cloned()),
                    LeafIdentity::EtcdServer | LeafIdentity::EtcdPeer => {
                        spec.sans(etcd_sans.iter().cloned())
                    }
                    _ => spec,
                };
                CatalogEntry {
                    identity,
                    authority: identity.authority(),
                    spec,
                }
            })
            .collect();
        Self { entries }
    }

    pub fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }

    pub fn get(&self, identity: LeafIdentity) -> Option<&CatalogEntry> {
        self.entries.iter().find(|e| e.identity == identity)
    }
}

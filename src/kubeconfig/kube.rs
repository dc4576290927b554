// src/kubeconfig/kube.rs
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};

use crate::error::{PkiError, Result};

pub const DEFAULT_NAME: &str = "default";
/// Server used by components that talk to their local apiserver.
pub const LOCAL_APISERVER: &str = "https://127.0.0.1:6443";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct KubeConfig {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub clusters: Vec<NamedCluster>,
    pub users: Vec<NamedUser>,
    pub contexts: Vec<NamedContext>,
    pub current_context: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedCluster {
    pub name: String,
    pub cluster: Cluster,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Cluster {
    pub server: String,
    pub certificate_authority_data: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedUser {
    pub name: String,
    pub user: User,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct User {
    pub client_certificate_data: String,
    pub client_key_data: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedContext {
    pub name: String,
    pub context: Context,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Context {
    pub cluster: String,
    pub user: String,
}

impl KubeConfig {
    /// Single-cluster, single-user config with embedded credentials. Cluster
    /// and context are both named `default`; the user entry is named after
    /// `user`.
    pub fn new(
        server: &str,
        ca_pem: &[u8],
        user: &str,
        client_cert_pem: &[u8],
        client_key_pem: &[u8],
    ) -> Result<Self> {
        let server = server.trim();
        if server.is_empty() {
            return Err(PkiError::Config("kubeconfig server cannot be empty".to_string()));
        }
        if user.trim().is_empty() {
            return Err(PkiError::Config("kubeconfig user cannot be empty".to_string()));
        }
        for (what, data) in [
            ("certificate authority", ca_pem),
            ("client certificate", client_cert_pem),
            ("client key", client_key_pem),
        ] {
            if data.is_empty() {
                return Err(PkiError::Validation(format!(
                    "kubeconfig for {:?}: {} is empty",
                    user, what
                )));
            }
        }

        Ok(Self {
            api_version: "v1".to_string(),
            kind: "Config".to_string(),
            clusters: vec![NamedCluster {
                name: DEFAULT_NAME.to_string(),
                cluster: Cluster {
                    server: server.to_string(),
                    certificate_authority_data: STANDARD.encode(ca_pem),
                },
            }],
            users: vec![NamedUser {
                name: user.to_string(),
                user: User {
                    client_certificate_data: STANDARD.encode(client_cert_pem),
                    client_key_data: STANDARD.encode(client_key_pem),
                },
            }],
            contexts: vec![NamedContext {
                name: DEFAULT_NAME.to_string(),
                context: Context {
                    cluster: DEFAULT_NAME.to_string(),
                    user: user.to_string(),
                },
            }],
            current_context: DEFAULT_NAME.to_string(),
        })
    }

    pub fn to_yaml(&self) -> Result<Vec<u8>> {
        Ok(serde_yaml::to_string(self)?.into_bytes())
    }

    pub fn from_yaml(bytes: &[u8]) -> Result<Self> {
        Ok(serde_yaml::from_slice(bytes)?)
    }

    pub fn server(&self) -> Option<&str> {
        self.clusters.first().map(|c| c.cluster.server.as_str())
    }

    pub fn user_name(&self) -> Option<&str> {
        self.users.first().map(|u| u.name.as_str())
    }

    pub fn client_certificate(&self) -> Result<Vec<u8>> {
        let user = self
            .users
            .first()
            .ok_or_else(|| PkiError::Validation("kubeconfig has no user".to_string()))?;
        STANDARD
            .decode(&user.user.client_certificate_data)
            .map_err(|e| PkiError::Validation(format!("decode client-certificate-data: {}", e)))
    }
}

/// Renders a kubeconfig and checks that it reads back identically.
pub fn build_kubeconfig(
    server: &str,
    ca_pem: &[u8],
    user: &str,
    client_cert_pem: &[u8],
    client_key_pem: &[u8],
) -> Result<Vec<u8>> {
    let config = KubeConfig::new(server, ca_pem, user, client_cert_pem, client_key_pem)?;
    let yaml = config.to_yaml()?;
    if KubeConfig::from_yaml(&yaml)? != config {
        return Err(PkiError::Internal(format!(
            "generated kubeconfig for {:?} does not round-trip",
            user
        )));
    }
    Ok(yaml)
}

/// Kubelet credential name: `system:node:<name>`, or the admin user when no
/// node name is known yet.
pub fn kubelet_user(node_name: Option<&str>) -> String {
    match node_name.map(str::trim).filter(|n| !n.is_empty()) {
        Some(name) => format!("system:node:{}", name),
        None => "kubernetes-admin".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_embedded_credentials() {
        let yaml = build_kubeconfig(
            "https://10.0.0.1:6443",
            b"ca",
            "kubernetes-admin",
            b"cert",
            b"key",
        )
        .unwrap();
        let text = String::from_utf8(yaml.clone()).unwrap();
        assert!(text.contains("current-context: default"));
        assert!(text.contains("certificate-authority-data: Y2E="));
        assert!(text.starts_with("apiVersion: v1\n"));
        assert!(!text.contains("api-version"));
        assert!(text.contains("- name: kubernetes-admin"));

        let parsed = KubeConfig::from_yaml(&yaml).unwrap();
        assert_eq!(parsed.server(), Some("https://10.0.0.1:6443"));
        assert_eq!(parsed.user_name(), Some("kubernetes-admin"));
        assert_eq!(parsed.client_certificate().unwrap(), b"cert");
    }

    #[test]
    fn empty_server_or_material_is_rejected() {
        assert!(matches!(
            build_kubeconfig("  ", b"ca", "u", b"c", b"k"),
            Err(PkiError::Config(_))
        ));
        assert!(build_kubeconfig(LOCAL_APISERVER, b"ca", "u", b"c", b"").is_err());
    }

    #[test]
    fn kubelet_user_falls_back_to_admin() {
        assert_eq!(kubelet_user(Some("cp-0")), "system:node:cp-0");
        assert_eq!(kubelet_user(Some(" ")), "kubernetes-admin");
        assert_eq!(kubelet_user(None), "kubernetes-admin");
    }
}

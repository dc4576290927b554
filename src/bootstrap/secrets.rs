// src/bootstrap/secrets.rs
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::builder::{Artifacts, Principal};
use crate::cert::catalog::{LeafIdentity, ETCD_CA, FRONT_PROXY_CA, KUBERNETES_CA};
use crate::cert::types::KeyPair;
use crate::error::{PkiError, Result};

pub const CLUSTER_NAME_LABEL: &str = "cluster.x-k8s.io/cluster-name";
pub const TLS_CERT_KEY: &str = "tls.crt";
pub const TLS_KEY_KEY: &str = "tls.key";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

/// Opaque Secret in its Kubernetes manifest shape; `data` values are
/// base64-encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretManifest {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    #[serde(rename = "type")]
    pub secret_type: String,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

impl SecretManifest {
    pub fn new(name: &str, namespace: &str, cluster_name: &str) -> Self {
        Self {
            api_version: "v1".to_string(),
            kind: "Secret".to_string(),
            metadata: ObjectMeta {
                name: name.to_string(),
                namespace: namespace.to_string(),
                labels: BTreeMap::from([(
                    CLUSTER_NAME_LABEL.to_string(),
                    cluster_name.to_string(),
                )]),
            },
            secret_type: "Opaque".to_string(),
            data: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Adds one entry; empty content is refused.
    pub fn insert(&mut self, key: &str, value: &[u8]) -> Result<()> {
        if value.is_empty() {
            return Err(PkiError::Validation(format!(
                "secret {:?}: value for key {:?} is empty",
                self.metadata.name, key
            )));
        }
        self.data.insert(key.to_string(), STANDARD.encode(value));
        Ok(())
    }

    pub fn with(mut self, key: &str, value: &[u8]) -> Result<Self> {
        self.insert(key, value)?;
        Ok(self)
    }

    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.data
            .get(key)
            .map(|v| {
                STANDARD.decode(v).map_err(|e| {
                    PkiError::Validation(format!(
                        "secret {:?}: key {:?} is not base64: {}",
                        self.metadata.name, key, e
                    ))
                })
            })
            .transpose()
    }
}

pub fn files_secret_name(cluster_name: &str) -> String {
    format!("{}-external-ca-files", cluster_name)
}

pub fn service_account_secret_name(cluster_name: &str) -> String {
    format!("{}-sa", cluster_name)
}

/// Every Secret a bootstrap run publishes, in apply order.
pub fn cluster_secrets(
    cluster_name: &str,
    namespace: &str,
    artifacts: &Artifacts,
    files_data: &BTreeMap<String, Vec<u8>>,
) -> Result<Vec<SecretManifest>> {
    let secret = |suffix: &str| {
        SecretManifest::new(&format!("{}-{}", cluster_name, suffix), namespace, cluster_name)
    };
    let cert_only = |suffix: &str, authority: &str| -> Result<SecretManifest> {
        secret(suffix).with(TLS_CERT_KEY, &artifacts.authority(authority)?.cert_pem)
    };
    let tls_pair = |suffix: &str, pair: &KeyPair| -> Result<SecretManifest> {
        secret(suffix)
            .with(TLS_CERT_KEY, &pair.cert_pem)?
            .with(TLS_KEY_KEY, pair.key_bytes())
    };

    let mut files = SecretManifest::new(&files_secret_name(cluster_name), namespace, cluster_name);
    for (key, value) in files_data {
        files.insert(key, value)?;
    }

    Ok(vec![
        cert_only("ca", KUBERNETES_CA)?,
        cert_only("proxy", FRONT_PROXY_CA)?,
        cert_only("etcd", ETCD_CA)?,
        tls_pair(
            "apiserver-etcd-client",
            artifacts.leaf(LeafIdentity::ApiServerEtcdClient)?,
        )?,
        tls_pair("sa", &artifacts.service_account)?,
        secret("kubeconfig").with(
            "value",
            &artifacts.client_config(Principal::Admin)?.kubeconfig,
        )?,
        files,
    ])
}

/// Service-account pair stored by an earlier run, if both keys are present.
pub fn previous_service_account(secret: Option<&SecretManifest>) -> Result<Option<KeyPair>> {
    let Some(secret) = secret else {
        return Ok(None);
    };
    match (secret.get(TLS_CERT_KEY)?, secret.get(TLS_KEY_KEY)?) {
        (Some(public), Some(private)) if !public.is_empty() && !private.is_empty() => {
            Ok(Some(KeyPair::new(public, private)))
        }
        _ => Ok(None),
    }
}

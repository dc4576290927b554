// src/bootstrap/files.rs
//! File records that tell kubeadm which Secret keys to materialize on the
//! control-plane host, and the merge rules for patching them in.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

use super::builder::{Artifacts, Principal};
use crate::cert::catalog::{LeafIdentity, ETCD_CA, FRONT_PROXY_CA, KUBERNETES_CA};
use crate::error::{PkiError, Result};

pub const FILE_OWNER: &str = "root:root";
const PUBLIC_MODE: &str = "0644";
const PRIVATE_MODE: &str = "0600";
const PKI_DIR: &str = "/etc/kubernetes/pki";
const KUBERNETES_DIR: &str = "/etc/kubernetes";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretKeyRef {
    pub name: String,
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentSource {
    Secret(SecretKeyRef),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    #[serde(default)]
    pub path: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub owner: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub permissions: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_from: Option<ContentSource>,
    /// Fields of existing entries this tool does not manage, kept verbatim.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

impl FileRecord {
    /// Root-owned file sourced from `secret`/`key`.
    pub fn from_secret(path: &str, permissions: &str, secret: &str, key: &str) -> Result<Self> {
        if !path.starts_with('/') {
            return Err(PkiError::Validation(format!("file path {:?} is not absolute", path)));
        }
        let valid_mode = permissions.len() == 4
            && permissions.starts_with('0')
            && permissions.chars().all(|c| ('0'..='7').contains(&c));
        if !valid_mode {
            return Err(PkiError::Validation(format!(
                "file {:?}: permissions {:?} are not an octal mode",
                path, permissions
            )));
        }
        if secret.trim().is_empty() || key.trim().is_empty() {
            return Err(PkiError::Validation(format!(
                "file {:?}: secret name and key are required",
                path
            )));
        }
        Ok(Self {
            path: path.to_string(),
            owner: FILE_OWNER.to_string(),
            permissions: permissions.to_string(),
            content_from: Some(ContentSource::Secret(SecretKeyRef {
                name: secret.to_string(),
                key: key.to_string(),
            })),
            extra: BTreeMap::new(),
        })
    }
}

/// Path under the pki directory for leaves that kubeadm reads as files.
fn leaf_stem(identity: LeafIdentity) -> Option<&'static str> {
    match identity {
        LeafIdentity::ApiServer => Some("apiserver"),
        LeafIdentity::ApiServerKubeletClient => Some("apiserver-kubelet-client"),
        LeafIdentity::FrontProxyClient => Some("front-proxy-client"),
        LeafIdentity::ApiServerEtcdClient => Some("apiserver-etcd-client"),
        LeafIdentity::EtcdServer => Some("etcd/server"),
        LeafIdentity::EtcdPeer => Some("etcd/peer"),
        LeafIdentity::EtcdHealthcheckClient => Some("etcd/healthcheck-client"),
        LeafIdentity::Admin
        | LeafIdentity::SuperAdmin
        | LeafIdentity::ControllerManager
        | LeafIdentity::Scheduler => None,
    }
}

fn pki_key(stem: &str, suffix: &str) -> String {
    format!("pki-{}-{}", stem.replace('/', "-"), suffix)
}

fn kubeconfig_key(principal: Principal) -> String {
    format!("kubeconfig-{}", principal)
}

/// File records plus the data of the Secret they point into. Every record
/// has non-empty content.
pub fn build_kubeadm_files(
    secret_name: &str,
    artifacts: &Artifacts,
) -> Result<(Vec<FileRecord>, BTreeMap<String, Vec<u8>>)> {
    let mut entries: Vec<(String, String, &'static str, &[u8])> = Vec::new();

    for (authority, stem) in [
        (KUBERNETES_CA, "ca"),
        (FRONT_PROXY_CA, "front-proxy-ca"),
        (ETCD_CA, "etcd/ca"),
    ] {
        entries.push((
            format!("{}/{}.crt", PKI_DIR, stem),
            pki_key(stem, "crt"),
            PUBLIC_MODE,
            artifacts.authority(authority)?.cert_pem.as_slice(),
        ));
    }

    entries.push((
        format!("{}/sa.pub", PKI_DIR),
        "pki-sa-pub".to_string(),
        PUBLIC_MODE,
        artifacts.service_account.cert_pem.as_slice(),
    ));
    entries.push((
        format!("{}/sa.key", PKI_DIR),
        "pki-sa-key".to_string(),
        PRIVATE_MODE,
        artifacts.service_account.key_bytes(),
    ));

    for identity in LeafIdentity::ALL {
        let Some(stem) = leaf_stem(identity) else {
            continue;
        };
        let pair = artifacts.leaf(identity)?;
        entries.push((
            format!("{}/{}.crt", PKI_DIR, stem),
            pki_key(stem, "crt"),
            PUBLIC_MODE,
            pair.cert_pem.as_slice(),
        ));
        entries.push((
            format!("{}/{}.key", PKI_DIR, stem),
            pki_key(stem, "key"),
            PRIVATE_MODE,
            pair.key_bytes(),
        ));
    }

    for principal in Principal::ALL {
        entries.push((
            format!("{}/{}", KUBERNETES_DIR, principal.file_name()),
            kubeconfig_key(principal),
            PRIVATE_MODE,
            artifacts.client_config(principal)?.kubeconfig.as_slice(),
        ));
    }

    let mut records = Vec::with_capacity(entries.len());
    let mut data = BTreeMap::new();
    for (path, key, mode, content) in entries {
        if content.is_empty() {
            return Err(PkiError::Validation(format!(
                "file content is empty for path {:?} (secret key {:?})",
                path, key
            )));
        }
        records.push(FileRecord::from_secret(&path, mode, secret_name, &key)?);
        data.insert(key, content.to_vec());
    }
    Ok((records, data))
}

/// Merges `desired` into `current` by path. Order is first-seen across
/// current then desired; a desired record replaces a current one with the
/// same path; records without a path are dropped.
pub fn merge_files(current: &[FileRecord], desired: &[FileRecord]) -> Vec<FileRecord> {
    merge_by_path(current, desired, |record| {
        Some(record.path.trim().to_string()).filter(|p| !p.is_empty())
    })
}

/// `merge_files` over any entry type, with `path_of` naming the key. Used
/// directly on raw manifest entries so fields this crate does not model
/// survive the merge untouched.
pub fn merge_by_path<T, F>(current: &[T], desired: &[T], path_of: F) -> Vec<T>
where
    T: Clone,
    F: Fn(&T) -> Option<String>,
{
    let mut order: Vec<String> = Vec::new();
    let mut by_path: HashMap<String, &T> = HashMap::new();
    for entry in current.iter().chain(desired) {
        let Some(path) = path_of(entry) else {
            continue;
        };
        if by_path.insert(path.clone(), entry).is_none() {
            order.push(path);
        }
    }
    order
        .iter()
        .filter_map(|path| by_path.get(path).map(|entry| (*entry).clone()))
        .collect()
}

/// Appends `add` to `current`, trimming entries and dropping blanks and
/// repeats while keeping first-seen order.
pub fn merge_commands<S: AsRef<str>>(current: &[S], add: &[S]) -> Vec<String> {
    let mut seen = HashSet::new();
    current
        .iter()
        .chain(add)
        .map(|c| c.as_ref().trim())
        .filter(|c| !c.is_empty() && seen.insert(c.to_string()))
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(path: &str, key: &str) -> FileRecord {
        FileRecord::from_secret(path, "0600", "demo-files", key).unwrap()
    }

    #[test]
    fn records_are_validated_at_construction() {
        assert!(FileRecord::from_secret("relative/ca.crt", "0644", "s", "k").is_err());
        assert!(FileRecord::from_secret("/etc/ca.crt", "644", "s", "k").is_err());
        assert!(FileRecord::from_secret("/etc/ca.crt", "0844", "s", "k").is_err());
        assert!(FileRecord::from_secret("/etc/ca.crt", "0644", "s", " ").is_err());
        let ok = FileRecord::from_secret("/etc/ca.crt", "0644", "s", "k").unwrap();
        assert_eq!(ok.owner, FILE_OWNER);
    }

    #[test]
    fn serializes_in_kubeadm_shape() {
        let json = serde_json::to_value(record("/etc/kubernetes/admin.conf", "kubeconfig-admin"))
            .unwrap();
        assert_eq!(json["contentFrom"]["secret"]["name"], "demo-files");
        assert_eq!(json["contentFrom"]["secret"]["key"], "kubeconfig-admin");
        assert_eq!(json["permissions"], "0600");
    }

    #[test]
    fn desired_wins_and_order_is_first_seen() {
        let mut stale = record("/b", "old");
        stale.owner = "nobody".to_string();
        let pathless = FileRecord {
            path: String::new(),
            owner: String::new(),
            permissions: String::new(),
            content_from: None,
            extra: BTreeMap::new(),
        };
        let current = vec![record("/a", "a"), stale, pathless];
        let desired = vec![record("/c", "c"), record("/b", "new")];

        let merged = merge_files(&current, &desired);
        let paths: Vec<_> = merged.iter().map(|r| r.path.as_str()).collect();
        assert_eq!(paths, vec!["/a", "/b", "/c"]);
        assert_eq!(merged[1], record("/b", "new"));
    }

    #[test]
    fn commands_are_trimmed_and_deduplicated() {
        let merged = merge_commands(
            &["  echo one ", "echo two", ""],
            &["echo two", "echo three", " echo one"],
        );
        assert_eq!(merged, vec!["echo one", "echo two", "echo three"]);
    }

    #[test]
    fn pki_keys_flatten_directories() {
        assert_eq!(pki_key("etcd/server", "crt"), "pki-etcd-server-crt");
        assert_eq!(kubeconfig_key(Principal::ControllerManager), "kubeconfig-controller-manager");
    }
}

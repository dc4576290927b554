// src/bootstrap/cluster.rs
//! The cluster-management side of a bootstrap run: where the endpoint comes
//! from and where Secrets and the control-plane patch go.

use async_trait::async_trait;
use serde::Deserialize;
use serde_yaml::{Mapping, Value};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::fs;
use tracing::{debug, info, warn};

use super::builder::Artifacts;
use super::files::{build_kubeadm_files, merge_by_path, merge_commands, FileRecord};
use super::secrets::{cluster_secrets, files_secret_name, SecretManifest};
use crate::error::{PkiError, Result};
use crate::utils::write_with_mode;

pub const DEFAULT_RETRY_STEPS: usize = 5;
const RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// Commands kubeadm must run before it can place the etcd files.
pub const PRE_KUBEADM_COMMANDS: [&str; 1] = ["mkdir -p /etc/kubernetes/pki/etcd"];

#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// `https://host:port` from the cluster's control-plane endpoint, or
    /// `None` when the cluster has not been given one.
    async fn get_cluster_endpoint(&self, namespace: &str, cluster_name: &str)
        -> Result<Option<String>>;

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<SecretManifest>>;

    async fn upsert_secret(
        &self,
        namespace: &str,
        secret: &SecretManifest,
        dry_run: bool,
    ) -> Result<()>;

    /// Sets `externalCA`, merges `files` and `pre_commands` into the named
    /// control plane.
    async fn patch_control_plane(
        &self,
        namespace: &str,
        name: &str,
        files: &[FileRecord],
        pre_commands: &[String],
        dry_run: bool,
    ) -> Result<()>;
}

/// Runs `op` until it succeeds, fails with a non-conflict error, or
/// `attempts` conflicts have been seen.
pub async fn retry_on_conflict<T, F, Fut, P>(attempts: usize, is_conflict: P, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    P: Fn(&PkiError) -> bool,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Err(e) if attempt < attempts && is_conflict(&e) => {
                debug!(attempt, error = %e, "update conflicted; retrying");
                tokio::time::sleep(RETRY_INTERVAL).await;
                attempt += 1;
            }
            result => return result,
        }
    }
}

/// Explicit override first, then the cluster's own endpoint.
pub async fn resolve_server(
    api: &dyn ClusterApi,
    namespace: &str,
    cluster_name: &str,
    override_server: Option<&str>,
) -> Result<String> {
    if let Some(server) = override_server.map(str::trim).filter(|s| !s.is_empty()) {
        return Ok(server.to_string());
    }
    let server = api
        .get_cluster_endpoint(namespace, cluster_name)
        .await?
        .map(|s| s.trim().to_string())
        .unwrap_or_default();
    if server.is_empty() {
        return Err(PkiError::Config(format!(
            "cluster {}/{} has empty spec.controlPlaneEndpoint; pass --server explicitly",
            namespace, cluster_name
        )));
    }
    Ok(server)
}

/// What `publish` sent to the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishSummary {
    pub secrets: Vec<String>,
    pub files: usize,
}

/// Upserts every Secret, then patches the control plane. Only called with
/// a complete Artifacts set.
pub async fn publish(
    api: &dyn ClusterApi,
    namespace: &str,
    cluster_name: &str,
    control_plane_name: &str,
    artifacts: &Artifacts,
    dry_run: bool,
) -> Result<PublishSummary> {
    let files_secret = files_secret_name(cluster_name);
    let (files, files_data) = build_kubeadm_files(&files_secret, artifacts)?;
    let secrets = cluster_secrets(cluster_name, namespace, artifacts, &files_data)?;

    for secret in &secrets {
        api.upsert_secret(namespace, secret, dry_run).await?;
    }

    let pre_commands: Vec<String> = PRE_KUBEADM_COMMANDS.iter().map(|c| c.to_string()).collect();
    api.patch_control_plane(namespace, control_plane_name, &files, &pre_commands, dry_run)
        .await?;

    info!(
        namespace,
        cluster = cluster_name,
        control_plane = control_plane_name,
        secrets = secrets.len(),
        files = files.len(),
        dry_run,
        "published bootstrap material"
    );
    Ok(PublishSummary {
        secrets: secrets.iter().map(|s| s.name().to_string()).collect(),
        files: files.len(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ClusterManifest {
    #[serde(default)]
    spec: ClusterSpec,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClusterSpec {
    #[serde(default)]
    control_plane_endpoint: Option<Endpoint>,
}

#[derive(Debug, Default, Deserialize)]
struct Endpoint {
    #[serde(default)]
    host: String,
    #[serde(default)]
    port: u16,
}

/// `ClusterApi` over a directory of YAML manifests, for running without a
/// live management cluster.
///
/// Layout: `clusters/<ns>/<name>.yaml` is read for the endpoint,
/// `secrets/<ns>/<name>.yaml` holds Secrets, and
/// `controlplanes/<ns>/<name>.yaml` holds the control-plane patch. The patch
/// carries `metadata.resourceVersion`, bumped on every write; a write that
/// finds the version moved underneath it fails with `Conflict`.
#[derive(Debug, Clone)]
pub struct ManifestDirectory {
    root: PathBuf,
    retry_steps: usize,
}

impl ManifestDirectory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            retry_steps: DEFAULT_RETRY_STEPS,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn cluster_path(&self, namespace: &str, name: &str) -> PathBuf {
        self.root.join("clusters").join(namespace).join(format!("{}.yaml", name))
    }

    pub fn secret_path(&self, namespace: &str, name: &str) -> PathBuf {
        self.root.join("secrets").join(namespace).join(format!("{}.yaml", name))
    }

    pub fn control_plane_path(&self, namespace: &str, name: &str) -> PathBuf {
        self.root
            .join("controlplanes")
            .join(namespace)
            .join(format!("{}.yaml", name))
    }

    fn read_yaml(path: &Path) -> Result<Option<Value>> {
        match fs::read(path) {
            Ok(bytes) => Ok(Some(serde_yaml::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write_yaml(path: &Path, value: &impl serde::Serialize, mode: u32) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        write_with_mode(path, serde_yaml::to_string(value)?.as_bytes(), mode)?;
        Ok(())
    }

    fn patch_once(
        &self,
        namespace: &str,
        name: &str,
        files: &[FileRecord],
        pre_commands: &[String],
        dry_run: bool,
    ) -> Result<()> {
        let path = self.control_plane_path(namespace, name);
        let mut manifest = Self::read_yaml(&path)?
            .unwrap_or_else(|| control_plane_skeleton(namespace, name));
        let version = resource_version(&manifest);

        apply_external_ca_patch(&mut manifest, files, pre_commands)?;
        if dry_run {
            debug!(path = %path.display(), "dry-run: control-plane patch computed, not written");
            return Ok(());
        }

        let on_disk = Self::read_yaml(&path)?.map(|m| resource_version(&m)).unwrap_or(0);
        if on_disk != version {
            return Err(PkiError::Conflict(format!(
                "control plane {}/{} changed from version {} to {}",
                namespace, name, version, on_disk
            )));
        }
        set_path(
            &mut manifest,
            &["metadata", "resourceVersion"],
            Value::from((version + 1).to_string()),
        )?;
        Self::write_yaml(&path, &manifest, 0o644)
    }
}

#[async_trait]
impl ClusterApi for ManifestDirectory {
    async fn get_cluster_endpoint(
        &self,
        namespace: &str,
        cluster_name: &str,
    ) -> Result<Option<String>> {
        let path = self.cluster_path(namespace, cluster_name);
        let Some(value) = Self::read_yaml(&path)? else {
            warn!(path = %path.display(), "no cluster manifest found");
            return Ok(None);
        };
        let manifest: ClusterManifest = serde_yaml::from_value(value)?;
        Ok(manifest
            .spec
            .control_plane_endpoint
            .filter(|e| !e.host.trim().is_empty() && e.port != 0)
            .map(|e| format!("https://{}:{}", e.host.trim(), e.port)))
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<SecretManifest>> {
        Self::read_yaml(&self.secret_path(namespace, name))?
            .map(|value| -> Result<SecretManifest> { Ok(serde_yaml::from_value(value)?) })
            .transpose()
    }

    async fn upsert_secret(
        &self,
        namespace: &str,
        secret: &SecretManifest,
        dry_run: bool,
    ) -> Result<()> {
        let mut desired = secret.clone();
        desired.metadata.namespace = namespace.to_string();
        if dry_run {
            debug!(secret = desired.name(), "dry-run: secret not written");
            return Ok(());
        }

        let path = self.secret_path(namespace, desired.name());
        let merged = match self.get_secret(namespace, desired.name()).await? {
            Some(mut existing) => {
                existing.metadata.labels.extend(desired.metadata.labels);
                existing.data = desired.data;
                existing.secret_type = desired.secret_type;
                existing.metadata.namespace = namespace.to_string();
                existing
            }
            None => desired,
        };
        Self::write_yaml(&path, &merged, 0o600)?;
        debug!(secret = merged.name(), path = %path.display(), "secret written");
        Ok(())
    }

    async fn patch_control_plane(
        &self,
        namespace: &str,
        name: &str,
        files: &[FileRecord],
        pre_commands: &[String],
        dry_run: bool,
    ) -> Result<()> {
        retry_on_conflict(self.retry_steps, PkiError::is_conflict, || async move {
            self.patch_once(namespace, name, files, pre_commands, dry_run)
        })
        .await
    }
}

fn control_plane_skeleton(namespace: &str, name: &str) -> Value {
    let mut metadata = Mapping::new();
    metadata.insert("name".into(), name.into());
    metadata.insert("namespace".into(), namespace.into());
    let mut root = Mapping::new();
    root.insert(
        "apiVersion".into(),
        "controlplane.cluster.x-k8s.io/v1beta1".into(),
    );
    root.insert("kind".into(), "KubeadmControlPlane".into());
    root.insert("metadata".into(), Value::Mapping(metadata));
    Value::Mapping(root)
}

fn resource_version(manifest: &Value) -> u64 {
    manifest
        .get("metadata")
        .and_then(|m| m.get("resourceVersion"))
        .and_then(|v| match v {
            Value::String(s) => s.parse().ok(),
            Value::Number(n) => n.as_u64(),
            _ => None,
        })
        .unwrap_or(0)
}

fn get_path<'a>(value: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter().try_fold(value, |v, key| v.get(*key))
}

/// Sets a nested mapping field, creating intermediate mappings.
fn set_path(value: &mut Value, path: &[&str], leaf: Value) -> Result<()> {
    let Some((last, parents)) = path.split_last() else {
        *value = leaf;
        return Ok(());
    };
    let mut current = value;
    for key in parents {
        let mapping = current.as_mapping_mut().ok_or_else(|| {
            PkiError::Validation(format!("manifest field {:?} is not a mapping", key))
        })?;
        current = mapping
            .entry(Value::from(*key))
            .or_insert_with(|| Value::Mapping(Mapping::new()));
    }
    current
        .as_mapping_mut()
        .ok_or_else(|| PkiError::Validation(format!("manifest parent of {:?} is not a mapping", last)))?
        .insert(Value::from(*last), leaf);
    Ok(())
}

fn file_entry_path(entry: &Value) -> Option<String> {
    entry
        .get("path")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
}

/// Sets `externalCA: true` and merges files and pre-kubeadm commands into a
/// control-plane manifest.
pub fn apply_external_ca_patch(
    manifest: &mut Value,
    files: &[FileRecord],
    pre_commands: &[String],
) -> Result<()> {
    const SPEC: [&str; 2] = ["spec", "kubeadmConfigSpec"];
    set_path(manifest, &[SPEC[0], SPEC[1], "externalCA"], Value::Bool(true))?;

    let current_files: Vec<Value> = get_path(manifest, &[SPEC[0], SPEC[1], "files"])
        .and_then(Value::as_sequence)
        .cloned()
        .unwrap_or_default();
    let dropped = current_files
        .iter()
        .filter(|entry| file_entry_path(entry).is_none())
        .count();
    if dropped > 0 {
        warn!(dropped, "control plane has file entries without a path; not carried over");
    }
    let desired_files = files
        .iter()
        .map(serde_yaml::to_value)
        .collect::<std::result::Result<Vec<_>, _>>()?;
    let merged_files = merge_by_path(&current_files, &desired_files, file_entry_path);
    set_path(
        manifest,
        &[SPEC[0], SPEC[1], "files"],
        Value::Sequence(merged_files),
    )?;

    let current_commands: Vec<String> =
        get_path(manifest, &[SPEC[0], SPEC[1], "preKubeadmCommands"])
            .and_then(Value::as_sequence)
            .map(|seq| {
                seq.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
    let merged_commands = merge_commands(&current_commands, pre_commands);
    set_path(
        manifest,
        &[SPEC[0], SPEC[1], "preKubeadmCommands"],
        serde_yaml::to_value(merged_commands)?,
    )?;
    Ok(())
}

// src/bootstrap/mod.rs
pub mod builder;
pub mod cluster;
pub mod files;
pub mod output;
pub mod secrets;

pub use builder::{ArtifactBuilder, Artifacts, ClientConfigRecord, Issuer, Principal};
pub use cluster::{publish, resolve_server, retry_on_conflict, ClusterApi, ManifestDirectory};
pub use files::{build_kubeadm_files, merge_by_path, merge_commands, merge_files, FileRecord};
pub use secrets::{cluster_secrets, SecretManifest};

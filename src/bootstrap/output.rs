// src/bootstrap/output.rs
use std::fs;
use std::path::Path;
use tracing::{debug, info};

use super::builder::{Artifacts, Principal};
use crate::cert::catalog::{ETCD_CA, FRONT_PROXY_CA, KUBERNETES_CA};
use crate::cert::types::KeyPair;
use crate::error::{PkiError, Result};
use crate::utils::write_with_mode;

const CERT_MODE: u32 = 0o644;
const KEY_MODE: u32 = 0o600;

/// Kubeconfig files dropped next to the PEMs.
const KUBECONFIG_FILES: [&str; 6] = [
    "admin.conf",
    "super-admin.conf",
    "kubelet.conf",
    "controller-manager.conf",
    "scheduler.conf",
    "bootstrap-admin.conf",
];

/// Writes `<name>.crt` and `<name>.key` for each entry, skipping empty
/// halves. Returns the number of files written.
pub fn write_pems(dir: &Path, entries: &[(String, KeyPair)]) -> Result<usize> {
    fs::create_dir_all(dir)?;
    let mut written = 0;
    for (name, pair) in entries {
        if !pair.cert_pem.is_empty() {
            write_with_mode(&dir.join(format!("{}.crt", name)), &pair.cert_pem, CERT_MODE)?;
            written += 1;
        }
        if !pair.key_bytes().is_empty() {
            write_with_mode(&dir.join(format!("{}.key", name)), pair.key_bytes(), KEY_MODE)?;
            written += 1;
        }
    }
    debug!(dir = %dir.display(), written, "wrote PEM files");
    Ok(written)
}

/// Local copy of a run: authority certificates under their local names
/// (`authority_keys` adds their keys in local custody), every leaf, the
/// service-account pair as `sa`, and the kubeconfigs.
pub fn write_artifacts(
    dir: &Path,
    artifacts: &Artifacts,
    authority_keys: &[(String, KeyPair)],
) -> Result<usize> {
    let mut entries: Vec<(String, KeyPair)> = artifacts
        .authorities
        .iter()
        .map(|(name, pair)| (local_authority_name(name).to_string(), pair.clone()))
        .collect();
    entries.extend(
        authority_keys
            .iter()
            .map(|(name, pair)| (local_authority_name(name).to_string(), pair.clone())),
    );
    entries.extend(
        artifacts
            .leaves
            .iter()
            .map(|(identity, pair)| (identity.output_name().to_string(), pair.clone())),
    );
    entries.push(("sa".to_string(), artifacts.service_account.clone()));
    let mut written = write_pems(dir, &entries)?;

    for principal in Principal::ALL {
        let record = artifacts.client_config(principal)?;
        write_with_mode(&dir.join(principal.file_name()), &record.kubeconfig, KEY_MODE)?;
        written += 1;
    }
    info!(dir = %dir.display(), written, "local output written");
    Ok(written)
}

/// Local file stem for an authority.
pub fn local_authority_name(authority: &str) -> &str {
    match authority {
        KUBERNETES_CA => "cluster-ca",
        FRONT_PROXY_CA => "front-proxy-ca",
        ETCD_CA => "etcd-ca",
        other => other,
    }
}

fn is_sensitive(file_name: &str) -> bool {
    file_name.ends_with(".key")
        || file_name.starts_with("kubeconfig")
        || KUBECONFIG_FILES.contains(&file_name)
}

/// Removes private keys and kubeconfigs from the top level of `dir`. A
/// missing directory is fine; individual failures are collected and
/// reported together. Returns the number of files removed.
pub fn cleanup_sensitive_output(dir: &Path) -> Result<usize> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };

    let mut removed = 0;
    let mut failures = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if !is_sensitive(&name) {
            continue;
        }
        match fs::remove_file(entry.path()) {
            Ok(()) => removed += 1,
            Err(e) => failures.push(format!("{}: {}", entry.path().display(), e)),
        }
    }

    if !failures.is_empty() {
        return Err(PkiError::Internal(format!(
            "cleanup failed for {} file(s): {}",
            failures.len(),
            failures.join("; ")
        )));
    }
    info!(dir = %dir.display(), removed, "removed sensitive local output");
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn pems_skip_missing_halves() {
        let dir = TempDir::new().unwrap();
        let written = write_pems(
            dir.path(),
            &[
                ("cluster-ca".to_string(), KeyPair::cert_only(b"ca".to_vec())),
                ("admin".to_string(), KeyPair::new(b"c".to_vec(), b"k".to_vec())),
            ],
        )
        .unwrap();
        assert_eq!(written, 3);
        assert!(!dir.path().join("cluster-ca.key").exists());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(dir.path().join("admin.key")).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn cleanup_removes_only_sensitive_files() {
        let dir = TempDir::new().unwrap();
        for name in ["ca.crt", "ca.key", "admin.conf", "kubeconfig-admin", "notes.txt"] {
            fs::write(dir.path().join(name), b"x").unwrap();
        }
        fs::create_dir(dir.path().join("etcd")).unwrap();
        fs::write(dir.path().join("etcd").join("peer.key"), b"x").unwrap();

        assert_eq!(cleanup_sensitive_output(dir.path()).unwrap(), 3);
        assert!(dir.path().join("ca.crt").exists());
        assert!(dir.path().join("notes.txt").exists());
        assert!(dir.path().join("etcd").join("peer.key").exists());
        assert!(!dir.path().join("admin.conf").exists());
    }

    #[test]
    fn cleanup_of_missing_directory_is_not_an_error() {
        let dir = TempDir::new().unwrap();
        assert_eq!(cleanup_sensitive_output(&dir.path().join("absent")).unwrap(), 0);
    }
}

// config/types.rs
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{fs, io};

use crate::error::{PkiError, Result};
use crate::signing::client::DEFAULT_DEADLINE;
use crate::signing::{ClientAllowList, ClientTlsMaterial, ServerTlsMaterial};

pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:9443";
pub const DEFAULT_STATE_DIR: &str = "out/signer-state";

/// Expands `~` and environment references in a user-supplied path.
pub fn expand_path(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::full(path).map_or_else(|_| path.to_string(), |p| p.into_owned()))
}

/// Comma-separated flag value to a trimmed, blank-free list.
pub fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn read_input(path: &Path, what: &str) -> Result<Vec<u8>> {
    let bytes = fs::read(path)
        .map_err(|e| PkiError::Config(format!("read {} {}: {}", what, path.display(), e)))?;
    if bytes.is_empty() {
        return Err(PkiError::Config(format!("{} {} is empty", what, path.display())));
    }
    Ok(bytes)
}

/// Settings of the signing daemon, persisted as JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignerConfig {
    pub listen_addr: String,
    pub state_dir: String,
    pub server_cert: String,
    pub server_key: String,
    pub client_ca: String,
    #[serde(default)]
    pub allowed_client_cns: Vec<String>,
}

impl Default for SignerConfig {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            state_dir: DEFAULT_STATE_DIR.to_string(),
            server_cert: String::new(),
            server_key: String::new(),
            client_ca: String::new(),
            allowed_client_cns: Vec::new(),
        }
    }
}

impl SignerConfig {
    pub fn load_from_file(path: &str) -> io::Result<Self> {
        let config_str = fs::read_to_string(expand_path(path))?;
        serde_json::from_str(&config_str).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    pub fn save_to_file(&self, path: &str) -> io::Result<()> {
        let config_str = serde_json::to_string_pretty(self)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        fs::write(expand_path(path), config_str)
    }

    pub fn validate(&self) -> Result<()> {
        if self.listen_addr.trim().is_empty() {
            return Err(PkiError::Config("listen address cannot be empty".to_string()));
        }
        if self.state_dir.trim().is_empty() {
            return Err(PkiError::Config("state directory cannot be empty".to_string()));
        }
        for (flag, value) in [
            ("server-cert", &self.server_cert),
            ("server-key", &self.server_key),
            ("client-ca", &self.client_ca),
        ] {
            if value.trim().is_empty() {
                return Err(PkiError::Config(format!("--{} is required", flag)));
            }
            let path = expand_path(value);
            if !path.exists() {
                return Err(PkiError::Config(format!(
                    "{} not found at: {}",
                    flag,
                    path.display()
                )));
            }
        }
        Ok(())
    }

    pub fn state_path(&self) -> PathBuf {
        expand_path(&self.state_dir)
    }

    pub fn allow_list(&self) -> ClientAllowList {
        ClientAllowList::new(self.allowed_client_cns.iter().map(String::as_str))
    }

    pub fn tls_material(&self) -> Result<ServerTlsMaterial> {
        Ok(ServerTlsMaterial {
            cert_chain_pem: read_input(&expand_path(&self.server_cert), "server certificate")?,
            key_pem: read_input(&expand_path(&self.server_key), "server key")?,
            client_ca_pem: read_input(&expand_path(&self.client_ca), "client CA bundle")?,
        })
    }
}

/// Where authority private keys live during a bootstrap run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum CustodyMode {
    /// Authorities generated (or loaded) in-process.
    Local,
    /// Authorities held by a signing service reached over mTLS.
    Remote,
}

/// Remote signer connection settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteSignerConfig {
    pub endpoint: String,
    pub ca_cert: Option<PathBuf>,
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
    pub server_name: Option<String>,
}

impl RemoteSignerConfig {
    pub fn tls_material(&self) -> Result<ClientTlsMaterial> {
        let required = |path: &Option<PathBuf>, flag: &str| -> Result<Vec<u8>> {
            let path = path
                .as_deref()
                .ok_or_else(|| PkiError::Config(format!("--{} is required in remote mode", flag)))?;
            read_input(path, flag)
        };
        Ok(ClientTlsMaterial {
            ca_pem: required(&self.ca_cert, "ca-cert")?,
            cert_pem: required(&self.client_cert, "client-cert")?,
            key_pem: required(&self.client_key, "client-key")?,
        })
    }
}

/// Everything one bootstrap run needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapConfig {
    pub cluster_name: String,
    pub namespace: String,
    pub control_plane_name: String,
    pub mode: CustodyMode,
    pub remote: RemoteSignerConfig,
    pub apiserver_sans: Vec<String>,
    pub etcd_sans: Vec<String>,
    pub server: Option<String>,
    pub kubelet_node_name: Option<String>,
    pub output_dir: PathBuf,
    pub manifest_dir: PathBuf,
    pub ca_state_dir: Option<PathBuf>,
    pub deadline: Duration,
    pub dry_run: bool,
    pub cleanup: bool,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            cluster_name: String::new(),
            namespace: "default".to_string(),
            control_plane_name: String::new(),
            mode: CustodyMode::Local,
            remote: RemoteSignerConfig::default(),
            apiserver_sans: Vec::new(),
            etcd_sans: Vec::new(),
            server: None,
            kubelet_node_name: None,
            output_dir: PathBuf::from("out"),
            manifest_dir: PathBuf::from("out/manifests"),
            ca_state_dir: None,
            deadline: DEFAULT_DEADLINE,
            dry_run: false,
            cleanup: false,
        }
    }
}

impl BootstrapConfig {
    pub fn validate(&self) -> Result<()> {
        if self.cluster_name.trim().is_empty() {
            return Err(PkiError::Config("--cluster-name is required".to_string()));
        }
        if self.control_plane_name.trim().is_empty() {
            return Err(PkiError::Config("--kcp-name is required".to_string()));
        }
        if self.namespace.trim().is_empty() {
            return Err(PkiError::Config("namespace cannot be empty".to_string()));
        }
        if self.output_dir.as_os_str().is_empty() {
            return Err(PkiError::Config("--output-dir cannot be empty".to_string()));
        }
        if self.deadline.is_zero() {
            return Err(PkiError::Config("per-call deadline must be positive".to_string()));
        }
        if self.mode == CustodyMode::Remote {
            if self.remote.endpoint.trim().is_empty() {
                return Err(PkiError::Config("--endpoint is required in remote mode".to_string()));
            }
            for (flag, path) in [
                ("ca-cert", &self.remote.ca_cert),
                ("client-cert", &self.remote.client_cert),
                ("client-key", &self.remote.client_key),
            ] {
                if path.is_none() {
                    return Err(PkiError::Config(format!(
                        "--{} is required in remote mode",
                        flag
                    )));
                }
            }
        }
        Ok(())
    }

    /// Per-cluster output directory.
    pub fn output_path(&self) -> PathBuf {
        self.output_dir.join(self.cluster_name.trim())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn bootstrap() -> BootstrapConfig {
        BootstrapConfig {
            cluster_name: "demo".to_string(),
            control_plane_name: "demo-control-plane".to_string(),
            ..BootstrapConfig::default()
        }
    }

    #[test]
    fn signer_config_round_trips_through_json() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("signer.json");
        let path = path.to_str().unwrap();

        let config = SignerConfig {
            allowed_client_cns: vec!["bootstrapper".to_string()],
            ..SignerConfig::default()
        };
        config.save_to_file(path).unwrap();
        assert_eq!(SignerConfig::load_from_file(path).unwrap(), config);
    }

    #[test]
    fn signer_config_requires_tls_inputs() {
        let err = SignerConfig::default().validate().unwrap_err();
        assert!(err.to_string().contains("--server-cert is required"));

        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("missing.pem");
        let config = SignerConfig {
            server_cert: missing.to_string_lossy().into_owned(),
            server_key: missing.to_string_lossy().into_owned(),
            client_ca: missing.to_string_lossy().into_owned(),
            ..SignerConfig::default()
        };
        assert!(matches!(config.validate(), Err(PkiError::Config(_))));
    }

    #[test]
    fn bootstrap_requires_names_and_remote_inputs() {
        bootstrap().validate().unwrap();

        let mut config = bootstrap();
        config.cluster_name = " ".to_string();
        assert!(matches!(config.validate(), Err(PkiError::Config(_))));

        let mut config = bootstrap();
        config.mode = CustodyMode::Remote;
        config.remote.endpoint = "127.0.0.1:9443".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("--ca-cert"));
    }

    #[test]
    fn csv_and_output_path() {
        assert_eq!(split_csv(" a, ,b,"), vec!["a", "b"]);
        assert_eq!(bootstrap().output_path(), PathBuf::from("out/demo"));
    }
}
